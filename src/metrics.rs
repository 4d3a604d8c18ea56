use tracing::trace;

// Trace-level metric events; the Prometheus endpoint only renders the recorder.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "trackmaster.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn chunk_elapsed(orders: usize, elapsed_ms: u128) {
    trace!(
        target = "trackmaster.metrics",
        orders = orders as u64,
        elapsed_ms = elapsed_ms as u64,
        "chunk_elapsed"
    );
}

pub fn workflow_outcome(workflow: &'static str, succeeded: usize, failed: usize) {
    trace!(
        target = "trackmaster.metrics",
        workflow = workflow,
        succeeded = succeeded as u64,
        failed = failed as u64,
        "workflow_outcome"
    );
}
