use crate::{
    models::{ApiError, OrderRow},
    pipeline::{BatchSummary, Connect, Engine, WorkflowSummary},
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{error, info};
use uuid::Uuid;

/// Work accepted by the single background worker. One job runs at a time, so
/// the ledgers only ever see one writer.
#[derive(Clone)]
pub enum JobRequest {
    Batch { rows: Vec<OrderRow> },
    Purchase { order_numbers: Vec<String> },
    Fulfill { order_numbers: Vec<String> },
}

impl JobRequest {
    fn kind(&self) -> &'static str {
        match self {
            JobRequest::Batch { .. } => "batch",
            JobRequest::Purchase { .. } => "purchase",
            JobRequest::Fulfill { .. } => "fulfill",
        }
    }
}

#[derive(Clone)]
struct Job {
    id: Uuid,
    request: JobRequest,
}

#[derive(Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOutput {
    Batch(BatchSummary),
    Purchase(WorkflowSummary),
    Fulfill(WorkflowSummary),
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running {
        completed: usize,
        total: usize,
        percent: u8,
    },
    Completed {
        result: JobOutput,
    },
    Failed {
        error: String,
        stage: Option<String>,
    },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub kind: &'static str,
    #[serde(flatten)]
    pub state: JobState,
}

type Statuses = Arc<Mutex<HashMap<Uuid, (&'static str, JobState)>>>;

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Statuses,
}

impl JobQueue {
    pub fn spawn<C: Connect>(engine: Engine<C>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(queue_capacity_from_env());
        let statuses: Statuses = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let kind = job.request.kind();
                set_state(
                    &statuses_bg,
                    job.id,
                    kind,
                    JobState::Running {
                        completed: 0,
                        total: 0,
                        percent: 0,
                    },
                )
                .await;
                info!(target = "trackmaster.jobs", job_id = %job.id, kind, "job_started");

                let result = match job.request {
                    JobRequest::Batch { rows } => {
                        let progress_statuses = statuses_bg.clone();
                        let id = job.id;
                        engine
                            .run_batch(rows, move |progress| {
                                let statuses = progress_statuses.clone();
                                async move {
                                    let running = JobState::Running {
                                        completed: progress.completed,
                                        total: progress.total,
                                        percent: progress.percent,
                                    };
                                    set_state(&statuses, id, "batch", running).await;
                                }
                            })
                            .await
                            .map(JobOutput::Batch)
                    }
                    JobRequest::Purchase { order_numbers } => engine
                        .purchase(&order_numbers)
                        .await
                        .map(JobOutput::Purchase),
                    JobRequest::Fulfill { order_numbers } => engine
                        .fulfill(&order_numbers)
                        .await
                        .map(JobOutput::Fulfill),
                };

                let state = match result {
                    Ok(output) => JobState::Completed { result: output },
                    Err(err) => {
                        error!(target = "trackmaster.jobs", job_id = %job.id, error = %err, "job_failed");
                        JobState::Failed {
                            error: err.detail().to_string(),
                            stage: Some(err.stage().to_string()),
                        }
                    }
                };
                set_state(&statuses_bg, job.id, kind, state).await;
            }
        });

        (Self { tx, statuses }, handle)
    }

    pub async fn enqueue(&self, request: JobRequest) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        set_state(&self.statuses, id, request.kind(), JobState::Queued).await;
        let job = Job { id, request };
        self.tx.send(job).await.map_err(|_| ApiError {
            error: "queue_send_failed".into(),
            detail: Some("worker not available".into()),
        })?;
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard.get(&id).cloned().map(|(kind, state)| JobInfo {
            id: id.to_string(),
            kind,
            state,
        })
    }
}

async fn set_state(statuses: &Statuses, id: Uuid, kind: &'static str, state: JobState) {
    statuses.lock().await.insert(id, (kind, state));
}

fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64)
}
