use crate::models::{OrderRow, Thresholds, TrackStatus, TrackingCandidate, TrackingResult, tracking_url};
use crate::provider::{ProviderError, SearchQuery, TrackingProvider};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::{Value, json};
use tracing::warn;

pub const MISSING_ZIP_NOTE: &str = "Missing Zip Code";
pub const NO_DELIVERY_NOTE: &str = "No expected delivery";
const WINDOW_BEFORE_DAYS: i64 = 5;
const WINDOW_AFTER_DAYS: i64 = 35;
const NOTE_LIMIT: usize = 100;
const MS_PER_DAY: f64 = 86_400_000.0;

const ACTIVE_STATUS_KEYWORDS: [&str; 6] = [
    "transit",
    "delivered",
    "on the way",
    "out for delivery",
    "picked up",
    "arrived",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveParams {
    pub limit: u32,
    pub thresholds: Thresholds,
}

/// Resolve one order against the provider. Every failure path becomes a
/// `SKIPPED` or `ERROR` result; nothing is returned as `Err`.
pub async fn resolve_order<P: TrackingProvider>(
    provider: &P,
    row: &OrderRow,
    params: &ResolveParams,
    now: DateTime<Utc>,
) -> TrackingResult {
    let zip = clean_zip(&row.shipping_zip);
    if zip.is_empty() {
        let mut result = TrackingResult::bare(row, "N/A", "N/A", TrackStatus::Skipped)
            .with_note(MISSING_ZIP_NOTE);
        result.diagnostics = Some(json!({
            "source": "validation",
            "requests": [],
            "candidates": [],
        }));
        return result;
    }

    let order_date_str = row.order_date_str().to_string();
    let Some(order_day) = parse_order_date(&order_date_str) else {
        let mut result = TrackingResult::bare(row, &zip, &order_date_str, TrackStatus::Error)
            .with_note(truncate_note(&format!("Invalid order date: {}", row.created_at)));
        result.diagnostics = Some(json!({ "source": "validation", "created_at": row.created_at }));
        return result;
    };
    let order_at = order_day.and_time(NaiveTime::MIN).and_utc();
    let (shipped_from, shipped_to) = search_window(order_day);

    let segments = zip_segments(&zip);
    let mut requests = Vec::with_capacity(segments.len());
    let mut pool: Vec<TrackingCandidate> = Vec::new();
    let mut errors: Vec<String> = Vec::new();
    let mut segment_reports: Vec<Value> = Vec::new();

    for segment in &segments {
        let query = SearchQuery::by_zip(segment, shipped_from.clone(), shipped_to.clone(), params.limit);
        match provider.search(&query).await {
            Ok(found) => {
                segment_reports.push(json!({ "zip": segment, "ok": true, "candidates": found.len() }));
                pool.extend(found);
            }
            Err(err) => {
                let message = segment_error(segment, &err);
                warn!(
                    target = "trackmaster.provider",
                    order = %row.order_number,
                    zip = %segment,
                    error = %err,
                    "segment_search_failed"
                );
                segment_reports.push(json!({ "zip": segment, "ok": false, "error": message }));
                errors.push(message);
            }
        }
        requests.push(query);
    }

    let diagnostics = json!({
        "source": "provider",
        "requests": requests,
        "candidates": pool,
        "errors": errors,
        "segments": segment_reports,
    });

    if pool.is_empty() && errors.len() == segments.len() {
        let mut result = TrackingResult::bare(row, &zip, &order_date_str, TrackStatus::Error)
            .with_note(truncate_note(&errors.join(" | ")));
        result.diagnostics = Some(diagnostics);
        return result;
    }

    let Some(matched) = select_best(&pool, now) else {
        let note = if pool.is_empty() {
            "No suitable tracking found".to_string()
        } else {
            format!(
                "Found {} items but none matched criteria (In Transit/Delivered/On the Way)",
                pool.len()
            )
        };
        let mut result =
            TrackingResult::bare(row, &zip, &order_date_str, TrackStatus::Skipped).with_note(note);
        result.diagnostics = Some(diagnostics);
        return result;
    };

    let expected_delivery = matched
        .expected_delivery
        .clone()
        .filter(|d| !d.trim().is_empty());
    let expected_at = expected_delivery.as_deref().and_then(parse_instant);
    let mut verdict = classify(order_at, expected_at, now, params.thresholds);
    // A held result must carry a delivery date to be queued.
    if verdict.status == TrackStatus::Queued && expected_delivery.is_none() {
        verdict.status = TrackStatus::Skipped;
        verdict.note = Some(NO_DELIVERY_NOTE.to_string());
    }
    let tracking_number = matched.tracking_number.clone().unwrap_or_default();

    let mut result = TrackingResult::bare(row, &zip, &order_date_str, verdict.status);
    result.tracking_url = Some(tracking_url(&tracking_number));
    result.tracking_number = Some(tracking_number);
    result.hash_id = matched.hash_id.clone();
    result.expected_delivery = expected_delivery;
    result.weight = Some(matched.weight.clone().unwrap_or_else(|| "N/A".to_string()));
    result.note = verdict.note;
    result.is_7_days_future = verdict.is_7_days_future;
    result.diagnostics = Some(diagnostics);
    result
}

/// Strip quote characters and surrounding whitespace from an exported zip.
pub fn clean_zip(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != '\'' && *c != '"')
        .collect::<String>()
        .trim()
        .to_string()
}

/// ZIP+4 values are searched as two independent segments.
pub fn zip_segments(zip: &str) -> Vec<String> {
    if !zip.contains('-') {
        return vec![zip.to_string()];
    }
    zip.split('-')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_order_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
}

pub fn search_window(order_day: NaiveDate) -> (String, String) {
    let from = order_day - Duration::days(WINDOW_BEFORE_DAYS);
    let to = order_day + Duration::days(WINDOW_AFTER_DAYS);
    (
        from.format("%Y-%m-%d").to_string(),
        to.format("%Y-%m-%d").to_string(),
    )
}

/// Provider dates come as RFC 3339, naive date-times, or bare dates; naive
/// values are read as UTC.
pub fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Some(parsed.and_utc());
        }
    }
    value
        .get(..10)
        .and_then(parse_order_date)
        .map(|day| day.and_time(NaiveTime::MIN).and_utc())
}

pub fn is_active_candidate(candidate: &TrackingCandidate, now: DateTime<Utc>) -> bool {
    let status = candidate.status.as_deref().unwrap_or("").to_lowercase();
    if ACTIVE_STATUS_KEYWORDS.iter().any(|kw| status.contains(kw)) {
        return true;
    }
    if candidate
        .shipped_date
        .as_deref()
        .is_some_and(|d| !d.trim().is_empty())
    {
        return true;
    }
    candidate
        .expected_delivery
        .as_deref()
        .and_then(parse_instant)
        .is_some_and(|at| at > now)
}

/// Among active candidates, the one with the latest expected delivery; ties
/// keep the earlier candidate and unreadable dates rank lowest.
pub fn select_best(pool: &[TrackingCandidate], now: DateTime<Utc>) -> Option<&TrackingCandidate> {
    let mut best: Option<(&TrackingCandidate, Option<DateTime<Utc>>)> = None;
    for candidate in pool.iter().filter(|c| is_active_candidate(c, now)) {
        let at = candidate.expected_delivery.as_deref().and_then(parse_instant);
        match best {
            Some((_, best_at)) if at <= best_at => {}
            _ => best = Some((candidate, at)),
        }
    }
    best.map(|(candidate, _)| candidate)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub status: TrackStatus,
    pub note: Option<String>,
    pub is_7_days_future: bool,
}

pub fn classify(
    order_at: DateTime<Utc>,
    expected_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    thresholds: Thresholds,
) -> Classification {
    let queue_days = f64::from(thresholds.days_for_queue);
    let warning_days = f64::from(thresholds.days_for_warning);
    let days_since_order = days_between(order_at, now);
    let lead_time_days = expected_at.map(|at| days_between(order_at, at));
    let is_7_days_future = lead_time_days.is_some_and(|lead| lead > warning_days);

    if days_since_order < queue_days {
        return Classification {
            status: TrackStatus::Queued,
            note: Some(format!("Order < {} days old", thresholds.days_for_queue)),
            is_7_days_future,
        };
    }
    if lead_time_days.is_some_and(|lead| lead < queue_days) {
        return Classification {
            status: TrackStatus::Queued,
            note: Some(format!(
                "Delivery less than {} days",
                thresholds.days_for_queue
            )),
            is_7_days_future,
        };
    }
    Classification {
        status: TrackStatus::Processed,
        note: (!is_7_days_future)
            .then(|| format!("Delivery less than {} days", thresholds.days_for_warning)),
        is_7_days_future,
    }
}

fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / MS_PER_DAY
}

fn segment_error(segment: &str, err: &ProviderError) -> String {
    match err {
        ProviderError::Network(_) => format!("Zip {segment} {err}"),
        _ => format!("Zip {segment}: {err}"),
    }
}

fn truncate_note(text: &str) -> String {
    text.chars().take(NOTE_LIMIT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeProvider, candidate, order};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn params() -> ResolveParams {
        ResolveParams {
            limit: 3000,
            thresholds: Thresholds::default(),
        }
    }

    fn day(offset_days: i64) -> String {
        (now().date_naive() + Duration::days(offset_days))
            .format("%Y-%m-%d")
            .to_string()
    }

    #[tokio::test]
    async fn missing_zip_skips_without_network() {
        let provider = FakeProvider::default();
        let row = order("#1", " '' ", "2025-02-01 10:00:00 -0600");
        let result = resolve_order(&provider, &row, &params(), now()).await;
        assert_eq!(result.status, TrackStatus::Skipped);
        assert_eq!(result.note.as_deref(), Some(MISSING_ZIP_NOTE));
        assert_eq!(result.zip, "N/A");
        assert!(provider.searched_zips().is_empty());
        assert!(result.diagnostics.is_some());
    }

    #[tokio::test]
    async fn zip_plus_four_searches_both_segments() {
        let provider = FakeProvider::default();
        let row = order("#1", "12345-6789", "2025-02-01 10:00:00");
        resolve_order(&provider, &row, &params(), now()).await;
        assert_eq!(provider.searched_zips(), vec!["12345", "6789"]);

        let provider = FakeProvider::default();
        let row = order("#2", "'12345", "2025-02-01 10:00:00");
        resolve_order(&provider, &row, &params(), now()).await;
        assert_eq!(provider.searched_zips(), vec!["12345"]);
    }

    #[tokio::test]
    async fn query_carries_window_and_limit() {
        let provider = FakeProvider::default();
        let row = order("#1", "12345", "2025-01-10 23:59:00 -0600");
        resolve_order(&provider, &row, &ResolveParams { limit: 50, ..params() }, now()).await;
        let queries = provider.queries.lock().unwrap();
        assert_eq!(queries[0].shipped_from, "2025-01-05");
        assert_eq!(queries[0].shipped_to, "2025-02-14");
        assert_eq!(queries[0].limit, 50);
        assert_eq!(queries[0].show_preshipment, 1);
    }

    #[tokio::test]
    async fn all_segments_failing_is_an_error() {
        let provider = FakeProvider::default()
            .with_search("12345", Err(ProviderError::Rejected("quota exceeded".into())))
            .with_search("6789", Err(ProviderError::Network("connection reset".into())));
        let row = order("#1", "12345-6789", "2025-02-01");
        let result = resolve_order(&provider, &row, &params(), now()).await;
        assert_eq!(result.status, TrackStatus::Error);
        assert_eq!(
            result.note.as_deref(),
            Some("Zip 12345: quota exceeded | Zip 6789 Network Error: connection reset")
        );
    }

    #[tokio::test]
    async fn error_note_is_truncated() {
        let provider = FakeProvider::default()
            .with_search("12345", Err(ProviderError::Rejected("x".repeat(300))));
        let row = order("#1", "12345", "2025-02-01");
        let result = resolve_order(&provider, &row, &params(), now()).await;
        assert_eq!(result.note.map(|n| n.chars().count()), Some(100));
    }

    #[tokio::test]
    async fn partial_segment_failure_still_resolves() {
        let provider = FakeProvider::default()
            .with_search("12345", Err(ProviderError::Rejected("bad zip".into())))
            .with_search("6789", Ok(vec![candidate("In Transit", &day(10), "1Z***42")]));
        let row = order("#1", "12345-6789", &day(-10));
        let result = resolve_order(&provider, &row, &params(), now()).await;
        assert_eq!(result.status, TrackStatus::Processed);
        assert_eq!(result.tracking_number.as_deref(), Some("1Z***42"));
        let diagnostics = result.diagnostics.unwrap();
        assert_eq!(diagnostics["errors"].as_array().unwrap().len(), 1);
        assert_eq!(diagnostics["requests"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn invalid_order_date_is_an_error() {
        let provider = FakeProvider::default();
        let row = order("#1", "12345", "yesterday");
        let result = resolve_order(&provider, &row, &params(), now()).await;
        assert_eq!(result.status, TrackStatus::Error);
        assert!(provider.searched_zips().is_empty());
    }

    #[tokio::test]
    async fn skipped_notes_distinguish_empty_from_unmatched() {
        let provider = FakeProvider::default();
        let row = order("#1", "12345", "2025-02-01");
        let result = resolve_order(&provider, &row, &params(), now()).await;
        assert_eq!(result.status, TrackStatus::Skipped);
        assert_eq!(result.note.as_deref(), Some("No suitable tracking found"));

        let provider = FakeProvider::default()
            .with_search("12345", Ok(vec![candidate("Label Created", "2025-01-01", "1Z1")]));
        let result = resolve_order(&provider, &row, &params(), now()).await;
        assert_eq!(result.status, TrackStatus::Skipped);
        assert!(result.note.unwrap().starts_with("Found 1 items but none matched"));
    }

    #[test]
    fn selection_ignores_inactive_candidates() {
        let pool = vec![
            candidate("In Transit", "2025-01-10", "FIRST"),
            candidate("Unknown", "2025-02-20", "SECOND"),
        ];
        let best = select_best(&pool, now()).unwrap();
        assert_eq!(best.tracking_number.as_deref(), Some("FIRST"));
    }

    #[test]
    fn selection_prefers_latest_delivery() {
        let pool = vec![
            candidate("Delivered", "2025-01-10", "EARLY"),
            candidate("In Transit", "2025-01-20", "LATE"),
            candidate("Delivered", "2025-01-20", "LATE_TIE"),
        ];
        let best = select_best(&pool, now()).unwrap();
        assert_eq!(best.tracking_number.as_deref(), Some("LATE"));
    }

    #[test]
    fn shipped_date_or_future_delivery_make_candidates_active() {
        let mut shipped = candidate("Label Created", "2025-01-01", "S");
        shipped.shipped_date = Some("2024-12-30".into());
        assert!(is_active_candidate(&shipped, now()));
        assert!(is_active_candidate(&candidate("Pre-Shipment", "2025-03-05", "F"), now()));
        assert!(!is_active_candidate(&candidate("Pre-Shipment", "2025-02-05", "P"), now()));
        assert!(is_active_candidate(&candidate("OUT FOR DELIVERY", "", "O"), now()));
    }

    #[test]
    fn parses_provider_date_shapes() {
        let midnight = Utc.with_ymd_and_hms(2025, 1, 20, 0, 0, 0).unwrap();
        assert_eq!(parse_instant("2025-01-20"), Some(midnight));
        assert_eq!(parse_instant("2025-01-20T00:00:00Z"), Some(midnight));
        assert_eq!(parse_instant("2025-01-20 00:00:00"), Some(midnight));
        assert_eq!(parse_instant("not a date"), None);
    }

    #[tokio::test]
    async fn recent_order_is_queued() {
        let provider = FakeProvider::default()
            .with_search("12345", Ok(vec![candidate("In Transit", &day(20), "1Z1")]));
        let row = order("#1", "12345", &day(0));
        let result = resolve_order(&provider, &row, &params(), now()).await;
        assert_eq!(result.status, TrackStatus::Queued);
        assert_eq!(result.note.as_deref(), Some("Order < 4 days old"));
        assert!(result.queue_item(now()).is_some());
    }

    #[tokio::test]
    async fn recent_match_without_delivery_is_skipped() {
        let mut undated = candidate("In Transit", "", "1Z***9");
        undated.expected_delivery = None;
        let provider = FakeProvider::default().with_search("12345", Ok(vec![undated]));
        let row = order("#1", "12345", &day(0));
        let result = resolve_order(&provider, &row, &params(), now()).await;
        assert_eq!(result.status, TrackStatus::Skipped);
        assert_eq!(result.note.as_deref(), Some(NO_DELIVERY_NOTE));
        assert_eq!(result.expected_delivery, None);
        assert!(result.queue_item(now()).is_none());

        let provider = FakeProvider::default()
            .with_search("12345", Ok(vec![candidate("In Transit", "  ", "1Z***9")]));
        let result = resolve_order(&provider, &row, &params(), now()).await;
        assert_eq!(result.status, TrackStatus::Skipped);
    }

    #[tokio::test]
    async fn short_lead_time_is_queued() {
        let provider = FakeProvider::default()
            .with_search("12345", Ok(vec![candidate("Delivered", &day(-7), "1Z1")]));
        let row = order("#1", "12345", &day(-10));
        let result = resolve_order(&provider, &row, &params(), now()).await;
        assert_eq!(result.status, TrackStatus::Queued);
        assert_eq!(result.note.as_deref(), Some("Delivery less than 4 days"));
    }

    #[tokio::test]
    async fn comfortable_lead_time_is_processed() {
        let provider = FakeProvider::default()
            .with_search("12345", Ok(vec![candidate("In Transit", &day(10), "1Z***77")]));
        let row = order("#1", "12345", &day(-10));
        let result = resolve_order(&provider, &row, &params(), now()).await;
        assert_eq!(result.status, TrackStatus::Processed);
        assert!(result.is_7_days_future);
        assert_eq!(result.note, None);
        assert_eq!(result.weight.as_deref(), Some("N/A"));
        assert_eq!(
            result.tracking_url.as_deref(),
            Some("https://www.ups.com/track?tracknum=1Z***77")
        );
    }

    #[tokio::test]
    async fn processed_with_short_lead_time_carries_warning() {
        let provider = FakeProvider::default()
            .with_search("12345", Ok(vec![candidate("Delivered", &day(-5), "1Z1")]));
        let row = order("#1", "12345", &day(-10));
        let result = resolve_order(&provider, &row, &params(), now()).await;
        assert_eq!(result.status, TrackStatus::Processed);
        assert!(!result.is_7_days_future);
        assert_eq!(result.note.as_deref(), Some("Delivery less than 7 days"));
    }

    #[test]
    fn classification_honors_custom_thresholds() {
        let order_at = now() - Duration::days(10);
        let thresholds = Thresholds {
            days_for_queue: 12,
            days_for_warning: 30,
        };
        let verdict = classify(order_at, Some(order_at + Duration::days(20)), now(), thresholds);
        assert_eq!(verdict.status, TrackStatus::Queued);
        assert_eq!(verdict.note.as_deref(), Some("Order < 12 days old"));
    }
}
