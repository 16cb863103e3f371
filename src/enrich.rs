//! Segment enrichment against the public API.
//!
//! One call per canonical record, every call behind the shared rate
//! limiter. Transient failures retry with capped, jittered, doubling
//! backoff; a 404 settles the record as failed; a 401/403 halts the whole
//! phase since the credential is bad for every call after it too.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

use crate::config::{
    API_BASE_URL, BASE_BACKOFF, ENRICH_CONCURRENCY, MAX_BACKOFF, MAX_RETRIES, REQUEST_TIMEOUT,
    SEGMENT_ENDPOINT_TEMPLATE,
};
use crate::dataset::Dataset;
use crate::error::EnrichError;
use crate::limiter::RateLimiter;
use crate::model::{CanonicalRecord, Coordinate, EnrichedFields};

// ── API seam ──

/// Segment detail as the API reports it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SegmentDetail {
    #[serde(default)]
    pub map: SegmentMap,
    #[serde(default)]
    pub start_latlng: Option<[f64; 2]>,
    #[serde(default)]
    pub end_latlng: Option<[f64; 2]>,
    #[serde(default)]
    pub effort_count: u64,
    #[serde(default)]
    pub athlete_count: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SegmentMap {
    #[serde(default)]
    pub polyline: Option<String>,
}

/// The outbound API call, abstracted so tests can script responses and the
/// pool never needs a network.
pub trait SegmentApi: Send + Sync + 'static {
    fn get_segment(
        &self,
        segment_id: u64,
    ) -> impl Future<Output = Result<SegmentDetail, EnrichError>> + Send;
}

/// Real API client: bearer-authorized GET per segment id.
pub struct HttpSegmentApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSegmentApi {
    pub fn new(access_token: &str) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth =
            reqwest::header::HeaderValue::from_str(&format!("Bearer {access_token}"))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: API_BASE_URL.to_string(),
        })
    }
}

impl SegmentApi for HttpSegmentApi {
    async fn get_segment(&self, segment_id: u64) -> Result<SegmentDetail, EnrichError> {
        let endpoint = SEGMENT_ENDPOINT_TEMPLATE.replace("{segment_id}", &segment_id.to_string());
        let url = format!("{}{}", self.base_url, endpoint);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EnrichError::Transient(e.to_string()))?;

        let status = response.status().as_u16();
        match status {
            200..=299 => response
                .json::<SegmentDetail>()
                .await
                .map_err(|e| EnrichError::BadResponse(e.to_string())),
            401 | 403 => Err(EnrichError::Credential(status)),
            429 => Err(EnrichError::Transient("HTTP 429".to_string())),
            500..=599 => Err(EnrichError::Transient(format!("HTTP {status}"))),
            _ => Err(EnrichError::Permanent(status)),
        }
    }
}

// ── Single-record enrichment ──

pub struct EnrichmentClient<A: SegmentApi> {
    api: Arc<A>,
    limiter: Arc<RateLimiter>,
    halt: Arc<AtomicBool>,
}

impl<A: SegmentApi> EnrichmentClient<A> {
    pub fn new(api: Arc<A>, limiter: Arc<RateLimiter>, halt: Arc<AtomicBool>) -> Self {
        Self { api, limiter, halt }
    }

    /// Enrich one pending record. Each attempt, retries included, spends
    /// one limiter token pair. Retries stop issuing calls once the shared
    /// halt flag is set; the record surfaces its last transient error.
    pub async fn enrich(&self, record: &CanonicalRecord) -> Result<EnrichedFields, EnrichError> {
        let mut last_err = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = backoff_delay(attempt - 1);
                warn!(
                    "Retrying segment {} (attempt {}/{}) after {:.1}s",
                    record.segment_id,
                    attempt,
                    MAX_RETRIES,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
                // The phase may have halted during the backoff wait.
                if self.halt.load(Ordering::SeqCst) {
                    return Err(last_err
                        .unwrap_or_else(|| EnrichError::Transient("phase halted".to_string())));
                }
            }

            let result = match self.limiter.acquire().await {
                Ok(()) => self.api.get_segment(record.segment_id).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(detail) => return Ok(build_fields(record, detail)),
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| EnrichError::Transient("retries exhausted".to_string())))
    }
}

/// Doubling base, capped, plus jitter bounded below half the base so delays
/// still strictly increase until the cap.
fn backoff_delay(exhausted_attempts: u32) -> Duration {
    let exp = BASE_BACKOFF
        .saturating_mul(2u32.saturating_pow(exhausted_attempts))
        .min(MAX_BACKOFF);
    let jitter_ms = rand::random::<u64>() % (BASE_BACKOFF.as_millis() as u64 / 2).max(1);
    exp + Duration::from_millis(jitter_ms)
}

fn build_fields(record: &CanonicalRecord, detail: SegmentDetail) -> EnrichedFields {
    let coord = |ll: Option<[f64; 2]>| {
        let [lat, lng] = ll.unwrap_or_default();
        Coordinate { lat, lng }
    };
    EnrichedFields {
        polyline: detail.map.polyline.unwrap_or_default(),
        start_coordinate: coord(detail.start_latlng),
        end_coordinate: coord(detail.end_latlng),
        average_speed: average_speed(record),
        effort_count: detail.effort_count,
        athlete_count: detail.athlete_count,
    }
}

/// Meters per second of the CR effort, from the listed elapsed time. The
/// segment endpoint itself carries no speed field.
fn average_speed(record: &CanonicalRecord) -> f64 {
    let Some(secs) = record.elapsed_time.as_deref().and_then(parse_elapsed_seconds) else {
        return 0.0;
    };
    if secs == 0 {
        return 0.0;
    }
    record.distance_meters / secs as f64
}

/// "12:34" → 754, "1:02:03" → 3723, "57s" → 57.
fn parse_elapsed_seconds(text: &str) -> Option<u64> {
    let text = text.trim();
    if let Some(stripped) = text.strip_suffix('s') {
        return stripped.trim().parse().ok();
    }
    let parts: Vec<&str> = text.split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let mut secs = 0u64;
    for part in parts {
        secs = secs
            .checked_mul(60)?
            .checked_add(part.trim().parse().ok()?)?;
    }
    Some(secs)
}

// ── Worker pool ──

#[derive(Debug, Default)]
pub struct EnrichStats {
    pub attempted: usize,
    pub enriched: usize,
    pub failed: usize,
    /// Records left pending because the phase halted before their turn.
    pub skipped: usize,
    /// Set when a credential failure stopped the phase early.
    pub credential_error: Option<String>,
}

enum Outcome {
    Enriched(u64, EnrichedFields),
    Failed(u64, EnrichError),
    Skipped,
}

/// Enrich every pending record in the dataset with bounded concurrency.
/// Returns only after all in-flight attempts have settled; the caller can
/// treat the dataset as quiescent when this comes back.
pub async fn run_enrichment<A: SegmentApi>(
    dataset: &mut Dataset,
    api: Arc<A>,
    limiter: Arc<RateLimiter>,
) -> EnrichStats {
    let pending: Vec<CanonicalRecord> = dataset
        .pending_ids()
        .into_iter()
        .filter_map(|id| dataset.get(id).cloned())
        .collect();

    let mut stats = EnrichStats::default();
    if pending.is_empty() {
        info!("No pending records; enrichment phase is a no-op");
        return stats;
    }
    info!("Enriching {} pending records", pending.len());

    let pb = ProgressBar::new(pending.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );

    let semaphore = Arc::new(Semaphore::new(ENRICH_CONCURRENCY));
    let halt = Arc::new(AtomicBool::new(false));
    let (tx, mut rx) = mpsc::channel::<Outcome>(ENRICH_CONCURRENCY * 2);

    for record in pending {
        let api = Arc::clone(&api);
        let limiter = Arc::clone(&limiter);
        let sem = Arc::clone(&semaphore);
        let halt = Arc::clone(&halt);
        let tx = tx.clone();

        tokio::spawn(async move {
            let Ok(_permit) = sem.acquire().await else {
                return;
            };
            // Queued work stops once the credential is known bad; whatever
            // is already past this check finishes its call.
            if halt.load(Ordering::SeqCst) {
                let _ = tx.send(Outcome::Skipped).await;
                return;
            }

            let client = EnrichmentClient::new(api, limiter, Arc::clone(&halt));
            let outcome = match client.enrich(&record).await {
                Ok(fields) => Outcome::Enriched(record.segment_id, fields),
                Err(e) => {
                    if e.is_fatal_to_phase() {
                        halt.store(true, Ordering::SeqCst);
                    }
                    Outcome::Failed(record.segment_id, e)
                }
            };
            let _ = tx.send(outcome).await;
        });
    }
    drop(tx);

    // The persist barrier: this loop only ends when every spawned worker
    // has settled and dropped its sender.
    while let Some(outcome) = rx.recv().await {
        match outcome {
            Outcome::Enriched(id, fields) => {
                stats.attempted += 1;
                stats.enriched += 1;
                dataset.mark_enriched(id, fields);
            }
            Outcome::Failed(id, err) => {
                stats.attempted += 1;
                stats.failed += 1;
                if err.is_fatal_to_phase() {
                    stats.credential_error = Some(err.to_string());
                }
                warn!("Segment {} enrichment failed: {}", id, err);
                dataset.mark_failed(id, &err.to_string());
            }
            Outcome::Skipped => {
                stats.skipped += 1;
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    info!(
        "Enrichment settled: {} enriched, {} failed, {} left pending",
        stats.enriched, stats.failed, stats.skipped
    );
    stats
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EnrichmentStatus, SegmentType};
    use chrono::NaiveDate;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn record(id: u64) -> CanonicalRecord {
        CanonicalRecord {
            segment_id: id,
            name: format!("segment-{id}"),
            segment_type: SegmentType::Ride,
            distance_meters: 5200.0,
            elevation_meters: 128.0,
            achieved_on: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            source_url: format!("https://www.strava.com/segments/{id}"),
            elapsed_time: Some("12:34".into()),
            effort_url: None,
            enrichment_status: EnrichmentStatus::Pending,
            enrichment_error: None,
            enriched: None,
        }
    }

    fn detail() -> SegmentDetail {
        SegmentDetail {
            map: SegmentMap {
                polyline: Some("abc123".into()),
            },
            start_latlng: Some([59.3, 18.0]),
            end_latlng: Some([59.4, 18.1]),
            effort_count: 1200,
            athlete_count: 340,
        }
    }

    /// Scripted API: per-id queue of responses, plus call log with stamps.
    struct FakeApi {
        scripts: Mutex<HashMap<u64, Vec<Result<SegmentDetail, EnrichError>>>>,
        calls: Mutex<Vec<(u64, Instant)>>,
    }

    impl FakeApi {
        fn new() -> Self {
            Self {
                scripts: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn script(self, id: u64, responses: Vec<Result<SegmentDetail, EnrichError>>) -> Self {
            self.scripts.lock().unwrap().insert(id, responses);
            self
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn stamps_for(&self, id: u64) -> Vec<Instant> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(i, _)| *i == id)
                .map(|&(_, t)| t)
                .collect()
        }
    }

    impl SegmentApi for FakeApi {
        async fn get_segment(&self, segment_id: u64) -> Result<SegmentDetail, EnrichError> {
            self.calls.lock().unwrap().push((segment_id, Instant::now()));
            let mut scripts = self.scripts.lock().unwrap();
            let queue = scripts.get_mut(&segment_id).expect("unscripted segment id");
            if queue.len() > 1 {
                queue.remove(0)
            } else {
                queue[0].clone_response()
            }
        }
    }

    trait CloneResponse {
        fn clone_response(&self) -> Result<SegmentDetail, EnrichError>;
    }

    impl CloneResponse for Result<SegmentDetail, EnrichError> {
        fn clone_response(&self) -> Result<SegmentDetail, EnrichError> {
            match self {
                Ok(d) => Ok(d.clone()),
                Err(EnrichError::Transient(s)) => Err(EnrichError::Transient(s.clone())),
                Err(EnrichError::Permanent(s)) => Err(EnrichError::Permanent(*s)),
                Err(EnrichError::Credential(s)) => Err(EnrichError::Credential(*s)),
                Err(EnrichError::LimiterTimeout) => Err(EnrichError::LimiterTimeout),
                Err(EnrichError::BadResponse(s)) => Err(EnrichError::BadResponse(s.clone())),
            }
        }
    }

    fn no_halt() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    fn wide_open_limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(
            10_000,
            Duration::from_secs(900),
            100_000,
            Duration::from_secs(86_400),
            Duration::from_secs(3600),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn success_builds_enriched_fields() {
        let api = Arc::new(FakeApi::new().script(1, vec![Ok(detail())]));
        let client = EnrichmentClient::new(Arc::clone(&api), wide_open_limiter(), no_halt());

        let fields = client.enrich(&record(1)).await.unwrap();
        assert_eq!(fields.polyline, "abc123");
        assert_eq!(fields.effort_count, 1200);
        assert_eq!(fields.start_coordinate, Coordinate { lat: 59.3, lng: 18.0 });
        // 5200 m in 754 s
        assert!((fields.average_speed - 5200.0 / 754.0).abs() < 1e-9);
        assert_eq!(api.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_with_increasing_backoff() {
        let api = Arc::new(FakeApi::new().script(
            1,
            vec![
                Err(EnrichError::Transient("HTTP 429".into())),
                Err(EnrichError::Transient("HTTP 429".into())),
                Err(EnrichError::Transient("HTTP 429".into())),
                Ok(detail()),
            ],
        ));
        let client = EnrichmentClient::new(Arc::clone(&api), wide_open_limiter(), no_halt());

        let fields = client.enrich(&record(1)).await.unwrap();
        assert_eq!(fields.polyline, "abc123");

        let stamps = api.stamps_for(1);
        assert_eq!(stamps.len(), 4);
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps[1] > gaps[0], "backoff not increasing: {:?}", gaps);
        assert!(gaps[2] > gaps[1], "backoff not increasing: {:?}", gaps);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhaust_to_failure() {
        let api = Arc::new(
            FakeApi::new().script(1, vec![Err(EnrichError::Transient("HTTP 503".into()))]),
        );
        let client = EnrichmentClient::new(Arc::clone(&api), wide_open_limiter(), no_halt());

        let err = client.enrich(&record(1)).await.unwrap_err();
        assert!(matches!(err, EnrichError::Transient(_)));
        assert_eq!(api.call_count() as u32, MAX_RETRIES + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let api = Arc::new(FakeApi::new().script(1, vec![Err(EnrichError::Permanent(404))]));
        let client = EnrichmentClient::new(Arc::clone(&api), wide_open_limiter(), no_halt());

        let err = client.enrich(&record(1)).await.unwrap_err();
        assert!(matches!(err, EnrichError::Permanent(404)));
        assert_eq!(api.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn every_attempt_spends_a_limiter_token() {
        let limiter = wide_open_limiter();
        let api = Arc::new(FakeApi::new().script(
            1,
            vec![
                Err(EnrichError::Transient("HTTP 500".into())),
                Ok(detail()),
            ],
        ));
        let client = EnrichmentClient::new(api, Arc::clone(&limiter), no_halt());
        client.enrich(&record(1)).await.unwrap();

        let (short, _) = limiter.remaining().await;
        assert_eq!(short, 10_000 - 2);
    }

    #[tokio::test(start_paused = true)]
    async fn halted_phase_stops_the_retry_loop() {
        let api = Arc::new(
            FakeApi::new().script(1, vec![Err(EnrichError::Transient("HTTP 429".into()))]),
        );
        // Flag set while the first attempt is in flight; retries must not
        // issue further calls.
        let halt = Arc::new(AtomicBool::new(true));
        let client = EnrichmentClient::new(Arc::clone(&api), wide_open_limiter(), halt);

        let err = client.enrich(&record(1)).await.unwrap_err();
        assert!(matches!(err, EnrichError::Transient(_)));
        assert_eq!(api.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_marks_outcomes_and_halts_on_credential_failure() {
        // Concurrency is bounded at ENRICH_CONCURRENCY, so script enough
        // records that some are still queued when the 403 lands.
        let mut api = FakeApi::new().script(1, vec![Err(EnrichError::Credential(403))]);
        let total = ENRICH_CONCURRENCY + 8;
        for id in 2..=total as u64 {
            api = api.script(id, vec![Ok(detail())]);
        }
        let api = Arc::new(api);

        let mut ds = Dataset::new();
        for id in 1..=total as u64 {
            ds.upsert(record(id));
        }

        let stats = run_enrichment(&mut ds, Arc::clone(&api), wide_open_limiter()).await;

        assert!(stats.credential_error.is_some());
        assert!(stats.skipped > 0, "no queued work was halted");
        assert_eq!(
            ds.get(1).unwrap().enrichment_status,
            EnrichmentStatus::Failed
        );
        let counts = ds.status_counts();
        assert_eq!(counts.pending, stats.skipped);
        assert_eq!(counts.enriched, stats.enriched);
        // Halted records were never attempted against the API.
        assert_eq!(api.call_count(), stats.attempted);
    }

    #[tokio::test(start_paused = true)]
    async fn fully_enriched_dataset_makes_zero_calls() {
        let api = Arc::new(FakeApi::new().script(1, vec![Ok(detail())]));
        let mut ds = Dataset::new();
        ds.upsert(record(1));

        let first = run_enrichment(&mut ds, Arc::clone(&api), wide_open_limiter()).await;
        assert_eq!(first.enriched, 1);
        assert_eq!(api.call_count(), 1);

        // Second run: everything already enriched, nothing spent.
        let second = run_enrichment(&mut ds, Arc::clone(&api), wide_open_limiter()).await;
        assert_eq!(second.attempted, 0);
        assert_eq!(api.call_count(), 1);
    }

    #[test]
    fn elapsed_time_parsing() {
        assert_eq!(parse_elapsed_seconds("12:34"), Some(754));
        assert_eq!(parse_elapsed_seconds("1:02:03"), Some(3723));
        assert_eq!(parse_elapsed_seconds("57s"), Some(57));
        assert_eq!(parse_elapsed_seconds("n/a"), None);
    }

    #[test]
    fn backoff_caps_at_max() {
        let d = backoff_delay(30);
        assert!(d >= MAX_BACKOFF);
        assert!(d < MAX_BACKOFF + BASE_BACKOFF);
    }
}
