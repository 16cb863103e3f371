//! URL templates, artifact paths, and tuning constants.

use std::time::Duration;

// ── Platform URLs ──

pub const CR_PAGE_URL_TEMPLATE: &str = "https://www.strava.com/athletes/{athlete_id}/segments/leader";
pub const API_BASE_URL: &str = "https://www.strava.com/api/v3";
pub const SEGMENT_ENDPOINT_TEMPLATE: &str = "/segments/{segment_id}";

// ── Persisted artifacts ──

pub const RAW_DATA_PATH: &str = "data/challenge_results_raw.json";
pub const ENRICHED_DATA_PATH: &str = "data/challenge_results_complemented.json";

// ── Rate limiting ──
// The platform enforces 100 calls / 15 min and 1000 / day on read tokens.
// Stay under both with margin; a 429 burns goodwill we can't buy back.

pub const SHORT_WINDOW: Duration = Duration::from_secs(15 * 60);
pub const SHORT_WINDOW_BUDGET: u32 = 90;
pub const DAILY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
pub const DAILY_WINDOW_BUDGET: u32 = 900;

/// Upper bound on a single limiter wait before the caller treats it as a
/// transient failure. Long enough to ride out a full short window.
pub const LIMITER_WAIT_TIMEOUT: Duration = Duration::from_secs(20 * 60);

// ── Enrichment ──

pub const ENRICH_CONCURRENCY: usize = 4;
pub const MAX_RETRIES: u32 = 3;
pub const BASE_BACKOFF: Duration = Duration::from_millis(2000);
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ── Extraction ──

/// Consecutive page advances that may come back empty before the extractor
/// concludes the listing is exhausted.
pub const MAX_EMPTY_ADVANCES: u32 = 2;
