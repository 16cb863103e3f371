//! Normalization of raw page entries into canonical records.
//!
//! Distances and elevations arrive as display text ("5.2 km", "328 ft"),
//! dates in whichever format the page felt like that day. Anything that
//! won't parse is logged and skipped; one bad row never stops the pass.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use tracing::warn;

use crate::dataset::Dataset;
use crate::error::NormalizeError;
use crate::model::{CanonicalRecord, EnrichmentStatus, RawEntry, SegmentType};

static SEGMENT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"strava\.com/segments/(\d+)").unwrap());
static MEASURE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(-?[\d.]+)\s*([a-z]+)").unwrap());

const DATE_FORMATS: &[&str] = &["%b %d, %Y", "%B %d, %Y", "%m/%d/%Y", "%d-%m-%Y", "%Y-%m-%d"];

#[derive(Debug, Default, Clone, Copy)]
pub struct NormalizeOutcome {
    /// Records not previously in the dataset, queued as pending.
    pub new: usize,
    /// Existing records whose descriptive fields were refreshed.
    pub updated: usize,
    /// Entries dropped as unparseable.
    pub skipped: usize,
}

/// Merge a batch of raw entries into the dataset. Existing records keep
/// their enrichment status and payload; only descriptive fields move.
pub fn normalize(entries: &[RawEntry], dataset: &mut Dataset) -> NormalizeOutcome {
    let mut outcome = NormalizeOutcome::default();

    for entry in entries {
        match canonicalize(entry) {
            Ok(record) => {
                if dataset.upsert(record) {
                    outcome.new += 1;
                } else {
                    outcome.updated += 1;
                }
            }
            Err(e) => {
                warn!("Skipping entry '{}': {}", entry.name, e);
                outcome.skipped += 1;
            }
        }
    }

    outcome
}

fn canonicalize(entry: &RawEntry) -> Result<CanonicalRecord, NormalizeError> {
    let link = entry.link.as_deref().ok_or(NormalizeError::MissingLink)?;
    let segment_id = segment_id_from_url(link)
        .ok_or_else(|| NormalizeError::BadSegmentId(link.to_string()))?;

    let name = entry.name.trim();
    if name.is_empty() {
        return Err(NormalizeError::EmptyName);
    }

    let distance_meters = parse_distance_meters(&entry.distance_text)
        .ok_or_else(|| NormalizeError::BadDistance(entry.distance_text.clone()))?;
    if distance_meters < 0.0 {
        return Err(NormalizeError::BadDistance(entry.distance_text.clone()));
    }
    let elevation_meters = parse_elevation_meters(&entry.elevation_text)
        .ok_or_else(|| NormalizeError::BadElevation(entry.elevation_text.clone()))?;
    let achieved_on = parse_date(&entry.date_text)
        .ok_or_else(|| NormalizeError::BadDate(entry.date_text.clone()))?;

    Ok(CanonicalRecord {
        segment_id,
        name: name.to_string(),
        segment_type: SegmentType::from_label(&entry.segment_type),
        distance_meters,
        elevation_meters,
        achieved_on,
        source_url: link.to_string(),
        elapsed_time: some_nonempty(&entry.time_text),
        effort_url: entry.time_link.clone(),
        enrichment_status: EnrichmentStatus::Pending,
        enrichment_error: None,
        enriched: None,
    })
}

pub fn segment_id_from_url(url: &str) -> Option<u64> {
    SEGMENT_ID_RE
        .captures(url)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// "5.2 km" → 5200.0, "400 m" → 400.0. Commas stripped ("5,200 m").
fn parse_distance_meters(text: &str) -> Option<f64> {
    let (value, unit) = parse_measure(text)?;
    match unit.as_str() {
        u if u.starts_with("km") => Some(value * 1000.0),
        u if u.starts_with("mi") => Some(value * 1609.344),
        u if u.starts_with('m') => Some(value),
        _ => None,
    }
}

/// "128 m" → 128.0, "328 ft" → 99.97. Negative values are real (descents).
fn parse_elevation_meters(text: &str) -> Option<f64> {
    let (value, unit) = parse_measure(text)?;
    match unit.as_str() {
        u if u.starts_with('m') => Some(value),
        u if u.starts_with("ft") => Some(value * 0.3048),
        _ => None,
    }
}

fn parse_measure(text: &str) -> Option<(f64, String)> {
    let cleaned = text.to_lowercase().replace(',', "");
    let caps = MEASURE_RE.captures(&cleaned)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    Some((value, caps.get(2)?.as_str().to_string()))
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
}

fn some_nonempty(text: &str) -> Option<String> {
    let t = text.trim();
    (!t.is_empty()).then(|| t.to_string())
}

// ── Tests ──
