//! Record types flowing through the pipeline.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One achievement row exactly as it appears on the page. Loosely typed on
/// purpose: all text, nothing validated yet. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct RawEntry {
    pub segment_type: String,
    pub name: String,
    pub link: Option<String>,
    pub distance_text: String,
    pub elevation_text: String,
    pub time_text: String,
    pub time_link: Option<String>,
    pub date_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentType {
    Ride,
    Run,
    Other,
}

impl SegmentType {
    pub fn from_label(label: &str) -> Self {
        let l = label.trim().to_lowercase();
        if l.contains("ride") || l.contains("cycl") {
            SegmentType::Ride
        } else if l.contains("run") {
            SegmentType::Run
        } else {
            SegmentType::Other
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentStatus {
    Pending,
    Enriched,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

/// API-sourced detail attached to a record once enrichment succeeds.
/// Present if and only if the record's status is `Enriched`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedFields {
    pub polyline: String,
    pub start_coordinate: Coordinate,
    pub end_coordinate: Coordinate,
    pub average_speed: f64,
    pub effort_count: u64,
    pub athlete_count: u64,
}

/// The validated unit of work, keyed by `segment_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub segment_id: u64,
    pub name: String,
    pub segment_type: SegmentType,
    pub distance_meters: f64,
    pub elevation_meters: f64,
    pub achieved_on: NaiveDate,
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effort_url: Option<String>,
    pub enrichment_status: EnrichmentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment_error: Option<String>,
    #[serde(flatten)]
    pub enriched: Option<EnrichedFields>,
}

impl CanonicalRecord {
    /// Status/payload consistency: enriched fields exactly when enriched.
    pub fn is_consistent(&self) -> bool {
        (self.enrichment_status == EnrichmentStatus::Enriched) == self.enriched.is_some()
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_type_labels() {
        assert_eq!(SegmentType::from_label("Ride"), SegmentType::Ride);
        assert_eq!(SegmentType::from_label(" trail run "), SegmentType::Run);
        assert_eq!(SegmentType::from_label("Hike"), SegmentType::Other);
        assert_eq!(SegmentType::from_label(""), SegmentType::Other);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&EnrichmentStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(
            serde_json::to_string(&SegmentType::Ride).unwrap(),
            "\"ride\""
        );
    }
}
