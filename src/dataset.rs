//! The persisted dataset: an ordered collection of canonical records keyed
//! by segment id. Single source of truth for resumability — a rerun loads
//! this, merges fresh extraction on top, and only enriches what is still
//! pending.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::model::{CanonicalRecord, EnrichedFields, EnrichmentStatus};

#[derive(Debug, Default)]
pub struct Dataset {
    records: Vec<CanonicalRecord>,
    index: HashMap<u64, usize>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON artifact, or start empty if none exists yet.
    pub fn load_or_empty(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read dataset {}", path.display()))?;
        let records: Vec<CanonicalRecord> = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse dataset {}", path.display()))?;
        let mut ds = Self::new();
        for r in records {
            if ds.get(r.segment_id).is_some() {
                warn!(
                    "Duplicate segment id {} in {}; keeping the first occurrence",
                    r.segment_id,
                    path.display()
                );
                continue;
            }
            if !r.is_consistent() {
                warn!(
                    "Record {} has status/payload mismatch in {}",
                    r.segment_id,
                    path.display()
                );
            }
            ds.insert(r);
        }
        info!("Loaded {} records from {}", ds.len(), path.display());
        Ok(ds)
    }

    /// Write the full dataset as a JSON array. Temp file + rename, so a
    /// crash mid-write never clobbers the previous artifact.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(&self.records)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, segment_id: u64) -> Option<&CanonicalRecord> {
        self.index.get(&segment_id).map(|&i| &self.records[i])
    }

    pub fn records(&self) -> &[CanonicalRecord] {
        &self.records
    }

    /// Insert a new record, or overwrite descriptive fields of an existing
    /// one while preserving its enrichment status and payload. Returns true
    /// when the segment id was new.
    pub fn upsert(&mut self, record: CanonicalRecord) -> bool {
        match self.index.get(&record.segment_id) {
            Some(&i) => {
                let existing = &mut self.records[i];
                existing.name = record.name;
                existing.segment_type = record.segment_type;
                existing.distance_meters = record.distance_meters;
                existing.elevation_meters = record.elevation_meters;
                existing.achieved_on = record.achieved_on;
                existing.source_url = record.source_url;
                existing.elapsed_time = record.elapsed_time;
                existing.effort_url = record.effort_url;
                false
            }
            None => {
                self.insert(record);
                true
            }
        }
    }

    fn insert(&mut self, record: CanonicalRecord) {
        debug_assert!(!self.index.contains_key(&record.segment_id));
        self.index.insert(record.segment_id, self.records.len());
        self.records.push(record);
    }

    /// Segment ids still awaiting enrichment.
    pub fn pending_ids(&self) -> Vec<u64> {
        self.records
            .iter()
            .filter(|r| r.enrichment_status == EnrichmentStatus::Pending)
            .map(|r| r.segment_id)
            .collect()
    }

    /// Pending → Enriched. Ignored for records in any other status, so a
    /// late worker result can never regress a settled record.
    pub fn mark_enriched(&mut self, segment_id: u64, fields: EnrichedFields) {
        if let Some(&i) = self.index.get(&segment_id) {
            let r = &mut self.records[i];
            if r.enrichment_status == EnrichmentStatus::Pending {
                r.enrichment_status = EnrichmentStatus::Enriched;
                r.enrichment_error = None;
                r.enriched = Some(fields);
            }
        }
    }

    /// Pending → Failed, recording the reason.
    pub fn mark_failed(&mut self, segment_id: u64, reason: &str) {
        if let Some(&i) = self.index.get(&segment_id) {
            let r = &mut self.records[i];
            if r.enrichment_status == EnrichmentStatus::Pending {
                r.enrichment_status = EnrichmentStatus::Failed;
                r.enrichment_error = Some(reason.to_string());
            }
        }
    }

    /// Explicit reset: Failed → Pending. The only sanctioned status
    /// regression, behind its own CLI operation.
    pub fn reset_failed(&mut self) -> usize {
        let mut reset = 0;
        for r in &mut self.records {
            if r.enrichment_status == EnrichmentStatus::Failed {
                r.enrichment_status = EnrichmentStatus::Pending;
                r.enrichment_error = None;
                r.enriched = None;
                reset += 1;
            }
        }
        reset
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut c = StatusCounts::default();
        for r in &self.records {
            match r.enrichment_status {
                EnrichmentStatus::Pending => c.pending += 1,
                EnrichmentStatus::Enriched => c.enriched += 1,
                EnrichmentStatus::Failed => c.failed += 1,
            }
        }
        c.total = self.records.len();
        c
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StatusCounts {
    pub total: usize,
    pub pending: usize,
    pub enriched: usize,
    pub failed: usize,
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Coordinate, SegmentType};
    use chrono::NaiveDate;

    fn record(id: u64, name: &str) -> CanonicalRecord {
        CanonicalRecord {
            segment_id: id,
            name: name.to_string(),
            segment_type: SegmentType::Ride,
            distance_meters: 5200.0,
            elevation_meters: 128.0,
            achieved_on: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            source_url: format!("https://www.strava.com/segments/{id}"),
            elapsed_time: None,
            effort_url: None,
            enrichment_status: EnrichmentStatus::Pending,
            enrichment_error: None,
            enriched: None,
        }
    }

    fn fields() -> EnrichedFields {
        EnrichedFields {
            polyline: "abc123".to_string(),
            start_coordinate: Coordinate { lat: 59.3, lng: 18.0 },
            end_coordinate: Coordinate { lat: 59.4, lng: 18.1 },
            average_speed: 8.5,
            effort_count: 1200,
            athlete_count: 340,
        }
    }

    #[test]
    fn upsert_dedupes_by_segment_id() {
        let mut ds = Dataset::new();
        assert!(ds.upsert(record(1, "Hill")));
        assert!(!ds.upsert(record(1, "Hill")));
        assert_eq!(ds.len(), 1);
    }

    #[test]
    fn upsert_preserves_enrichment() {
        let mut ds = Dataset::new();
        ds.upsert(record(1, "Hill"));
        ds.mark_enriched(1, fields());

        // Re-extraction with a renamed segment
        ds.upsert(record(1, "Hill (renamed)"));
        let r = ds.get(1).unwrap();
        assert_eq!(r.name, "Hill (renamed)");
        assert_eq!(r.enrichment_status, EnrichmentStatus::Enriched);
        assert!(r.enriched.is_some());
        assert!(r.is_consistent());
    }

    #[test]
    fn status_never_regresses() {
        let mut ds = Dataset::new();
        ds.upsert(record(1, "Hill"));
        ds.mark_failed(1, "HTTP 404");
        ds.mark_enriched(1, fields());
        assert_eq!(ds.get(1).unwrap().enrichment_status, EnrichmentStatus::Failed);

        ds.upsert(record(2, "Sprint"));
        ds.mark_enriched(2, fields());
        ds.mark_failed(2, "late error");
        assert_eq!(ds.get(2).unwrap().enrichment_status, EnrichmentStatus::Enriched);
    }

    #[test]
    fn reset_failed_requeues() {
        let mut ds = Dataset::new();
        ds.upsert(record(1, "Hill"));
        ds.upsert(record(2, "Sprint"));
        ds.mark_failed(1, "HTTP 404");
        ds.mark_enriched(2, fields());

        assert_eq!(ds.reset_failed(), 1);
        assert_eq!(ds.pending_ids(), vec![1]);
        assert_eq!(ds.get(2).unwrap().enrichment_status, EnrichmentStatus::Enriched);
    }

    #[test]
    fn roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ds.json");

        let mut ds = Dataset::new();
        ds.upsert(record(1, "Hill"));
        ds.upsert(record(2, "Sprint"));
        ds.mark_enriched(2, fields());
        ds.save(&path).unwrap();

        let loaded = Dataset::load_or_empty(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(2).unwrap().enriched, Some(fields()));
        assert_eq!(loaded.pending_ids(), vec![1]);
    }

    #[test]
    fn load_missing_file_is_empty() {
        let ds = Dataset::load_or_empty(Path::new("data/definitely_not_here.json")).unwrap();
        assert!(ds.is_empty());
    }
}
