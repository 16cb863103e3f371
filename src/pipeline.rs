//! Pipeline orchestration: the one stateful coordinator.
//!
//! Drives extraction → normalization → enrichment over the persisted
//! dataset, and is the only module that touches the artifacts on disk.
//! Every exit path persists whatever state exists; a phase failure never
//! takes accumulated work down with it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use crate::dataset::Dataset;
use crate::enrich::{run_enrichment, SegmentApi};
use crate::extract;
use crate::limiter::RateLimiter;
use crate::normalize::normalize;
use crate::session::RecordPage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Extracting,
    Normalizing,
    Enriching,
    /// Everything settled and the complemented dataset is on disk. Some
    /// records may still be failed or pending; that is a valid dataset,
    /// not an error.
    Persisted,
    /// Enrichment stopped early on a credential failure; the dataset as of
    /// the halt is on disk.
    PartiallyEnriched,
    /// Extraction or normalization died; prior state is on disk untouched.
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Extracting => "extracting",
            Phase::Normalizing => "normalizing",
            Phase::Enriching => "enriching",
            Phase::Persisted => "persisted",
            Phase::PartiallyEnriched => "partially-enriched",
            Phase::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub final_phase: Phase,
    pub extracted: usize,
    pub skipped_rows: usize,
    pub new_records: usize,
    pub updated_records: usize,
    pub skipped_entries: usize,
    pub enriched: usize,
    pub enrich_failed: usize,
    pub still_pending: usize,
    pub dataset_path: PathBuf,
    /// Which phase failed and why, when the run did not reach `Persisted`.
    pub failure: Option<String>,
}

pub struct PipelineOrchestrator {
    raw_path: PathBuf,
    enriched_path: PathBuf,
    phase: Phase,
}

impl PipelineOrchestrator {
    pub fn new(raw_path: &Path, enriched_path: &Path) -> Self {
        Self {
            raw_path: raw_path.to_path_buf(),
            enriched_path: enriched_path.to_path_buf(),
            phase: Phase::Idle,
        }
    }

    /// Load the resumable dataset: the complemented artifact overlaid with
    /// the raw one. An extraction-only pass writes raw alone, so the raw
    /// artifact can carry records and descriptive updates the complemented
    /// one has not seen yet; the merge keeps enrichment state where both
    /// know a record.
    pub fn load_dataset(&self) -> Result<Dataset> {
        let mut ds = Dataset::load_or_empty(&self.enriched_path)?;
        let raw = Dataset::load_or_empty(&self.raw_path)?;
        for record in raw.records() {
            ds.upsert(record.clone());
        }
        Ok(ds)
    }

    fn transition(&mut self, next: Phase) {
        info!("Pipeline phase: {} → {}", self.phase, next);
        self.phase = next;
    }

    /// One full invocation. Repeated runs are cheap: records already
    /// enriched are merged over, not re-fetched, and spend no API budget.
    pub async fn run<P, A>(
        &mut self,
        page: &mut P,
        api: Arc<A>,
        limiter: Arc<RateLimiter>,
    ) -> Result<RunSummary>
    where
        P: RecordPage,
        A: SegmentApi,
    {
        let mut dataset = self.load_dataset()?;
        let mut summary = self.empty_summary();

        // ── Extraction ──
        self.transition(Phase::Extracting);
        let extraction = match extract::extract(page).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Extraction failed: {}", e);
                self.transition(Phase::Failed);
                // Prior state survives as-is; nothing new to merge.
                dataset.save(&self.enriched_path)?;
                summary.final_phase = Phase::Failed;
                summary.failure = Some(format!("extraction phase: {e}"));
                summary.still_pending = dataset.status_counts().pending;
                return Ok(summary);
            }
        };
        summary.extracted = extraction.entries.len();
        summary.skipped_rows = extraction.skipped_rows;

        // ── Normalization ──
        self.transition(Phase::Normalizing);
        let norm = normalize(&extraction.entries, &mut dataset);
        summary.new_records = norm.new;
        summary.updated_records = norm.updated;
        summary.skipped_entries = norm.skipped;
        dataset.save(&self.raw_path)?;
        info!(
            "Normalized: {} new, {} updated, {} skipped → {}",
            norm.new,
            norm.updated,
            norm.skipped,
            self.raw_path.display()
        );

        // ── Enrichment ──
        self.transition(Phase::Enriching);
        let stats = run_enrichment(&mut dataset, api, limiter).await;
        summary.enriched = stats.enriched;
        summary.enrich_failed = stats.failed;

        // Persist is a barrier: run_enrichment returns only once all
        // in-flight attempts have settled.
        dataset.save(&self.enriched_path)?;
        summary.still_pending = dataset.status_counts().pending;

        if let Some(reason) = stats.credential_error {
            self.transition(Phase::PartiallyEnriched);
            summary.final_phase = Phase::PartiallyEnriched;
            summary.failure = Some(format!("enrichment phase: {reason}"));
        } else {
            self.transition(Phase::Persisted);
            summary.final_phase = Phase::Persisted;
        }
        Ok(summary)
    }

    /// Extraction + normalization only; writes the raw artifact.
    pub async fn run_extraction<P: RecordPage>(&mut self, page: &mut P) -> Result<RunSummary> {
        let mut dataset = self.load_dataset()?;
        let mut summary = self.empty_summary();
        summary.dataset_path = self.raw_path.clone();

        self.transition(Phase::Extracting);
        let extraction = match extract::extract(page).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.transition(Phase::Failed);
                summary.final_phase = Phase::Failed;
                summary.failure = Some(format!("extraction phase: {e}"));
                return Ok(summary);
            }
        };
        summary.extracted = extraction.entries.len();
        summary.skipped_rows = extraction.skipped_rows;

        self.transition(Phase::Normalizing);
        let norm = normalize(&extraction.entries, &mut dataset);
        summary.new_records = norm.new;
        summary.updated_records = norm.updated;
        summary.skipped_entries = norm.skipped;
        dataset.save(&self.raw_path)?;

        self.transition(Phase::Persisted);
        summary.final_phase = Phase::Persisted;
        summary.still_pending = dataset.status_counts().pending;
        Ok(summary)
    }

    /// Enrichment only, over whatever is already persisted.
    pub async fn run_enrichment_only<A: SegmentApi>(
        &mut self,
        api: Arc<A>,
        limiter: Arc<RateLimiter>,
    ) -> Result<RunSummary> {
        let mut dataset = self.load_dataset()?;
        let mut summary = self.empty_summary();

        self.transition(Phase::Enriching);
        let stats = run_enrichment(&mut dataset, api, limiter).await;
        summary.enriched = stats.enriched;
        summary.enrich_failed = stats.failed;

        dataset.save(&self.enriched_path)?;
        summary.still_pending = dataset.status_counts().pending;

        if let Some(reason) = stats.credential_error {
            self.transition(Phase::PartiallyEnriched);
            summary.final_phase = Phase::PartiallyEnriched;
            summary.failure = Some(format!("enrichment phase: {reason}"));
        } else {
            self.transition(Phase::Persisted);
            summary.final_phase = Phase::Persisted;
        }
        Ok(summary)
    }

    fn empty_summary(&self) -> RunSummary {
        RunSummary {
            final_phase: Phase::Idle,
            extracted: 0,
            skipped_rows: 0,
            new_records: 0,
            updated_records: 0,
            skipped_entries: 0,
            enriched: 0,
            enrich_failed: 0,
            still_pending: 0,
            dataset_path: self.enriched_path.clone(),
            failure: None,
        }
    }
}

// ── Tests ──
