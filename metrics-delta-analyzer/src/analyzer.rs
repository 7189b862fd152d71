use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use metrics::Key;
use thiserror::Error;
use tracing::warn;

use crate::{
    builder::AnalysisMode,
    cost::{CostError, CostReport},
    decoder::BucketDump,
    frequency::FrequencyTable,
    registry::{FrequencySnapshot, Identity, TrackerRegistry},
    search::{search_with_cancel, SearchError, SearchOutcome},
    snapshot::{HistogramSnapshot, SnapshotError},
    tracker::{ThirdOrderDeltas, TrackingMode},
};

/// Errors that could occur while tracking or analyzing a histogram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnalysisError {
    /// The snapshot was malformed, or its values overflowed while tracking.
    #[error("malformed snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    /// The configured scheme cannot hold every tracked value.
    #[error(transparent)]
    Cost(#[from] CostError),

    /// The scheme search failed or was cancelled.
    #[error(transparent)]
    Search(#[from] SearchError),

    /// Analysis was requested for a histogram that was never tracked.
    #[error("histogram {0} has not been tracked")]
    UnknownHistogram(String),
}

/// Result of tracking a single scrape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tracked {
    /// Third-order values produced by the scrape.
    pub deltas: ThirdOrderDeltas,
    /// Decoded buckets of the scrape, if bucket dumps are enabled.
    pub dump: Option<String>,
}

/// What an analysis found, depending on the [`AnalysisMode`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnalysisReport {
    /// Raw distribution of third-order values.
    Frequencies {
        /// Copy of the frequency table.
        table: FrequencyTable,
        /// Tracking mode the values were produced with.
        mode: TrackingMode,
    },

    /// Cost of the configured scheme.
    Cost(CostReport),

    /// Cheapest scheme per search depth.
    Search(SearchOutcome),
}

/// Analysis of one histogram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Analysis {
    /// Number of scrapes the analysis covers.
    pub scrapes: u64,
    /// The findings.
    pub report: AnalysisReport,
}

impl fmt::Display for Analysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.report {
            AnalysisReport::Frequencies { table, mode } => write!(f, "{}", table.report(*mode)),
            AnalysisReport::Cost(report) => write!(f, "{}", report.display(self.scrapes)),
            AnalysisReport::Search(outcome) => write!(f, "{}", outcome.display(self.scrapes)),
        }
    }
}

/// Everything learned from one scrape of one histogram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScrapeReport {
    /// Rendered histogram identity.
    pub identity: String,
    /// The tracked scrape.
    pub tracked: Tracked,
    /// Analysis of all scrapes of the histogram so far.
    pub analysis: Analysis,
}

impl fmt::Display for ScrapeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "### Found sparse histogram: {}", self.identity)?;
        if let Some(dump) = &self.tracked.dump {
            f.write_str(dump)?;
        }
        write!(f, "{}", self.analysis)
    }
}

/// Tracks scrapes of sparse histograms and analyzes how compactly their changes could be stored.
///
/// Built with [`AnalyzerBuilder`](crate::AnalyzerBuilder). An `Analyzer` can be shared between
/// threads: scrapes of different histograms are tracked concurrently.
pub struct Analyzer {
    registry: TrackerRegistry,
    analysis_mode: AnalysisMode,
    bucket_dump: bool,
}

impl Analyzer {
    pub(crate) fn new(
        registry: TrackerRegistry,
        analysis_mode: AnalysisMode,
        bucket_dump: bool,
    ) -> Self {
        Self { registry, analysis_mode, bucket_dump }
    }

    /// What this analyzer reports.
    pub fn analysis_mode(&self) -> &AnalysisMode {
        &self.analysis_mode
    }

    /// Tracking mode used for every histogram.
    pub fn tracking_mode(&self) -> TrackingMode {
        self.registry.mode()
    }

    /// Whether tracking renders the decoded buckets.
    pub fn bucket_dump(&self) -> bool {
        self.bucket_dump
    }

    /// Per-histogram trackers.
    pub fn registry(&self) -> &TrackerRegistry {
        &self.registry
    }

    /// Tracks a scrape of the histogram identified by `key`.
    ///
    /// # Errors
    ///
    /// If the snapshot is rejected, an error is returned and the histogram's state is unchanged.
    pub fn track(&self, key: &Key, snapshot: &HistogramSnapshot) -> Result<Tracked, AnalysisError> {
        self.track_inner(key, snapshot).map_err(|e| {
            warn!(histogram = %Identity(key), error = %e, "Rejected histogram snapshot.");
            AnalysisError::from(e)
        })
    }

    fn track_inner(
        &self,
        key: &Key,
        snapshot: &HistogramSnapshot,
    ) -> Result<Tracked, SnapshotError> {
        let dump =
            if self.bucket_dump { Some(BucketDump::new(snapshot)?.to_string()) } else { None };
        let deltas = self.registry.update(key, snapshot)?;
        Ok(Tracked { deltas, dump })
    }

    /// Analyzes everything tracked so far for `key`.
    ///
    /// # Errors
    ///
    /// If `key` was never tracked, or the configured scheme cannot hold every tracked value, an
    /// error is returned. Tracked state is never affected.
    pub fn analyze(&self, key: &Key) -> Result<Analysis, AnalysisError> {
        self.analyze_with_cancel(key, &AtomicBool::new(false))
    }

    /// Like [`analyze`](Self::analyze), but a search stops early once `cancel` is set.
    ///
    /// The frequency table is copied before analysis starts, so the histogram can keep being
    /// tracked meanwhile.
    ///
    /// # Errors
    ///
    /// As [`analyze`](Self::analyze), and [`SearchError::Cancelled`] if a search was cancelled.
    pub fn analyze_with_cancel(
        &self,
        key: &Key,
        cancel: &AtomicBool,
    ) -> Result<Analysis, AnalysisError> {
        let FrequencySnapshot { table, scrapes } = self
            .registry
            .frequencies(key)
            .ok_or_else(|| AnalysisError::UnknownHistogram(Identity(key).to_string()))?;

        let report = match &self.analysis_mode {
            AnalysisMode::Frequencies => {
                AnalysisReport::Frequencies { table, mode: self.registry.mode() }
            }
            AnalysisMode::Fixed(buckets) => {
                let report = buckets.evaluate(&table).map_err(|e| {
                    warn!(
                        histogram = %Identity(key),
                        bit_buckets = %buckets,
                        error = %e,
                        "Bit bucket scheme cannot hold every tracked value."
                    );
                    e
                })?;
                AnalysisReport::Cost(report)
            }
            AnalysisMode::Search { max_extra } => {
                let outcome = search_with_cancel(&table, *max_extra, cancel).map_err(|e| {
                    if cancel.load(Ordering::Relaxed) {
                        warn!(histogram = %Identity(key), "Bit bucket search cancelled.");
                    }
                    e
                })?;
                AnalysisReport::Search(outcome)
            }
        };

        Ok(Analysis { scrapes, report })
    }

    /// Tracks a scrape of the histogram identified by `key`, then analyzes it.
    ///
    /// # Errors
    ///
    /// As [`track`](Self::track) and [`analyze`](Self::analyze). If analysis fails, the scrape
    /// stays tracked.
    pub fn scrape(
        &self,
        key: &Key,
        snapshot: &HistogramSnapshot,
    ) -> Result<ScrapeReport, AnalysisError> {
        let tracked = self.track(key, snapshot)?;
        let analysis = self.analyze(key)?;
        Ok(ScrapeReport { identity: Identity(key).to_string(), tracked, analysis })
    }
}
