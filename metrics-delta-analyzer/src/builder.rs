use std::num::ParseIntError;

use thiserror::Error;

use crate::{
    analyzer::Analyzer,
    cost::{BitBuckets, MAX_BOUNDARIES},
    registry::TrackerRegistry,
    search::MAX_EXTRA_BOUNDARIES,
    tracker::TrackingMode,
};

/// Boundaries used by Gorilla for timestamps.
pub const GORILLA_TIMESTAMPS: &[u8] = &[7, 9, 12, 32];

/// Boundaries used by Prometheus 2 for timestamps.
pub const PROMETHEUS_2_TIMESTAMPS: &[u8] = &[14, 17, 20, 64];

/// Boundaries used by Prometheus 1 for timestamps.
pub const PROMETHEUS_1_TIMESTAMPS: &[u8] = &[6, 17, 23];

/// Boundaries used by Prometheus 1 for integer values.
pub const PROMETHEUS_1_VALUES: &[u8] = &[6, 13, 20, 33];

/// Errors that could occur while configuring an analyzer or a bit-bucket scheme.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A fixed scheme was requested without any boundary.
    #[error("bit bucket scheme needs at least one boundary")]
    EmptyBoundaries,

    /// A zero boundary was combined with other boundaries.
    ///
    /// Zero on its own requests a search, it is not a usable width.
    #[error("zero bit boundary cannot be combined with other boundaries")]
    ZeroBoundary,

    /// A boundary was wider than 64 bits.
    #[error("bit boundary {0} is wider than 64 bits")]
    BoundaryTooWide(u8),

    /// The boundaries were not strictly ascending.
    #[error("bit boundaries must be strictly ascending, found {next} after {previous}")]
    NotAscending {
        /// The earlier boundary.
        previous: u8,
        /// The boundary that did not exceed it.
        next: u8,
    },

    /// More boundaries than a scheme can hold.
    #[error("{0} bit boundaries given, at most {max} are supported", max = MAX_BOUNDARIES)]
    TooManyBoundaries(usize),

    /// The search was asked to place too many boundaries.
    #[error(
        "search for {0} extra bit boundaries requested, at most {max} are supported",
        max = MAX_EXTRA_BOUNDARIES
    )]
    TooManyExtraBoundaries(usize),

    /// An entry of a boundary list could not be parsed.
    #[error("invalid bit boundary '{entry}': {source}")]
    InvalidBoundary {
        /// The offending entry.
        entry: String,
        /// Details about the parsing failure.
        source: ParseIntError,
    },
}

/// What an analyzer reports after each scrape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnalysisMode {
    /// The raw distribution of third-order values.
    Frequencies,

    /// The cheapest scheme found by searching, with up to `max_extra` boundaries below the top
    /// width.
    Search {
        /// Maximum number of extra boundaries.
        max_extra: usize,
    },

    /// The cost of a fixed scheme.
    Fixed(BitBuckets),
}

/// Builder for an [`Analyzer`].
pub struct AnalyzerBuilder {
    bit_boundaries: Vec<u8>,
    tracking_mode: TrackingMode,
    max_extra_boundaries: usize,
    bucket_dump: bool,
}

impl AnalyzerBuilder {
    /// Set the bit boundaries to evaluate.
    ///
    /// An empty list reports the raw distribution of third-order values instead of a cost. A list
    /// holding only `0` searches for the cheapest scheme. Anything else is evaluated as a fixed
    /// scheme, and must be strictly ascending.
    ///
    /// Defaults to an empty list.
    #[must_use]
    pub fn with_bit_boundaries<I>(mut self, boundaries: I) -> Self
    where
        I: IntoIterator<Item = u8>,
    {
        self.bit_boundaries = boundaries.into_iter().collect();
        self
    }

    /// Set the bit boundaries from a comma-separated list, such as `7,9,12,32`.
    ///
    /// The entries are sorted, so `32,7,12,9` is equivalent. A blank string means an empty list.
    /// See [`with_bit_boundaries`](Self::with_bit_boundaries) for how the list is used.
    ///
    /// # Errors
    ///
    /// If any entry is not an integer between 0 and 255, an error will be returned.
    pub fn with_bit_boundaries_str<S>(mut self, boundaries: S) -> Result<Self, ConfigError>
    where
        S: AsRef<str>,
    {
        let boundaries = boundaries.as_ref().trim();
        let mut parsed = Vec::new();
        if !boundaries.is_empty() {
            for entry in boundaries.split(',') {
                let entry = entry.trim();
                let width = entry.parse::<u8>().map_err(|source| ConfigError::InvalidBoundary {
                    entry: entry.to_string(),
                    source,
                })?;
                parsed.push(width);
            }
        }
        parsed.sort_unstable();

        self.bit_boundaries = parsed;
        Ok(self)
    }

    /// Set the tracking mode.
    ///
    /// Defaults to [`TrackingMode::Delta`].
    #[must_use]
    pub fn with_tracking_mode(mut self, mode: TrackingMode) -> Self {
        self.tracking_mode = mode;
        self
    }

    /// Set how many boundaries a search may place below the top width.
    ///
    /// Only used when searching. Every additional boundary multiplies the number of candidates
    /// evaluated.
    ///
    /// Defaults to 3, which is also the maximum.
    #[must_use]
    pub fn with_max_extra_boundaries(mut self, max_extra: usize) -> Self {
        self.max_extra_boundaries = max_extra;
        self
    }

    /// Set whether tracking a scrape also renders the decoded buckets.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn with_bucket_dump(mut self, bucket_dump: bool) -> Self {
        self.bucket_dump = bucket_dump;
        self
    }

    /// Builds the analyzer.
    ///
    /// # Errors
    ///
    /// If the bit boundaries or the search depth are invalid, an error variant will be returned
    /// describing the issue.
    pub fn build(self) -> Result<Analyzer, ConfigError> {
        if self.max_extra_boundaries > MAX_EXTRA_BOUNDARIES {
            return Err(ConfigError::TooManyExtraBoundaries(self.max_extra_boundaries));
        }

        let analysis_mode = match self.bit_boundaries.as_slice() {
            [] => AnalysisMode::Frequencies,
            [0] => AnalysisMode::Search { max_extra: self.max_extra_boundaries },
            _ => AnalysisMode::Fixed(BitBuckets::new(self.bit_boundaries)?),
        };

        let registry = TrackerRegistry::new(self.tracking_mode);
        Ok(Analyzer::new(registry, analysis_mode, self.bucket_dump))
    }
}

impl Default for AnalyzerBuilder {
    fn default() -> Self {
        AnalyzerBuilder {
            bit_boundaries: Vec::new(),
            tracking_mode: TrackingMode::default(),
            max_extra_boundaries: MAX_EXTRA_BOUNDARIES,
            bucket_dump: false,
        }
    }
}
