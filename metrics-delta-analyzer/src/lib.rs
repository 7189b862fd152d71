//! Storage-cost analysis for the bucket counts of sparse histograms.
//!
//! A sparse histogram describes its populated buckets as runs of contiguous indices ("spans") and
//! one delta per bucket. Storing every scrape of such a histogram verbatim is wasteful: from one
//! scrape to the next, most buckets change by about as much as they did the previous time. This
//! crate measures how much that can be exploited.
//!
//! For every histogram it tracks, per bucket, the change of the tracked value since the previous
//! scrape (second order) and the change of that change (third order). The third-order values are
//! collected in a frequency table, which is then either:
//! - reported as-is,
//! - costed against a fixed bit-bucket scheme, a variable-length code that spends few bits on small
//!   values and escapes to wider widths for large ones, or
//! - searched for the scheme with the smallest total cost.
//!
//! # Usage
//!
//! ```
//! # use metrics::Key;
//! # use metrics_delta_analyzer::{AnalyzerBuilder, BucketSpan, HistogramSnapshot};
//! // Cost each scrape against the scheme Gorilla uses for timestamps.
//! let analyzer = AnalyzerBuilder::default()
//!     .with_bit_boundaries_str("7,9,12,32")
//!     .expect("valid bit boundaries")
//!     .build()
//!     .expect("valid configuration");
//!
//! let key = Key::from_name("request_latency_seconds");
//! for deltas in [vec![5, -2, 1], vec![6, -2, 0], vec![6, -1, 0]] {
//!     // Snapshots normally come from decoding a scraped exposition format.
//!     let snapshot = HistogramSnapshot::new(20, 1e-128, 10)
//!         .with_positive(vec![BucketSpan::new(0, 3)], deltas);
//!
//!     let report = analyzer.scrape(&key, &snapshot).expect("well-formed snapshot");
//!     println!("{report}");
//! }
//! ```
//!
//! # Concurrency
//!
//! An [`Analyzer`] can be shared between threads. Scrapes of distinct histograms are tracked
//! concurrently, while scrapes of the same histogram are applied one at a time, in the order they
//! acquire its lock. Analysis works on a copy of the frequency table, so a long search never
//! holds up tracking, and can be cancelled through [`Analyzer::analyze_with_cancel`].
//!
//! # Memory
//!
//! Per histogram, only the buckets present in the latest scrape are remembered, but the frequency
//! table and the set of tracked histograms only ever grow.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod analyzer;
pub use self::analyzer::{Analysis, AnalysisError, AnalysisReport, Analyzer, ScrapeReport, Tracked};

mod builder;
pub use self::builder::{
    AnalysisMode, AnalyzerBuilder, ConfigError, GORILLA_TIMESTAMPS, PROMETHEUS_1_TIMESTAMPS,
    PROMETHEUS_1_VALUES, PROMETHEUS_2_TIMESTAMPS,
};

mod cost;
pub use self::cost::{
    BitBucket, BitBuckets, CostError, CostReport, CostReportDisplay, MAX_BOUNDARIES,
    UNBOUNDED_WIDTH,
};

mod decoder;
pub use self::decoder::{
    bucket_bound, Ascending, BucketDump, DecodedBucket, DecodedSide, Descending, Side, TailFirst,
};

mod frequency;
pub use self::frequency::{FrequencyReport, FrequencyTable};

mod registry;
pub use self::registry::{FrequencySnapshot, Identity, TrackerRegistry};

mod search;
pub use self::search::{
    required_top_width, search, search_with_cancel, BoundaryOdometer, DepthResult, SearchError,
    SearchOutcome, SearchOutcomeDisplay, MAX_EXTRA_BOUNDARIES,
};

mod snapshot;
pub use self::snapshot::{BucketSpan, HistogramSnapshot, SnapshotError, SparseBuckets};

mod tracker;
pub use self::tracker::{DeltaTracker, ThirdOrderDelta, ThirdOrderDeltas, TrackingMode};
