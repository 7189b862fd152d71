//! Decoded sparse histogram snapshots.
//!
//! A sparse histogram does not carry a dense array of buckets. Each side of the zero bucket is
//! described by a list of [`BucketSpan`]s, runs of contiguous populated bucket indices, and a
//! parallel list of deltas: each entry is the difference between a bucket's count and the count
//! of the bucket before it.

use thiserror::Error;

use crate::decoder::Side;

/// Errors that could occur while validating or tracking a histogram snapshot.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    /// The resolution was zero, which leaves bucket bounds undefined.
    #[error("resolution must be greater than zero")]
    ZeroResolution,

    /// The zero threshold was negative, NaN or infinite.
    #[error("zero threshold must be finite and non-negative")]
    InvalidZeroThreshold,

    /// A span covered no buckets at all.
    #[error("{side} span #{span} has zero length")]
    EmptySpan {
        /// Side of the histogram the span belongs to.
        side: Side,
        /// Position of the span within the side's span list.
        span: usize,
    },

    /// A span after the first one moved backwards.
    #[error("{side} span #{span} has negative offset {offset}")]
    NegativeGap {
        /// Side of the histogram the span belongs to.
        side: Side,
        /// Position of the span within the side's span list.
        span: usize,
        /// The offending offset.
        offset: i32,
    },

    /// The spans of a side do not cover exactly as many buckets as there are deltas.
    #[error("{side} spans cover {buckets} buckets but {deltas} deltas were given")]
    LengthMismatch {
        /// Side of the histogram.
        side: Side,
        /// Total length across all spans.
        buckets: u64,
        /// Length of the delta array.
        deltas: usize,
    },

    /// A bucket index does not fit into the index range.
    #[error("{side} bucket index overflows at span #{span}")]
    IndexOverflow {
        /// Side of the histogram.
        side: Side,
        /// Position of the span that overflowed.
        span: usize,
    },

    /// The zero count does not fit into a signed cumulative count.
    #[error("zero count {0} is too large")]
    ZeroCountOverflow(u64),

    /// A cumulative count, or one of its differences across scrapes, overflowed.
    #[error("{side} bucket {index} overflows while accumulating counts")]
    CountOverflow {
        /// Side of the histogram.
        side: Side,
        /// Bucket index where the overflow happened.
        index: i32,
    },
}

/// A run of contiguous populated buckets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketSpan {
    /// Gap to the previous span, or the starting index for the first span.
    pub offset: i32,
    /// Number of buckets in this run.
    pub length: u32,
}

impl BucketSpan {
    /// Creates a new `BucketSpan`.
    pub const fn new(offset: i32, length: u32) -> Self {
        Self { offset, length }
    }
}

/// One side (positive or negative) of a sparse histogram.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SparseBuckets {
    /// Runs of populated bucket indices.
    pub spans: Vec<BucketSpan>,
    /// One delta per bucket covered by `spans`.
    pub deltas: Vec<i64>,
}

impl SparseBuckets {
    /// Creates a new `SparseBuckets` from spans and their deltas.
    pub fn new(spans: Vec<BucketSpan>, deltas: Vec<i64>) -> Self {
        Self { spans, deltas }
    }

    /// Returns `true` if this side has no populated buckets.
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub(crate) fn validate(&self, side: Side) -> Result<(), SnapshotError> {
        let mut buckets = 0u64;
        // Index one past the end of the previous span.
        let mut next_index = 0i64;

        for (span, bs) in self.spans.iter().enumerate() {
            if bs.length == 0 {
                return Err(SnapshotError::EmptySpan { side, span });
            }
            if span > 0 && bs.offset < 0 {
                return Err(SnapshotError::NegativeGap { side, span, offset: bs.offset });
            }

            let start = next_index + i64::from(bs.offset);
            let end = start + i64::from(bs.length) - 1;
            if i32::try_from(start).is_err() || i32::try_from(end).is_err() {
                return Err(SnapshotError::IndexOverflow { side, span });
            }

            next_index = end + 1;
            buckets += u64::from(bs.length);
        }

        if buckets != self.deltas.len() as u64 {
            return Err(SnapshotError::LengthMismatch { side, buckets, deltas: self.deltas.len() });
        }

        Ok(())
    }
}

/// An immutable, already-decoded scrape of one sparse histogram.
#[derive(Clone, Debug, PartialEq)]
pub struct HistogramSnapshot {
    /// Buckets per decade.
    pub resolution: u8,
    /// Magnitudes at or below this threshold fall into the zero bucket.
    pub zero_threshold: f64,
    /// Number of observations in the zero bucket.
    pub zero_count: u64,
    /// Buckets above the zero bucket.
    pub positive: SparseBuckets,
    /// Buckets below the zero bucket.
    pub negative: SparseBuckets,
}

impl HistogramSnapshot {
    /// Creates a snapshot with no populated buckets.
    pub fn new(resolution: u8, zero_threshold: f64, zero_count: u64) -> Self {
        Self {
            resolution,
            zero_threshold,
            zero_count,
            positive: SparseBuckets::default(),
            negative: SparseBuckets::default(),
        }
    }

    /// Sets the positive buckets.
    #[must_use]
    pub fn with_positive(mut self, spans: Vec<BucketSpan>, deltas: Vec<i64>) -> Self {
        self.positive = SparseBuckets::new(spans, deltas);
        self
    }

    /// Sets the negative buckets.
    #[must_use]
    pub fn with_negative(mut self, spans: Vec<BucketSpan>, deltas: Vec<i64>) -> Self {
        self.negative = SparseBuckets::new(spans, deltas);
        self
    }

    /// Returns the buckets for the given side.
    pub fn buckets(&self, side: Side) -> &SparseBuckets {
        match side {
            Side::Positive => &self.positive,
            Side::Negative => &self.negative,
        }
    }

    /// Total number of buckets, including the zero bucket.
    pub fn bucket_count(&self) -> usize {
        self.negative.deltas.len() + 1 + self.positive.deltas.len()
    }

    /// Total number of spans across both sides.
    pub fn span_count(&self) -> usize {
        self.negative.spans.len() + self.positive.spans.len()
    }

    /// Checks that the snapshot is well-formed.
    ///
    /// Decoding and tracking assume a well-formed snapshot, so both call this first.
    ///
    /// # Errors
    ///
    /// Returns the first problem found: a zero resolution, an unusable zero threshold, or a side
    /// whose spans are empty, move backwards, overflow the index range, or cover a different
    /// number of buckets than there are deltas.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        self.validate_schema()?;
        self.negative.validate(Side::Negative)?;
        self.positive.validate(Side::Positive)
    }

    pub(crate) fn validate_schema(&self) -> Result<(), SnapshotError> {
        if self.resolution == 0 {
            return Err(SnapshotError::ZeroResolution);
        }
        if !self.zero_threshold.is_finite() || self.zero_threshold < 0.0 {
            return Err(SnapshotError::InvalidZeroThreshold);
        }
        self.signed_zero_count().map(|_| ())
    }

    pub(crate) fn signed_zero_count(&self) -> Result<i64, SnapshotError> {
        i64::try_from(self.zero_count)
            .map_err(|_| SnapshotError::ZeroCountOverflow(self.zero_count))
    }
}
