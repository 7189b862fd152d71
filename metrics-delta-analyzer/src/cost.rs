//! Bit-cost model for variable-length encoded third-order values.
//!
//! A scheme is an ascending list of bit widths. A value of zero is written as a single marker
//! bit. Any other value goes into the narrowest width whose signed range holds it, and is written
//! as a unary escape selecting that width followed by the value itself. Reaching the widest
//! width needs no terminating marker bit.
use std::fmt;

use thiserror::Error;

use crate::{builder::ConfigError, frequency::FrequencyTable};

/// Maximum number of boundaries in a scheme.
pub const MAX_BOUNDARIES: usize = 4;

/// Bit width treated as an unbounded range.
pub const UNBOUNDED_WIDTH: u8 = 64;

/// Errors that could occur while evaluating a scheme.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CostError {
    /// A value is outside of the range of the widest boundary.
    #[error("value {value} does not fit into the largest bit bucket ({largest} bits)")]
    Overflow {
        /// The value that could not be classified.
        value: i64,
        /// Width of the widest boundary.
        largest: u8,
    },
}

/// Bucket a value is classified into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BitBucket {
    /// The value zero.
    Zero,

    /// Boundary at the given position of the scheme, counting from zero.
    Bounded(usize),
}

/// A validated bit-bucket scheme.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitBuckets {
    boundaries: Vec<u8>,
    limits: Vec<Option<i64>>,
}

impl BitBuckets {
    /// Creates a new `BitBuckets` from its boundaries.
    ///
    /// # Errors
    ///
    /// The boundaries must be non-empty, strictly ascending, at most [`MAX_BOUNDARIES`] long, and
    /// each between 1 and 64 bits wide. Otherwise, an error variant will be returned describing
    /// the issue.
    pub fn new(boundaries: Vec<u8>) -> Result<Self, ConfigError> {
        if boundaries.is_empty() {
            return Err(ConfigError::EmptyBoundaries);
        }
        if boundaries.len() > MAX_BOUNDARIES {
            return Err(ConfigError::TooManyBoundaries(boundaries.len()));
        }
        for &width in &boundaries {
            if width == 0 {
                return Err(ConfigError::ZeroBoundary);
            }
            if width > UNBOUNDED_WIDTH {
                return Err(ConfigError::BoundaryTooWide(width));
            }
        }
        if let Some(pair) = boundaries.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(ConfigError::NotAscending { previous: pair[0], next: pair[1] });
        }

        let limits = boundaries.iter().map(|&width| limit(width)).collect();
        Ok(Self { boundaries, limits })
    }

    /// Boundaries of this scheme, ascending.
    pub fn boundaries(&self) -> &[u8] {
        &self.boundaries
    }

    /// Number of buckets, including the zero bucket.
    pub fn len(&self) -> usize {
        self.boundaries.len() + 1
    }

    /// Always `false`: a scheme has at least the zero bucket and one boundary.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Classifies `value` into the narrowest bucket that holds it.
    ///
    /// # Errors
    ///
    /// If `value` is out of range for the widest boundary, an error is returned.
    pub fn classify(&self, value: i64) -> Result<BitBucket, CostError> {
        if value == 0 {
            return Ok(BitBucket::Zero);
        }

        self.limits
            .iter()
            .position(|limit| match limit {
                Some(limit) => value >= -limit && value < *limit,
                None => true,
            })
            .map(BitBucket::Bounded)
            .ok_or_else(|| CostError::Overflow { value, largest: self.largest() })
    }

    /// Bits needed to encode one value in `bucket`.
    pub fn cost_of(&self, bucket: BitBucket) -> u32 {
        match bucket {
            BitBucket::Zero => 1,
            BitBucket::Bounded(position) => {
                let width = u32::from(self.boundaries[position]);
                let markers = position as u32 + 2;
                if position + 1 == self.boundaries.len() {
                    markers - 1 + width
                } else {
                    markers + width
                }
            }
        }
    }

    /// Computes what encoding every value of `table` would cost.
    ///
    /// # Errors
    ///
    /// Fails on the first value that cannot be classified; no partial report is produced.
    pub fn evaluate(&self, table: &FrequencyTable) -> Result<CostReport, CostError> {
        let mut counts = vec![0u64; self.len()];
        for (value, count) in table.iter() {
            let slot = match self.classify(value)? {
                BitBucket::Zero => 0,
                BitBucket::Bounded(position) => position + 1,
            };
            counts[slot] += count;
        }

        let total_bits = counts.iter().enumerate().fold(0u64, |total, (slot, count)| {
            let bucket = if slot == 0 { BitBucket::Zero } else { BitBucket::Bounded(slot - 1) };
            total.saturating_add(count.saturating_mul(u64::from(self.cost_of(bucket))))
        });

        Ok(CostReport { boundaries: self.boundaries.clone(), counts, total_bits })
    }

    fn largest(&self) -> u8 {
        self.boundaries.last().copied().unwrap_or(0)
    }
}

fn limit(width: u8) -> Option<i64> {
    if width >= UNBOUNDED_WIDTH {
        None
    } else {
        Some(1i64 << (width - 1))
    }
}

/// Outcome of evaluating a scheme against a frequency table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CostReport {
    boundaries: Vec<u8>,
    counts: Vec<u64>,
    total_bits: u64,
}

impl CostReport {
    /// Boundaries of the evaluated scheme.
    pub fn boundaries(&self) -> &[u8] {
        &self.boundaries
    }

    /// Occurrences per bucket: the zero bucket first, then one entry per boundary.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Total encoded size, in bits.
    pub fn total_bits(&self) -> u64 {
        self.total_bits
    }

    /// Total encoded size, in whole bytes.
    pub fn total_bytes(&self) -> u64 {
        self.total_bits / 8
    }

    /// Number of classified values.
    pub fn occurrences(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Share of all occurrences that went into the bucket at `slot`, indexed as in
    /// [`counts`](Self::counts).
    ///
    /// Returns zero if nothing was classified, or `slot` is out of range.
    pub fn fraction(&self, slot: usize) -> f64 {
        let total = self.occurrences();
        match self.counts.get(slot) {
            Some(count) if total > 0 => *count as f64 / total as f64,
            _ => 0.0,
        }
    }

    /// Average encoded size per scrape, in bytes.
    pub fn bytes_per_scrape(&self, scrapes: u64) -> f64 {
        if scrapes == 0 {
            return 0.0;
        }
        self.total_bits as f64 / 8.0 / scrapes as f64
    }

    /// Renders the report, averaging the size over `scrapes`.
    pub fn display(&self, scrapes: u64) -> CostReportDisplay<'_> {
        CostReportDisplay { report: self, scrapes }
    }
}

/// Textual rendering of a [`CostReport`].
pub struct CostReportDisplay<'a> {
    report: &'a CostReport,
    scrapes: u64,
}

impl fmt::Display for CostReportDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let report = self.report;
        writeln!(f, "- Bit bucket frequency ({} buckets incl. zero bucket):", report.counts.len())?;

        for (slot, count) in report.counts.iter().enumerate() {
            let width = if slot == 0 { 0 } else { report.boundaries[slot - 1] };
            writeln!(f, "  {} bits → {} ({:.2}%)", width, count, report.fraction(slot) * 100.0)?;
        }

        writeln!(
            f,
            "  TOTAL storage size for ΔΔ(Δ) values: {} bytes ({:.1} bytes per scrape)",
            report.total_bytes(),
            report.bytes_per_scrape(self.scrapes)
        )
    }
}

impl fmt::Display for BitBuckets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, width) in self.boundaries.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{width}")?;
        }
        Ok(())
    }
}
