//! Brute-force search for the cheapest bit-bucket scheme.
use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use thiserror::Error;
use tracing::debug;

use crate::{
    builder::ConfigError,
    cost::{BitBuckets, CostError, CostReport, MAX_BOUNDARIES},
    frequency::FrequencyTable,
};

/// Maximum number of boundaries the search places below the top width.
pub const MAX_EXTRA_BOUNDARIES: usize = MAX_BOUNDARIES - 1;

/// Errors that could occur while searching.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SearchError {
    /// The search was configured with an unusable depth.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A candidate scheme could not hold every value.
    #[error(transparent)]
    Cost(#[from] CostError),

    /// The search was cancelled before it finished.
    #[error("bit bucket search was cancelled")]
    Cancelled,
}

/// Smallest bit width whose signed range holds every value in `table`.
///
/// Always at least 2, so that an empty or all-zero table still gets a usable scheme.
pub fn required_top_width(table: &FrequencyTable) -> u8 {
    let max = table.max().unwrap_or(1).max(1);
    let min = table.min().unwrap_or(-1).min(-1);

    // `!min` is `-min - 1` without overflowing on `i64::MIN`.
    let for_max = bit_length(max as u64) + 1;
    let for_min = bit_length(!min as u64) + 1;
    for_max.max(for_min)
}

fn bit_length(value: u64) -> u8 {
    (u64::BITS - value.leading_zeros()) as u8
}

/// Enumerates schemes of `extra` boundaries below a fixed top width.
///
/// Every strictly ascending tuple drawn from `1..top` is visited exactly once, in lexicographic
/// order, each followed by `top` itself.
#[derive(Clone, Debug)]
pub struct BoundaryOdometer {
    current: Option<Vec<u8>>,
}

impl BoundaryOdometer {
    /// Creates a new `BoundaryOdometer`.
    ///
    /// If there are fewer than `extra` widths below `top`, the odometer yields nothing.
    pub fn new(extra: usize, top: u8) -> Self {
        let current = (extra < usize::from(top)).then(|| {
            let mut boundaries: Vec<u8> = (1..=extra as u8).collect();
            boundaries.push(top);
            boundaries
        });
        Self { current }
    }
}

impl Iterator for BoundaryOdometer {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current.as_mut()?;
        let item = current.clone();
        if !advance(current) {
            self.current = None;
        }
        Some(item)
    }
}

fn advance(boundaries: &mut [u8]) -> bool {
    let free = boundaries.len() - 1;

    // Rightmost position with room before its right neighbour. Everything right of it is
    // already packed against the top width.
    let Some(position) = (0..free).rev().find(|&p| boundaries[p + 1] - boundaries[p] > 1) else {
        return false;
    };

    boundaries[position] += 1;
    for q in position + 1..free {
        boundaries[q] = boundaries[q - 1] + 1;
    }
    true
}

/// Cheapest scheme found for one number of extra boundaries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DepthResult {
    /// Number of boundaries below the top width.
    pub extra: usize,
    /// Cost of the cheapest scheme; its boundaries are in [`CostReport::boundaries`].
    pub report: CostReport,
}

/// Result of a scheme search.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchOutcome {
    /// Cost of the scheme holding only the top width.
    pub baseline: CostReport,
    /// Cheapest scheme per number of extra boundaries, skipping those without room.
    pub depths: Vec<DepthResult>,
}

impl SearchOutcome {
    /// Cheapest scheme overall, the baseline included.
    ///
    /// Ties go to the scheme with fewer boundaries.
    pub fn best(&self) -> &CostReport {
        self.depths
            .iter()
            .map(|depth| &depth.report)
            .fold(&self.baseline, |best, report| {
                if report.total_bits() < best.total_bits() {
                    report
                } else {
                    best
                }
            })
    }

    /// Renders the baseline and the best report of every depth, averaging over `scrapes`.
    pub fn display(&self, scrapes: u64) -> SearchOutcomeDisplay<'_> {
        SearchOutcomeDisplay { outcome: self, scrapes }
    }
}

/// Textual rendering of a [`SearchOutcome`].
pub struct SearchOutcomeDisplay<'a> {
    outcome: &'a SearchOutcome,
    scrapes: u64,
}

impl fmt::Display for SearchOutcomeDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.outcome.baseline.display(self.scrapes))?;
        for depth in &self.outcome.depths {
            write!(f, "{}", depth.report.display(self.scrapes))?;
        }
        Ok(())
    }
}

/// Searches for the cheapest scheme with up to `max_extra` boundaries below the top width.
///
/// # Errors
///
/// If `max_extra` exceeds [`MAX_EXTRA_BOUNDARIES`], an error is returned.
pub fn search(table: &FrequencyTable, max_extra: usize) -> Result<SearchOutcome, SearchError> {
    search_with_cancel(table, max_extra, &AtomicBool::new(false))
}

/// Like [`search`], but stops with [`SearchError::Cancelled`] once `cancel` is set.
///
/// The flag is checked before every candidate is evaluated.
///
/// # Errors
///
/// If `max_extra` exceeds [`MAX_EXTRA_BOUNDARIES`], or the search was cancelled, an error is
/// returned.
pub fn search_with_cancel(
    table: &FrequencyTable,
    max_extra: usize,
    cancel: &AtomicBool,
) -> Result<SearchOutcome, SearchError> {
    if max_extra > MAX_EXTRA_BOUNDARIES {
        return Err(ConfigError::TooManyExtraBoundaries(max_extra).into());
    }

    let top = required_top_width(table);
    let baseline = evaluate(table, vec![top], cancel)?;

    let mut depths = Vec::new();
    for extra in 1..=max_extra {
        let mut best: Option<CostReport> = None;
        for boundaries in BoundaryOdometer::new(extra, top) {
            let report = evaluate(table, boundaries, cancel)?;
            if best.as_ref().map_or(true, |best| report.total_bits() < best.total_bits()) {
                best = Some(report);
            }
        }

        if let Some(report) = best {
            debug!(
                extra,
                boundaries = ?report.boundaries(),
                total_bits = report.total_bits(),
                "Found cheapest bit buckets for search depth."
            );
            depths.push(DepthResult { extra, report });
        }
    }

    Ok(SearchOutcome { baseline, depths })
}

fn evaluate(
    table: &FrequencyTable,
    boundaries: Vec<u8>,
    cancel: &AtomicBool,
) -> Result<CostReport, SearchError> {
    if cancel.load(Ordering::Relaxed) {
        return Err(SearchError::Cancelled);
    }
    Ok(BitBuckets::new(boundaries)?.evaluate(table)?)
}
