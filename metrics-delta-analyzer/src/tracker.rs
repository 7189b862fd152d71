use std::collections::BTreeMap;

use tracing::trace;

use crate::{
    decoder::{DecodedSide, Side},
    frequency::FrequencyTable,
    snapshot::{HistogramSnapshot, SnapshotError},
};

/// Which per-bucket quantity is differenced across scrapes.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum TrackingMode {
    /// Track the bucket deltas as carried on the wire.
    ///
    /// The tracked values are Δ of Δ of the bucket delta, hence "ΔΔΔ".
    #[default]
    Delta,

    /// Track the absolute count of each bucket, reconstructed from the deltas.
    ///
    /// The tracked values are Δ of Δ of the bucket count, hence "ΔΔ". The first time a bucket
    /// index shows up there is no history for it, so the bucket delta stands in for its
    /// second-order value, and no second-order value is stored until the following scrape.
    Absolute,
}

impl TrackingMode {
    /// Short label for the kind of value this mode produces.
    pub fn value_label(&self) -> &'static str {
        match self {
            TrackingMode::Delta => "ΔΔΔ",
            TrackingMode::Absolute => "ΔΔ",
        }
    }
}

/// A third-order value produced for a single bucket by a single scrape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThirdOrderDelta {
    /// Side of the bucket.
    pub side: Side,
    /// Bucket index.
    pub index: i32,
    /// Change of the second-order value since the previous scrape.
    pub value: i64,
}

/// All third-order values produced by one scrape, negative side first, ascending index.
pub type ThirdOrderDeltas = Vec<ThirdOrderDelta>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct SideState {
    first: BTreeMap<i32, i64>,
    second: BTreeMap<i32, i64>,
}

/// Running first- and second-order values of one histogram.
///
/// Every update differences the new snapshot against the state left by the previous one, and
/// records the resulting third-order values in a frequency table that lives as long as the
/// tracker. Bucket schema changes between scrapes are not accounted for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeltaTracker {
    mode: TrackingMode,
    negative: SideState,
    positive: SideState,
    frequencies: FrequencyTable,
    scrapes: u64,
}

impl DeltaTracker {
    /// Creates a new `DeltaTracker`.
    pub fn new(mode: TrackingMode) -> Self {
        Self {
            mode,
            negative: SideState::default(),
            positive: SideState::default(),
            frequencies: FrequencyTable::new(),
            scrapes: 0,
        }
    }

    /// Tracking mode of this tracker.
    pub fn mode(&self) -> TrackingMode {
        self.mode
    }

    /// Number of scrapes tracked so far.
    pub fn scrapes(&self) -> u64 {
        self.scrapes
    }

    /// Third-order values accumulated over all scrapes.
    pub fn frequencies(&self) -> &FrequencyTable {
        &self.frequencies
    }

    /// First-order values by bucket index, as of the last scrape.
    pub fn first_order(&self, side: Side) -> &BTreeMap<i32, i64> {
        &self.state(side).first
    }

    /// Second-order values by bucket index, as of the last scrape.
    pub fn second_order(&self, side: Side) -> &BTreeMap<i32, i64> {
        &self.state(side).second
    }

    fn state(&self, side: Side) -> &SideState {
        match side {
            Side::Negative => &self.negative,
            Side::Positive => &self.positive,
        }
    }

    /// Tracks a new scrape of this histogram.
    ///
    /// Returns the third-order values of this scrape, which have already been recorded in
    /// [`frequencies`](DeltaTracker::frequencies). Only buckets present in `snapshot` survive
    /// in the state afterwards.
    ///
    /// # Errors
    ///
    /// If the snapshot is malformed, or any difference overflows, an error is returned and the
    /// tracker is left exactly as it was.
    pub fn update(
        &mut self,
        snapshot: &HistogramSnapshot,
    ) -> Result<ThirdOrderDeltas, SnapshotError> {
        let negative = DecodedSide::new(snapshot, Side::Negative)?;
        let positive = DecodedSide::new(snapshot, Side::Positive)?;

        let mut deltas = Vec::with_capacity(negative.len() + positive.len());
        let next_negative = advance(self.mode, &negative, &self.negative, &mut deltas)?;
        let next_positive = advance(self.mode, &positive, &self.positive, &mut deltas)?;

        self.negative = next_negative;
        self.positive = next_positive;
        self.frequencies.extend(deltas.iter().map(|d| d.value));
        self.scrapes += 1;

        trace!(
            scrape = self.scrapes,
            negative_buckets = negative.len(),
            positive_buckets = positive.len(),
            "Tracked histogram scrape."
        );

        Ok(deltas)
    }
}

fn advance(
    mode: TrackingMode,
    decoded: &DecodedSide<'_>,
    previous: &SideState,
    out: &mut ThirdOrderDeltas,
) -> Result<SideState, SnapshotError> {
    let side = decoded.side();
    let mut next = SideState::default();

    for bucket in decoded {
        let index = bucket.index;
        let overflow = || SnapshotError::CountOverflow { side, index };
        let previous_first = previous.first.get(&index).copied();

        let second = match mode {
            TrackingMode::Delta => {
                let second =
                    bucket.delta.checked_sub(previous_first.unwrap_or(0)).ok_or_else(overflow)?;
                next.first.insert(index, bucket.delta);
                next.second.insert(index, second);
                second
            }
            TrackingMode::Absolute => {
                next.first.insert(index, bucket.count);
                match previous_first {
                    Some(previous_count) => {
                        let second =
                            bucket.count.checked_sub(previous_count).ok_or_else(overflow)?;
                        next.second.insert(index, second);
                        second
                    }
                    // No history yet: seed with the bucket delta, store no second-order value.
                    None => bucket.delta,
                }
            }
        };

        let previous_second = previous.second.get(&index).copied().unwrap_or(0);
        let value = second.checked_sub(previous_second).ok_or_else(overflow)?;
        out.push(ThirdOrderDelta { side, index, value });
    }

    Ok(next)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use proptest::{collection::vec as arb_vec, prelude::*};

    use super::{DeltaTracker, TrackingMode};
    use crate::{
        decoder::{DecodedSide, Side},
        snapshot::{BucketSpan, HistogramSnapshot, SnapshotError},
    };

    fn positive(zero_count: u64, spans: Vec<BucketSpan>, deltas: Vec<i64>) -> HistogramSnapshot {
        HistogramSnapshot::new(20, 1e-128, zero_count).with_positive(spans, deltas)
    }

    fn values(deltas: &[super::ThirdOrderDelta]) -> Vec<i64> {
        deltas.iter().map(|d| d.value).collect()
    }

    fn map(tracker: &DeltaTracker, side: Side, second: bool) -> Vec<(i32, i64)> {
        let map = if second { tracker.second_order(side) } else { tracker.first_order(side) };
        map.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn test_delta_mode_consecutive_scrapes() {
        let mut tracker = DeltaTracker::new(TrackingMode::Delta);
        let span = vec![BucketSpan::new(0, 3)];

        let first = tracker.update(&positive(10, span.clone(), vec![5, -2, 1])).unwrap();
        assert_eq!(values(&first), vec![5, -2, 1]);
        assert_eq!(map(&tracker, Side::Positive, true), vec![(0, 5), (1, -2), (2, 1)]);

        let second = tracker.update(&positive(10, span, vec![6, -2, 0])).unwrap();
        assert_eq!(map(&tracker, Side::Positive, false), vec![(0, 6), (1, -2), (2, 0)]);
        assert_eq!(map(&tracker, Side::Positive, true), vec![(0, 1), (1, 0), (2, -1)]);
        assert_eq!(values(&second), vec![-4, 2, -2]);

        assert_eq!(tracker.scrapes(), 2);
        let frequencies = tracker.frequencies();
        assert_eq!(frequencies.total(), 6);
        assert_eq!(
            frequencies.iter().collect::<Vec<_>>(),
            vec![(-4, 1), (-2, 2), (1, 1), (2, 1), (5, 1)]
        );
    }

    #[test]
    fn test_absolute_mode_bootstrap() {
        let mut tracker = DeltaTracker::new(TrackingMode::Absolute);
        let span = vec![BucketSpan::new(0, 3)];

        // First sighting: the deltas stand in for the second-order values.
        let first = tracker.update(&positive(10, span.clone(), vec![5, -2, 1])).unwrap();
        assert_eq!(values(&first), vec![5, -2, 1]);
        assert_eq!(map(&tracker, Side::Positive, false), vec![(0, 15), (1, 13), (2, 14)]);
        assert!(tracker.second_order(Side::Positive).is_empty());

        // Counts [16, 14, 14]: second-order [1, 1, 0] against no stored history.
        let second = tracker.update(&positive(10, span.clone(), vec![6, -2, 0])).unwrap();
        assert_eq!(values(&second), vec![1, 1, 0]);
        assert_eq!(map(&tracker, Side::Positive, true), vec![(0, 1), (1, 1), (2, 0)]);

        // Counts [18, 16, 16]: second-order [2, 2, 2].
        let third = tracker.update(&positive(12, span, vec![6, -2, 0])).unwrap();
        assert_eq!(values(&third), vec![1, 1, 2]);
    }

    #[test]
    fn test_new_and_emptied_buckets() {
        let mut tracker = DeltaTracker::new(TrackingMode::Delta);

        tracker.update(&positive(0, vec![BucketSpan::new(0, 2)], vec![4, 4])).unwrap();

        // Bucket 1 emptied, bucket 3 newly populated.
        let deltas = tracker
            .update(&positive(0, vec![BucketSpan::new(0, 1), BucketSpan::new(2, 1)], vec![4, 7]))
            .unwrap();
        let indexed: Vec<(i32, i64)> = deltas.iter().map(|d| (d.index, d.value)).collect();
        assert_eq!(indexed, vec![(0, -4), (3, 7)]);
        assert_eq!(map(&tracker, Side::Positive, false), vec![(0, 4), (3, 7)]);

        // Bucket 1 is back, without any history.
        let deltas =
            tracker.update(&positive(0, vec![BucketSpan::new(0, 2)], vec![4, 1])).unwrap();
        let indexed: Vec<(i32, i64)> = deltas.iter().map(|d| (d.index, d.value)).collect();
        assert_eq!(indexed, vec![(0, 0), (1, 1)]);
    }

    #[test]
    fn test_sides_are_independent() {
        let mut tracker = DeltaTracker::new(TrackingMode::Delta);
        let snapshot = HistogramSnapshot::new(20, 1e-128, 0)
            .with_positive(vec![BucketSpan::new(0, 1)], vec![3])
            .with_negative(vec![BucketSpan::new(0, 1)], vec![9]);

        let deltas = tracker.update(&snapshot).unwrap();
        let sided: Vec<(Side, i64)> = deltas.iter().map(|d| (d.side, d.value)).collect();
        assert_eq!(sided, vec![(Side::Negative, 9), (Side::Positive, 3)]);
        assert_eq!(map(&tracker, Side::Negative, false), vec![(0, 9)]);
        assert_eq!(map(&tracker, Side::Positive, false), vec![(0, 3)]);
    }

    #[test]
    fn test_failed_update_leaves_state_untouched() {
        let mut tracker = DeltaTracker::new(TrackingMode::Delta);
        let good = HistogramSnapshot::new(20, 1e-128, 0)
            .with_positive(vec![BucketSpan::new(0, 1)], vec![1])
            .with_negative(vec![BucketSpan::new(0, 1)], vec![2]);
        tracker.update(&good).unwrap();
        let before = tracker.clone();

        let malformed = positive(0, vec![BucketSpan::new(0, 2)], vec![1]);
        assert!(tracker.update(&malformed).is_err());
        assert_eq!(tracker, before);

        // The negative side succeeds, the positive side overflows: nothing may be committed.
        let overflowing = HistogramSnapshot::new(20, 1e-128, 0)
            .with_positive(vec![BucketSpan::new(0, 1)], vec![i64::MIN])
            .with_negative(vec![BucketSpan::new(0, 1)], vec![5]);
        assert_eq!(
            tracker.update(&overflowing),
            Err(SnapshotError::CountOverflow { side: Side::Positive, index: 0 })
        );
        assert_eq!(tracker, before);

        // A corrected snapshot can be retried.
        let deltas = tracker.update(&good).unwrap();
        assert_eq!(values(&deltas), vec![-2, -1]);
        assert_eq!(tracker.scrapes(), 2);
    }

    fn arb_side() -> impl Strategy<Value = (Vec<BucketSpan>, Vec<i64>)> {
        arb_vec((0i32..4, 1u32..4), 0..4).prop_flat_map(|raw| {
            let spans: Vec<BucketSpan> =
                raw.into_iter().map(|(offset, length)| BucketSpan::new(offset, length)).collect();
            let total = spans.iter().map(|s| s.length as usize).sum::<usize>();
            (Just(spans), arb_vec(-50i64..50, total))
        })
    }

    fn arb_snapshot() -> impl Strategy<Value = HistogramSnapshot> {
        (0u64..100, arb_side(), arb_side()).prop_map(|(zero_count, (ps, pd), (ns, nd))| {
            HistogramSnapshot::new(10, 1e-128, zero_count).with_positive(ps, pd).with_negative(ns, nd)
        })
    }

    proptest! {
        #[test]
        fn property_test_state_only_holds_live_buckets(
            absolute in any::<bool>(),
            snapshots in arb_vec(arb_snapshot(), 1..8),
        ) {
            let mode = if absolute { TrackingMode::Absolute } else { TrackingMode::Delta };
            let mut tracker = DeltaTracker::new(mode);
            let mut recorded = 0;

            for snapshot in &snapshots {
                let deltas = tracker.update(snapshot).unwrap();
                recorded += deltas.len() as u64;

                for side in [Side::Negative, Side::Positive] {
                    let live: BTreeSet<i32> =
                        DecodedSide::new(snapshot, side).unwrap().iter().map(|b| b.index).collect();
                    let first: BTreeSet<i32> = tracker.first_order(side).keys().copied().collect();
                    let second: BTreeSet<i32> = tracker.second_order(side).keys().copied().collect();

                    prop_assert_eq!(&first, &live);
                    prop_assert!(second.is_subset(&live));
                    if mode == TrackingMode::Delta {
                        prop_assert_eq!(&second, &live);
                    }
                }
            }

            prop_assert_eq!(tracker.frequencies().total(), recorded);
            prop_assert_eq!(tracker.scrapes(), snapshots.len() as u64);
        }
    }
}
