//! Expansion of span/delta encoded buckets into absolute bucket counts.
use std::{fmt, slice};

use crate::snapshot::{BucketSpan, HistogramSnapshot, SnapshotError};

const SEPARATOR: &str =
    "  ----------------------------------------------------------------------";

/// Side of the zero bucket.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum Side {
    /// Buckets for values below the zero bucket.
    Negative,
    /// Buckets for values above the zero bucket.
    Positive,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Negative => f.write_str("negative"),
            Side::Positive => f.write_str("positive"),
        }
    }
}

/// Maps a bucket index to the magnitude of its upper bound.
///
/// Bucket `i` covers magnitudes in `(bound(i - 1), bound(i)]`, with `bound(i) = 10^(i/resolution)`.
/// Bounds below the zero threshold are clamped to it.
pub fn bucket_bound(index: i32, resolution: u8, zero_threshold: f64) -> f64 {
    let resolution = i32::from(resolution.max(1));
    let bound = if index % resolution == 0 {
        10f64.powi(index / resolution)
    } else {
        10f64.powf(f64::from(index) / f64::from(resolution))
    };

    if bound < zero_threshold {
        zero_threshold
    } else {
        bound
    }
}

/// A single decoded bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodedBucket {
    /// Bucket index.
    pub index: i32,
    /// Delta to the previous bucket, as carried on the wire.
    pub delta: i64,
    /// Absolute cumulative count: the zero count plus all deltas up to and including this one.
    pub count: i64,
    /// Whether this bucket is the lowest index of its span.
    pub span_start: bool,
}

/// One side of a snapshot, ready to be decoded.
///
/// Creating a `DecodedSide` checks the side for well-formedness and for count overflow. The
/// buckets themselves are only decoded while iterating, and iteration can be restarted any
/// number of times.
#[derive(Clone, Copy, Debug)]
pub struct DecodedSide<'a> {
    side: Side,
    spans: &'a [BucketSpan],
    deltas: &'a [i64],
    zero_count: i64,
    last_index: i64,
    final_count: i64,
}

impl<'a> DecodedSide<'a> {
    /// Prepares one side of `snapshot` for decoding.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot is malformed, or if any cumulative count overflows.
    pub fn new(snapshot: &'a HistogramSnapshot, side: Side) -> Result<Self, SnapshotError> {
        snapshot.validate_schema()?;
        let buckets = snapshot.buckets(side);
        buckets.validate(side)?;

        let zero_count = snapshot.signed_zero_count()?;
        let mut decoded = DecodedSide {
            side,
            spans: &buckets.spans,
            deltas: &buckets.deltas,
            zero_count,
            last_index: 0,
            final_count: zero_count,
        };

        // Walk once with checked arithmetic so that iteration itself can never overflow.
        let mut count = zero_count;
        let mut last_index = 0;
        for (index, delta) in positions(decoded.spans, decoded.deltas) {
            count = count.checked_add(delta).ok_or(SnapshotError::CountOverflow {
                side,
                index: index as i32,
            })?;
            last_index = index;
        }
        decoded.last_index = last_index;
        decoded.final_count = count;

        Ok(decoded)
    }

    /// Side of the histogram being decoded.
    pub fn side(&self) -> Side {
        self.side
    }

    /// Number of populated buckets on this side.
    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    /// Returns `true` if this side has no populated buckets.
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Cumulative count of the bucket farthest from zero, or the zero count if there is none.
    pub fn final_count(&self) -> i64 {
        self.final_count
    }

    /// Iterates the buckets in ascending index order.
    pub fn iter(&self) -> Ascending<'a> {
        Ascending {
            spans: self.spans.iter(),
            deltas: self.deltas.iter(),
            index: 0,
            remaining: 0,
            span_start: false,
            count: self.zero_count,
        }
    }

    /// Iterates the buckets in descending index order.
    pub fn descending(&self) -> Descending<'a> {
        Descending {
            spans: self.spans.iter().rev(),
            deltas: self.deltas.iter().rev(),
            index: self.last_index,
            gap: 0,
            remaining: 0,
            count: self.final_count,
        }
    }

    /// Iterates the buckets starting with the one farthest from zero.
    ///
    /// That is ascending index order for the positive side, and descending for the negative
    /// side, so that the negative side reads from its tail towards the zero bucket.
    pub fn tail_first(&self) -> TailFirst<'a> {
        match self.side {
            Side::Positive => TailFirst::Ascending(self.iter()),
            Side::Negative => TailFirst::Descending(self.descending()),
        }
    }
}

// Bucket indices paired with their deltas, without accumulating counts.
fn positions<'a>(
    spans: &'a [BucketSpan],
    deltas: &'a [i64],
) -> impl Iterator<Item = (i64, i64)> + 'a {
    let mut next_index = 0i64;
    spans
        .iter()
        .flat_map(move |span| {
            let start = next_index + i64::from(span.offset);
            next_index = start + i64::from(span.length);
            start..next_index
        })
        .zip(deltas.iter().copied())
}

impl<'a> IntoIterator for &DecodedSide<'a> {
    type Item = DecodedBucket;
    type IntoIter = Ascending<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Decoded buckets in ascending index order.
#[derive(Clone, Debug)]
pub struct Ascending<'a> {
    spans: slice::Iter<'a, BucketSpan>,
    deltas: slice::Iter<'a, i64>,
    index: i64,
    remaining: u32,
    span_start: bool,
    count: i64,
}

impl Iterator for Ascending<'_> {
    type Item = DecodedBucket;

    fn next(&mut self) -> Option<DecodedBucket> {
        while self.remaining == 0 {
            let span = self.spans.next()?;
            self.index += i64::from(span.offset);
            self.remaining = span.length;
            self.span_start = true;
        }

        let delta = *self.deltas.next()?;
        self.count += delta;
        let bucket = DecodedBucket {
            index: self.index as i32,
            delta,
            count: self.count,
            span_start: self.span_start,
        };

        self.index += 1;
        self.remaining -= 1;
        self.span_start = false;
        Some(bucket)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.deltas.size_hint()
    }
}

/// Decoded buckets in descending index order.
#[derive(Clone, Debug)]
pub struct Descending<'a> {
    spans: std::iter::Rev<slice::Iter<'a, BucketSpan>>,
    deltas: std::iter::Rev<slice::Iter<'a, i64>>,
    index: i64,
    // Offset of the span we are currently walking, needed to find the end of the one before it.
    gap: i32,
    remaining: u32,
    count: i64,
}

impl Iterator for Descending<'_> {
    type Item = DecodedBucket;

    fn next(&mut self) -> Option<DecodedBucket> {
        while self.remaining == 0 {
            let span = self.spans.next()?;
            self.index -= i64::from(self.gap);
            self.gap = span.offset;
            self.remaining = span.length;
        }

        let delta = *self.deltas.next()?;
        let bucket = DecodedBucket {
            index: self.index as i32,
            delta,
            count: self.count,
            span_start: self.remaining == 1,
        };

        self.count -= delta;
        self.index -= 1;
        self.remaining -= 1;
        Some(bucket)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.deltas.size_hint()
    }
}

/// Decoded buckets starting from the tail of their side.
///
/// See [`DecodedSide::tail_first`].
#[derive(Clone, Debug)]
pub enum TailFirst<'a> {
    /// Positive side.
    Ascending(Ascending<'a>),
    /// Negative side.
    Descending(Descending<'a>),
}

impl Iterator for TailFirst<'_> {
    type Item = DecodedBucket;

    fn next(&mut self) -> Option<DecodedBucket> {
        match self {
            TailFirst::Ascending(inner) => inner.next(),
            TailFirst::Descending(inner) => inner.next(),
        }
    }
}

/// Human-readable float: plain notation for everyday magnitudes, exponent notation otherwise.
pub(crate) struct Float(pub(crate) f64);

impl fmt::Display for Float {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let magnitude = self.0.abs();
        if magnitude == 0.0 || (1e-4..1e15).contains(&magnitude) {
            write!(f, "{}", self.0)
        } else {
            write!(f, "{:e}", self.0)
        }
    }
}

/// Human-readable dump of every bucket in a snapshot.
///
/// Negative buckets come first, farthest from zero first, followed by the zero bucket and then
/// the positive buckets in ascending order. Gaps between spans are marked with a separator line.
pub struct BucketDump<'a> {
    snapshot: &'a HistogramSnapshot,
    negative: DecodedSide<'a>,
    positive: DecodedSide<'a>,
}

impl<'a> BucketDump<'a> {
    /// Creates a dump of the given snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot is malformed.
    pub fn new(snapshot: &'a HistogramSnapshot) -> Result<Self, SnapshotError> {
        Ok(BucketDump {
            snapshot,
            negative: DecodedSide::new(snapshot, Side::Negative)?,
            positive: DecodedSide::new(snapshot, Side::Positive)?,
        })
    }

    fn bound(&self, index: i32) -> f64 {
        bucket_bound(index, self.snapshot.resolution, self.snapshot.zero_threshold)
    }

    fn has_gap_before(&self, bucket: &DecodedBucket) -> bool {
        bucket.span_start
            && self.bound(bucket.index.saturating_sub(1)) > self.snapshot.zero_threshold
    }
}

impl fmt::Display for BucketDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "- {} buckets / {} spans:",
            self.snapshot.bucket_count(),
            self.snapshot.span_count()
        )?;

        for bucket in self.negative.tail_first() {
            let upper = self.bound(bucket.index);
            let lower = self.bound(bucket.index.saturating_sub(1));
            writeln!(f, "  -{} ≤ x < -{} → {}", Float(upper), Float(lower), bucket.count)?;
            if self.has_gap_before(&bucket) {
                writeln!(f, "{}", SEPARATOR)?;
            }
        }

        let threshold = self.snapshot.zero_threshold;
        writeln!(
            f,
            "  -{} ≤ x ≤ {} → {}",
            Float(threshold),
            Float(threshold),
            self.snapshot.zero_count
        )?;

        for bucket in self.positive.tail_first() {
            if self.has_gap_before(&bucket) {
                writeln!(f, "{}", SEPARATOR)?;
            }
            let lower = self.bound(bucket.index.saturating_sub(1));
            let upper = self.bound(bucket.index);
            writeln!(f, "  {} < x ≤ {} → {}", Float(lower), Float(upper), bucket.count)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::{collection::vec as arb_vec, prelude::*};

    use super::{bucket_bound, BucketDump, DecodedSide, Float, Side};
    use crate::snapshot::{BucketSpan, HistogramSnapshot, SnapshotError};

    fn counts(side: &DecodedSide<'_>) -> Vec<(i32, i64)> {
        side.iter().map(|b| (b.index, b.count)).collect()
    }

    #[test]
    fn test_decode_single_span() {
        let snapshot = HistogramSnapshot::new(20, 1e-128, 10)
            .with_positive(vec![BucketSpan::new(0, 3)], vec![5, -2, 1]);
        let positive = DecodedSide::new(&snapshot, Side::Positive).unwrap();

        assert_eq!(counts(&positive), vec![(0, 15), (1, 13), (2, 14)]);
        assert_eq!(positive.final_count(), 14);

        // Restartable: a second pass yields the same buckets.
        assert_eq!(counts(&positive), vec![(0, 15), (1, 13), (2, 14)]);
    }

    #[test]
    fn test_decode_multiple_spans() {
        let snapshot = HistogramSnapshot::new(4, 1e-128, 0).with_positive(
            vec![BucketSpan::new(-2, 2), BucketSpan::new(3, 1), BucketSpan::new(0, 2)],
            vec![1, 2, -1, 3, 0],
        );
        let positive = DecodedSide::new(&snapshot, Side::Positive).unwrap();

        assert_eq!(counts(&positive), vec![(-2, 1), (-1, 3), (3, 2), (4, 5), (5, 5)]);
        let starts: Vec<bool> = positive.iter().map(|b| b.span_start).collect();
        assert_eq!(starts, vec![true, false, true, true, false]);
    }

    #[test]
    fn test_negative_side_reads_tail_first() {
        let snapshot = HistogramSnapshot::new(4, 1e-128, 2)
            .with_negative(vec![BucketSpan::new(1, 2), BucketSpan::new(2, 1)], vec![3, 1, -2]);
        let negative = DecodedSide::new(&snapshot, Side::Negative).unwrap();

        let tail_first: Vec<(i32, i64)> =
            negative.tail_first().map(|b| (b.index, b.count)).collect();
        assert_eq!(tail_first, vec![(5, 4), (2, 6), (1, 5)]);

        let deltas: Vec<i64> = negative.tail_first().map(|b| b.delta).collect();
        assert_eq!(deltas, vec![-2, 1, 3]);
    }

    #[test]
    fn test_decode_empty_side() {
        let snapshot = HistogramSnapshot::new(20, 1e-128, 7);
        let negative = DecodedSide::new(&snapshot, Side::Negative).unwrap();
        assert!(negative.is_empty());
        assert_eq!(negative.iter().count(), 0);
        assert_eq!(negative.descending().count(), 0);
        assert_eq!(negative.final_count(), 7);
    }

    #[test]
    fn test_decode_count_overflow() {
        let snapshot = HistogramSnapshot::new(20, 1e-128, 1)
            .with_positive(vec![BucketSpan::new(0, 2)], vec![i64::MAX - 1, 1]);
        assert_eq!(
            DecodedSide::new(&snapshot, Side::Positive).unwrap_err(),
            SnapshotError::CountOverflow { side: Side::Positive, index: 1 }
        );
    }

    #[test]
    fn test_bucket_bound() {
        assert_eq!(bucket_bound(0, 20, 1e-128), 1.0);
        assert_eq!(bucket_bound(20, 20, 1e-128), 10.0);
        assert_eq!(bucket_bound(-40, 20, 1e-128), 0.01);

        let bound = bucket_bound(1, 20, 1e-128);
        assert!((bound - 10f64.powf(0.05)).abs() < 1e-12);

        // Clamped to the zero threshold.
        assert_eq!(bucket_bound(-60, 20, 0.1), 0.1);
    }

    #[test]
    fn test_float_display() {
        assert_eq!(Float(1.0).to_string(), "1");
        assert_eq!(Float(0.25).to_string(), "0.25");
        assert_eq!(Float(1e-128).to_string(), "1e-128");
        assert_eq!(Float(0.0).to_string(), "0");
    }

    #[test]
    fn test_dump() {
        let snapshot = HistogramSnapshot::new(1, 0.1, 4)
            .with_positive(vec![BucketSpan::new(0, 1), BucketSpan::new(1, 1)], vec![2, 1])
            .with_negative(vec![BucketSpan::new(0, 1)], vec![3]);
        let dump = BucketDump::new(&snapshot).unwrap().to_string();

        let expected = "\
- 4 buckets / 3 spans:
  -1 ≤ x < -0.1 → 7
  -0.1 ≤ x ≤ 0.1 → 4
  0.1 < x ≤ 1 → 6
  ----------------------------------------------------------------------
  10 < x ≤ 100 → 7
";
        assert_eq!(dump, expected);
    }

    #[test]
    fn test_dump_rejects_malformed() {
        let snapshot = HistogramSnapshot::new(1, 0.1, 4)
            .with_positive(vec![BucketSpan::new(0, 2)], vec![2]);
        assert!(BucketDump::new(&snapshot).is_err());
    }

    fn arb_side() -> impl Strategy<Value = (Vec<BucketSpan>, Vec<i64>)> {
        arb_vec((-3i32..6, 1u32..5), 0..6).prop_flat_map(|raw| {
            let spans: Vec<BucketSpan> = raw
                .iter()
                .enumerate()
                .map(|(i, (offset, length))| {
                    BucketSpan::new(if i == 0 { *offset } else { offset.abs() }, *length)
                })
                .collect();
            let total = spans.iter().map(|s| s.length as usize).sum::<usize>();
            (Just(spans), arb_vec(-1000i64..1000, total))
        })
    }

    proptest! {
        #[test]
        fn property_test_decode_round_trip(zero_count in 0u64..10_000, (spans, deltas) in arb_side()) {
            let snapshot = HistogramSnapshot::new(8, 1e-128, zero_count)
                .with_positive(spans.clone(), deltas.clone())
                .with_negative(spans, deltas.clone());
            let expected = zero_count as i64 + deltas.iter().sum::<i64>();

            for side in [Side::Positive, Side::Negative] {
                let decoded = DecodedSide::new(&snapshot, side).unwrap();
                let ascending: Vec<_> = decoded.iter().collect();
                let mut descending: Vec<_> = decoded.descending().collect();
                descending.reverse();

                prop_assert_eq!(ascending.len(), deltas.len());
                prop_assert_eq!(decoded.final_count(), expected);
                prop_assert_eq!(ascending.last().map_or(zero_count as i64, |b| b.count), expected);
                prop_assert!(ascending.windows(2).all(|w| w[0].index < w[1].index));

                let forward: Vec<(i32, i64, i64)> =
                    ascending.iter().map(|b| (b.index, b.delta, b.count)).collect();
                let backward: Vec<(i32, i64, i64)> =
                    descending.iter().map(|b| (b.index, b.delta, b.count)).collect();
                prop_assert_eq!(forward, backward);
            }
        }
    }
}
