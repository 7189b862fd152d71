use std::{collections::BTreeMap, fmt};

use crate::tracker::TrackingMode;

/// Occurrence counts of tracked values.
///
/// Values are kept in ascending order, which is the order every report reads them in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrequencyTable {
    counts: BTreeMap<i64, u64>,
    total: u64,
}

impl FrequencyTable {
    /// Creates a new, empty `FrequencyTable`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a single occurrence of `value`.
    pub fn record(&mut self, value: i64) {
        self.record_n(value, 1);
    }

    /// Records `n` occurrences of `value`.
    pub fn record_n(&mut self, value: i64, n: u64) {
        if n == 0 {
            return;
        }
        *self.counts.entry(value).or_insert(0) += n;
        self.total += n;
    }

    /// Number of times `value` was recorded.
    pub fn count(&self, value: i64) -> u64 {
        self.counts.get(&value).copied().unwrap_or(0)
    }

    /// Total number of recorded occurrences.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Number of distinct values.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Returns `true` if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Smallest recorded value.
    pub fn min(&self) -> Option<i64> {
        self.counts.keys().next().copied()
    }

    /// Largest recorded value.
    pub fn max(&self) -> Option<i64> {
        self.counts.keys().next_back().copied()
    }

    /// Iterates over `(value, count)` pairs in ascending value order.
    pub fn iter(&self) -> impl Iterator<Item = (i64, u64)> + '_ {
        self.counts.iter().map(|(v, c)| (*v, *c))
    }

    /// Merges all occurrences from `other` into this table.
    pub fn merge(&mut self, other: &FrequencyTable) {
        for (value, count) in other.iter() {
            self.record_n(value, count);
        }
    }

    /// Renders the raw distribution, with cumulative percentages.
    pub fn report(&self, mode: TrackingMode) -> FrequencyReport<'_> {
        FrequencyReport { table: self, mode }
    }
}

impl FromIterator<(i64, u64)> for FrequencyTable {
    fn from_iter<I: IntoIterator<Item = (i64, u64)>>(iter: I) -> Self {
        let mut table = FrequencyTable::new();
        for (value, count) in iter {
            table.record_n(value, count);
        }
        table
    }
}

impl Extend<i64> for FrequencyTable {
    fn extend<I: IntoIterator<Item = i64>>(&mut self, iter: I) {
        for value in iter {
            self.record(value);
        }
    }
}

/// Sorted frequency listing of a [`FrequencyTable`].
pub struct FrequencyReport<'a> {
    table: &'a FrequencyTable,
    mode: TrackingMode,
}

impl fmt::Display for FrequencyReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "- {} frequency:", self.mode.value_label())?;

        let total = self.table.total() as f64;
        let mut cumulative = 0;
        for (value, count) in self.table.iter() {
            cumulative += count;
            writeln!(f, "  {} → {} ({:.2}%)", value, count, cumulative as f64 / total * 100.0)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::FrequencyTable;
    use crate::tracker::TrackingMode;

    #[test]
    fn test_record_and_query() {
        let mut table = FrequencyTable::new();
        assert!(table.is_empty());
        assert_eq!(table.min(), None);
        assert_eq!(table.max(), None);

        table.extend([3, -2, 3, 0, 3]);
        table.record_n(7, 0);

        assert_eq!(table.len(), 3);
        assert_eq!(table.total(), 5);
        assert_eq!(table.count(3), 3);
        assert_eq!(table.count(7), 0);
        assert_eq!(table.min(), Some(-2));
        assert_eq!(table.max(), Some(3));
        assert_eq!(table.iter().collect::<Vec<_>>(), vec![(-2, 1), (0, 1), (3, 3)]);
    }

    #[test]
    fn test_merge() {
        let mut a: FrequencyTable = [(0, 2), (1, 1)].into_iter().collect();
        let b: FrequencyTable = [(1, 4), (-5, 1)].into_iter().collect();
        a.merge(&b);

        assert_eq!(a.iter().collect::<Vec<_>>(), vec![(-5, 1), (0, 2), (1, 5)]);
        assert_eq!(a.total(), 8);
    }

    #[test]
    fn test_report() {
        let table: FrequencyTable = [(0, 6), (-1, 1), (2, 1)].into_iter().collect();

        let report = table.report(TrackingMode::Delta).to_string();
        let expected = "\
- ΔΔΔ frequency:
  -1 → 1 (12.50%)
  0 → 6 (87.50%)
  2 → 1 (100.00%)
";
        assert_eq!(report, expected);

        let report = table.report(TrackingMode::Absolute).to_string();
        assert!(report.starts_with("- ΔΔ frequency:\n"));
    }

    #[test]
    fn test_empty_report() {
        let table = FrequencyTable::new();
        assert_eq!(table.report(TrackingMode::Delta).to_string(), "- ΔΔΔ frequency:\n");
    }
}
