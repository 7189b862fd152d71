//! Per-histogram tracker storage.
use std::{
    fmt,
    hash::BuildHasherDefault,
    iter::repeat,
    sync::{Arc, PoisonError, RwLock},
};

use hashbrown::{hash_map::RawEntryMut, HashMap};
use metrics::{Key, KeyHasher};
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    frequency::FrequencyTable,
    snapshot::{HistogramSnapshot, SnapshotError},
    tracker::{DeltaTracker, ThirdOrderDeltas, TrackingMode},
};

type TrackerHandle = Arc<Mutex<DeltaTracker>>;
type TrackerMap = HashMap<Key, TrackerHandle, BuildHasherDefault<KeyHasher>>;

/// Renders a histogram identity as `name{label="value",...}`.
///
/// Labels are rendered in the order they were given. The braces are left out when there are no
/// labels.
pub struct Identity<'a>(pub &'a Key);

impl fmt::Display for Identity<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.name())?;

        let mut labels = self.0.labels().peekable();
        if labels.peek().is_none() {
            return Ok(());
        }

        f.write_str("{")?;
        for (i, label) in labels.enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}=\"{}\"", label.key(), label.value())?;
        }
        f.write_str("}")
    }
}

/// Copy of the frequency table of one histogram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrequencySnapshot {
    /// Third-order values recorded so far.
    pub table: FrequencyTable,
    /// Number of scrapes the table was built from.
    pub scrapes: u64,
}

/// Delta trackers, keyed by histogram identity.
///
/// Lookups go through a set of sharded maps, and every identity owns a dedicated lock, so updates
/// for different histograms do not wait on each other while updates for the same histogram are
/// applied one at a time.
///
/// Trackers are never removed: the registry grows with the number of distinct histograms seen.
pub struct TrackerRegistry {
    shards: Vec<RwLock<TrackerMap>>,
    shard_mask: usize,
    mode: TrackingMode,
}

impl TrackerRegistry {
    /// Creates a new `TrackerRegistry` whose trackers all use `mode`.
    pub fn new(mode: TrackingMode) -> Self {
        let shard_count = std::cmp::max(1, num_cpus::get()).next_power_of_two();
        let shard_mask = shard_count - 1;
        let shards =
            repeat(()).take(shard_count).map(|_| RwLock::new(TrackerMap::default())).collect();

        Self { shards, shard_mask, mode }
    }

    /// Tracking mode used for every histogram.
    pub fn mode(&self) -> TrackingMode {
        self.mode
    }

    /// Tracks a new scrape of the histogram identified by `key`.
    ///
    /// A tracker is created the first time a key is seen with a well-formed snapshot.
    ///
    /// # Errors
    ///
    /// If the snapshot is rejected, an error is returned and the tracker for `key`, if any, is
    /// left unchanged.
    pub fn update(
        &self,
        key: &Key,
        snapshot: &HistogramSnapshot,
    ) -> Result<ThirdOrderDeltas, SnapshotError> {
        snapshot.validate()?;

        let tracker = self.get_or_create(key);
        let mut tracker = tracker.lock();
        tracker.update(snapshot)
    }

    /// Runs `op` against the tracker for `key`, if one exists.
    ///
    /// The tracker is locked while `op` runs.
    pub fn with_tracker<O, V>(&self, key: &Key, op: O) -> Option<V>
    where
        O: FnOnce(&DeltaTracker) -> V,
    {
        let tracker = self.get(key)?;
        let tracker = tracker.lock();
        Some(op(&tracker))
    }

    /// Takes a copy of the frequency table for `key`, if it has been tracked.
    ///
    /// The copy can be analyzed while the histogram keeps being tracked.
    pub fn frequencies(&self, key: &Key) -> Option<FrequencySnapshot> {
        self.with_tracker(key, |tracker| FrequencySnapshot {
            table: tracker.frequencies().clone(),
            scrapes: tracker.scrapes(),
        })
    }

    /// Number of tracked histograms.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    /// Returns `true` if no histogram has been tracked yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits every tracked histogram.
    ///
    /// Shards are visited one at a time, so a histogram registered while visiting may or may not be
    /// observed.
    pub fn visit<F>(&self, mut collect: F)
    where
        F: FnMut(&Key, &DeltaTracker),
    {
        for shard in &self.shards {
            let shard_read = shard.read().unwrap_or_else(PoisonError::into_inner);
            for (key, tracker) in shard_read.iter() {
                collect(key, &tracker.lock());
            }
        }
    }

    fn shard(&self, key: &Key) -> (u64, &RwLock<TrackerMap>) {
        let hash = key.get_hash();
        (hash, &self.shards[hash as usize & self.shard_mask])
    }

    fn get(&self, key: &Key) -> Option<TrackerHandle> {
        let (hash, shard) = self.shard(key);
        let shard_read = shard.read().unwrap_or_else(PoisonError::into_inner);
        shard_read.raw_entry().from_key_hashed_nocheck(hash, key).map(|(_, v)| Arc::clone(v))
    }

    fn get_or_create(&self, key: &Key) -> TrackerHandle {
        if let Some(tracker) = self.get(key) {
            return tracker;
        }

        let (hash, shard) = self.shard(key);
        let mut shard_write = shard.write().unwrap_or_else(PoisonError::into_inner);
        match shard_write.raw_entry_mut().from_key_hashed_nocheck(hash, key) {
            RawEntryMut::Occupied(entry) => Arc::clone(entry.get()),
            RawEntryMut::Vacant(entry) => {
                debug!(histogram = %Identity(key), mode = ?self.mode, "Registered new histogram.");

                let tracker = Arc::new(Mutex::new(DeltaTracker::new(self.mode)));
                let (_, v) = entry.insert_hashed_nocheck(hash, key.clone(), Arc::clone(&tracker));
                Arc::clone(v)
            }
        }
    }
}

impl Default for TrackerRegistry {
    fn default() -> Self {
        Self::new(TrackingMode::default())
    }
}

#[cfg(test)]
mod tests {
    use metrics::{Key, Label};

    use super::{Identity, TrackerRegistry};
    use crate::{
        snapshot::{BucketSpan, HistogramSnapshot},
        tracker::TrackingMode,
    };

    fn snapshot(deltas: Vec<i64>) -> HistogramSnapshot {
        let spans = vec![BucketSpan::new(0, deltas.len() as u32)];
        HistogramSnapshot::new(20, 1e-128, 10).with_positive(spans, deltas)
    }

    #[test]
    fn test_identity_display() {
        let key = Key::from_name("request_latency");
        assert_eq!(Identity(&key).to_string(), "request_latency");

        let key = Key::from_parts(
            "request_latency",
            vec![Label::new("method", "GET"), Label::new("code", "200")],
        );
        assert_eq!(Identity(&key).to_string(), "request_latency{method=\"GET\",code=\"200\"}");
    }

    #[test]
    fn test_identities_are_tracked_separately() {
        let registry = TrackerRegistry::new(TrackingMode::Delta);
        assert!(registry.is_empty());

        let get = Key::from_parts("latency", vec![Label::new("method", "GET")]);
        let put = Key::from_parts("latency", vec![Label::new("method", "PUT")]);

        registry.update(&get, &snapshot(vec![5, -2, 1])).unwrap();
        registry.update(&get, &snapshot(vec![6, -2, 0])).unwrap();
        let deltas = registry.update(&put, &snapshot(vec![6, -2, 0])).unwrap();

        // A fresh identity starts without history.
        assert_eq!(deltas.iter().map(|d| d.value).collect::<Vec<_>>(), vec![6, -2, 0]);
        assert_eq!(registry.len(), 2);

        let frequencies = registry.frequencies(&get).unwrap();
        assert_eq!(frequencies.scrapes, 2);
        assert_eq!(frequencies.table.total(), 6);
        assert_eq!(registry.frequencies(&put).unwrap().scrapes, 1);
        assert_eq!(registry.frequencies(&Key::from_name("unknown")), None);
    }

    #[test]
    fn test_malformed_first_snapshot_registers_nothing() {
        let registry = TrackerRegistry::default();
        let key = Key::from_name("latency");
        let malformed = HistogramSnapshot::new(20, 1e-128, 0)
            .with_positive(vec![BucketSpan::new(0, 2)], vec![1]);

        assert!(registry.update(&key, &malformed).is_err());
        assert!(registry.is_empty());
        assert_eq!(registry.with_tracker(&key, |t| t.scrapes()), None);
    }

    #[test]
    fn test_visit() {
        let registry = TrackerRegistry::new(TrackingMode::Absolute);
        for name in ["a", "b", "c"] {
            registry.update(&Key::from_name(name), &snapshot(vec![1])).unwrap();
        }

        let mut seen = Vec::new();
        registry.visit(|key, tracker| {
            assert_eq!(tracker.mode(), TrackingMode::Absolute);
            seen.push((key.name().to_string(), tracker.scrapes()));
        });
        seen.sort();
        assert_eq!(
            seen,
            vec![("a".to_string(), 1), ("b".to_string(), 1), ("c".to_string(), 1)]
        );
    }
}
