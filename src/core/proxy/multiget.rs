// src/core/proxy/multiget.rs

//! The Multiget De-duplicator (§4.C): active only while a multiget request
//! is in flight, built fresh per reservation. A plain `HashMap<Bytes, _>`
//! is enough — unlike the teacher's `DashMap<Bytes, _>` keyspace shard
//! (`core/storage/db`), this map is owned exclusively by one reservation,
//! never shared across threads.

use std::collections::HashMap;

use bytes::Bytes;

use crate::core::metrics;

/// One upstream's request for a given key within a multiget.
pub struct MultigetEntry {
    pub upstream_id: u64,
    /// Binary opcode-pairing identifier (opaque), `None` for ASCII.
    pub opaque: Option<u32>,
    pub hits: u32,
}

/// Keyed by raw key bytes to a linked (here: `Vec`) list of entries, head
/// insertion order reflecting which upstream asked first.
#[derive(Default)]
pub struct MultigetMap {
    entries: HashMap<Bytes, Vec<MultigetEntry>>,
    /// Keys already satisfied by a prior pass of this reservation (used to
    /// filter out-standing keys across a retry).
    satisfied: std::collections::HashSet<Bytes>,
}

impl MultigetMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an incoming key request from `upstream_id`. Returns `true` if
    /// this is the first occurrence of `key` (must be sent downstream),
    /// `false` if it's a duplicate (recorded, not resent; increments the
    /// dedupe counter).
    pub fn record(&mut self, key: Bytes, upstream_id: u64, opaque: Option<u32>) -> bool {
        let entry = MultigetEntry {
            upstream_id,
            opaque,
            hits: 0,
        };
        match self.entries.get_mut(&key) {
            Some(list) => {
                list.insert(0, entry);
                metrics::MULTIGET_KEYS_DEDUPE_TOTAL.inc();
                false
            }
            None => {
                self.entries.insert(key, vec![entry]);
                metrics::MULTIGET_KEYS_UNIQUE_TOTAL.inc();
                true
            }
        }
    }

    /// Keys still outstanding, i.e. not yet recorded as `satisfied` — used
    /// to build the retry request so already-successful keys aren't asked
    /// again.
    pub fn outstanding_keys(&self) -> Vec<Bytes> {
        self.entries
            .keys()
            .filter(|k| !self.satisfied.contains(*k))
            .cloned()
            .collect()
    }

    /// On a downstream VALUE response: marks the key satisfied and bumps
    /// every waiting upstream's hit counter, returning the list of
    /// `(upstream_id, opaque)` pairs to emit the value to.
    pub fn on_value(&mut self, key: &Bytes) -> Vec<(u64, Option<u32>)> {
        self.satisfied.insert(key.clone());
        match self.entries.get_mut(key) {
            Some(list) => {
                list.iter_mut().for_each(|e| e.hits += 1);
                list.iter().map(|e| (e.upstream_id, e.opaque)).collect()
            }
            None => Vec::new(),
        }
    }

    /// Walked once when the reservation finishes: every entry with
    /// `hits == 0` counts as a miss for that upstream. Returns the list of
    /// `(upstream_id, key)` misses and frees the map's entries.
    pub fn drain_misses(&mut self) -> Vec<(u64, Bytes)> {
        let mut misses = Vec::new();
        for (key, list) in self.entries.drain() {
            for entry in list {
                if entry.hits == 0 {
                    misses.push((entry.upstream_id, key.clone()));
                }
            }
        }
        misses
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn only_first_occurrence_is_forwarded() {
        let mut map = MultigetMap::new();
        // get A B A C A
        assert!(map.record(Bytes::from_static(b"A"), 1, None));
        assert!(map.record(Bytes::from_static(b"B"), 1, None));
        assert!(!map.record(Bytes::from_static(b"A"), 1, None));
        assert!(map.record(Bytes::from_static(b"C"), 1, None));
        assert!(!map.record(Bytes::from_static(b"A"), 1, None));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn misses_are_keys_never_answered() {
        let mut map = MultigetMap::new();
        map.record(Bytes::from_static(b"A"), 1, None);
        map.record(Bytes::from_static(b"B"), 1, None);
        map.on_value(&Bytes::from_static(b"A"));
        let misses = map.drain_misses();
        assert_eq!(misses.len(), 1);
        assert_eq!(misses[0].1, Bytes::from_static(b"B"));
    }

    #[test]
    fn keys_sum_identity_holds() {
        let mut map = MultigetMap::new();
        let keys = [b"A".as_slice(), b"B", b"A", b"C", b"A"];
        let mut dedupe = 0usize;
        for k in keys {
            if !map.record(Bytes::copy_from_slice(k), 1, None) {
                dedupe += 1;
            }
        }
        let unique = map.len();
        assert_eq!(dedupe + unique, keys.len());
    }

    proptest! {
        /// Invariant 6: for any multiget key list K (with duplicates),
        /// `tot_multiget_keys_dedupe + unique(K) == |K|`.
        #[test]
        fn dedupe_plus_unique_always_equals_total(
            keys in proptest::collection::vec(proptest::sample::select(vec!["A", "B", "C", "D"]), 0..32)
        ) {
            let mut map = MultigetMap::new();
            let mut dedupe = 0usize;
            for k in &keys {
                if !map.record(Bytes::copy_from_slice(k.as_bytes()), 1, None) {
                    dedupe += 1;
                }
            }
            prop_assert_eq!(dedupe + map.len(), keys.len());
        }

        /// Invariant 4: every key receives exactly one emission to the
        /// originating upstream irrespective of duplicates within the
        /// request, i.e. `on_value` fans out to exactly as many entries as
        /// there were requesters for that key, once per requester.
        #[test]
        fn every_requester_is_notified_exactly_once_per_value(
            keys in proptest::collection::vec(proptest::sample::select(vec!["A", "B", "C"]), 1..16)
        ) {
            let mut map = MultigetMap::new();
            let mut requesters: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
            for (i, k) in keys.iter().enumerate() {
                map.record(Bytes::copy_from_slice(k.as_bytes()), i as u64, None);
                *requesters.entry(k.as_str()).or_insert(0) += 1;
            }
            for (key, count) in &requesters {
                let notified = map.on_value(&Bytes::copy_from_slice(key.as_bytes()));
                prop_assert_eq!(notified.len(), *count);
            }
        }
    }
}
