//! Expiry index for the in-memory backend
//!
//! Maps deadline → keys in a `BTreeMap`, so purging expired keys costs
//! O(expired) rather than a scan of the whole store.

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

/// Deadline-ordered index of keys carrying an expiration
#[derive(Debug, Default)]
pub(crate) struct ExpiryIndex {
    index: BTreeMap<Instant, HashSet<String>>,
}

impl ExpiryIndex {
    pub(crate) fn insert(&mut self, deadline: Instant, key: &str) {
        self.index
            .entry(deadline)
            .or_default()
            .insert(key.to_string());
    }

    /// Forget `key` at `deadline`, dropping the bucket once empty
    pub(crate) fn remove(&mut self, deadline: Instant, key: &str) {
        if let Some(keys) = self.index.get_mut(&deadline) {
            keys.remove(key);
            if keys.is_empty() {
                self.index.remove(&deadline);
            }
        }
    }

    /// Remove and return every key whose deadline is at or before `now`
    pub(crate) fn drain_expired(&mut self, now: Instant) -> Vec<String> {
        let due: Vec<Instant> = self.index.range(..=now).map(|(at, _)| *at).collect();
        let mut keys = Vec::new();
        for at in due {
            if let Some(bucket) = self.index.remove(&at) {
                keys.extend(bucket);
            }
        }
        keys
    }

    pub(crate) fn len(&self) -> usize {
        self.index.values().map(HashSet::len).sum()
    }
}
