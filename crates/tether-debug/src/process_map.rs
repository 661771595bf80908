//! The per-device map of tracked processes.

use std::collections::{BTreeMap, BTreeSet};

/// Close hook for values held in a [`ProcessMap`]; invoked when an entry is
/// removed (its pid stopped being reported) or the map is cleared.
pub trait Release {
    fn release(&self);
}

/// Mapping from pid to a tracked per-process value, owned exclusively by one
/// tracking task.
///
/// The key set always equals the most recently applied pid set: entries for
/// vanished pids are removed and released, entries for new pids are created
/// through the supplied factory exactly once per pid per stream incarnation.
/// External readers never see this structure; they observe published
/// immutable snapshots.
pub struct ProcessMap<V> {
    entries: BTreeMap<u32, V>,
}

impl<V: Release> ProcessMap<V> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Diff the map against `pids`. Re-applying an identical pid set is a
    /// no-op: no factory calls, no releases.
    pub fn update(&mut self, pids: &[u32], mut factory: impl FnMut(u32) -> V) {
        let desired: BTreeSet<u32> = pids.iter().copied().collect();

        let stale: Vec<u32> = self
            .entries
            .keys()
            .filter(|pid| !desired.contains(pid))
            .copied()
            .collect();
        for pid in stale {
            if let Some(entry) = self.entries.remove(&pid) {
                entry.release();
            }
        }

        for pid in desired {
            self.entries.entry(pid).or_insert_with(|| factory(pid));
        }
    }

    pub fn clear(&mut self) {
        for (_, entry) in std::mem::take(&mut self.entries) {
            entry.release();
        }
    }

    pub fn pids(&self) -> Vec<u32> {
        self.entries.keys().copied().collect()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V: Release> Default for ProcessMap<V> {
    fn default() -> Self {
        Self::new()
    }
}
