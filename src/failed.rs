//! Addresses the device has declared permanently unsupported.
//!
//! The set is copy-on-write: readers hold an `Arc` snapshot while the
//! orchestrator grows the live set, and a mutation never disturbs a snapshot
//! already handed out.

use std::collections::BTreeSet;
use std::sync::Arc;

/// Copy-on-write set of unsupported register addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailedRegisterSet {
    inner: Arc<BTreeSet<u16>>,
}

impl FailedRegisterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cheap snapshot of the current contents.
    #[inline]
    pub fn snapshot(&self) -> Arc<BTreeSet<u16>> {
        Arc::clone(&self.inner)
    }

    #[inline]
    pub fn contains(&self, address: u16) -> bool {
        self.inner.contains(&address)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.inner.iter().copied()
    }

    /// Add addresses, returning how many were new.
    pub fn extend(&mut self, addresses: impl IntoIterator<Item = u16>) -> usize {
        let fresh: Vec<u16> = addresses
            .into_iter()
            .filter(|a| !self.inner.contains(a))
            .collect();
        if fresh.is_empty() {
            return 0;
        }
        let set = Arc::make_mut(&mut self.inner);
        fresh.into_iter().filter(|&a| set.insert(a)).count()
    }

    /// Remove one address so it is read again; returns whether it was present.
    pub fn remove(&mut self, address: u16) -> bool {
        if !self.inner.contains(&address) {
            return false;
        }
        Arc::make_mut(&mut self.inner).remove(&address)
    }

    /// Forget every address; returns whether anything was removed.
    pub fn clear(&mut self) -> bool {
        if self.inner.is_empty() {
            return false;
        }
        self.inner = Arc::new(BTreeSet::new());
        true
    }
}

impl FromIterator<u16> for FailedRegisterSet {
    fn from_iter<I: IntoIterator<Item = u16>>(iter: I) -> Self {
        Self {
            inner: Arc::new(iter.into_iter().collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_counts_new_addresses() {
        let mut set = FailedRegisterSet::new();
        assert_eq!(set.extend([0x0100, 0x0101]), 2);
        assert_eq!(set.extend([0x0101, 0x0102]), 1);
        assert_eq!(set.extend([0x0100]), 0);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_snapshot_is_isolated() {
        let mut set: FailedRegisterSet = [0x0100].into_iter().collect();
        let snapshot = set.snapshot();

        set.extend([0x0200]);
        assert!(set.contains(0x0200));
        assert!(!snapshot.contains(&0x0200));
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut set: FailedRegisterSet = [1, 2, 3].into_iter().collect();
        assert!(set.remove(2));
        assert!(!set.remove(2));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 3]);
        assert!(set.clear());
        assert!(!set.clear());
        assert!(set.is_empty());
    }
}
