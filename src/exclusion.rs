//! Externally controlled address exclusions.
//!
//! A host decides some addresses must not be polled (an entity the user
//! disabled, say). It publishes the set through a [`DisabledAddressSource`];
//! the engine holds a `watch` receiver and rebuilds its batches on the next
//! refresh after the set changes.

use std::collections::BTreeSet;

use tokio::sync::watch;
use tracing::debug;

/// Publisher of addresses the engine must not read.
pub trait DisabledAddressSource: Send + Sync {
    /// Current set.
    fn disabled_addresses(&self) -> BTreeSet<u16>;

    /// Receiver that is marked changed whenever the set changes.
    fn subscribe(&self) -> watch::Receiver<BTreeSet<u16>>;
}

/// In-process source backed by a `watch` channel.
#[derive(Debug)]
pub struct StaticExclusions {
    tx: watch::Sender<BTreeSet<u16>>,
}

impl StaticExclusions {
    pub fn new(initial: impl IntoIterator<Item = u16>) -> Self {
        let (tx, _rx) = watch::channel(initial.into_iter().collect());
        Self { tx }
    }

    /// Replace the whole set; subscribers are only notified on a change.
    pub fn set(&self, addresses: impl IntoIterator<Item = u16>) {
        let next: BTreeSet<u16> = addresses.into_iter().collect();
        self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!("Excluded addresses: {} -> {}", current.len(), next.len());
            *current = next;
            true
        });
    }

    pub fn exclude(&self, address: u16) {
        self.tx.send_if_modified(|current| current.insert(address));
    }

    pub fn include(&self, address: u16) {
        self.tx.send_if_modified(|current| current.remove(&address));
    }
}

impl Default for StaticExclusions {
    fn default() -> Self {
        Self::new([])
    }
}

impl DisabledAddressSource for StaticExclusions {
    fn disabled_addresses(&self) -> BTreeSet<u16> {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<BTreeSet<u16>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changes_are_signalled_once() {
        let source = StaticExclusions::new([0x0100]);
        let mut rx = source.subscribe();
        assert!(!rx.has_changed().unwrap());

        source.exclude(0x0101);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), BTreeSet::from([0x0100, 0x0101]));

        // Re-adding an address already present is not a change.
        source.exclude(0x0101);
        assert!(!rx.has_changed().unwrap());

        source.include(0x0100);
        assert!(rx.has_changed().unwrap());
        assert_eq!(source.disabled_addresses(), BTreeSet::from([0x0101]));
    }

    #[test]
    fn test_set_replaces() {
        let source = StaticExclusions::default();
        let mut rx = source.subscribe();
        source.set([1, 2, 3]);
        assert_eq!(rx.borrow_and_update().len(), 3);
        source.set([3, 2, 1]);
        assert!(!rx.has_changed().unwrap());
    }
}
