//! Property cache shared by every view.
//!
//! Holds the last known property set per buddy and the in-flight fetch
//! state. Entries are created lazily and are never expired; a later fetch or
//! directory push overwrites them. Closing a view does not touch the cache.

use crate::handles::BuddyId;
use crate::property::PropertySet;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertiesChanged {
    pub buddy: BuddyId,
    pub properties: PropertySet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStage {
    /// Waiting on the buddy's own published node.
    PointQuery,
    /// Point query failed; waiting on the directory's copy.
    DirectoryLookup,
}

struct PendingFetch {
    stage: FetchStage,
    deadline: Instant,
    waiters: Vec<oneshot::Sender<PropertySet>>,
}

pub struct PropertyCache {
    entries: HashMap<BuddyId, PropertySet>,
    pending: HashMap<BuddyId, PendingFetch>,
    changes_tx: broadcast::Sender<PropertiesChanged>,
    fetch_timeout: Duration,
}

impl PropertyCache {
    pub fn new(fetch_timeout: Duration, capacity: usize) -> Self {
        let (changes_tx, _) = broadcast::channel(capacity);
        Self {
            entries: HashMap::new(),
            pending: HashMap::new(),
            changes_tx,
            fetch_timeout,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PropertiesChanged> {
        self.changes_tx.subscribe()
    }

    pub(crate) fn sender(&self) -> broadcast::Sender<PropertiesChanged> {
        self.changes_tx.clone()
    }

    /// Last known properties; empty when nothing is known yet.
    pub fn get(&self, buddy: BuddyId) -> PropertySet {
        self.entries.get(&buddy).cloned().unwrap_or_default()
    }

    /// Whether a fetch or a push has ever stored a set for `buddy`.
    pub fn is_known(&self, buddy: BuddyId) -> bool {
        self.entries.contains_key(&buddy)
    }

    /// Partial update: keys in `properties` overwrite, other keys are kept.
    ///
    /// Returns true if the stored set changed.
    pub fn merge(&mut self, buddy: BuddyId, properties: &PropertySet) -> bool {
        let mut updated = self.get(buddy);
        updated.update_from(properties);
        self.store(buddy, updated)
    }

    /// Authoritative update: the stored set becomes exactly `properties`.
    pub fn replace(&mut self, buddy: BuddyId, properties: PropertySet) -> bool {
        self.store(buddy, properties)
    }

    fn store(&mut self, buddy: BuddyId, properties: PropertySet) -> bool {
        let previous = self.entries.insert(buddy, properties.clone());
        if previous.unwrap_or_default() == properties {
            return false;
        }

        debug!(%buddy, count = properties.len(), "buddy properties changed");
        let _ = self.changes_tx.send(PropertiesChanged { buddy, properties });
        true
    }

    pub fn is_fetching(&self, buddy: BuddyId) -> bool {
        self.pending.contains_key(&buddy)
    }

    pub fn fetch_stage(&self, buddy: BuddyId) -> Option<FetchStage> {
        self.pending.get(&buddy).map(|p| p.stage)
    }

    pub fn pending_fetches(&self) -> usize {
        self.pending.len()
    }

    /// Registers interest in a fetch of `buddy`.
    ///
    /// Returns true when no fetch was in flight and the caller must send the
    /// point query. A waiter, if given, is resolved when the fetch finishes
    /// or expires.
    pub fn begin_fetch(
        &mut self,
        buddy: BuddyId,
        now: Instant,
        waiter: Option<oneshot::Sender<PropertySet>>,
    ) -> bool {
        let deadline = now + self.fetch_timeout;
        let mut started = false;
        let pending = self.pending.entry(buddy).or_insert_with(|| {
            started = true;
            PendingFetch {
                stage: FetchStage::PointQuery,
                deadline,
                waiters: Vec::new(),
            }
        });
        if let Some(waiter) = waiter {
            pending.waiters.push(waiter);
        }
        started
    }

    /// Moves an in-flight fetch to the directory lookup stage.
    ///
    /// The original deadline is kept. Returns false if no point query was
    /// in flight for `buddy`.
    pub fn escalate_fetch(&mut self, buddy: BuddyId) -> bool {
        match self.pending.get_mut(&buddy) {
            Some(pending) if pending.stage == FetchStage::PointQuery => {
                pending.stage = FetchStage::DirectoryLookup;
                true
            }
            _ => false,
        }
    }

    /// Drops an in-flight fetch without storing anything, e.g. when the
    /// query could not be sent. Waiters get whatever is cached.
    pub fn cancel_fetch(&mut self, buddy: BuddyId) {
        if let Some(pending) = self.pending.remove(&buddy) {
            let cached = self.get(buddy);
            for waiter in pending.waiters {
                let _ = waiter.send(cached.clone());
            }
        }
    }

    /// Stores the fetch outcome and wakes every waiter.
    ///
    /// Outcomes arriving after the fetch expired are still stored.
    pub fn complete_fetch(&mut self, buddy: BuddyId, properties: PropertySet) {
        let pending = self.pending.remove(&buddy);
        self.replace(buddy, properties.clone());
        if let Some(pending) = pending {
            for waiter in pending.waiters {
                let _ = waiter.send(properties.clone());
            }
        }
    }

    /// Abandons fetches whose deadline has passed.
    ///
    /// The in-flight flag is cleared so a later refresh can try again, and
    /// waiters get whatever is cached.
    pub fn expire_fetches(&mut self, now: Instant) -> Vec<BuddyId> {
        let expired: Vec<BuddyId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for buddy in &expired {
            if let Some(pending) = self.pending.remove(buddy) {
                debug!(%buddy, stage = ?pending.stage, "property fetch timed out");
                let cached = self.get(*buddy);
                for waiter in pending.waiters {
                    let _ = waiter.send(cached.clone());
                }
            }
        }
        expired
    }

    /// Drops every in-flight fetch, resolving waiters with cached values.
    pub fn abort_fetches(&mut self) {
        for (buddy, pending) in self.pending.drain() {
            let cached = self.entries.get(&buddy).cloned().unwrap_or_default();
            for waiter in pending.waiters {
                let _ = waiter.send(cached.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> PropertyCache {
        PropertyCache::new(Duration::from_secs(30), 16)
    }

    fn color(value: &str) -> PropertySet {
        PropertySet::new().with("color", value)
    }

    #[test]
    fn test_change_event_only_on_difference() {
        let mut cache = cache();
        let mut rx = cache.subscribe();
        let bob = BuddyId(1);

        assert!(cache.replace(bob, color("#005FE4,#00A0FF")));
        assert!(!cache.replace(bob, color("#005FE4,#00A0FF")));
        assert!(cache.replace(bob, color("#FFFFFF,#AAAAAA")));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.buddy, bob);
        assert_eq!(first.properties, color("#005FE4,#00A0FF"));
        assert_eq!(rx.try_recv().unwrap().properties, color("#FFFFFF,#AAAAAA"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_empty_set_for_unknown_buddy_is_silent() {
        let mut cache = cache();
        let mut rx = cache.subscribe();
        let bob = BuddyId(1);

        assert!(!cache.is_known(bob));
        assert!(!cache.replace(bob, PropertySet::new()));
        assert!(cache.is_known(bob));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_merge_is_partial_and_replace_is_not() {
        let mut cache = cache();
        let bob = BuddyId(1);
        cache.replace(bob, color("#1").with("nick", "bob"));

        cache.merge(bob, &color("#2"));
        assert_eq!(cache.get(bob), color("#2").with("nick", "bob"));

        cache.replace(bob, color("#3"));
        assert_eq!(cache.get(bob), color("#3"));
    }

    #[test]
    fn test_single_fetch_in_flight() {
        let mut cache = cache();
        let bob = BuddyId(1);
        let now = Instant::now();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();

        assert!(cache.begin_fetch(bob, now, Some(tx1)));
        assert!(!cache.begin_fetch(bob, now, Some(tx2)));
        assert!(!cache.begin_fetch(bob, now, None));
        assert_eq!(cache.pending_fetches(), 1);

        cache.complete_fetch(bob, color("#1"));
        assert!(!cache.is_fetching(bob));
        assert_eq!(rx1.try_recv().unwrap(), color("#1"));
        assert_eq!(rx2.try_recv().unwrap(), color("#1"));

        assert!(cache.begin_fetch(bob, now, None));
    }

    #[test]
    fn test_escalation_keeps_fetch_in_flight() {
        let mut cache = cache();
        let bob = BuddyId(1);

        assert!(!cache.escalate_fetch(bob));
        cache.begin_fetch(bob, Instant::now(), None);
        assert!(cache.escalate_fetch(bob));
        assert!(!cache.escalate_fetch(bob));
        assert_eq!(cache.fetch_stage(bob), Some(FetchStage::DirectoryLookup));
        assert!(!cache.begin_fetch(bob, Instant::now(), None));
    }

    #[test]
    fn test_expired_fetch_is_cleared() {
        let mut cache = cache();
        let bob = BuddyId(1);
        let charles = BuddyId(2);
        let start = Instant::now();
        let (tx, mut rx) = oneshot::channel();

        cache.begin_fetch(bob, start, Some(tx));
        cache.begin_fetch(charles, start + Duration::from_secs(20), None);

        assert!(cache.expire_fetches(start + Duration::from_secs(10)).is_empty());
        let expired = cache.expire_fetches(start + Duration::from_secs(30));
        assert_eq!(expired, vec![bob]);
        assert!(!cache.is_fetching(bob));
        assert!(cache.is_fetching(charles));
        assert_eq!(rx.try_recv().unwrap(), PropertySet::new());
        assert!(!cache.is_known(bob));

        // a late reply still lands
        cache.complete_fetch(bob, color("#1"));
        assert_eq!(cache.get(bob), color("#1"));
    }

    #[test]
    fn test_abort_resolves_waiters() {
        let mut cache = cache();
        let bob = BuddyId(1);
        cache.replace(bob, color("#1"));
        let (tx, mut rx) = oneshot::channel();
        cache.begin_fetch(bob, Instant::now(), Some(tx));

        cache.abort_fetches();
        assert_eq!(cache.pending_fetches(), 0);
        assert_eq!(rx.try_recv().unwrap(), color("#1"));
    }
}
