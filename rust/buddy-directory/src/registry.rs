use crate::cache::PropertyCache;
use crate::error::{GadgetError, Result};
use crate::handles::BuddyId;
use crate::property::PropertySet;
use crate::protocol::{ViewId, ViewQuery};
use crate::view::{Delta, View, ViewState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembersChanged {
    pub view_id: ViewId,
    pub added: BTreeSet<BuddyId>,
    pub removed: BTreeSet<BuddyId>,
}

/// Tracks every view created on this connection.
///
/// Ids start at 0 and are never reused. Closed views keep their last
/// membership snapshot so callers can still read it.
pub struct ViewRegistry {
    views: HashMap<ViewId, View>,
    next_id: ViewId,
    changes_tx: broadcast::Sender<MembersChanged>,
}

impl ViewRegistry {
    pub fn new(capacity: usize) -> Self {
        let (changes_tx, _) = broadcast::channel(capacity);
        Self {
            views: HashMap::new(),
            next_id: 0,
            changes_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembersChanged> {
        self.changes_tx.subscribe()
    }

    pub(crate) fn sender(&self) -> broadcast::Sender<MembersChanged> {
        self.changes_tx.clone()
    }

    /// Id the next `create` will hand out.
    pub fn next_id(&self) -> ViewId {
        self.next_id
    }

    pub fn create(&mut self, query: ViewQuery) -> ViewId {
        let id = self.next_id;
        self.next_id += 1;
        self.views.insert(id, View::new(id, query));
        debug!(view_id = id, "view created");
        id
    }

    pub fn get(&self, view_id: ViewId) -> Option<&View> {
        self.views.get(&view_id)
    }

    pub fn state(&self, view_id: ViewId) -> Result<ViewState> {
        self.views
            .get(&view_id)
            .map(View::state)
            .ok_or(GadgetError::UnknownView(view_id))
    }

    pub fn members(&self, view_id: ViewId) -> Result<BTreeSet<BuddyId>> {
        self.views
            .get(&view_id)
            .map(|v| v.members().clone())
            .ok_or(GadgetError::UnknownView(view_id))
    }

    fn open_view(&mut self, view_id: ViewId) -> Option<&mut View> {
        match self.views.get_mut(&view_id) {
            Some(view) if !view.is_closed() => Some(view),
            Some(_) => {
                debug!(view_id, "dropping update for closed view");
                None
            }
            None => {
                debug!(view_id, "dropping update for unknown view");
                None
            }
        }
    }

    /// Applies the directory's first answer to a view request.
    ///
    /// Member properties are stored before membership changes, so listeners
    /// of the membership event can already read them. The event is raised
    /// even when the reply is empty.
    pub fn apply_initial_reply(
        &mut self,
        view_id: ViewId,
        members: Vec<(BuddyId, Option<PropertySet>)>,
        cache: &mut PropertyCache,
    ) -> Option<MembersChanged> {
        let view = self.open_view(view_id)?;
        let first = view.state() == ViewState::Pending;

        let mut ids = Vec::with_capacity(members.len());
        for (buddy, properties) in members {
            if let Some(properties) = properties {
                cache.replace(buddy, properties);
            }
            ids.push(buddy);
        }

        let flipped = view.apply(&Delta::added(ids));
        info!(view_id, members = view.members().len(), "view is live");

        if !first && flipped.is_empty() {
            return None;
        }
        Some(self.publish(view_id, flipped))
    }

    /// Applies an unsolicited added/removed notification.
    ///
    /// Unknown and closed views are ignored. An event is raised only when
    /// some membership actually flipped.
    pub fn apply_delta(&mut self, view_id: ViewId, delta: &Delta) -> Option<MembersChanged> {
        let view = self.open_view(view_id)?;
        let flipped = view.apply(delta);
        if flipped.is_empty() {
            return None;
        }
        Some(self.publish(view_id, flipped))
    }

    fn publish(&self, view_id: ViewId, flipped: Delta) -> MembersChanged {
        let event = MembersChanged {
            view_id,
            added: flipped.added,
            removed: flipped.removed,
        };
        debug!(
            view_id,
            added = event.added.len(),
            removed = event.removed.len(),
            "view membership changed"
        );
        let _ = self.changes_tx.send(event.clone());
        event
    }

    /// Closes a view. Returns `Ok(false)` when it was already closed, in
    /// which case the caller must not send another unsubscribe.
    pub fn close(&mut self, view_id: ViewId) -> Result<bool> {
        let view = self
            .views
            .get_mut(&view_id)
            .ok_or(GadgetError::UnknownView(view_id))?;
        let closed = view.close();
        if closed {
            info!(view_id, "view closed");
        }
        Ok(closed)
    }

    /// Closes every open view without further notice, returning their ids.
    pub fn close_all(&mut self) -> Vec<ViewId> {
        let mut closed: Vec<ViewId> = self
            .views
            .values_mut()
            .filter_map(|view| view.close().then_some(view.id()))
            .collect();
        closed.sort_unstable();
        closed
    }

    /// Open views that currently list `buddy`.
    pub fn views_containing(&self, buddy: BuddyId) -> Vec<ViewId> {
        let mut ids: Vec<ViewId> = self
            .views
            .values()
            .filter(|v| !v.is_closed() && v.contains(buddy))
            .map(View::id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn open_count(&self) -> usize {
        self.views.values().filter(|v| !v.is_closed()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn setup() -> (ViewRegistry, PropertyCache) {
        (
            ViewRegistry::new(16),
            PropertyCache::new(Duration::from_secs(30), 16),
        )
    }

    fn color(value: &str) -> Option<PropertySet> {
        Some(PropertySet::new().with("color", value))
    }

    fn ids(raw: &[u32]) -> BTreeSet<BuddyId> {
        raw.iter().copied().map(BuddyId).collect()
    }

    #[test]
    fn test_ids_are_sequential_and_never_reused() {
        let (mut registry, _) = setup();
        assert_eq!(registry.create(ViewQuery::RandomSample { max: 3 }), 0);
        assert_eq!(registry.create(ViewQuery::RandomSample { max: 3 }), 1);
        registry.close(0).unwrap();
        assert_eq!(registry.create(ViewQuery::RandomSample { max: 3 }), 2);
        assert_eq!(registry.next_id(), 3);
    }

    #[test]
    fn test_initial_reply_primes_cache() {
        let (mut registry, mut cache) = setup();
        let mut members_rx = registry.subscribe();
        let mut props_rx = cache.subscribe();
        let id = registry.create(ViewQuery::RandomSample { max: 3 });

        let event = registry
            .apply_initial_reply(
                id,
                vec![
                    (BuddyId(2), color("#AAAAAA,#BBBBBB")),
                    (BuddyId(1), color("#005FE4,#00A0FF")),
                ],
                &mut cache,
            )
            .unwrap();

        assert_eq!(event.added, ids(&[1, 2]));
        assert!(event.removed.is_empty());
        assert_eq!(members_rx.try_recv().unwrap(), event);
        assert!(props_rx.try_recv().is_ok());
        assert!(props_rx.try_recv().is_ok());
        assert_eq!(registry.members(id).unwrap(), ids(&[1, 2]));
        assert_eq!(registry.state(id).unwrap(), ViewState::Live);
    }

    #[test]
    fn test_empty_initial_reply_is_observable() {
        let (mut registry, mut cache) = setup();
        let mut rx = registry.subscribe();
        let id = registry.create(ViewQuery::RandomSample { max: 3 });

        let event = registry.apply_initial_reply(id, Vec::new(), &mut cache).unwrap();
        assert!(event.added.is_empty());
        assert_eq!(rx.try_recv().unwrap().view_id, id);
        assert_eq!(registry.state(id).unwrap(), ViewState::Live);
    }

    #[test]
    fn test_delta_fold_is_idempotent() {
        let (mut registry, mut cache) = setup();
        let id = registry.create(ViewQuery::RandomSample { max: 3 });
        registry.apply_initial_reply(id, vec![(BuddyId(1), None), (BuddyId(2), None)], &mut cache);

        let deltas = [
            Delta::added([BuddyId(3)]),
            Delta::added([BuddyId(3)]),
            Delta::removed([BuddyId(1)]),
            Delta::removed([BuddyId(1)]),
            Delta::removed([BuddyId(7)]),
            Delta::new([BuddyId(4)], [BuddyId(2)]),
        ];
        let mut expected = ids(&[1, 2]);
        let mut events = 0;
        for delta in &deltas {
            if registry.apply_delta(id, delta).is_some() {
                events += 1;
            }
            expected.extend(delta.added.iter().copied());
            for r in &delta.removed {
                expected.remove(r);
            }
        }

        assert_eq!(registry.members(id).unwrap(), expected);
        assert_eq!(expected, ids(&[3, 4]));
        assert_eq!(events, 3);
    }

    #[test]
    fn test_closed_view_drops_notifications() {
        let (mut registry, mut cache) = setup();
        let id = registry.create(ViewQuery::RandomSample { max: 3 });
        registry.apply_initial_reply(id, vec![(BuddyId(1), None)], &mut cache);
        let mut rx = registry.subscribe();

        assert!(registry.close(id).unwrap());
        assert!(!registry.close(id).unwrap());
        assert!(registry.apply_delta(id, &Delta::added([BuddyId(5)])).is_none());
        assert!(registry
            .apply_initial_reply(id, vec![(BuddyId(6), None)], &mut cache)
            .is_none());
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.members(id).unwrap(), ids(&[1]));
        assert_eq!(registry.open_count(), 0);
    }

    #[test]
    fn test_unknown_view() {
        let (mut registry, _) = setup();
        assert_eq!(registry.members(4), Err(GadgetError::UnknownView(4)));
        assert_eq!(registry.close(4), Err(GadgetError::UnknownView(4)));
        assert!(registry.apply_delta(4, &Delta::added([BuddyId(1)])).is_none());
    }

    #[test]
    fn test_views_containing() {
        let (mut registry, mut cache) = setup();
        let a = registry.create(ViewQuery::RandomSample { max: 3 });
        let b = registry.create(ViewQuery::RandomSample { max: 3 });
        registry.apply_initial_reply(a, vec![(BuddyId(1), None)], &mut cache);
        registry.apply_initial_reply(b, vec![(BuddyId(1), None), (BuddyId(2), None)], &mut cache);

        assert_eq!(registry.views_containing(BuddyId(1)), vec![a, b]);
        registry.close(a).unwrap();
        assert_eq!(registry.views_containing(BuddyId(1)), vec![b]);
        assert_eq!(registry.close_all(), vec![b]);
    }
}
