//! A single live view: one outstanding directory subscription.

use crate::handles::BuddyId;
use crate::protocol::{ViewId, ViewQuery};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewState {
    /// Query sent, nothing applied yet.
    Pending,
    Live,
    Closed,
}

/// Membership change for one view. `added` and `removed` never overlap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub added: BTreeSet<BuddyId>,
    pub removed: BTreeSet<BuddyId>,
}

impl Delta {
    /// Identities listed on both sides cancel out and are dropped.
    pub fn new(
        added: impl IntoIterator<Item = BuddyId>,
        removed: impl IntoIterator<Item = BuddyId>,
    ) -> Self {
        let mut added: BTreeSet<BuddyId> = added.into_iter().collect();
        let mut removed: BTreeSet<BuddyId> = removed.into_iter().collect();
        let both: Vec<BuddyId> = added.intersection(&removed).copied().collect();
        for id in both {
            added.remove(&id);
            removed.remove(&id);
        }
        Self { added, removed }
    }

    pub fn added(ids: impl IntoIterator<Item = BuddyId>) -> Self {
        Self::new(ids, [])
    }

    pub fn removed(ids: impl IntoIterator<Item = BuddyId>) -> Self {
        Self::new([], ids)
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct View {
    id: ViewId,
    query: ViewQuery,
    members: BTreeSet<BuddyId>,
    state: ViewState,
}

impl View {
    pub fn new(id: ViewId, query: ViewQuery) -> Self {
        Self {
            id,
            query,
            members: BTreeSet::new(),
            state: ViewState::Pending,
        }
    }

    pub fn id(&self) -> ViewId {
        self.id
    }

    pub fn query(&self) -> &ViewQuery {
        &self.query
    }

    pub fn state(&self) -> ViewState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ViewState::Closed
    }

    pub fn members(&self) -> &BTreeSet<BuddyId> {
        &self.members
    }

    pub fn contains(&self, buddy: BuddyId) -> bool {
        self.members.contains(&buddy)
    }

    /// Applies `delta` and returns the part of it that actually flipped
    /// membership. Adding a member twice or removing a non-member is a no-op.
    ///
    /// A closed view is never mutated.
    pub fn apply(&mut self, delta: &Delta) -> Delta {
        if self.is_closed() {
            return Delta::default();
        }

        let removed: BTreeSet<BuddyId> = delta
            .removed
            .iter()
            .copied()
            .filter(|id| self.members.remove(id))
            .collect();
        let added: BTreeSet<BuddyId> = delta
            .added
            .iter()
            .copied()
            .filter(|id| self.members.insert(*id))
            .collect();

        self.state = ViewState::Live;
        Delta { added, removed }
    }

    /// Marks the view closed. Returns false if it already was.
    ///
    /// The final membership is kept as a read-only snapshot.
    pub fn close(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state = ViewState::Closed;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u32]) -> BTreeSet<BuddyId> {
        raw.iter().copied().map(BuddyId).collect()
    }

    #[test]
    fn test_delta_sides_are_disjoint() {
        let delta = Delta::new([BuddyId(1), BuddyId(2)], [BuddyId(2), BuddyId(3)]);
        assert_eq!(delta.added, ids(&[1]));
        assert_eq!(delta.removed, ids(&[3]));
    }

    #[test]
    fn test_apply_reports_only_flips() {
        let mut view = View::new(0, ViewQuery::RandomSample { max: 3 });
        assert_eq!(view.state(), ViewState::Pending);

        let flipped = view.apply(&Delta::added([BuddyId(1), BuddyId(2)]));
        assert_eq!(flipped.added, ids(&[1, 2]));
        assert_eq!(view.state(), ViewState::Live);

        let flipped = view.apply(&Delta::added([BuddyId(2), BuddyId(3)]));
        assert_eq!(flipped.added, ids(&[3]));

        let flipped = view.apply(&Delta::removed([BuddyId(1), BuddyId(9)]));
        assert_eq!(flipped.removed, ids(&[1]));
        assert!(flipped.added.is_empty());
        assert_eq!(view.members(), &ids(&[2, 3]));
    }

    #[test]
    fn test_empty_apply_goes_live() {
        let mut view = View::new(0, ViewQuery::RandomSample { max: 1 });
        assert!(view.apply(&Delta::default()).is_empty());
        assert_eq!(view.state(), ViewState::Live);
    }

    #[test]
    fn test_closed_view_is_frozen() {
        let mut view = View::new(0, ViewQuery::RandomSample { max: 3 });
        view.apply(&Delta::added([BuddyId(1)]));

        assert!(view.close());
        assert!(!view.close());
        assert!(view.apply(&Delta::added([BuddyId(2)])).is_empty());
        assert!(view.apply(&Delta::removed([BuddyId(1)])).is_empty());
        assert_eq!(view.members(), &ids(&[1]));
        assert_eq!(view.state(), ViewState::Closed);
    }
}
