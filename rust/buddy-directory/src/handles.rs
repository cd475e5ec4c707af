//! Contact handle allocation.
//!
//! Maps a network address to a stable local integer. The host connection
//! manager normally owns this; `ContactHandles` is the in-process version.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuddyId(pub u32);

impl fmt::Display for BuddyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub trait HandleRepo: Send {
    /// Returns the handle for `jid`, allocating one if needed.
    fn ensure(&mut self, jid: &str) -> Option<BuddyId>;

    fn lookup(&self, jid: &str) -> Option<BuddyId>;

    fn inspect(&self, id: BuddyId) -> Option<&str>;
}

/// Lowercases a JID and strips its resource.
///
/// Returns `None` for addresses with an empty node or domain.
pub fn normalize_jid(jid: &str) -> Option<String> {
    let bare = jid.split('/').next().unwrap_or(jid).trim();
    let (node, domain) = match bare.split_once('@') {
        Some((node, domain)) => {
            if node.is_empty() {
                return None;
            }
            (Some(node), domain)
        }
        None => (None, bare),
    };
    if domain.is_empty() {
        return None;
    }
    Some(match node {
        Some(node) => format!("{}@{}", node.to_lowercase(), domain.to_lowercase()),
        None => domain.to_lowercase(),
    })
}

#[derive(Debug)]
pub struct ContactHandles {
    by_jid: HashMap<String, BuddyId>,
    by_id: HashMap<BuddyId, String>,
    next: u32,
}

impl ContactHandles {
    pub fn new() -> Self {
        Self {
            by_jid: HashMap::new(),
            by_id: HashMap::new(),
            next: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl Default for ContactHandles {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleRepo for ContactHandles {
    fn ensure(&mut self, jid: &str) -> Option<BuddyId> {
        let jid = normalize_jid(jid)?;
        if let Some(id) = self.by_jid.get(&jid) {
            return Some(*id);
        }
        let id = BuddyId(self.next);
        self.next += 1;
        self.by_id.insert(id, jid.clone());
        self.by_jid.insert(jid, id);
        Some(id)
    }

    fn lookup(&self, jid: &str) -> Option<BuddyId> {
        self.by_jid.get(&normalize_jid(jid)?).copied()
    }

    fn inspect(&self, id: BuddyId) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }
}
