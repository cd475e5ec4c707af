//! The single-owner reactive core.
//!
//! `GadgetCore` owns the directory session, the property cache and the view
//! registry. Every method returns as soon as its stanza is handed to the
//! transport; results surface later through the broadcast events. The async
//! [`Gadget`](crate::Gadget) handle drives one of these from its event loop.

use crate::cache::{PropertiesChanged, PropertyCache};
use crate::config::GadgetConfig;
use crate::error::{GadgetError, Result};
use crate::handles::{BuddyId, HandleRepo};
use crate::property::PropertySet;
use crate::protocol::{BuddyEntry, Inbound, ViewId, ViewQuery};
use crate::registry::{MembersChanged, ViewRegistry};
use crate::session::DirectorySession;
use crate::stanza::Element;
use crate::transport::StanzaSink;
use crate::view::{Delta, ViewState};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Answer to a properties request: either already cached or on its way.
#[derive(Debug)]
pub enum PropertiesRequest {
    Ready(PropertySet),
    Pending(oneshot::Receiver<PropertySet>),
}

pub struct GadgetCore {
    session: DirectorySession,
    cache: PropertyCache,
    registry: ViewRegistry,
    handles: Box<dyn HandleRepo>,
    self_handle: Option<BuddyId>,
    fallback_to_directory: bool,
}

impl GadgetCore {
    pub fn new(
        config: &GadgetConfig,
        sink: Arc<dyn StanzaSink>,
        handles: Box<dyn HandleRepo>,
    ) -> Self {
        Self {
            session: DirectorySession::new(sink),
            cache: PropertyCache::new(config.fetch_timeout, config.event_capacity),
            registry: ViewRegistry::new(config.event_capacity),
            handles,
            self_handle: None,
            fallback_to_directory: config.fallback_to_directory,
        }
    }

    pub fn subscribe_members(&self) -> broadcast::Receiver<MembersChanged> {
        self.registry.subscribe()
    }

    pub fn subscribe_properties(&self) -> broadcast::Receiver<PropertiesChanged> {
        self.cache.subscribe()
    }

    pub(crate) fn event_senders(
        &self,
    ) -> (
        broadcast::Sender<MembersChanged>,
        broadcast::Sender<PropertiesChanged>,
    ) {
        (self.registry.sender(), self.cache.sender())
    }

    pub fn set_directory(&mut self, jid: Option<&str>) {
        self.session.set_directory(jid);
    }

    pub fn directory(&self) -> Option<&str> {
        self.session.directory()
    }

    pub fn set_self_jid(&mut self, jid: &str) -> Result<BuddyId> {
        let id = self.ensure_handle(jid)?;
        self.self_handle = Some(id);
        Ok(id)
    }

    pub fn ensure_handle(&mut self, jid: &str) -> Result<BuddyId> {
        self.handles
            .ensure(jid)
            .ok_or_else(|| GadgetError::UnknownContact(jid.to_string()))
    }

    pub fn inspect_handle(&self, buddy: BuddyId) -> Option<String> {
        self.handles.inspect(buddy).map(str::to_string)
    }

    pub fn cache(&self) -> &PropertyCache {
        &self.cache
    }

    pub fn registry(&self) -> &ViewRegistry {
        &self.registry
    }

    pub fn session(&self) -> &DirectorySession {
        &self.session
    }

    /// Allocates a view id and sends the view request tagged with it.
    ///
    /// The returned id does not reflect server state yet; the initial
    /// membership arrives later as a membership event.
    pub fn create_view(&mut self, query: ViewQuery) -> Result<ViewId> {
        if let ViewQuery::RandomSample { max: 0 } = query {
            return Err(GadgetError::InvalidQuery(
                "random sample size must be greater than 0".to_string(),
            ));
        }
        if self.session.directory().is_none() {
            return Err(GadgetError::ServiceUnavailable);
        }

        let view_id = self.registry.create(query.clone());
        if let Err(e) = self.session.send_view_request(view_id, &query) {
            // the id stays consumed
            let _ = self.registry.close(view_id);
            return Err(e);
        }
        Ok(view_id)
    }

    pub fn close_view(&mut self, view_id: ViewId) -> Result<()> {
        if self.registry.close(view_id)? {
            if let Err(e) = self.session.send_close(view_id) {
                warn!(view_id, error = %e, "could not send view close");
            }
        }
        Ok(())
    }

    pub fn view_members(&self, view_id: ViewId) -> Result<BTreeSet<BuddyId>> {
        self.registry.members(view_id)
    }

    pub fn view_state(&self, view_id: ViewId) -> Result<ViewState> {
        self.registry.state(view_id)
    }

    pub fn cached_properties(&self, buddy: BuddyId) -> PropertySet {
        self.cache.get(buddy)
    }

    /// Starts a property fetch for `buddy` unless one is already in flight.
    pub fn refresh(
        &mut self,
        buddy: BuddyId,
        now: Instant,
        waiter: Option<oneshot::Sender<PropertySet>>,
    ) -> Result<()> {
        if self.session.directory().is_none() {
            return Err(GadgetError::ServiceUnavailable);
        }
        let jid = self
            .handles
            .inspect(buddy)
            .map(str::to_string)
            .ok_or_else(|| GadgetError::UnknownContact(buddy.to_string()))?;

        if !self.cache.begin_fetch(buddy, now, waiter) {
            debug!(%buddy, "property fetch already in flight");
            return Ok(());
        }
        if let Err(e) = self.session.send_properties_query(&jid) {
            self.cache.cancel_fetch(buddy);
            return Err(e);
        }
        debug!(%buddy, jid = %jid, "property fetch started");
        Ok(())
    }

    /// Cached properties if any are known, otherwise a fetch to wait on.
    pub fn request_properties(
        &mut self,
        buddy: BuddyId,
        now: Instant,
    ) -> Result<PropertiesRequest> {
        if self.cache.is_known(buddy) {
            return Ok(PropertiesRequest::Ready(self.cache.get(buddy)));
        }
        let (tx, rx) = oneshot::channel();
        self.refresh(buddy, now, Some(tx))?;
        Ok(PropertiesRequest::Pending(rx))
    }

    /// Publishes the local buddy's properties.
    pub fn set_own_properties(&mut self, properties: PropertySet) -> Result<()> {
        self.session.send_publish(&properties)?;
        if let Some(me) = self.self_handle {
            self.cache.replace(me, properties);
        }
        Ok(())
    }

    pub fn handle_stanza(&mut self, stanza: &Element) {
        if let Some(inbound) = self.session.demux(stanza) {
            self.handle_inbound(inbound);
        }
    }

    pub fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::ViewReply { view_id, buddies } => {
                let members = self.resolve_entries(buddies);
                self.registry
                    .apply_initial_reply(view_id, members, &mut self.cache);
            }
            Inbound::ViewError { view_id } => {
                warn!(view_id, "directory rejected view request");
                let _ = self.registry.close(view_id);
            }
            Inbound::Added { view_id, buddies } => {
                if !self.is_open(view_id) {
                    debug!(view_id, "dropping added notification");
                    return;
                }
                let members = self.resolve_entries(buddies);
                let mut added = Vec::with_capacity(members.len());
                for (buddy, properties) in members {
                    if let Some(properties) = properties {
                        self.cache.replace(buddy, properties);
                    }
                    added.push(buddy);
                }
                self.registry.apply_delta(view_id, &Delta::added(added));
            }
            Inbound::Removed { view_id, jids } => {
                let removed: Vec<BuddyId> =
                    jids.iter().filter_map(|jid| self.handles.lookup(jid)).collect();
                self.registry.apply_delta(view_id, &Delta::removed(removed));
            }
            Inbound::Change { jid, properties } => match self.handles.ensure(&jid) {
                Some(buddy) => {
                    self.cache.replace(buddy, properties);
                }
                None => debug!(jid = %jid, "ignoring change for invalid address"),
            },
            Inbound::PropertiesReply { jid, properties }
            | Inbound::LookupReply { jid, properties } => {
                if let Some(buddy) = self.handles.lookup(&jid) {
                    self.cache.complete_fetch(buddy, properties);
                }
            }
            Inbound::PropertiesError { jid } => self.point_query_failed(&jid),
            Inbound::LookupError { jid } => {
                if let Some(buddy) = self.handles.lookup(&jid) {
                    self.cache.complete_fetch(buddy, PropertySet::new());
                }
            }
        }
    }

    /// A failed point query falls back to the directory's copy when
    /// possible; otherwise the buddy has no properties.
    fn point_query_failed(&mut self, jid: &str) {
        let Some(buddy) = self.handles.lookup(jid) else {
            return;
        };
        let can_fall_back = self.fallback_to_directory && self.session.directory().is_some();
        if can_fall_back && self.cache.escalate_fetch(buddy) {
            match self.session.send_lookup(jid) {
                Ok(()) => {
                    debug!(%buddy, "point query failed, asking the directory");
                    return;
                }
                Err(e) => warn!(%buddy, error = %e, "could not send directory lookup"),
            }
        }
        self.cache.complete_fetch(buddy, PropertySet::new());
    }

    fn is_open(&self, view_id: ViewId) -> bool {
        self.registry.get(view_id).is_some_and(|v| !v.is_closed())
    }

    fn resolve_entries(
        &mut self,
        buddies: Vec<BuddyEntry>,
    ) -> Vec<(BuddyId, Option<PropertySet>)> {
        buddies
            .into_iter()
            .filter_map(|entry| match self.handles.ensure(&entry.jid) {
                Some(buddy) => Some((buddy, entry.properties)),
                None => {
                    debug!(jid = %entry.jid, "skipping buddy with invalid address");
                    None
                }
            })
            .collect()
    }

    /// Expires stale property fetches.
    pub fn sweep(&mut self, now: Instant) {
        for buddy in self.cache.expire_fetches(now) {
            if let Some(jid) = self.handles.inspect(buddy) {
                self.session.forget_fetch(jid);
            }
        }
    }

    /// Connection teardown: every view closes locally, nothing is sent.
    pub fn disconnect(&mut self) {
        let closed = self.registry.close_all();
        self.cache.abort_fetches();
        self.session.reset();
        debug!(views = closed.len(), "directory state torn down");
    }
}
