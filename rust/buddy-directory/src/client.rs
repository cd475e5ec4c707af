use crate::cache::PropertiesChanged;
use crate::config::GadgetConfig;
use crate::connection::{spawn_event_loop, ConnectionCommand};
use crate::engine::{GadgetCore, PropertiesRequest};
use crate::error::{GadgetError, Result};
use crate::handles::{BuddyId, ContactHandles, HandleRepo};
use crate::property::PropertySet;
use crate::protocol::{ViewId, ViewQuery};
use crate::registry::MembersChanged;
use crate::stanza::Element;
use crate::stream::{PropertyStream, ViewStream};
use crate::transport::{ChannelSink, StanzaSink};
use crate::view::ViewState;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Both ends of the presence stream when the host wires it up through
/// channels: drain `outbound` into the network, feed parsed stanzas
/// into `inbound`.
pub struct TransportChannels {
    pub outbound: mpsc::Receiver<Element>,
    pub inbound: mpsc::Sender<Element>,
}

pub struct GadgetBuilder {
    config: GadgetConfig,
    directory: Option<String>,
    self_jid: Option<String>,
    handles: Option<Box<dyn HandleRepo>>,
}

impl Default for GadgetBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GadgetBuilder {
    pub fn new() -> Self {
        Self {
            config: GadgetConfig::default(),
            directory: None,
            self_jid: None,
            handles: None,
        }
    }

    pub fn config(mut self, config: GadgetConfig) -> Self {
        self.config = config;
        self
    }

    /// Address of the directory service, as learned from service discovery.
    pub fn directory(mut self, jid: impl Into<String>) -> Self {
        self.directory = Some(jid.into());
        self
    }

    /// The local user's address; published properties are cached under it.
    pub fn self_jid(mut self, jid: impl Into<String>) -> Self {
        self.self_jid = Some(jid.into());
        self
    }

    pub fn handles(mut self, handles: impl HandleRepo + 'static) -> Self {
        self.handles = Some(Box::new(handles));
        self
    }

    /// Spawns the event loop on the current tokio runtime.
    pub fn spawn(
        self,
        sink: Arc<dyn StanzaSink>,
        inbound: mpsc::Receiver<Element>,
    ) -> Result<Gadget> {
        let handles = self
            .handles
            .unwrap_or_else(|| Box::new(ContactHandles::new()));
        let mut core = GadgetCore::new(&self.config, sink, handles);
        core.set_directory(self.directory.as_deref());
        if let Some(jid) = &self.self_jid {
            core.set_self_jid(jid)?;
        }

        let (members_tx, properties_tx) = core.event_senders();
        let (command_tx, command_rx) = mpsc::channel(self.config.command_queue_size);
        let wait_limit = self.config.fetch_timeout + self.config.sweep_interval * 2;

        spawn_event_loop(core, self.config, command_rx, inbound);

        Ok(Gadget {
            inner: Arc::new(GadgetInner {
                command_tx,
                members_tx,
                properties_tx,
                wait_limit,
            }),
        })
    }

    /// Spawns the event loop with channel-backed transport ends.
    pub fn spawn_with_channels(self) -> Result<(Gadget, TransportChannels)> {
        let capacity = self.config.command_queue_size;
        let (sink, outbound) = ChannelSink::new(capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let gadget = self.spawn(Arc::new(sink), inbound_rx)?;
        Ok((
            gadget,
            TransportChannels {
                outbound,
                inbound: inbound_tx,
            },
        ))
    }
}

struct GadgetInner {
    command_tx: mpsc::Sender<ConnectionCommand>,
    members_tx: broadcast::Sender<MembersChanged>,
    properties_tx: broadcast::Sender<PropertiesChanged>,
    wait_limit: Duration,
}

/// Cloneable handle to a running directory event loop.
///
/// The loop stops when `disconnect` is called, the inbound stream ends,
/// or the last clone is dropped; every view is closed locally at that
/// point.
#[derive(Clone)]
pub struct Gadget {
    inner: Arc<GadgetInner>,
}

impl Gadget {
    pub fn builder() -> GadgetBuilder {
        GadgetBuilder::new()
    }

    pub fn is_running(&self) -> bool {
        !self.inner.command_tx.is_closed()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ConnectionCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .command_tx
            .send(make(reply))
            .await
            .map_err(|_| GadgetError::ChannelError("event loop stopped".to_string()))?;
        rx.await
            .map_err(|_| GadgetError::ChannelError("event loop dropped the request".to_string()))
    }

    pub async fn set_directory(&self, jid: Option<&str>) -> Result<()> {
        self.inner
            .command_tx
            .send(ConnectionCommand::SetDirectory(jid.map(str::to_string)))
            .await
            .map_err(|_| GadgetError::ChannelError("event loop stopped".to_string()))
    }

    pub async fn ensure_handle(&self, jid: &str) -> Result<BuddyId> {
        let jid = jid.to_string();
        self.request(|reply| ConnectionCommand::EnsureHandle { jid, reply })
            .await?
    }

    pub async fn inspect_handle(&self, buddy: BuddyId) -> Result<Option<String>> {
        self.request(|reply| ConnectionCommand::InspectHandle { buddy, reply })
            .await
    }

    pub async fn create_view(&self, query: ViewQuery) -> Result<ViewId> {
        self.request(|reply| ConnectionCommand::CreateView { query, reply })
            .await?
    }

    /// Up to `max` randomly chosen buddies, kept current by the directory.
    pub async fn request_random_buddies(&self, max: u32) -> Result<ViewId> {
        self.create_view(ViewQuery::RandomSample { max }).await
    }

    /// Buddies whose published properties include every entry of `criteria`.
    pub async fn search_buddies_by_properties(&self, criteria: PropertySet) -> Result<ViewId> {
        self.create_view(ViewQuery::PropertyMatch { criteria }).await
    }

    pub async fn close_view(&self, view_id: ViewId) -> Result<()> {
        self.request(|reply| ConnectionCommand::CloseView { view_id, reply })
            .await?
    }

    pub async fn view_members(&self, view_id: ViewId) -> Result<BTreeSet<BuddyId>> {
        self.request(|reply| ConnectionCommand::ViewMembers { view_id, reply })
            .await?
    }

    pub async fn view_state(&self, view_id: ViewId) -> Result<ViewState> {
        self.request(|reply| ConnectionCommand::ViewState { view_id, reply })
            .await?
    }

    /// Properties of `buddy`, fetching them when nothing is cached yet.
    ///
    /// A fetch that fails or expires resolves with whatever is cached,
    /// which may be empty.
    pub async fn properties(&self, buddy: BuddyId) -> Result<PropertySet> {
        let request = self
            .request(|reply| ConnectionCommand::Properties { buddy, reply })
            .await??;
        match request {
            PropertiesRequest::Ready(properties) => Ok(properties),
            PropertiesRequest::Pending(rx) => {
                match tokio::time::timeout(self.inner.wait_limit, rx).await {
                    Ok(Ok(properties)) => Ok(properties),
                    Ok(Err(_)) => Err(GadgetError::ChannelError(
                        "property fetch abandoned".to_string(),
                    )),
                    Err(_) => Err(GadgetError::Timeout),
                }
            }
        }
    }

    /// Starts a fetch even when properties are cached; the result arrives
    /// as a property change event.
    pub async fn refresh_properties(&self, buddy: BuddyId) -> Result<()> {
        self.request(|reply| ConnectionCommand::Refresh { buddy, reply })
            .await?
    }

    pub async fn set_properties(&self, properties: PropertySet) -> Result<()> {
        self.request(|reply| ConnectionCommand::SetProperties { properties, reply })
            .await?
    }

    pub fn subscribe_members(&self) -> broadcast::Receiver<MembersChanged> {
        self.inner.members_tx.subscribe()
    }

    pub fn subscribe_properties(&self) -> broadcast::Receiver<PropertiesChanged> {
        self.inner.properties_tx.subscribe()
    }

    pub fn watch_view(&self, view_id: ViewId) -> ViewStream {
        ViewStream::new(self.subscribe_members(), view_id)
    }

    pub fn watch_properties(&self, buddy: Option<BuddyId>) -> PropertyStream {
        PropertyStream::new(self.subscribe_properties(), buddy)
    }

    /// Tears down local state. Nothing is sent to the directory.
    pub async fn disconnect(&self) {
        let _ = self
            .inner
            .command_tx
            .send(ConnectionCommand::Disconnect)
            .await;
    }
}
