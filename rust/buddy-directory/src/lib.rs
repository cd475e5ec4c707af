//! # buddy-directory
//!
//! Client side of the Gadget buddy directory: live, server-maintained
//! views over the set of buddies present on a presence network, plus a
//! shared cache of the properties those buddies publish.
//!
//! ## Example
//!
//! ```rust,ignore
//! use buddy_directory::{Gadget, PropertySet};
//!
//! let (gadget, transport) = Gadget::builder()
//!     .directory("gadget.example.org")
//!     .self_jid("me@example.org")
//!     .spawn_with_channels()?;
//!
//! let view = gadget.request_random_buddies(10).await?;
//! let mut changes = gadget.watch_view(view);
//!
//! while let Some(change) = changes.next().await {
//!     println!("+{:?} -{:?}", change.added, change.removed);
//! }
//! ```
//!
//! ## Views
//!
//! - **Random sample** - up to `max` buddies picked by the directory
//! - **Property match** - buddies whose properties contain the criteria
//!
//! Membership is only ever changed by directory traffic. Closing a view
//! freezes it locally and tells the directory to stop sending updates.

mod cache;
mod client;
mod config;
mod connection;
mod engine;
mod error;
mod handles;
mod property;
mod protocol;
mod registry;
mod session;
pub mod stanza;
mod stream;
mod telemetry;
mod transport;
mod view;

pub use cache::{FetchStage, PropertiesChanged, PropertyCache};
pub use client::{Gadget, GadgetBuilder, TransportChannels};
pub use config::GadgetConfig;
pub use engine::{GadgetCore, PropertiesRequest};
pub use error::{GadgetError, Result};
pub use handles::{normalize_jid, BuddyId, ContactHandles, HandleRepo};
pub use property::{PropertySet, PropertyValue};
pub use protocol::{BuddyEntry, Inbound, ViewId, ViewQuery};
pub use registry::{MembersChanged, ViewRegistry};
pub use session::DirectorySession;
pub use stanza::Element;
pub use stream::{PropertyStream, ViewStream};
pub use telemetry::{init as init_telemetry, TelemetryConfig};
pub use transport::{ChannelSink, StanzaSink};
pub use view::{Delta, View, ViewState};
