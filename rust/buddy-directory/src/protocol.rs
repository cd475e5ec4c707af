//! Gadget directory wire protocol.
//!
//! Outgoing stanzas are built by the `*_request` functions; inbound payloads
//! are parsed into the closed [`Inbound`] set by [`DirectorySession`].
//!
//! [`DirectorySession`]: crate::session::DirectorySession

use crate::handles::normalize_jid;
use crate::property::PropertySet;
use crate::stanza::{Element, NS_AMP, NS_CLIENT, NS_OLPC_BUDDY, NS_OLPC_BUDDY_PROPS, NS_PUBSUB};
use serde::{Deserialize, Serialize};

pub type ViewId = u32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViewQuery {
    RandomSample { max: u32 },
    PropertyMatch { criteria: PropertySet },
}

/// A buddy as listed in a view reply or an `added` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuddyEntry {
    pub jid: String,
    /// `None` when the entry carried no `properties` element at all.
    pub properties: Option<PropertySet>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    ViewReply { view_id: ViewId, buddies: Vec<BuddyEntry> },
    ViewError { view_id: ViewId },
    Added { view_id: ViewId, buddies: Vec<BuddyEntry> },
    Removed { view_id: ViewId, jids: Vec<String> },
    Change { jid: String, properties: PropertySet },
    PropertiesReply { jid: String, properties: PropertySet },
    PropertiesError { jid: String },
    LookupReply { jid: String, properties: PropertySet },
    LookupError { jid: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "get" => Some(IqType::Get),
            "set" => Some(IqType::Set),
            "result" => Some(IqType::Result),
            "error" => Some(IqType::Error),
            _ => None,
        }
    }
}

fn iq(kind: IqType, id: &str, to: Option<&str>) -> Element {
    let mut iq = Element::new("iq")
        .with_ns(NS_CLIENT)
        .with_attr("type", kind.as_str())
        .with_attr("id", id);
    if let Some(to) = to {
        iq.set_attr("to", to);
    }
    iq
}

/// Delivery rule asking the server to drop, not store, undeliverable notices.
fn amp_no_store() -> Element {
    Element::new("amp").with_ns(NS_AMP).with_child(
        Element::new("rule")
            .with_attr("condition", "deliver-at")
            .with_attr("value", "stored")
            .with_attr("action", "error"),
    )
}

pub fn view_request(iq_id: &str, directory: &str, view_id: ViewId, query: &ViewQuery) -> Element {
    let mut view = Element::new("view")
        .with_ns(NS_OLPC_BUDDY)
        .with_attr("id", view_id.to_string());

    match query {
        ViewQuery::RandomSample { max } => {
            view.push(Element::new("random").with_attr("max", max.to_string()));
        }
        ViewQuery::PropertyMatch { criteria } => {
            view.push(Element::new("buddy").with_child(criteria.to_element()));
        }
    }

    iq(IqType::Get, iq_id, Some(directory)).with_child(view)
}

pub fn close_request(directory: &str, view_id: ViewId) -> Element {
    Element::new("message")
        .with_ns(NS_CLIENT)
        .with_attr("to", directory)
        .with_attr("type", "notice")
        .with_child(
            Element::new("close")
                .with_ns(NS_OLPC_BUDDY)
                .with_attr("id", view_id.to_string()),
        )
        .with_child(amp_no_store())
}

/// Point query for the properties a buddy published on its own node.
pub fn properties_request(iq_id: &str, jid: &str) -> Element {
    iq(IqType::Get, iq_id, Some(jid)).with_child(
        Element::new("pubsub")
            .with_ns(NS_PUBSUB)
            .with_child(Element::new("items").with_attr("node", NS_OLPC_BUDDY_PROPS)),
    )
}

/// Asks the directory for the properties it holds for `jid`.
pub fn lookup_request(iq_id: &str, directory: &str, jid: &str) -> Element {
    iq(IqType::Get, iq_id, Some(directory)).with_child(
        Element::new("query")
            .with_ns(NS_OLPC_BUDDY)
            .with_child(Element::new("buddy").with_attr("jid", jid)),
    )
}

pub fn publish_request(iq_id: &str, properties: &PropertySet) -> Element {
    iq(IqType::Set, iq_id, None).with_child(
        Element::new("pubsub").with_ns(NS_PUBSUB).with_child(
            Element::new("publish")
                .with_attr("node", NS_OLPC_BUDDY_PROPS)
                .with_child(Element::new("item").with_child(properties.to_element())),
        ),
    )
}

pub(crate) fn parse_view_id(el: &Element) -> Option<ViewId> {
    el.attr("id")?.trim().parse().ok()
}

/// Reads the `buddy` children of a view reply or `added` notification.
///
/// Buddies without a `jid` are skipped.
pub(crate) fn parse_buddies(parent: &Element) -> Vec<BuddyEntry> {
    parent
        .children_named("buddy")
        .filter_map(|buddy| {
            let jid = buddy.attr("jid")?;
            Some(BuddyEntry {
                jid: jid.to_string(),
                properties: buddy.child("properties").map(PropertySet::from_element),
            })
        })
        .collect()
}

pub(crate) fn parse_removed(parent: &Element) -> Vec<String> {
    parent
        .children_named("buddy")
        .filter_map(|buddy| buddy.attr("jid").map(str::to_string))
        .collect()
}

/// Extracts the published property set from a pubsub items reply.
pub(crate) fn parse_pubsub_properties(iq: &Element) -> PropertySet {
    iq.find_path(&["pubsub", "items", "item", "properties"])
        .map(PropertySet::from_element)
        .unwrap_or_default()
}

/// Extracts the properties for `jid` from a directory lookup reply.
pub(crate) fn parse_lookup_properties(iq: &Element, jid: &str) -> PropertySet {
    iq.child("query")
        .into_iter()
        .flat_map(|query| query.children_named("buddy"))
        .find(|buddy| {
            buddy
                .attr("jid")
                .and_then(normalize_jid)
                .is_some_and(|j| j == jid)
        })
        .and_then(|buddy| buddy.child("properties"))
        .map(PropertySet::from_element)
        .unwrap_or_default()
}
