//! Directory session: addressing, request correlation and inbound demux.

use crate::error::{GadgetError, Result};
use crate::handles::normalize_jid;
use crate::property::PropertySet;
use crate::protocol::{self, Inbound, IqType, ViewId, ViewQuery};
use crate::stanza::{Element, NS_OLPC_BUDDY};
use crate::transport::StanzaSink;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// What an outstanding iq is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outstanding {
    View(ViewId),
    Properties(String),
    Lookup(String),
    Publish,
}

pub struct DirectorySession {
    directory: Option<String>,
    sink: Arc<dyn StanzaSink>,
    outstanding: HashMap<String, Outstanding>,
    next_iq: u64,
}

impl DirectorySession {
    pub fn new(sink: Arc<dyn StanzaSink>) -> Self {
        Self {
            directory: None,
            sink,
            outstanding: HashMap::new(),
            next_iq: 1,
        }
    }

    /// Sets the directory address found by service discovery.
    ///
    /// `None`, or an address that does not parse, leaves the session without
    /// a directory.
    pub fn set_directory(&mut self, jid: Option<&str>) {
        self.directory = jid.and_then(normalize_jid);
        match &self.directory {
            Some(dir) => debug!(directory = %dir, "directory service resolved"),
            None => debug!("directory service cleared"),
        }
    }

    pub fn directory(&self) -> Option<&str> {
        self.directory.as_deref()
    }

    fn require_directory(&self) -> Result<String> {
        self.directory.clone().ok_or(GadgetError::ServiceUnavailable)
    }

    fn next_iq_id(&mut self) -> String {
        let id = format!("gadget-{}", self.next_iq);
        self.next_iq += 1;
        id
    }

    fn send_iq(&mut self, iq_id: String, stanza: Element, waiting: Outstanding) -> Result<()> {
        self.sink.send(stanza)?;
        self.outstanding.insert(iq_id, waiting);
        Ok(())
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn send_view_request(&mut self, view_id: ViewId, query: &ViewQuery) -> Result<()> {
        let directory = self.require_directory()?;
        let iq_id = self.next_iq_id();
        let stanza = protocol::view_request(&iq_id, &directory, view_id, query);
        self.send_iq(iq_id, stanza, Outstanding::View(view_id))
    }

    pub fn send_close(&mut self, view_id: ViewId) -> Result<()> {
        let directory = self.require_directory()?;
        self.sink.send(protocol::close_request(&directory, view_id))
    }

    pub fn send_properties_query(&mut self, jid: &str) -> Result<()> {
        let iq_id = self.next_iq_id();
        let stanza = protocol::properties_request(&iq_id, jid);
        self.send_iq(iq_id, stanza, Outstanding::Properties(jid.to_string()))
    }

    pub fn send_lookup(&mut self, jid: &str) -> Result<()> {
        let directory = self.require_directory()?;
        let iq_id = self.next_iq_id();
        let stanza = protocol::lookup_request(&iq_id, &directory, jid);
        self.send_iq(iq_id, stanza, Outstanding::Lookup(jid.to_string()))
    }

    pub fn send_publish(&mut self, properties: &PropertySet) -> Result<()> {
        let iq_id = self.next_iq_id();
        let stanza = protocol::publish_request(&iq_id, properties);
        self.send_iq(iq_id, stanza, Outstanding::Publish)
    }

    /// Forgets the iqs of an abandoned property fetch.
    pub fn forget_fetch(&mut self, jid: &str) {
        self.outstanding.retain(|_, waiting| match waiting {
            Outstanding::Properties(j) | Outstanding::Lookup(j) => j != jid,
            _ => true,
        });
    }

    pub fn reset(&mut self) {
        self.outstanding.clear();
    }

    fn from_directory(&self, stanza: &Element) -> bool {
        match (&self.directory, stanza.attr("from").and_then(normalize_jid)) {
            (Some(dir), Some(from)) => *dir == from,
            _ => false,
        }
    }

    /// Classifies one inbound stanza.
    ///
    /// Returns `None` for anything that is not directory traffic, is not
    /// correlated with a request of ours, or is malformed.
    pub fn demux(&mut self, stanza: &Element) -> Option<Inbound> {
        match stanza.name.as_str() {
            "iq" => self.demux_iq(stanza),
            "message" => self.demux_message(stanza),
            _ => None,
        }
    }

    fn demux_iq(&mut self, stanza: &Element) -> Option<Inbound> {
        let kind = stanza.attr("type").and_then(IqType::parse)?;
        if !matches!(kind, IqType::Result | IqType::Error) {
            return None;
        }
        let iq_id = stanza.attr("id")?;
        let waiting = self.outstanding.get(iq_id)?.clone();

        let expected_from = match &waiting {
            Outstanding::View(_) | Outstanding::Lookup(_) => self.directory.clone(),
            Outstanding::Properties(jid) => normalize_jid(jid),
            Outstanding::Publish => None,
        };
        if let (Some(expected), Some(from)) = (expected_from, stanza.attr("from")) {
            if normalize_jid(from).as_deref() != Some(expected.as_str()) {
                warn!(iq_id, from, expected = %expected, "ignoring reply from unexpected sender");
                return None;
            }
        }
        self.outstanding.remove(iq_id);

        let ok = kind == IqType::Result;
        Some(match waiting {
            Outstanding::View(view_id) if ok => {
                let buddies = stanza
                    .child("view")
                    .map(protocol::parse_buddies)
                    .unwrap_or_default();
                Inbound::ViewReply { view_id, buddies }
            }
            Outstanding::View(view_id) => Inbound::ViewError { view_id },
            Outstanding::Properties(jid) if ok => Inbound::PropertiesReply {
                properties: protocol::parse_pubsub_properties(stanza),
                jid,
            },
            Outstanding::Properties(jid) => Inbound::PropertiesError { jid },
            Outstanding::Lookup(jid) if ok => Inbound::LookupReply {
                properties: normalize_jid(&jid)
                    .map(|bare| protocol::parse_lookup_properties(stanza, &bare))
                    .unwrap_or_default(),
                jid,
            },
            Outstanding::Lookup(jid) => Inbound::LookupError { jid },
            Outstanding::Publish => {
                if !ok {
                    warn!(iq_id, "publishing own properties failed");
                }
                return None;
            }
        })
    }

    fn demux_message(&self, stanza: &Element) -> Option<Inbound> {
        let payload = stanza
            .children
            .iter()
            .find(|c| c.ns.as_deref() == Some(NS_OLPC_BUDDY))?;

        if !self.from_directory(stanza) {
            debug!(from = ?stanza.attr("from"), "ignoring buddy notification not sent by the directory");
            return None;
        }

        match payload.name.as_str() {
            "added" => {
                let view_id = protocol::parse_view_id(payload)?;
                Some(Inbound::Added {
                    view_id,
                    buddies: protocol::parse_buddies(payload),
                })
            }
            "removed" => {
                let view_id = protocol::parse_view_id(payload)?;
                Some(Inbound::Removed {
                    view_id,
                    jids: protocol::parse_removed(payload),
                })
            }
            "change" => {
                let jid = payload.attr("jid")?.to_string();
                let properties = payload.child("properties")?;
                Some(Inbound::Change {
                    jid,
                    properties: PropertySet::from_element(properties),
                })
            }
            other => {
                debug!(element = other, "ignoring unknown directory notification");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::{NS_AMP, NS_OLPC_BUDDY_PROPS};
    use crate::transport::ChannelSink;
    use tokio::sync::mpsc;

    fn session() -> (DirectorySession, mpsc::Receiver<Element>) {
        let (sink, rx) = ChannelSink::new(16);
        let mut session = DirectorySession::new(Arc::new(sink));
        session.set_directory(Some("gadget.localhost"));
        (session, rx)
    }

    fn result_for(request: &Element, from: &str) -> Element {
        Element::new("iq")
            .with_attr("type", "result")
            .with_attr("id", request.attr("id").unwrap())
            .with_attr("from", from)
    }

    fn notice(payload: Element) -> Element {
        Element::new("message")
            .with_attr("from", "gadget.localhost")
            .with_attr("to", "alice@localhost")
            .with_attr("type", "notice")
            .with_child(payload)
            .with_child(Element::new("amp").with_ns(NS_AMP))
    }

    fn buddy(jid: &str, color: &str) -> Element {
        Element::new("buddy")
            .with_attr("jid", jid)
            .with_child(PropertySet::new().with("color", color).to_element())
    }

    #[test]
    fn test_no_directory_is_unavailable() {
        let (sink, _rx) = ChannelSink::new(4);
        let mut session = DirectorySession::new(Arc::new(sink));
        assert_eq!(
            session.send_view_request(0, &ViewQuery::RandomSample { max: 3 }),
            Err(GadgetError::ServiceUnavailable)
        );
        assert_eq!(session.send_close(0), Err(GadgetError::ServiceUnavailable));
        assert_eq!(session.outstanding_len(), 0);
    }

    #[test]
    fn test_view_reply_correlated_by_iq() {
        let (mut session, mut rx) = session();
        session
            .send_view_request(0, &ViewQuery::RandomSample { max: 3 })
            .unwrap();
        let request = rx.try_recv().unwrap();

        let reply = result_for(&request, "gadget.localhost").with_child(
            Element::new("view")
                .with_ns(NS_OLPC_BUDDY)
                .with_attr("id", "0")
                .with_child(buddy("charles@localhost", "#AAAAAA,#BBBBBB"))
                .with_child(buddy("bob@localhost", "#005FE4,#00A0FF")),
        );

        match session.demux(&reply) {
            Some(Inbound::ViewReply { view_id, buddies }) => {
                assert_eq!(view_id, 0);
                assert_eq!(buddies.len(), 2);
                assert_eq!(buddies[0].jid, "charles@localhost");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(session.outstanding_len(), 0);
        // duplicate reply is not correlated anymore
        assert!(session.demux(&reply).is_none());
    }

    #[test]
    fn test_reply_from_wrong_sender_is_ignored() {
        let (mut session, mut rx) = session();
        session
            .send_view_request(0, &ViewQuery::RandomSample { max: 1 })
            .unwrap();
        let request = rx.try_recv().unwrap();

        assert!(session.demux(&result_for(&request, "mallory@localhost")).is_none());
        assert_eq!(session.outstanding_len(), 1);
    }

    #[test]
    fn test_properties_error() {
        let (mut session, mut rx) = session();
        session.send_properties_query("bob@localhost").unwrap();
        let request = rx.try_recv().unwrap();
        assert_eq!(request.attr("to"), Some("bob@localhost"));

        let error = Element::new("iq")
            .with_attr("type", "error")
            .with_attr("id", request.attr("id").unwrap())
            .with_attr("from", "bob@localhost");
        assert_eq!(
            session.demux(&error),
            Some(Inbound::PropertiesError {
                jid: "bob@localhost".to_string()
            })
        );
    }

    #[test]
    fn test_properties_reply() {
        let (mut session, mut rx) = session();
        session.send_properties_query("bob@localhost").unwrap();
        let request = rx.try_recv().unwrap();
        let props = PropertySet::new().with("color", "#1");

        let reply = result_for(&request, "bob@localhost").with_child(
            Element::new("pubsub").with_child(
                Element::new("items")
                    .with_attr("node", NS_OLPC_BUDDY_PROPS)
                    .with_child(Element::new("item").with_child(props.to_element())),
            ),
        );
        assert_eq!(
            session.demux(&reply),
            Some(Inbound::PropertiesReply {
                jid: "bob@localhost".to_string(),
                properties: props,
            })
        );
    }

    #[test]
    fn test_forget_fetch() {
        let (mut session, _rx) = session();
        session.send_properties_query("bob@localhost").unwrap();
        session.send_lookup("bob@localhost").unwrap();
        session.send_properties_query("charles@localhost").unwrap();

        session.forget_fetch("bob@localhost");
        assert_eq!(session.outstanding_len(), 1);
    }

    #[test]
    fn test_notifications() {
        let (mut session, _rx) = session();

        let added = notice(
            Element::new("added")
                .with_ns(NS_OLPC_BUDDY)
                .with_attr("id", "0")
                .with_child(buddy("oscar@localhost", "#000000,#AAAAAA")),
        );
        match session.demux(&added) {
            Some(Inbound::Added { view_id: 0, buddies }) => {
                assert_eq!(buddies[0].jid, "oscar@localhost")
            }
            other => panic!("unexpected {:?}", other),
        }

        let removed = notice(
            Element::new("removed")
                .with_ns(NS_OLPC_BUDDY)
                .with_attr("id", "0")
                .with_child(Element::new("buddy").with_attr("jid", "bob@localhost")),
        );
        assert_eq!(
            session.demux(&removed),
            Some(Inbound::Removed {
                view_id: 0,
                jids: vec!["bob@localhost".to_string()],
            })
        );

        let change = notice(
            Element::new("change")
                .with_ns(NS_OLPC_BUDDY)
                .with_attr("jid", "bob@localhost")
                .with_attr("id", "0")
                .with_child(PropertySet::new().with("color", "#FFFFFF,#AAAAAA").to_element()),
        );
        assert_eq!(
            session.demux(&change),
            Some(Inbound::Change {
                jid: "bob@localhost".to_string(),
                properties: PropertySet::new().with("color", "#FFFFFF,#AAAAAA"),
            })
        );
    }

    #[test]
    fn test_malformed_notifications_are_ignored() {
        let (mut session, _rx) = session();

        let no_id = notice(Element::new("added").with_ns(NS_OLPC_BUDDY));
        assert!(session.demux(&no_id).is_none());

        let bad_id = notice(Element::new("removed").with_ns(NS_OLPC_BUDDY).with_attr("id", "x"));
        assert!(session.demux(&bad_id).is_none());

        let unknown = notice(Element::new("shuffle").with_ns(NS_OLPC_BUDDY));
        assert!(session.demux(&unknown).is_none());

        let mut spoofed = notice(Element::new("added").with_ns(NS_OLPC_BUDDY).with_attr("id", "0"));
        spoofed.set_attr("from", "mallory@localhost");
        assert!(session.demux(&spoofed).is_none());

        assert!(session.demux(&Element::new("presence")).is_none());
    }
}
