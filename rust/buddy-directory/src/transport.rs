use crate::error::{GadgetError, Result};
use crate::stanza::Element;
use tokio::sync::mpsc;

/// Outbound half of the presence stream.
///
/// `send` must hand the stanza off without waiting on the network.
pub trait StanzaSink: Send + Sync {
    fn send(&self, stanza: Element) -> Result<()>;
}

/// Sink backed by a bounded channel; the host drains the receiver into the
/// real stream.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Element>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Element>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl StanzaSink for ChannelSink {
    fn send(&self, stanza: Element) -> Result<()> {
        self.tx.try_send(stanza).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                GadgetError::Transport("outbound queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                GadgetError::Transport("stream closed".to_string())
            }
        })
    }
}
