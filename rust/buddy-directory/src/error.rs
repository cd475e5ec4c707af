use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GadgetError {
    #[error("Gadget directory service unavailable")]
    ServiceUnavailable,

    #[error("Unknown view: {0}")]
    UnknownView(u32),

    #[error("View {0} is closed")]
    ViewClosed(u32),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Unknown contact: {0}")]
    UnknownContact(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Timed out waiting for directory")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, GadgetError>;
