use rdebug_core::{FrameError, SessionStatus};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("relay channel closed")]
    Closed,
    #[error("relay ack timed out")]
    Timeout,
    #[error("relay rejected request: {code}: {message}")]
    Rejected { code: String, message: String },
    #[error("relay connect failed: {0}")]
    Connect(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session not ready (status {0:?})")]
    NotReady(SessionStatus),
    #[error("engine transport closed")]
    TransportClosed,
    #[error("command got no response")]
    NoResponse,
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("client already connected")]
    AlreadyConnected,
    #[error("invalid client options: {0}")]
    Config(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("engine at {host}:{port} did not produce a session in time")]
    AttachTimeout { host: String, port: u16 },
    #[error(transparent)]
    Client(#[from] ClientError),
}
