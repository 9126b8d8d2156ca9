//! xtunneld/src/error.rs
//! Crate-wide error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid proxy config: {0}")]
    Config(String),

    #[error("already registered: {0}")]
    AlreadyRegistered(String),

    #[error("no port available")]
    PortUnavailable,

    #[error("control session closed")]
    ControlClosed,

    #[error("timed out waiting for work connection")]
    WorkConnTimeout,

    #[error("timed out peeking connection for vhost routing")]
    PeekTimeout,

    #[error("authentication required")]
    AuthRequired,

    #[error("unknown proxy type: {0}")]
    UnknownType(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
