//! Error taxonomy for the protocol and the node.
//!
//! `Error` is the wire-level error carried inside replies. Everything a
//! client can be told about a failed command goes through one of the
//! constructors below, so error codes stay stable across handlers.

use serde::{Deserialize, Serialize};

/// Protocol error delivered to clients inside a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct Error {
    pub code: u32,
    pub message: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub temporary: bool,
}

impl Error {
    fn new(code: u32, message: &str) -> Self {
        Error {
            code,
            message: message.to_string(),
            temporary: false,
        }
    }

    /// Something went wrong on the server while processing a command.
    pub fn internal() -> Self {
        let mut err = Error::new(100, "internal server error");
        err.temporary = true;
        err
    }

    pub fn unauthorized() -> Self {
        Error::new(101, "unauthorized")
    }

    pub fn unknown_channel() -> Self {
        Error::new(102, "unknown channel")
    }

    pub fn permission_denied() -> Self {
        Error::new(103, "permission denied")
    }

    pub fn method_not_found() -> Self {
        Error::new(104, "method not found")
    }

    pub fn already_subscribed() -> Self {
        Error::new(105, "already subscribed")
    }

    pub fn bad_request() -> Self {
        Error::new(107, "bad request")
    }

    /// The operation is not made available by the application handler.
    pub fn not_available() -> Self {
        Error::new(108, "not available")
    }

    pub fn expired() -> Self {
        Error::new(109, "expired")
    }
}

/// Terminal close condition pushed to a session before the transport goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnect {
    pub code: u16,
    pub reason: &'static str,
}

/// Transport closed in an orderly way.
pub const DISCONNECT_NORMAL: Disconnect = Disconnect {
    code: 3000,
    reason: "connection closed",
};

/// Node is shutting down.
pub const DISCONNECT_SHUTDOWN: Disconnect = Disconnect {
    code: 3001,
    reason: "shutting down",
};

/// Session credentials expired and were not refreshed.
pub const DISCONNECT_EXPIRED: Disconnect = Disconnect {
    code: 3005,
    reason: "expired",
};

/// Failure to deliver a frame to a session.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The session is gone. Background producers treat this as
    /// end-of-stream and stop silently.
    #[error("session closed")]
    Closed,
    /// The transport failed while the session is still considered live.
    #[error("transport failure: {0}")]
    Transport(#[from] axum::Error),
}

/// Node lifecycle and publish errors.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("invalid node config: {0}")]
    Config(String),
    #[error("event handler is not set")]
    NoHandler,
    #[error("node is already running")]
    AlreadyRunning,
    #[error("node is not running")]
    NotRunning,
}
