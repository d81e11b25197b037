use std::{io, time::Duration};

use protocol::{CodecError, CommandType};

/// Errors surfaced by the engine.
///
/// Only establishment failures are returned synchronously from the start
/// calls. Once connected, I/O failures close the connection instead and show
/// up as [`EngineError::ConnectionClosed`] on outstanding requests.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("binding port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("resolving {host}:{service}: {source}")]
    Resolve {
        host: String,
        service: String,
        #[source]
        source: io::Error,
    },

    #[error("service {0:?} is not a port number")]
    InvalidService(String),

    #[error("{host} resolved to no endpoints")]
    NoEndpoints { host: String },

    #[error("no connection within {0:?}")]
    ConnectTimeout(Duration),

    #[error("no session id negotiated within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("session id {0} is negative")]
    InvalidContextId(i32),

    #[error("engine is already started")]
    AlreadyStarted,

    #[error("not connected")]
    NotConnected,

    #[error("{0} requires an assigned session id")]
    ContextUnassigned(CommandType),

    /// The connection closed before a reply arrived.
    #[error("connection closed before a reply arrived")]
    ConnectionClosed,

    #[error("peer reported failure for command {command_id}")]
    RequestFailed { command_id: u32 },

    #[error("expected {expected} reply, received {received}")]
    UnexpectedReply {
        expected: CommandType,
        received: CommandType,
    },

    #[error("starting worker runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("loading configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}
