//! Error types for the wire layer.

use std::io;

use crate::CommandType;

/// Errors that can occur while framing or interpreting commands.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// An I/O error occurred while reading or writing.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The header carried a command type this build does not know.
    #[error("unknown command type {0}")]
    UnknownCommandType(u32),

    /// Fewer bytes than a whole header were supplied.
    #[error("truncated header: got {len} bytes")]
    TruncatedHeader {
        /// Number of bytes available.
        len: usize,
    },

    /// A non-lifecycle command arrived without an assigned session id.
    #[error("{command_type} received with unassigned context id {ctx_id}")]
    UnassignedContext {
        /// The offending command type.
        command_type: CommandType,
        /// The context id carried in the header.
        ctx_id: i32,
    },

    /// The payload exceeds the configured maximum size.
    #[error("payload size {size} exceeds maximum allowed {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: usize,
        /// The maximum allowed size.
        max: usize,
    },

    /// Failed to serialize a typed payload.
    #[error("payload serialization failed: {0}")]
    PayloadEncode(#[source] serde_json::Error),

    /// Failed to deserialize a typed payload.
    #[error("payload deserialization failed: {0}")]
    PayloadDecode(#[source] serde_json::Error),
}
