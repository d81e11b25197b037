//! Wire model for the remote debugging command protocol.
//!
//! Two peers exchange [`Command`]s over a single byte stream. Every command is
//! a fixed-size [`CommandHeader`] followed by `data_size` bytes of payload:
//!
//! ```text
//! +-----------+----------+--------------+-------------+-------------------+
//! | type: u32 | ctx: i32 | command: u32 | size: u32   | payload (size)    |
//! +-----------+----------+--------------+-------------+-------------------+
//! ```
//!
//! All integers are little-endian. The payload is opaque at this layer; the
//! [`payload`] module holds the typed bodies the engine puts in it.
//!
//! # Scope
//!
//! This crate only handles the wire format:
//! - [`CommandHeader`] encoding and decoding
//! - [`CommandCodec`], a `tokio_util` codec producing whole commands
//! - typed payload bodies
//!
//! Connection handling, correlation of replies and the session handshake live
//! in the `engine` crate.

mod codec;
mod command;
mod error;
mod header;
pub mod payload;

pub mod testing;

pub use codec::CommandCodec;
pub use command::{Command, CommandType};
pub use error::CodecError;
pub use header::{CTX_UNASSIGNED, CommandHeader, HEADER_SIZE};

/// The port the context role listens on when none is given
pub const DEFAULT_PORT: u16 = 51123;
