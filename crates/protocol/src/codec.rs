//! Command codec implementation using tokio-util.
//!
//! This module provides [`CommandCodec`], which implements both the `Encoder`
//! and `Decoder` traits from tokio-util for [`Command`]s.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::command::Command;
use crate::error::CodecError;
use crate::header::{CommandHeader, HEADER_SIZE};

/// Default maximum payload size (16 MB).
pub(crate) const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    Header,
    Payload(CommandHeader),
}

/// Codec for encoding and decoding commands.
///
/// Decoding is a two step state machine: a whole header is read first, then
/// exactly `data_size` payload bytes. A zero-size payload completes the
/// command straight after the header.
///
/// # Example
///
/// ```ignore
/// use tokio_util::codec::FramedRead;
/// use protocol::CommandCodec;
///
/// let framed = FramedRead::new(reader, CommandCodec::new());
/// ```
#[derive(Debug, Clone)]
pub struct CommandCodec {
    max_payload_size: usize,
    state: DecodeState,
}

impl CommandCodec {
    /// Create a new codec with default settings.
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new codec with a custom maximum payload size.
    ///
    /// Payloads larger than this are rejected with [`CodecError::PayloadTooLarge`].
    pub fn with_max_size(max_payload_size: usize) -> Self {
        Self {
            max_payload_size,
            state: DecodeState::Header,
        }
    }

    fn check_size(&self, size: usize) -> Result<(), CodecError> {
        if size > self.max_payload_size {
            return Err(CodecError::PayloadTooLarge {
                size,
                max: self.max_payload_size,
            });
        }
        Ok(())
    }
}

impl Default for CommandCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for CommandCodec {
    type Item = Command;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.state {
            DecodeState::Header => {
                if src.len() < HEADER_SIZE {
                    src.reserve(HEADER_SIZE - src.len());
                    return Ok(None);
                }

                let header = CommandHeader::decode(&src[..HEADER_SIZE])?;
                if !header.has_context() && !header.command_type.is_lifecycle() {
                    return Err(CodecError::UnassignedContext {
                        command_type: header.command_type,
                        ctx_id: header.ctx_id,
                    });
                }
                self.check_size(header.data_size as usize)?;

                src.advance(HEADER_SIZE);
                self.state = DecodeState::Payload(header);
                header
            }
            DecodeState::Payload(header) => header,
        };

        let size = header.data_size as usize;
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        let payload = src.split_to(size).freeze();
        self.state = DecodeState::Header;

        tracing::trace!(
            command_type = %header.command_type,
            ctx_id = header.ctx_id,
            command_id = header.command_id,
            data_size = header.data_size,
            "decoded command"
        );
        Ok(Some(Command::from_wire(header, payload)))
    }
}

impl Encoder<Command> for CommandCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.check_size(item.payload().len())?;

        dst.reserve(HEADER_SIZE + item.payload().len());
        item.header().encode(dst);
        dst.put_slice(item.payload());

        Ok(())
    }
}
