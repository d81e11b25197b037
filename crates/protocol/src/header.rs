use bytes::{Buf, BufMut};

use crate::command::CommandType;
use crate::error::CodecError;

/// Size in bytes of an encoded [`CommandHeader`].
pub const HEADER_SIZE: usize = 16;

/// Context id of a session whose id has not been negotiated yet.
pub const CTX_UNASSIGNED: i32 = -1;

/// Fixed-layout header preceding every payload on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub command_type: CommandType,
    /// Session id; negative while unassigned.
    pub ctx_id: i32,
    /// Correlates a request with its reply.
    pub command_id: u32,
    /// Length of the payload that follows.
    pub data_size: u32,
}

impl CommandHeader {
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32_le(self.command_type.into());
        dst.put_i32_le(self.ctx_id);
        dst.put_u32_le(self.command_id);
        dst.put_u32_le(self.data_size);
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode(&mut &mut buf[..]);
        buf
    }

    /// Decode a header from the first [`HEADER_SIZE`] bytes of `src`.
    pub fn decode(mut src: &[u8]) -> Result<Self, CodecError> {
        if src.len() < HEADER_SIZE {
            return Err(CodecError::TruncatedHeader { len: src.len() });
        }

        let command_type = CommandType::try_from(src.get_u32_le())?;
        Ok(Self {
            command_type,
            ctx_id: src.get_i32_le(),
            command_id: src.get_u32_le(),
            data_size: src.get_u32_le(),
        })
    }

    pub fn has_context(&self) -> bool {
        self.ctx_id >= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = CommandHeader {
            command_type: CommandType::RequestLocalVarList,
            ctx_id: 7,
            command_id: 41,
            data_size: 1024,
        };

        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(CommandHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn header_layout_is_little_endian() {
        let header = CommandHeader {
            command_type: CommandType::Break,
            ctx_id: CTX_UNASSIGNED,
            command_id: 2,
            data_size: 0,
        };

        assert_eq!(
            header.to_bytes(),
            [14, 0, 0, 0, 0xff, 0xff, 0xff, 0xff, 2, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn short_input_is_rejected() {
        let result = CommandHeader::decode(&[1, 0, 0, 0, 0]);
        assert!(matches!(result, Err(CodecError::TruncatedHeader { len: 5 })));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0] = 99;
        assert!(matches!(
            CommandHeader::decode(&bytes),
            Err(CodecError::UnknownCommandType(99))
        ));
    }
}
