//! Testing utilities for the wire layer.

use bytes::BytesMut;
use tokio_util::codec::Encoder;

use crate::{Command, CommandCodec};

/// Encode a command exactly as it appears on the wire.
///
/// # Example
///
/// ```
/// use protocol::{Command, CommandType, HEADER_SIZE, testing::frame_command};
///
/// let bytes = frame_command(&Command::empty(CommandType::Break, 1, 3));
/// assert_eq!(bytes.len(), HEADER_SIZE);
/// ```
pub fn frame_command(command: &Command) -> Vec<u8> {
    let mut buf = BytesMut::new();
    CommandCodec::new()
        .encode(command.clone(), &mut buf)
        .expect("failed to encode command");
    buf.to_vec()
}

/// Encode several commands back to back.
pub fn frame_commands(commands: &[Command]) -> Vec<u8> {
    commands.iter().flat_map(frame_command).collect()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    use super::*;
    use crate::CommandType;

    #[tokio::test]
    async fn framed_commands_read_back_in_order() {
        let commands = vec![
            Command::empty(CommandType::Break, 1, 1),
            Command::new(CommandType::ValueString, 1, 3, Bytes::from_static(b"\"a\""))
                .unwrap(),
            Command::empty(CommandType::Resume, 1, 5),
        ];
        let bytes = frame_commands(&commands);

        let mut reader = FramedRead::new(&bytes[..], CommandCodec::new());
        for expected in &commands {
            let command = reader.next().await.unwrap().unwrap();
            assert_eq!(&command, expected);
        }
        assert!(reader.next().await.is_none());
    }
}
