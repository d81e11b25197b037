use std::fmt;

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::CodecError;
use crate::header::CommandHeader;
use crate::payload;

/// The semantic kind of a command.
///
/// The discriminants are the wire identifiers and must match on both peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandType {
    StartConnection = 1,
    EndConnection = 2,
    Succeeded = 3,
    Failed = 4,
    ChangedState = 5,
    UpdateSource = 6,
    ForceUpdateSource = 7,
    AddedSource = 8,
    SaveSource = 9,
    SetUpdateCount = 10,
    SetBreakpoint = 11,
    RemoveBreakpoint = 12,
    ChangedBreakpointList = 13,
    Break = 14,
    Resume = 15,
    StepInto = 16,
    StepOver = 17,
    StepReturn = 18,
    OutputLog = 19,
    Eval = 20,
    RequestFieldsVarList = 21,
    RequestLocalVarList = 22,
    RequestEnvironVarList = 23,
    RequestEvalVarList = 24,
    RequestGlobalVarList = 25,
    RequestRegistryVarList = 26,
    RequestStackList = 27,
    ValueString = 28,
    ValueVarList = 29,
    ValueBacktraceList = 30,
}

impl CommandType {
    /// Every command type, in wire order.
    pub const ALL: [CommandType; 30] = [
        CommandType::StartConnection,
        CommandType::EndConnection,
        CommandType::Succeeded,
        CommandType::Failed,
        CommandType::ChangedState,
        CommandType::UpdateSource,
        CommandType::ForceUpdateSource,
        CommandType::AddedSource,
        CommandType::SaveSource,
        CommandType::SetUpdateCount,
        CommandType::SetBreakpoint,
        CommandType::RemoveBreakpoint,
        CommandType::ChangedBreakpointList,
        CommandType::Break,
        CommandType::Resume,
        CommandType::StepInto,
        CommandType::StepOver,
        CommandType::StepReturn,
        CommandType::OutputLog,
        CommandType::Eval,
        CommandType::RequestFieldsVarList,
        CommandType::RequestLocalVarList,
        CommandType::RequestEnvironVarList,
        CommandType::RequestEvalVarList,
        CommandType::RequestGlobalVarList,
        CommandType::RequestRegistryVarList,
        CommandType::RequestStackList,
        CommandType::ValueString,
        CommandType::ValueVarList,
        CommandType::ValueBacktraceList,
    ];

    /// Start and end of a connection.
    ///
    /// These are the only commands allowed to carry an unassigned context id.
    pub fn is_lifecycle(self) -> bool {
        matches!(self, CommandType::StartConnection | CommandType::EndConnection)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandType::StartConnection => "start-connection",
            CommandType::EndConnection => "end-connection",
            CommandType::Succeeded => "succeeded",
            CommandType::Failed => "failed",
            CommandType::ChangedState => "changed-state",
            CommandType::UpdateSource => "update-source",
            CommandType::ForceUpdateSource => "force-update-source",
            CommandType::AddedSource => "added-source",
            CommandType::SaveSource => "save-source",
            CommandType::SetUpdateCount => "set-update-count",
            CommandType::SetBreakpoint => "set-breakpoint",
            CommandType::RemoveBreakpoint => "remove-breakpoint",
            CommandType::ChangedBreakpointList => "changed-breakpoint-list",
            CommandType::Break => "break",
            CommandType::Resume => "resume",
            CommandType::StepInto => "step-into",
            CommandType::StepOver => "step-over",
            CommandType::StepReturn => "step-return",
            CommandType::OutputLog => "output-log",
            CommandType::Eval => "eval",
            CommandType::RequestFieldsVarList => "request-fields-varlist",
            CommandType::RequestLocalVarList => "request-local-varlist",
            CommandType::RequestEnvironVarList => "request-environ-varlist",
            CommandType::RequestEvalVarList => "request-eval-varlist",
            CommandType::RequestGlobalVarList => "request-global-varlist",
            CommandType::RequestRegistryVarList => "request-registry-varlist",
            CommandType::RequestStackList => "request-stack-list",
            CommandType::ValueString => "value-string",
            CommandType::ValueVarList => "value-varlist",
            CommandType::ValueBacktraceList => "value-backtrace-list",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u32> for CommandType {
    type Error = CodecError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        // discriminants are contiguous from 1
        value
            .checked_sub(1)
            .and_then(|index| CommandType::ALL.get(index as usize))
            .copied()
            .ok_or(CodecError::UnknownCommandType(value))
    }
}

impl From<CommandType> for u32 {
    fn from(value: CommandType) -> Self {
        value as u32
    }
}

/// A single unit of exchange: a header and the payload it describes.
///
/// The header's `data_size` is always derived from the payload, so a
/// `Command` can never disagree with itself about its length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    header: CommandHeader,
    payload: Bytes,
}

impl Command {
    /// Fails with [`CodecError::PayloadTooLarge`] if the payload length does
    /// not fit the header's 32-bit size field.
    pub fn new(
        command_type: CommandType,
        ctx_id: i32,
        command_id: u32,
        payload: Bytes,
    ) -> Result<Self, CodecError> {
        let header = CommandHeader {
            command_type,
            ctx_id,
            command_id,
            data_size: wire_size(payload.len())?,
        };
        Ok(Self { header, payload })
    }

    /// A command that is all header.
    pub fn empty(command_type: CommandType, ctx_id: i32, command_id: u32) -> Self {
        let header = CommandHeader {
            command_type,
            ctx_id,
            command_id,
            data_size: 0,
        };
        Self {
            header,
            payload: Bytes::new(),
        }
    }

    /// Build a command whose payload is the JSON form of `body`.
    pub fn with_body<T: Serialize>(
        command_type: CommandType,
        ctx_id: i32,
        command_id: u32,
        body: &T,
    ) -> Result<Self, CodecError> {
        let payload = payload::encode(body)?;
        Self::new(command_type, ctx_id, command_id, payload)
    }

    /// Reassemble a command read off the wire.
    ///
    /// The codec only calls this once exactly `header.data_size` bytes have
    /// been read.
    pub(crate) fn from_wire(header: CommandHeader, payload: Bytes) -> Self {
        debug_assert_eq!(header.data_size as usize, payload.len());
        Self { header, payload }
    }

    pub fn header(&self) -> &CommandHeader {
        &self.header
    }

    pub fn command_type(&self) -> CommandType {
        self.header.command_type
    }

    pub fn ctx_id(&self) -> i32 {
        self.header.ctx_id
    }

    pub fn command_id(&self) -> u32 {
        self.header.command_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Decode the payload as a typed body.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        payload::decode(&self.payload)
    }
}

fn wire_size(len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::PayloadTooLarge {
        size: len,
        max: u32::MAX as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_type_round_trips_through_its_identifier() {
        for command_type in CommandType::ALL {
            let raw: u32 = command_type.into();
            assert_eq!(CommandType::try_from(raw).unwrap(), command_type);
        }
    }

    #[test]
    fn unknown_identifiers_are_rejected() {
        assert!(matches!(
            CommandType::try_from(0),
            Err(CodecError::UnknownCommandType(0))
        ));
        assert!(matches!(
            CommandType::try_from(31),
            Err(CodecError::UnknownCommandType(31))
        ));
    }

    #[test]
    fn data_size_follows_payload() {
        let command = Command::new(
            CommandType::ValueString,
            3,
            9,
            Bytes::from_static(b"\"hello\""),
        )
        .unwrap();
        assert_eq!(command.header().data_size, 7);

        let empty = Command::empty(CommandType::Resume, 3, 11);
        assert_eq!(empty.header().data_size, 0);
        assert!(empty.payload().is_empty());
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn payload_length_must_fit_the_size_field() {
        assert_eq!(wire_size(u32::MAX as usize).unwrap(), u32::MAX);
        assert!(matches!(
            wire_size(u32::MAX as usize + 1),
            Err(CodecError::PayloadTooLarge { size, max })
                if size == u32::MAX as usize + 1 && max == u32::MAX as usize
        ));
    }

    #[test]
    fn only_connection_commands_are_lifecycle() {
        let lifecycle: Vec<_> = CommandType::ALL
            .into_iter()
            .filter(|t| t.is_lifecycle())
            .collect();
        assert_eq!(
            lifecycle,
            vec![CommandType::StartConnection, CommandType::EndConnection]
        );
    }
}
