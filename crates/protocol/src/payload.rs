//! Typed payload bodies.
//!
//! Payloads travel as JSON. Which body goes with which [`CommandType`] is
//! fixed:
//!
//! | Command type | Body |
//! |---|---|
//! | `changed-state` | [`ChangedState`] |
//! | `update-source` | [`UpdateSource`] |
//! | `added-source` | [`Source`] |
//! | `save-source` | [`SaveSource`] |
//! | `set-update-count` | [`SetUpdateCount`] |
//! | `set-breakpoint`, `remove-breakpoint` | [`Breakpoint`] |
//! | `changed-breakpoint-list` | `Vec<Breakpoint>` |
//! | `output-log` | [`OutputLog`] |
//! | `eval` | [`Eval`] |
//! | `request-fields-varlist` | [`Variable`] |
//! | `request-local-varlist`, `request-environ-varlist` | [`StackFrame`] |
//! | `request-eval-varlist` | [`EvalVarList`] |
//! | `value-string` | `String` |
//! | `value-varlist` | `Vec<Variable>` |
//! | `value-backtrace-list` | `Vec<BacktraceEntry>` |
//!
//! Every other command type carries an empty payload.
//!
//! [`CommandType`]: crate::CommandType

use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::CodecError;

/// Serialize a body into payload bytes.
pub fn encode<T: Serialize + ?Sized>(body: &T) -> Result<Bytes, CodecError> {
    serde_json::to_vec(body)
        .map(Bytes::from)
        .map_err(CodecError::PayloadEncode)
}

/// Deserialize payload bytes into a body.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(payload).map_err(CodecError::PayloadDecode)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedState {
    pub is_break: bool,
}

/// Ask the front-end to show `line` of the source identified by `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSource {
    pub key: String,
    pub line: i32,
    pub update_count: i32,
}

/// A source file known to the debuggee.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    /// Identifies the source in every other command.
    pub key: String,
    pub title: String,
    pub path: Option<PathBuf>,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveSource {
    pub key: String,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetUpdateCount {
    pub update_count: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    /// Key of the source the breakpoint lives in.
    pub key: String,
    pub line: i32,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Message,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLog {
    pub log_type: LogType,
    pub text: String,
    /// Source the message refers to, if any.
    pub key: Option<String>,
    pub line: i32,
}

/// A frame on the debuggee's call stack; level 0 is the innermost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub level: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eval {
    pub expression: String,
    pub frame: StackFrame,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalVarList {
    pub expressions: Vec<String>,
    pub frame: StackFrame,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: String,
    pub value_type: String,
    /// Whether fields can be requested with `request-fields-varlist`.
    pub has_fields: bool,
    pub frame: Option<StackFrame>,
    /// Names leading from the root variable to this one.
    #[serde(default)]
    pub path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacktraceEntry {
    pub function: String,
    pub key: String,
    pub line: i32,
    pub frame: StackFrame,
}
