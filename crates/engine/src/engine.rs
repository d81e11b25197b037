use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use protocol::payload::{
    self, BacktraceEntry, Breakpoint, ChangedState, Eval, EvalVarList, LogType, OutputLog,
    SaveSource, SetUpdateCount, Source, StackFrame, UpdateSource, Variable,
};
use protocol::{Command, CommandType};
use serde::{Serialize, de::DeserializeOwned};

use crate::establish::{Acceptor, Connector, Strategy};
use crate::ids::Role;
use crate::pending::ResponseHandler;
use crate::session::{Correlation, Session, SessionState};
use crate::transport::{self, Dispatch};
use crate::worker::Worker;
use crate::{EngineConfig, EngineError};

/// Map a signed wait in seconds to a start timeout; negative means do not
/// wait at all.
pub fn wait_bound(seconds: i64) -> Option<Duration> {
    u64::try_from(seconds).ok().map(Duration::from_secs)
}

/// One end of a remote debugging session.
///
/// An engine is either the context role, which listens and assigns the
/// session id, or the frame role, which connects out and adopts it. Commands
/// are sent with the typed methods; everything the peer sends is queued for
/// [`Engine::pop_command`], and replies to requests are also handed to the
/// handler given with the request.
///
/// Dropping the engine stops it.
pub struct Engine {
    session: Arc<Session>,
    worker: Mutex<Option<Worker>>,
    config: EngineConfig,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            session: Arc::new(Session::new()),
            worker: Mutex::new(None),
            config,
        }
    }

    /// Listen on `port` and run the handshake as the context role, assigning
    /// `ctx_id` to the session.
    ///
    /// With a `timeout`, returns once the peer has acknowledged the session
    /// id, or fails when the timeout expires. Without one, returns straight
    /// away and the handshake completes in the background.
    pub fn start_as_context(
        &self,
        port: u16,
        ctx_id: i32,
        timeout: Option<Duration>,
    ) -> Result<(), EngineError> {
        if ctx_id < 0 {
            return Err(EngineError::InvalidContextId(ctx_id));
        }
        self.start(
            Role::Context,
            || Acceptor::bind(port).map(Strategy::Acceptor),
            Some(ctx_id),
            timeout,
        )
    }

    /// Connect to `host`:`service` and run the handshake as the frame role.
    ///
    /// `service` must be a port number. Resolution happens in the background
    /// and counts against `timeout`.
    pub fn start_as_frame(
        &self,
        host: &str,
        service: &str,
        timeout: Option<Duration>,
    ) -> Result<(), EngineError> {
        self.start(
            Role::Frame,
            || Connector::new(host, service).map(Strategy::Connector),
            None,
            timeout,
        )
    }

    fn start<F>(
        &self,
        role: Role,
        strategy: F,
        assign: Option<i32>,
        timeout: Option<Duration>,
    ) -> Result<(), EngineError>
    where
        F: FnOnce() -> Result<Strategy, EngineError>,
    {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut slot = self.lock_worker();
        self.reap(&mut slot);

        let (connection, tasks) = transport::channel();
        self.session.begin(role, connection.clone())?;

        let strategy = match strategy() {
            Ok(strategy) => strategy,
            Err(e) => {
                self.session.reset();
                return Err(e);
            }
        };
        let greeting =
            assign.map(|ctx_id| self.session.prepare(CommandType::StartConnection, ctx_id));

        let dispatch: Arc<dyn Dispatch> = self.session.clone();
        let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
        let started = strategy.start(connection, tasks, dispatch, greeting, &self.config, remaining);
        let worker = match started {
            Ok(worker) => worker,
            Err(e) => {
                self.session.reset();
                return Err(e);
            }
        };

        if let Some(timeout) = timeout {
            if !self.session.wait_for_context(deadline) {
                let connected = self.session.is_connected();
                worker.shutdown(Duration::ZERO);
                self.session.reset();
                return Err(if connected {
                    EngineError::HandshakeTimeout(timeout)
                } else {
                    EngineError::NotConnected
                });
            }
            tracing::debug!(?role, ctx_id = self.session.ctx_id(), "session established");
        }

        *slot = Some(worker);
        Ok(())
    }

    /// Join a worker whose connection has already gone.
    fn reap(&self, slot: &mut Option<Worker>) {
        if self.session.state() != SessionState::Disconnected {
            return;
        }
        if let Some(worker) = slot.take() {
            worker.shutdown(Duration::ZERO);
        }
        self.session.reset();
    }

    /// End the session and join the worker.
    ///
    /// If still connected the peer is sent end-connection, and queued commands
    /// get up to the configured grace period to go out. Safe to call any
    /// number of times.
    pub fn stop(&self) {
        let mut slot = self.lock_worker();

        if let Some(connection) = self.session.begin_stop() {
            if connection.is_connected() {
                if let Err(e) = self.write(CommandType::EndConnection, Bytes::new()) {
                    tracing::debug!(error = %e, "could not send end-connection");
                }
            }
        }
        if let Some(worker) = slot.take() {
            worker.shutdown(self.config.shutdown_grace());
        }
        self.session.reset();
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// The negotiated session id, negative until the handshake completes.
    pub fn ctx_id(&self) -> i32 {
        self.session.ctx_id()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn has_command(&self) -> bool {
        self.session.has_command()
    }

    /// The oldest inbound command, left in the queue.
    pub fn get_command(&self) -> Option<Command> {
        self.session.get_command()
    }

    pub fn pop_command(&self) -> Option<Command> {
        self.session.pop_command()
    }

    /// Send a command without expecting a reply. Returns its command id.
    pub fn write(&self, command_type: CommandType, payload: Bytes) -> Result<u32, EngineError> {
        self.submit(command_type, payload, Correlation::None)
    }

    /// Send a command and run `handler` with whatever the peer replies.
    pub fn write_with(
        &self,
        command_type: CommandType,
        payload: Bytes,
        handler: ResponseHandler,
    ) -> Result<u32, EngineError> {
        self.submit(command_type, payload, Correlation::Await(handler))
    }

    /// Reply to `request`, reusing its command id.
    pub fn write_response(
        &self,
        request: &Command,
        command_type: CommandType,
        payload: Bytes,
    ) -> Result<u32, EngineError> {
        self.submit(
            command_type,
            payload,
            Correlation::ReplyTo(request.command_id()),
        )
    }

    fn submit(
        &self,
        command_type: CommandType,
        payload: Bytes,
        correlation: Correlation,
    ) -> Result<u32, EngineError> {
        if payload.len() > self.config.max_payload_size {
            return Err(protocol::CodecError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            }
            .into());
        }
        self.session.submit(command_type, payload, correlation)
    }

    fn notify<B: Serialize + ?Sized>(
        &self,
        command_type: CommandType,
        body: &B,
    ) -> Result<u32, EngineError> {
        self.write(command_type, payload::encode(body)?)
    }

    fn respond<B: Serialize + ?Sized>(
        &self,
        request: &Command,
        command_type: CommandType,
        body: &B,
    ) -> Result<u32, EngineError> {
        self.write_response(request, command_type, payload::encode(body)?)
    }

    fn request<T, F>(
        &self,
        command_type: CommandType,
        payload: Bytes,
        expected: CommandType,
        handler: F,
    ) -> Result<u32, EngineError>
    where
        T: DeserializeOwned,
        F: FnOnce(Result<T, EngineError>) + Send + 'static,
    {
        self.write_with(
            command_type,
            payload,
            Box::new(move |reply| handler(decode_reply(reply, expected))),
        )
    }

    pub fn response_succeeded(&self, request: &Command) -> Result<u32, EngineError> {
        self.write_response(request, CommandType::Succeeded, Bytes::new())
    }

    pub fn response_failed(&self, request: &Command) -> Result<u32, EngineError> {
        self.write_response(request, CommandType::Failed, Bytes::new())
    }

    pub fn changed_state(&self, is_break: bool) -> Result<u32, EngineError> {
        self.notify(CommandType::ChangedState, &ChangedState { is_break })
    }

    /// Ask the front-end to show `line` of the source `key`. The handler hears
    /// whether it succeeded.
    pub fn update_source<F>(
        &self,
        key: &str,
        line: i32,
        update_count: i32,
        handler: F,
    ) -> Result<u32, EngineError>
    where
        F: FnOnce(Result<(), EngineError>) + Send + 'static,
    {
        let body = UpdateSource {
            key: key.to_owned(),
            line,
            update_count,
        };
        self.write_with(
            CommandType::UpdateSource,
            payload::encode(&body)?,
            Box::new(move |reply| handler(decode_ack(reply))),
        )
    }

    pub fn force_update_source(&self) -> Result<u32, EngineError> {
        self.write(CommandType::ForceUpdateSource, Bytes::new())
    }

    pub fn added_source(&self, source: &Source) -> Result<u32, EngineError> {
        self.notify(CommandType::AddedSource, source)
    }

    pub fn save_source(&self, key: &str, lines: &[String]) -> Result<u32, EngineError> {
        let body = SaveSource {
            key: key.to_owned(),
            lines: lines.to_vec(),
        };
        self.notify(CommandType::SaveSource, &body)
    }

    pub fn set_update_count(&self, update_count: i32) -> Result<u32, EngineError> {
        self.notify(CommandType::SetUpdateCount, &SetUpdateCount { update_count })
    }

    pub fn set_breakpoint(&self, breakpoint: &Breakpoint) -> Result<u32, EngineError> {
        self.notify(CommandType::SetBreakpoint, breakpoint)
    }

    pub fn remove_breakpoint(&self, breakpoint: &Breakpoint) -> Result<u32, EngineError> {
        self.notify(CommandType::RemoveBreakpoint, breakpoint)
    }

    pub fn changed_breakpoint_list(&self, breakpoints: &[Breakpoint]) -> Result<u32, EngineError> {
        self.notify(CommandType::ChangedBreakpointList, breakpoints)
    }

    pub fn break_(&self) -> Result<u32, EngineError> {
        self.write(CommandType::Break, Bytes::new())
    }

    pub fn resume(&self) -> Result<u32, EngineError> {
        self.write(CommandType::Resume, Bytes::new())
    }

    pub fn step_into(&self) -> Result<u32, EngineError> {
        self.write(CommandType::StepInto, Bytes::new())
    }

    pub fn step_over(&self) -> Result<u32, EngineError> {
        self.write(CommandType::StepOver, Bytes::new())
    }

    pub fn step_return(&self) -> Result<u32, EngineError> {
        self.write(CommandType::StepReturn, Bytes::new())
    }

    pub fn output_log(
        &self,
        log_type: LogType,
        text: &str,
        key: Option<&str>,
        line: i32,
    ) -> Result<u32, EngineError> {
        let body = OutputLog {
            log_type,
            text: text.to_owned(),
            key: key.map(str::to_owned),
            line,
        };
        self.notify(CommandType::OutputLog, &body)
    }

    /// Evaluate `expression` in `frame`; the handler gets the value as text.
    pub fn eval<F>(&self, expression: &str, frame: StackFrame, handler: F) -> Result<u32, EngineError>
    where
        F: FnOnce(Result<String, EngineError>) + Send + 'static,
    {
        let body = Eval {
            expression: expression.to_owned(),
            frame,
        };
        self.request(
            CommandType::Eval,
            payload::encode(&body)?,
            CommandType::ValueString,
            handler,
        )
    }

    pub fn request_fields_var_list<F>(
        &self,
        variable: &Variable,
        handler: F,
    ) -> Result<u32, EngineError>
    where
        F: FnOnce(Result<Vec<Variable>, EngineError>) + Send + 'static,
    {
        self.request(
            CommandType::RequestFieldsVarList,
            payload::encode(variable)?,
            CommandType::ValueVarList,
            handler,
        )
    }

    pub fn request_local_var_list<F>(&self, frame: StackFrame, handler: F) -> Result<u32, EngineError>
    where
        F: FnOnce(Result<Vec<Variable>, EngineError>) + Send + 'static,
    {
        self.request(
            CommandType::RequestLocalVarList,
            payload::encode(&frame)?,
            CommandType::ValueVarList,
            handler,
        )
    }

    pub fn request_environ_var_list<F>(
        &self,
        frame: StackFrame,
        handler: F,
    ) -> Result<u32, EngineError>
    where
        F: FnOnce(Result<Vec<Variable>, EngineError>) + Send + 'static,
    {
        self.request(
            CommandType::RequestEnvironVarList,
            payload::encode(&frame)?,
            CommandType::ValueVarList,
            handler,
        )
    }

    pub fn request_eval_var_list<F>(
        &self,
        expressions: &[String],
        frame: StackFrame,
        handler: F,
    ) -> Result<u32, EngineError>
    where
        F: FnOnce(Result<Vec<Variable>, EngineError>) + Send + 'static,
    {
        let body = EvalVarList {
            expressions: expressions.to_vec(),
            frame,
        };
        self.request(
            CommandType::RequestEvalVarList,
            payload::encode(&body)?,
            CommandType::ValueVarList,
            handler,
        )
    }

    pub fn request_global_var_list<F>(&self, handler: F) -> Result<u32, EngineError>
    where
        F: FnOnce(Result<Vec<Variable>, EngineError>) + Send + 'static,
    {
        self.request(
            CommandType::RequestGlobalVarList,
            Bytes::new(),
            CommandType::ValueVarList,
            handler,
        )
    }

    pub fn request_registry_var_list<F>(&self, handler: F) -> Result<u32, EngineError>
    where
        F: FnOnce(Result<Vec<Variable>, EngineError>) + Send + 'static,
    {
        self.request(
            CommandType::RequestRegistryVarList,
            Bytes::new(),
            CommandType::ValueVarList,
            handler,
        )
    }

    pub fn request_stack_list<F>(&self, handler: F) -> Result<u32, EngineError>
    where
        F: FnOnce(Result<Vec<BacktraceEntry>, EngineError>) + Send + 'static,
    {
        self.request(
            CommandType::RequestStackList,
            Bytes::new(),
            CommandType::ValueBacktraceList,
            handler,
        )
    }

    pub fn response_string(&self, request: &Command, value: &str) -> Result<u32, EngineError> {
        self.respond(request, CommandType::ValueString, value)
    }

    pub fn response_var_list(
        &self,
        request: &Command,
        variables: &[Variable],
    ) -> Result<u32, EngineError> {
        self.respond(request, CommandType::ValueVarList, variables)
    }

    pub fn response_backtrace_list(
        &self,
        request: &Command,
        backtrace: &[BacktraceEntry],
    ) -> Result<u32, EngineError> {
        self.respond(request, CommandType::ValueBacktraceList, backtrace)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn decode_reply<T: DeserializeOwned>(
    reply: Result<Command, EngineError>,
    expected: CommandType,
) -> Result<T, EngineError> {
    let reply = reply?;
    match reply.command_type() {
        received if received == expected => Ok(reply.decode_payload()?),
        CommandType::Failed => Err(EngineError::RequestFailed {
            command_id: reply.command_id(),
        }),
        received => Err(EngineError::UnexpectedReply { expected, received }),
    }
}

fn decode_ack(reply: Result<Command, EngineError>) -> Result<(), EngineError> {
    let reply = reply?;
    match reply.command_type() {
        CommandType::Succeeded => Ok(()),
        CommandType::Failed => Err(EngineError::RequestFailed {
            command_id: reply.command_id(),
        }),
        received => Err(EngineError::UnexpectedReply {
            expected: CommandType::Succeeded,
            received,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(command_type: CommandType, body: &str) -> Result<Command, EngineError> {
        Ok(Command::new(
            command_type,
            1,
            4,
            Bytes::copy_from_slice(body.as_bytes()),
        )
        .unwrap())
    }

    #[test]
    fn negative_wait_means_no_bound() {
        assert_eq!(wait_bound(-1), None);
        assert_eq!(wait_bound(0), Some(Duration::ZERO));
        assert_eq!(wait_bound(3), Some(Duration::from_secs(3)));
    }

    #[test]
    fn expected_reply_is_decoded() {
        let value: String =
            decode_reply(reply(CommandType::ValueString, "\"42\""), CommandType::ValueString)
                .unwrap();
        assert_eq!(value, "42");
    }

    #[test]
    fn failed_reply_is_an_error() {
        let result: Result<String, _> =
            decode_reply(reply(CommandType::Failed, ""), CommandType::ValueString);
        assert!(matches!(
            result,
            Err(EngineError::RequestFailed { command_id: 4 })
        ));

        assert!(matches!(
            decode_ack(reply(CommandType::Failed, "")),
            Err(EngineError::RequestFailed { command_id: 4 })
        ));
        assert!(decode_ack(reply(CommandType::Succeeded, "")).is_ok());
    }

    #[test]
    fn other_replies_are_unexpected() {
        let result: Result<Vec<Variable>, _> =
            decode_reply(reply(CommandType::ValueString, "\"x\""), CommandType::ValueVarList);
        assert!(matches!(
            result,
            Err(EngineError::UnexpectedReply {
                expected: CommandType::ValueVarList,
                received: CommandType::ValueString,
            })
        ));
    }

    #[test]
    fn abandonment_reaches_typed_handlers() {
        let result: Result<String, _> =
            decode_reply(Err(EngineError::ConnectionClosed), CommandType::ValueString);
        assert!(matches!(result, Err(EngineError::ConnectionClosed)));
    }

    #[test]
    fn commands_need_a_connection() {
        let engine = Engine::new();

        assert!(matches!(engine.resume(), Err(EngineError::NotConnected)));
        assert_eq!(engine.state(), SessionState::Disconnected);
        assert!(!engine.is_connected());
    }

    #[test]
    fn negative_context_id_is_rejected() {
        let engine = Engine::new();
        assert!(matches!(
            engine.start_as_context(0, -3, None),
            Err(EngineError::InvalidContextId(-3))
        ));
    }
}
