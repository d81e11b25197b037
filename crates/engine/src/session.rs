//! State shared between callers and the worker.
//!
//! Everything here sits behind one mutex: the session id, the command id
//! counter, the outstanding requests and the inbound queue. Handlers are
//! always run after the lock is released.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use protocol::{CTX_UNASSIGNED, Command, CommandType};

use crate::ids::{CommandIds, Role};
use crate::pending::{PendingResponses, ResponseHandler};
use crate::transport::{ConnectionHandle, Dispatch};
use crate::EngineError;

/// Where an engine is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// `stop` is in progress.
    Ending,
}

/// What to do about a reply to an outgoing command.
pub(crate) enum Correlation {
    /// Fire and forget.
    None,
    /// Run the handler when the reply arrives.
    Await(ResponseHandler),
    /// This command is itself the reply to the given command id.
    ReplyTo(u32),
}

struct Shared {
    role: Role,
    state: SessionState,
    ctx_id: i32,
    ids: CommandIds,
    pending: PendingResponses,
    inbound: VecDeque<Command>,
    connection: Option<ConnectionHandle>,
}

pub(crate) struct Session {
    shared: Mutex<Shared>,
    context_assigned: Condvar,
}

impl Session {
    pub(crate) fn new() -> Self {
        Self {
            shared: Mutex::new(Shared {
                role: Role::Context,
                state: SessionState::Disconnected,
                ctx_id: CTX_UNASSIGNED,
                ids: CommandIds::new(Role::Context),
                pending: PendingResponses::default(),
                inbound: VecDeque::new(),
                connection: None,
            }),
            context_assigned: Condvar::new(),
        }
    }

    /// Move from `Disconnected` to `Connecting` as `role`.
    pub(crate) fn begin(&self, role: Role, connection: ConnectionHandle) -> Result<(), EngineError> {
        with_lock("Session.begin", &self.shared, |mut shared| {
            if shared.state != SessionState::Disconnected || shared.connection.is_some() {
                return Err(EngineError::AlreadyStarted);
            }
            shared.role = role;
            shared.state = SessionState::Connecting;
            shared.ctx_id = CTX_UNASSIGNED;
            shared.ids = CommandIds::new(role);
            shared.inbound.clear();
            shared.connection = Some(connection);
            tracing::debug!(?role, "session connecting");
            Ok(())
        })
    }

    /// Build a command with a fresh id without sending it.
    pub(crate) fn prepare(&self, command_type: CommandType, ctx_id: i32) -> Command {
        with_lock("Session.prepare", &self.shared, |mut shared| {
            let command_id = shared.ids.allocate();
            Command::empty(command_type, ctx_id, command_id)
        })
    }

    /// Stamp a command with the session id and an id, record its
    /// correlation and queue it. Returns the command id used.
    pub(crate) fn submit(
        &self,
        command_type: CommandType,
        payload: Bytes,
        correlation: Correlation,
    ) -> Result<u32, EngineError> {
        let (result, replaced) = with_lock("Session.submit", &self.shared, |mut shared| {
            let connection = match &shared.connection {
                Some(connection) if connection.is_connected() => connection.clone(),
                _ => return (Err(EngineError::NotConnected), None),
            };
            let ctx_id = shared.ctx_id;
            if ctx_id < 0 && !command_type.is_lifecycle() {
                return (Err(EngineError::ContextUnassigned(command_type)), None);
            }

            let (command_id, handler) = match correlation {
                Correlation::None => (shared.ids.allocate(), None),
                Correlation::Await(handler) => (shared.ids.allocate(), Some(handler)),
                Correlation::ReplyTo(command_id) => (command_id, None),
            };
            let command = match Command::new(command_type, ctx_id, command_id, payload) {
                Ok(command) => command,
                Err(e) => return (Err(e.into()), None),
            };
            let replaced = handler.and_then(|h| shared.pending.insert(*command.header(), h));

            if let Err(e) = connection.write(command) {
                let orphan = shared.pending.take(ctx_id, command_id);
                return (Err(e), orphan);
            }
            (Ok(command_id), replaced)
        });

        if let Some(handler) = replaced {
            handler(Err(EngineError::ConnectionClosed));
        }
        result
    }

    /// Wait until the handshake assigns a session id.
    ///
    /// Gives up early if the connection drops. `None` waits forever.
    pub(crate) fn wait_for_context(&self, deadline: Option<Instant>) -> bool {
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if shared.ctx_id >= 0 {
                return true;
            }
            if shared.state != SessionState::Connecting {
                return false;
            }

            shared = match deadline {
                None => self
                    .context_assigned
                    .wait(shared)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        return false;
                    };
                    self.context_assigned
                        .wait_timeout(shared, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Mark the session as ending and hand back its connection, if any.
    pub(crate) fn begin_stop(&self) -> Option<ConnectionHandle> {
        with_lock("Session.begin_stop", &self.shared, |mut shared| {
            let connection = shared.connection.clone()?;
            shared.state = SessionState::Ending;
            tracing::debug!("session ending");
            Some(connection)
        })
    }

    /// Forget the connection and return to `Disconnected`.
    pub(crate) fn reset(&self) {
        let abandoned = with_lock("Session.reset", &self.shared, |mut shared| {
            shared.state = SessionState::Disconnected;
            shared.ctx_id = CTX_UNASSIGNED;
            shared.connection = None;
            shared.pending.drain()
        });
        self.context_assigned.notify_all();
        abandon(abandoned);
        tracing::debug!("session disconnected");
    }

    pub(crate) fn has_command(&self) -> bool {
        with_lock("Session.inbound", &self.shared, |shared| {
            !shared.inbound.is_empty()
        })
    }

    pub(crate) fn get_command(&self) -> Option<Command> {
        with_lock("Session.inbound", &self.shared, |shared| {
            shared.inbound.front().cloned()
        })
    }

    pub(crate) fn pop_command(&self) -> Option<Command> {
        with_lock("Session.inbound", &self.shared, |mut shared| {
            shared.inbound.pop_front()
        })
    }

    pub(crate) fn is_connected(&self) -> bool {
        with_lock("Session.connection", &self.shared, |shared| {
            shared
                .connection
                .as_ref()
                .is_some_and(ConnectionHandle::is_connected)
        })
    }

    pub(crate) fn ctx_id(&self) -> i32 {
        with_lock("Session.ctx_id", &self.shared, |shared| shared.ctx_id)
    }

    pub(crate) fn state(&self) -> SessionState {
        with_lock("Session.state", &self.shared, |shared| shared.state)
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        with_lock("Session.pending", &self.shared, |shared| {
            shared.pending.len()
        })
    }
}

impl Dispatch for Session {
    fn dispatch(&self, command: Command) {
        let handler = with_lock("Session.dispatch", &self.shared, |mut shared| {
            let handler = shared
                .pending
                .take(command.ctx_id(), command.command_id());

            match command.command_type() {
                CommandType::StartConnection if command.ctx_id() >= 0 => {
                    shared.ctx_id = command.ctx_id();
                    if shared.state == SessionState::Connecting {
                        shared.state = SessionState::Connected;
                    }
                    tracing::debug!(ctx_id = shared.ctx_id, "session id assigned");

                    if shared.role == Role::Frame {
                        acknowledge(&shared, &command);
                    }
                    self.context_assigned.notify_all();
                }
                CommandType::StartConnection => {
                    tracing::warn!("start-connection without a session id");
                }
                CommandType::EndConnection => {
                    tracing::debug!(ctx_id = shared.ctx_id, "peer ended the session");
                    shared.ctx_id = CTX_UNASSIGNED;
                }
                _ if shared.ctx_id < 0 && command.ctx_id() >= 0 => {
                    shared.ctx_id = command.ctx_id();
                    if shared.state == SessionState::Connecting {
                        shared.state = SessionState::Connected;
                    }
                    tracing::debug!(ctx_id = shared.ctx_id, "session id adopted");
                    self.context_assigned.notify_all();
                }
                _ => {}
            }

            shared.inbound.push_back(command.clone());
            handler
        });

        if let Some(handler) = handler {
            handler(Ok(command));
        }
    }

    fn closed(&self) {
        let abandoned = with_lock("Session.closed", &self.shared, |mut shared| {
            if shared.state != SessionState::Ending {
                shared.state = SessionState::Disconnected;
            }
            shared.ctx_id = CTX_UNASSIGNED;
            shared.pending.drain()
        });
        self.context_assigned.notify_all();

        tracing::debug!(abandoned = abandoned.len(), "connection lost");
        abandon(abandoned);
    }
}

/// Echo a start-connection back with the adopted session id.
fn acknowledge(shared: &Shared, request: &Command) {
    let Some(connection) = &shared.connection else {
        return;
    };
    let reply = Command::empty(
        CommandType::StartConnection,
        shared.ctx_id,
        request.command_id(),
    );
    if let Err(e) = connection.write(reply) {
        tracing::warn!(error = %e, "could not acknowledge start-connection");
    }
}

fn abandon(handlers: Vec<ResponseHandler>) {
    for handler in handlers {
        handler(Err(EngineError::ConnectionClosed));
    }
}

fn with_lock<T, F, R>(name: &str, lock: &Mutex<T>, f: F) -> R
where
    F: FnOnce(MutexGuard<'_, T>) -> R,
{
    tracing::trace!(%name, "taking lock");
    let inner = lock.lock().unwrap_or_else(PoisonError::into_inner);
    tracing::trace!(%name, "took lock");
    let res = f(inner);
    tracing::trace!(%name, "released lock");
    res
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::transport::{self, ConnectionTasks, Task};

    use super::*;

    fn connected(role: Role) -> (Session, ConnectionTasks) {
        let session = Session::new();
        let (handle, tasks) = transport::channel();
        tasks.set_connected(true);
        session.begin(role, handle).unwrap();
        (session, tasks)
    }

    fn written(tasks: &mut ConnectionTasks) -> Vec<Command> {
        std::iter::from_fn(|| tasks.try_recv())
            .filter_map(|task| match task {
                Task::Write(command) => Some(command),
                _ => None,
            })
            .collect()
    }

    fn start(ctx_id: i32, command_id: u32) -> Command {
        Command::empty(CommandType::StartConnection, ctx_id, command_id)
    }

    #[test]
    fn frame_adopts_and_acknowledges_the_session_id() {
        let (session, mut tasks) = connected(Role::Frame);

        session.dispatch(start(7, 1));

        assert_eq!(session.ctx_id(), 7);
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(written(&mut tasks), vec![start(7, 1)]);
        assert!(session.has_command());
    }

    #[test]
    fn frame_adopts_the_session_id_from_ordinary_traffic() {
        let (session, mut tasks) = connected(Role::Frame);
        assert_eq!(session.state(), SessionState::Connecting);

        session.dispatch(Command::empty(CommandType::OutputLog, 5, 2));

        assert!(session.wait_for_context(Some(Instant::now())));
        assert_eq!(session.ctx_id(), 5);
        assert_eq!(session.state(), SessionState::Connected);
        assert!(written(&mut tasks).is_empty());
        assert_eq!(
            session.pop_command().map(|c| c.command_type()),
            Some(CommandType::OutputLog)
        );
    }

    #[test]
    fn context_is_assigned_by_the_acknowledgement() {
        let (session, mut tasks) = connected(Role::Context);
        assert!(!session.wait_for_context(Some(Instant::now())));

        session.dispatch(start(7, 1));

        assert!(session.wait_for_context(Some(Instant::now())));
        assert!(written(&mut tasks).is_empty());
    }

    #[test]
    fn requests_need_a_session_id() {
        let (session, _tasks) = connected(Role::Frame);

        let result = session.submit(CommandType::Break, Bytes::new(), Correlation::None);
        assert!(matches!(
            result,
            Err(EngineError::ContextUnassigned(CommandType::Break))
        ));

        let result = session.submit(CommandType::EndConnection, Bytes::new(), Correlation::None);
        assert!(result.is_ok());
    }

    #[test]
    fn reply_runs_handler_once_and_is_still_queued() {
        let (session, mut tasks) = connected(Role::Frame);
        session.dispatch(start(3, 1));
        let _ = written(&mut tasks);
        let _ = session.pop_command();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = session
            .submit(
                CommandType::Eval,
                Bytes::new(),
                Correlation::Await(Box::new(move |reply| {
                    assert!(reply.is_ok());
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        assert_eq!(id % 2, 0);
        assert_eq!(session.pending_len(), 1);

        let reply = Command::empty(CommandType::ValueString, 3, id);
        session.dispatch(reply.clone());
        session.dispatch(reply.clone());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.pending_len(), 0);
        assert_eq!(session.pop_command(), Some(reply.clone()));
        assert_eq!(session.pop_command(), Some(reply));
    }

    #[test]
    fn reply_to_reuses_the_request_id() {
        let (session, mut tasks) = connected(Role::Context);
        session.dispatch(start(2, 1));

        let id = session
            .submit(CommandType::Succeeded, Bytes::new(), Correlation::ReplyTo(40))
            .unwrap();

        assert_eq!(id, 40);
        let sent = written(&mut tasks);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command_id(), 40);
        assert_eq!(sent[0].ctx_id(), 2);
    }

    #[test]
    fn close_abandons_outstanding_requests() {
        let (session, _tasks) = connected(Role::Frame);
        session.dispatch(start(1, 1));

        let abandoned = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let abandoned = Arc::clone(&abandoned);
            session
                .submit(
                    CommandType::RequestStackList,
                    Bytes::new(),
                    Correlation::Await(Box::new(move |reply| {
                        assert!(matches!(reply, Err(EngineError::ConnectionClosed)));
                        abandoned.fetch_add(1, Ordering::SeqCst);
                    })),
                )
                .unwrap();
        }

        session.closed();

        assert_eq!(abandoned.load(Ordering::SeqCst), 3);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.ctx_id(), CTX_UNASSIGNED);
    }

    #[test]
    fn end_connection_unassigns_the_session_id() {
        let (session, _tasks) = connected(Role::Frame);
        session.dispatch(start(5, 1));

        session.dispatch(Command::empty(CommandType::EndConnection, 5, 3));

        assert_eq!(session.ctx_id(), CTX_UNASSIGNED);
    }

    #[test]
    fn cannot_begin_twice() {
        let (session, _tasks) = connected(Role::Frame);
        let (handle, _other) = transport::channel();

        assert!(matches!(
            session.begin(Role::Context, handle),
            Err(EngineError::AlreadyStarted)
        ));
    }

    #[test]
    fn waiting_wakes_when_assigned_from_another_thread() {
        let (session, _tasks) = connected(Role::Context);
        let session = Arc::new(session);

        let assigner = Arc::clone(&session);
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            assigner.dispatch(start(9, 1));
        });

        assert!(session.wait_for_context(Some(Instant::now() + Duration::from_secs(5))));
        assert_eq!(session.ctx_id(), 9);
        thread.join().unwrap();
    }
}
