//! One peer connection: the ordered write queue and the read loop.
//!
//! Callers never touch the socket. They hold a [`ConnectionHandle`] that
//! pushes [`Task`]s onto an unbounded channel; the worker owns the receiving
//! end, the [`WriteQueue`] and both halves of the stream.

use std::collections::VecDeque;
use std::io;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use futures::StreamExt;
use protocol::{Command, CommandCodec};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

use crate::{EngineConfig, EngineError};

/// Receives every command read off the wire, in wire order.
pub(crate) trait Dispatch: Send + Sync + 'static {
    fn dispatch(&self, command: Command);

    /// The connection has gone and nothing more will be dispatched.
    fn closed(&self);
}

/// Work handed to the worker.
#[derive(Debug)]
pub(crate) enum Task {
    Write(Command),
    /// Drop whatever is still queued and close.
    Close,
    /// Send whatever is still queued, then close.
    Shutdown,
}

/// Cheap, cloneable access to a connection driven by the worker.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionHandle {
    tasks: mpsc::UnboundedSender<Task>,
    connected: Arc<AtomicBool>,
}

/// The worker's side of a [`ConnectionHandle`].
#[derive(Debug)]
pub(crate) struct ConnectionTasks {
    receiver: mpsc::UnboundedReceiver<Task>,
    connected: Arc<AtomicBool>,
}

pub(crate) fn channel() -> (ConnectionHandle, ConnectionTasks) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(false));
    (
        ConnectionHandle {
            tasks: tx,
            connected: Arc::clone(&connected),
        },
        ConnectionTasks {
            receiver: rx,
            connected,
        },
    )
}

impl ConnectionHandle {
    /// Queue a command for sending. Never blocks.
    pub fn write(&self, command: Command) -> Result<(), EngineError> {
        if !self.is_connected() {
            return Err(EngineError::NotConnected);
        }

        let header = command.header();
        tracing::debug!(
            command_type = %header.command_type,
            ctx_id = header.ctx_id,
            command_id = header.command_id,
            data_size = header.data_size,
            "queueing command"
        );
        self.tasks
            .send(Task::Write(command))
            .map_err(|_| EngineError::NotConnected)
    }

    /// Ask the worker to tear the connection down. Calling this more than
    /// once, or after the connection is gone, does nothing.
    pub fn close(&self) {
        if self.tasks.send(Task::Close).is_err() {
            tracing::trace!("close requested on a finished connection");
        }
    }

    pub(crate) fn shutdown(&self) {
        if self.tasks.send(Task::Shutdown).is_err() {
            tracing::trace!("shutdown requested on a finished connection");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl ConnectionTasks {
    pub(crate) async fn recv(&mut self) -> Option<Task> {
        self.receiver.recv().await
    }

    pub(crate) fn try_recv(&mut self) -> Option<Task> {
        self.receiver.try_recv().ok()
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}

/// Commands accepted for sending but not yet fully written.
///
/// A command stays at the front until both its header and its payload have
/// been written and flushed; only then is it popped and the next one started.
#[derive(Debug, Default)]
pub(crate) struct WriteQueue {
    commands: VecDeque<Command>,
}

impl WriteQueue {
    pub(crate) fn push(&mut self, command: Command) {
        self.commands.push_back(command);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.commands.len()
    }

    /// Drop every queued command, returning how many there were.
    pub(crate) fn abandon(&mut self) -> usize {
        let dropped = self.commands.len();
        self.commands.clear();
        dropped
    }

    /// Write queued commands in order until the queue is empty.
    ///
    /// On error the failed command is still at the front of the queue.
    pub(crate) async fn transmit<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(command) = self.commands.front() {
            writer.write_all(&command.header().to_bytes()).await?;
            if !command.payload().is_empty() {
                writer.write_all(command.payload()).await?;
            }
            writer.flush().await?;
            tracing::trace!(command_id = command.command_id(), "command sent");
            self.commands.pop_front();
        }
        Ok(())
    }
}

/// Drive one established connection until either direction finishes.
pub(crate) async fn run_connection<S>(
    stream: S,
    queue: &mut WriteQueue,
    tasks: &mut ConnectionTasks,
    dispatch: &dyn Dispatch,
    config: &EngineConfig,
) where
    S: AsyncRead + AsyncWrite,
{
    let (reader, writer) = tokio::io::split(stream);

    tokio::select! {
        () = read_loop(reader, dispatch, config.max_payload_size) => {}
        () = write_loop(writer, queue, tasks, config.write_batch.max(1)) => {}
    }
}

async fn read_loop<R>(reader: R, dispatch: &dyn Dispatch, max_payload_size: usize)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, CommandCodec::with_max_size(max_payload_size));

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(command) => {
                tracing::trace!(
                    command_type = %command.command_type(),
                    ctx_id = command.ctx_id(),
                    command_id = command.command_id(),
                    "received command"
                );
                dispatch.dispatch(command);
            }
            Err(e) => {
                tracing::warn!(error = %e, "framing failure, closing connection");
                return;
            }
        }
    }
    tracing::debug!("peer closed the connection");
}

async fn write_loop<W>(
    mut writer: W,
    queue: &mut WriteQueue,
    tasks: &mut ConnectionTasks,
    batch: usize,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        if let Err(e) = queue.transmit(&mut writer).await {
            let dropped = queue.abandon();
            tracing::warn!(error = %e, dropped, "write failed, closing connection");
            return;
        }

        let Some(first) = tasks.recv().await else {
            return;
        };

        let mut next = Some(first);
        let mut taken = 0;
        while let Some(task) = next {
            match task {
                Task::Write(command) => queue.push(command),
                Task::Close => {
                    let dropped = queue.abandon();
                    tracing::debug!(dropped, "closing connection");
                    return;
                }
                Task::Shutdown => {
                    match queue.transmit(&mut writer).await {
                        Ok(()) => {
                            if let Err(e) = writer.shutdown().await {
                                tracing::debug!(error = %e, "shutting down write half");
                            }
                        }
                        Err(e) => {
                            let dropped = queue.abandon();
                            tracing::warn!(error = %e, dropped, "write failed during shutdown");
                        }
                    }
                    return;
                }
            }

            taken += 1;
            next = if taken < batch { tasks.try_recv() } else { None };
        }
    }
}
