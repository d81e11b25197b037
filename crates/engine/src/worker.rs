//! The background thread that owns all socket I/O for one engine.
//!
//! Each worker is a plain OS thread running a single-threaded tokio runtime.
//! The rest of the program is synchronous and only talks to it through the
//! task channel, so the runtime never leaks into callers.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use protocol::Command;
use tokio_util::sync::CancellationToken;

use crate::establish::Strategy;
use crate::transport::{self, ConnectionHandle, ConnectionTasks, Dispatch, Task, WriteQueue};
use crate::{EngineConfig, EngineError};

pub(crate) struct Worker {
    connection: ConnectionHandle,
    cancel: CancellationToken,
    established: Receiver<Result<(), EngineError>>,
    // never sent on; disconnects when the thread finishes
    finished: Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn(
        strategy: Strategy,
        connection: ConnectionHandle,
        tasks: ConnectionTasks,
        dispatch: Arc<dyn Dispatch>,
        greeting: Option<Command>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(EngineError::Runtime)?;

        let cancel = CancellationToken::new();
        let (established_tx, established_rx) = crossbeam_channel::bounded(1);
        let (finished_tx, finished_rx) = crossbeam_channel::bounded::<()>(0);

        let worker_cancel = cancel.clone();
        let thread = std::thread::Builder::new()
            .name("remotedbg-worker".to_string())
            .spawn(move || {
                let _finished = finished_tx;
                let mut tasks = tasks;

                runtime.block_on(async {
                    tokio::select! {
                        () = run(strategy, &mut tasks, dispatch.as_ref(), greeting, &config, established_tx) => {}
                        () = worker_cancel.cancelled() => tracing::debug!("worker cancelled"),
                    }
                });
                // a resolver stuck in a blocking lookup must not hold up exit
                runtime.shutdown_background();

                tasks.set_connected(false);
                dispatch.closed();
                tracing::debug!("worker finished");
            })
            .map_err(EngineError::Runtime)?;

        Ok(Self {
            connection,
            cancel,
            established: established_rx,
            finished: finished_rx,
            thread: Some(thread),
        })
    }

    /// Block until the stream is connected, establishment fails, or
    /// `timeout` passes.
    pub(crate) fn wait_established(&self, timeout: Duration) -> Result<(), EngineError> {
        match self.established.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(EngineError::ConnectTimeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::NotConnected),
        }
    }

    /// Let queued writes go out for up to `grace`, then stop the worker and
    /// join it.
    pub(crate) fn shutdown(mut self, grace: Duration) {
        if self.connection.is_connected() {
            self.connection.shutdown();
        } else {
            self.connection.close();
        }

        if let Err(RecvTimeoutError::Timeout) = self.finished.recv_timeout(grace) {
            tracing::debug!(?grace, "worker did not finish in time, cancelling");
        }
        self.join();
    }

    fn join(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("worker thread panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.join();
    }
}

async fn run(
    strategy: Strategy,
    tasks: &mut ConnectionTasks,
    dispatch: &dyn Dispatch,
    greeting: Option<Command>,
    config: &EngineConfig,
    established: Sender<Result<(), EngineError>>,
) {
    let mut queue = WriteQueue::default();
    if let Some(greeting) = greeting {
        queue.push(greeting);
    }

    let result = tokio::select! {
        result = strategy.establish(config.retry_delay()) => result,
        () = wait_for_stop(tasks, &mut queue) => {
            tracing::debug!("stopped before a connection was made");
            return;
        }
    };

    let stream = match result {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "could not establish connection");
            // nobody may be waiting
            let _ = established.send(Err(e));
            return;
        }
    };

    tasks.set_connected(true);
    let _ = established.send(Ok(()));

    transport::run_connection(stream, &mut queue, tasks, dispatch, config).await;
    tracing::debug!("connection closed");
}

/// Collect writes issued before the stream exists; return on close.
async fn wait_for_stop(tasks: &mut ConnectionTasks, queue: &mut WriteQueue) {
    loop {
        match tasks.recv().await {
            Some(Task::Write(command)) => queue.push(command),
            Some(Task::Close | Task::Shutdown) | None => return,
        }
    }
}
