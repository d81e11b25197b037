//! Connection, correlation and session handling for the remote debugging
//! protocol.
//!
//! An [`Engine`] plays one of two roles. The context role listens for a
//! single peer and assigns the session id; the frame role connects out and
//! adopts it:
//!
//! ```no_run
//! use std::time::Duration;
//! use engine::Engine;
//!
//! let context = Engine::new();
//! context.start_as_context(51123, 1, Some(Duration::from_secs(10)))?;
//!
//! context.eval("answer", Default::default(), |value| {
//!     println!("answer = {value:?}");
//! })?;
//!
//! while context.is_connected() {
//!     if let Some(command) = context.pop_command() {
//!         println!("received {}", command.command_type());
//!     }
//! #   break;
//! }
//! context.stop();
//! # Ok::<(), engine::EngineError>(())
//! ```
//!
//! All socket I/O happens on a background worker thread. The public methods
//! only queue work and never block, apart from the start calls (bounded by
//! their timeout) and [`Engine::stop`].

mod config;
mod engine;
mod error;
mod establish;
mod ids;
mod pending;
mod session;
mod transport;
mod worker;

pub use config::{EngineConfig, default_path};
pub use engine::{Engine, wait_bound};
pub use error::EngineError;
pub use pending::ResponseHandler;
pub use session::SessionState;

pub use protocol::{Command, CommandType, DEFAULT_PORT, payload};
