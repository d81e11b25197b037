use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use engine::payload::Eval;
use engine::{Command, CommandType, DEFAULT_PORT, Engine, EngineConfig, EngineError, SessionState};
use eyre::WrapErr;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Parser)]
#[command(about = "Run one end of a remote debugging session")]
struct Args {
    /// Engine configuration file
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Seconds to wait for the session to be established; negative returns
    /// straight away
    #[clap(long, global = true, default_value_t = 10, allow_negative_numbers = true)]
    wait: i64,

    #[command(subcommand)]
    role: RoleArgs,
}

#[derive(Debug, Subcommand)]
enum RoleArgs {
    /// Listen for a frame and answer its requests
    Context {
        #[clap(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        #[clap(long, default_value_t = 0)]
        ctx_id: i32,
    },
    /// Connect to a context and log what it sends
    Frame {
        #[clap(default_value = "127.0.0.1")]
        host: String,

        #[clap(default_value_t = DEFAULT_PORT.to_string())]
        port: String,
    },
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    tracing::debug!(?args, "parsed command line arguments");

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .wrap_err_with(|| format!("loading configuration from {}", path.display()))?,
        None => EngineConfig::load_default().wrap_err("loading default configuration")?,
    };
    let timeout = engine::wait_bound(args.wait);
    let engine = Engine::with_config(config);

    match args.role {
        RoleArgs::Context { port, ctx_id } => {
            engine
                .start_as_context(port, ctx_id, timeout)
                .wrap_err_with(|| format!("starting context on port {port}"))?;
            tracing::info!(port, ctx_id, "context started");
            serve(&engine, |request| answer(&engine, request))?;
        }
        RoleArgs::Frame { host, port } => {
            engine
                .start_as_frame(&host, &port, timeout)
                .wrap_err_with(|| format!("connecting to {host}:{port}"))?;
            tracing::info!(%host, %port, ctx_id = engine.ctx_id(), "frame started");
            serve(&engine, |_| Ok(()))?;
        }
    }

    engine.stop();
    tracing::info!("session over");
    Ok(())
}

/// Poll the inbound queue until the session is gone.
fn serve<F>(engine: &Engine, mut on_command: F) -> eyre::Result<()>
where
    F: FnMut(&Command) -> Result<(), EngineError>,
{
    loop {
        match engine.pop_command() {
            Some(command) => {
                tracing::info!(
                    command_type = %command.command_type(),
                    ctx_id = command.ctx_id(),
                    command_id = command.command_id(),
                    data_size = command.header().data_size,
                    "received"
                );
                on_command(&command)
                    .wrap_err_with(|| format!("handling {}", command.command_type()))?;
            }
            None if engine.state() == SessionState::Disconnected => return Ok(()),
            None => thread::sleep(POLL_INTERVAL),
        }
    }
}

/// Give every request a plausible reply so a frame can be exercised without a
/// real debuggee.
fn answer(engine: &Engine, request: &Command) -> Result<(), EngineError> {
    match request.command_type() {
        CommandType::Eval => {
            let eval: Eval = request.decode_payload()?;
            engine.response_string(request, &eval.expression)?;
        }
        CommandType::RequestFieldsVarList
        | CommandType::RequestLocalVarList
        | CommandType::RequestEnvironVarList
        | CommandType::RequestEvalVarList
        | CommandType::RequestGlobalVarList
        | CommandType::RequestRegistryVarList => {
            engine.response_var_list(request, &[])?;
        }
        CommandType::RequestStackList => {
            engine.response_backtrace_list(request, &[])?;
        }
        CommandType::UpdateSource => {
            engine.response_succeeded(request)?;
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_defaults_to_the_local_context() {
        let args = Args::try_parse_from(["remotedbg-peer", "frame"]).unwrap();

        assert_eq!(args.wait, 10);
        match args.role {
            RoleArgs::Frame { host, port } => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(port, "51123");
            }
            other => panic!("unexpected role {other:?}"),
        }
    }

    #[test]
    fn negative_wait_is_accepted() {
        let args =
            Args::try_parse_from(["remotedbg-peer", "--wait", "-1", "context", "--ctx-id", "4"])
                .unwrap();

        assert_eq!(engine::wait_bound(args.wait), None);
        assert!(matches!(
            args.role,
            RoleArgs::Context {
                port: DEFAULT_PORT,
                ctx_id: 4
            }
        ));
    }
}
