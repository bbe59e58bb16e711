use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use legacy_cli::{CommandRegistry, LegacyExecHandler};
use legacy_tunnel::{ipc, ChildTunnel, TunnelLogLayer, TunnelOptions};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tunnel_protocol::CALL_TIMEOUT_ENV;

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            1
        }
    };
    system_utils::drain_and_exit(code)
}

#[tokio::main(flavor = "current_thread")]
async fn run() -> anyhow::Result<i32> {
    let Some(stream) = ipc::from_env().context("failed to open the IPC channel")? else {
        eprintln!("The Titanium SDK bootstrap cannot be directly executed.");
        return Ok(2);
    };
    let (reader, writer) = stream.into_split();
    let tunnel = ChildTunnel::new(writer, tunnel_options()?);
    init_tracing(Arc::clone(&tunnel));

    let mut handler = LegacyExecHandler::new(CommandRegistry::new());
    if let Some(dir) = builtin_hooks_dir() {
        handler = handler.with_builtin_hooks(dir);
    }
    Ok(legacy_tunnel::serve(tunnel, reader, Arc::new(handler)).await)
}

fn tunnel_options() -> anyhow::Result<TunnelOptions> {
    let call_timeout = match std::env::var(CALL_TIMEOUT_ENV) {
        Ok(raw) => Some(
            humantime::parse_duration(&raw)
                .with_context(|| format!("invalid {CALL_TIMEOUT_ENV} \"{raw}\""))?,
        ),
        Err(_) => None,
    };
    Ok(TunnelOptions { call_timeout })
}

fn init_tracing(tunnel: Arc<ChildTunnel>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    tracing_subscriber::registry()
        .with(filter)
        .with(TunnelLogLayer::new(tunnel))
        .init();
}

/// Hooks shipped next to the bootstrap executable.
fn builtin_hooks_dir() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?.join("hooks");
    dir.is_dir().then_some(dir)
}
