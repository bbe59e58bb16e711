mod cli;
mod config;
mod login;
mod prompt;
mod run_legacy;
mod services;

use crate::cli::{Args, Command, LegacyArgs};
use crate::config::{expand_tilde, load_daemon_config};
use crate::run_legacy::{LegacyRunner, OptionGroup};
use crate::services::ServiceRegistry;
use anyhow::Context;
use clap::Parser;
use legacy_tunnel::{LegacySpawner, SpawnError};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use tunnel_protocol::CALL_TIMEOUT_ENV;

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

async fn run() -> anyhow::Result<i32> {
    let args = Args::parse();
    let config_path = expand_tilde(&args.config);
    let config = load_daemon_config(&config_path)
        .with_context(|| format!("failed to load config {}", config_path.display()))?;
    let _log_guard = init_tracing(args.log_to_stderr, config.log_dir().as_deref())?;

    let config = Arc::new(config);
    let services = Arc::new(ServiceRegistry::new(
        config.sdk_roots(),
        config.accounts.clone(),
    ));
    let mut spawner = LegacySpawner::new(config.bootstrap_path(), services.clone());
    if let Some(timeout) = config.call_timeout()? {
        spawner = spawner.with_env(
            CALL_TIMEOUT_ENV,
            humantime::format_duration(timeout).to_string(),
        );
    }
    let runner = LegacyRunner::new(spawner, services.clone(), Arc::clone(&config));

    match args.command {
        Command::Build(legacy) => exec_legacy(&runner, "build", legacy).await,
        Command::Clean(legacy) => exec_legacy(&runner, "clean", legacy).await,
        Command::Run(legacy) => exec_legacy(&runner, "run", legacy).await,
        Command::BuildOptions(options) => {
            let groups = runner
                .build_options(options.platform.as_deref(), options.sdk.as_deref())
                .await?;
            print_option_groups(&groups);
            Ok(0)
        }
        Command::Login(login_args) => {
            let mut stdout = io::stdout();
            let mut stderr = io::stderr();
            login::login(services.as_ref(), &login_args, &mut stdout, &mut stderr).await
        }
    }
}

async fn exec_legacy(runner: &LegacyRunner, name: &str, args: LegacyArgs) -> anyhow::Result<i32> {
    let result = runner.exec(name, args).await?;
    tracing::debug!(command = name, result = ?result, "legacy command finished");
    Ok(0)
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<SpawnError>() {
        Some(SpawnError::Exited { code }) if *code != 0 => *code,
        _ => 1,
    }
}

fn print_option_groups(groups: &[OptionGroup]) {
    for group in groups {
        println!("{}", group.title);
        let width = group
            .entries
            .iter()
            .map(|(usage, _)| usage.len())
            .max()
            .unwrap_or_default();
        for (usage, desc) in &group.entries {
            println!("  {usage:width$}  {desc}");
        }
        println!();
    }
}

fn init_tracing(
    log_to_stderr: bool,
    log_dir: Option<&Path>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = log_to_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
    });

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "titanium.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_target(false)
                .json()
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();
    Ok(guard)
}
