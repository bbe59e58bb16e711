//! The legacy CLI as it runs inside the bootstrap process.
//!
//! A [`LegacyExecHandler`] receives the `exec`/`help` envelope from the tunnel, builds a [`Cli`]
//! and walks it through loading, validation and execution. Hooks fire at every step.

pub mod argv;
pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod handler;
pub mod hooks;
pub mod sdk;

pub use argv::Argv;
pub use cli::{Cli, CliOptions, PipelineState, CLI_VERSION};
pub use command::{
    CommandConfig, CommandModule, CommandRegistry, LoadedCommand, OptionHooks, OptionSpec,
    RunDone, RunEntry,
};
pub use config::LegacyConfig;
pub use error::CliError;
pub use handler::LegacyExecHandler;
pub use hooks::{Done, HookData, HookError, HookFn, HookRegistry, HookSpec};
pub use sdk::{PlatformInfo, Sdk, SystemPlatformInfo};
