use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use legacy_tunnel::{ChildTunnel, ExecFailure, ExecHandler, ExecMode, ExecOutcome};
use tunnel_protocol::ExecRequest;

use crate::cli::{Cli, CliOptions};
use crate::command::CommandRegistry;
use crate::sdk::{PlatformInfo, SystemPlatformInfo};

/// Builds a fresh [`Cli`] for every `exec`/`help` envelope the tunnel receives.
pub struct LegacyExecHandler {
    commands: CommandRegistry,
    platform_info: Arc<dyn PlatformInfo>,
    builtin_hooks: Option<PathBuf>,
}

impl LegacyExecHandler {
    pub fn new(commands: CommandRegistry) -> Self {
        Self {
            commands,
            platform_info: Arc::new(SystemPlatformInfo),
            builtin_hooks: None,
        }
    }

    pub fn with_platform_info(mut self, platform_info: Arc<dyn PlatformInfo>) -> Self {
        self.platform_info = platform_info;
        self
    }

    pub fn with_builtin_hooks(mut self, dir: impl Into<PathBuf>) -> Self {
        self.builtin_hooks = Some(dir.into());
        self
    }
}

#[async_trait]
impl ExecHandler for LegacyExecHandler {
    async fn handle(
        &self,
        tunnel: Arc<ChildTunnel>,
        mode: ExecMode,
        request: ExecRequest,
    ) -> Result<ExecOutcome, ExecFailure> {
        let command = request.command.clone();
        let outcome = match Cli::new(CliOptions {
            request,
            tunnel,
            commands: self.commands.clone(),
            platform_info: Arc::clone(&self.platform_info),
            builtin_hooks: self.builtin_hooks.clone(),
        }) {
            Ok(cli) => match mode {
                ExecMode::Exec => cli.go().await,
                ExecMode::Help => cli.help().await,
            },
            Err(err) => Err(err),
        };

        match outcome {
            Ok(result) => Ok(ExecOutcome {
                result,
                exit_code: 0,
            }),
            Err(err) => {
                tracing::debug!(%command, ?mode, error = %err, "legacy command failed");
                Err(ExecFailure {
                    payload: err.to_payload(),
                    exit_code: err.exit_code(),
                })
            }
        }
    }
}
