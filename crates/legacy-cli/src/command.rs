//! Command modules, their option schemas and the registry that loads them from an SDK.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::Command;
use tokio::sync::oneshot;
use tunnel_protocol::Question;

use crate::cli::Cli;
use crate::error::CliError;
use crate::sdk::Sdk;

pub type VerifyFn = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;
pub type ValidateFn = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
pub type ValueCallback = Arc<dyn Fn(Value) -> Option<Value> + Send + Sync>;
pub type PromptFn = Arc<dyn Fn() -> BoxFuture<'static, Question> + Send + Sync>;

/// Code-level behavior attached to an option. Never serialized.
#[derive(Clone, Default)]
pub struct OptionHooks {
    /// Decides whether a `required` option is actually needed right now.
    pub verify_if_required: Option<VerifyFn>,
    /// Checks a supplied value and may adjust it.
    pub validate: Option<ValidateFn>,
    /// Final transformation of the value; `None` keeps it as is.
    pub callback: Option<ValueCallback>,
    /// Builds a custom question for this option.
    pub prompt: Option<PromptFn>,
}

impl fmt::Debug for OptionHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionHooks")
            .field("verify_if_required", &self.verify_if_required.is_some())
            .field("validate", &self.validate.is_some())
            .field("callback", &self.callback.is_some())
            .field("prompt", &self.prompt.is_some())
            .finish()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OptionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abbr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
    #[serde(default)]
    pub skip_value_check: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(skip)]
    pub hooks: OptionHooks,
}

impl OptionSpec {
    /// Allowed values, unless the value check is switched off.
    pub fn checked_values(&self) -> Option<&[String]> {
        if self.skip_value_check {
            None
        } else {
            self.values.as_deref()
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct FlagSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abbr: Option<String>,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub flags: BTreeMap<String, FlagSpec>,
    #[serde(default)]
    pub options: BTreeMap<String, OptionSpec>,
}

/// Option schema of a command, returned as-is by `help`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CommandConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(default)]
    pub flags: BTreeMap<String, FlagSpec>,
    #[serde(default)]
    pub options: BTreeMap<String, OptionSpec>,
    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformConfig>,
}

type RunResult = anyhow::Result<Value>;

/// Completion callback handed to [`RunEntry::Callback`] commands. Only the first call counts.
#[derive(Clone)]
pub struct RunDone {
    tx: Arc<Mutex<Option<oneshot::Sender<RunResult>>>>,
}

impl RunDone {
    fn new() -> (Self, oneshot::Receiver<RunResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    pub fn call(&self, result: RunResult) {
        let sender = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => tracing::debug!("ignoring repeated command completion"),
        }
    }
}

/// How a command's work completes.
pub enum RunEntry {
    /// Resolves with the command result.
    Future(BoxFuture<'static, RunResult>),
    /// Reports through a [`RunDone`]; extra calls are ignored.
    Callback(Box<dyn FnOnce(RunDone) + Send>),
    /// Gives no completion signal at all; treated as finished once the tunnel goes quiet.
    Detached(Box<dyn FnOnce() + Send>),
}

impl RunEntry {
    pub fn future<F>(fut: F) -> Self
    where
        F: Future<Output = RunResult> + Send + 'static,
    {
        RunEntry::Future(Box::pin(fut))
    }

    pub(crate) fn done_channel() -> (RunDone, oneshot::Receiver<RunResult>) {
        RunDone::new()
    }
}

/// A command the pipeline can load, validate and run.
#[async_trait]
pub trait CommandModule: Send + Sync {
    /// Range of CLI versions the command supports.
    fn cli_version(&self) -> Option<&str> {
        None
    }

    /// Whether the module has an entry point at all.
    fn runnable(&self) -> bool {
        true
    }

    async fn config(&self, _cli: &Cli) -> Result<CommandConfig, CliError> {
        Ok(CommandConfig::default())
    }

    async fn validate(&self, _cli: &Cli) -> Result<(), CliError> {
        Ok(())
    }

    fn run(&self, cli: Arc<Cli>) -> Result<RunEntry, CliError>;
}

/// A command resolved for one pipeline run.
#[derive(Clone)]
pub struct LoadedCommand {
    pub name: String,
    pub path: PathBuf,
    pub cli_version: semver::Version,
    pub module: Arc<dyn CommandModule>,
}

impl fmt::Debug for LoadedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedCommand")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("cli_version", &self.cli_version)
            .finish_non_exhaustive()
    }
}

/// Resolves command names to modules. Modules registered in code win over descriptors found in
/// the SDK.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    modules: HashMap<String, Arc<dyn CommandModule>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, module: Arc<dyn CommandModule>) -> &mut Self {
        self.modules.insert(name.into(), module);
        self
    }

    pub fn load(
        &self,
        name: &str,
        sdk: &Sdk,
        cli_version: &semver::Version,
    ) -> Result<LoadedCommand, CliError> {
        let (path, module) = match self.modules.get(name) {
            Some(module) => (PathBuf::from(format!("<builtin:{name}>")), Arc::clone(module)),
            None => {
                let path = sdk.command_descriptor(name);
                let module: Arc<dyn CommandModule> =
                    Arc::new(ManifestCommand::load(name, &path).map_err(CliError::Other)?);
                (path, module)
            }
        };
        tracing::trace!(command = name, path = %path.display(), "loaded command");

        if let Some(range) = module.cli_version() {
            let range = semver::VersionReq::parse(range)
                .with_context(|| format!("Command \"{name}\" has an invalid cli-version \"{range}\""))?;
            if !range.matches(cli_version) {
                return Err(CliError::Other(anyhow::anyhow!(
                    "Command \"{name}\" is incompatible with this version of the Titanium CLI"
                )));
            }
        }
        if !module.runnable() {
            return Err(CliError::Other(anyhow::anyhow!(
                "Command \"{name}\" does not contain a valid run function"
            )));
        }

        Ok(LoadedCommand {
            name: name.to_string(),
            path,
            cli_version: cli_version.clone(),
            module,
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CommandDescriptor {
    cli_version: Option<String>,
    run: Option<RunSpec>,
    #[serde(flatten)]
    config: CommandConfig,
}

#[derive(Clone, Debug, Deserialize)]
struct RunSpec {
    program: String,
    #[serde(default)]
    args: Vec<String>,
}

/// A command described by `<sdk>/cli/commands/<name>.toml` whose work is an external program.
#[derive(Clone, Debug)]
pub struct ManifestCommand {
    name: String,
    descriptor: CommandDescriptor,
}

impl ManifestCommand {
    pub fn load(name: &str, path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Unable to find command \"{name}\" at {}", path.display()))?;
        let descriptor: CommandDescriptor = toml::from_str(&raw)
            .with_context(|| format!("failed to parse command descriptor {}", path.display()))?;
        Ok(Self {
            name: name.to_string(),
            descriptor,
        })
    }
}

#[async_trait]
impl CommandModule for ManifestCommand {
    fn cli_version(&self) -> Option<&str> {
        self.descriptor.cli_version.as_deref()
    }

    fn runnable(&self) -> bool {
        self.descriptor.run.is_some()
    }

    async fn config(&self, _cli: &Cli) -> Result<CommandConfig, CliError> {
        Ok(self.descriptor.config.clone())
    }

    fn run(&self, cli: Arc<Cli>) -> Result<RunEntry, CliError> {
        let Some(spec) = self.descriptor.run.clone() else {
            return Err(CliError::Other(anyhow::anyhow!(
                "Command \"{}\" does not contain a valid run function",
                self.name
            )));
        };
        let name = self.name.clone();
        Ok(RunEntry::future(async move {
            let argv = cli.argv();
            let cwd = argv
                .get_str("project-dir")
                .map(PathBuf::from)
                .or_else(|| cli.cwd().map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("."));
            let platform = argv.get_str("platform").unwrap_or_default().to_string();
            let sdk = cli.sdk().path.display().to_string();
            let expand = |raw: &str| {
                raw.replace("{sdk}", &sdk)
                    .replace("{cwd}", &cwd.display().to_string())
                    .replace("{command}", &name)
                    .replace("{platform}", &platform)
            };

            let mut cmd = Command::new(expand(&spec.program));
            cmd.args(spec.args.iter().map(|arg| expand(arg)))
                .current_dir(&cwd)
                .env("LEGACY_ARGV", argv.to_value().to_string())
                .env("LEGACY_CONFIG", cli.config().as_value().to_string())
                .stdin(Stdio::null())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .kill_on_drop(true);
            let status = cmd
                .status()
                .await
                .with_context(|| format!("failed to run command \"{name}\""))?;
            match status.code() {
                Some(0) => Ok(json!({ "command": name, "exitCode": 0 })),
                Some(code) => Err(CliError::command(
                    format!("Command \"{name}\" failed with exit code {code}"),
                    code,
                )
                .into()),
                None => Err(CliError::command(format!("Command \"{name}\" was terminated"), 1).into()),
            }
        }))
    }
}
