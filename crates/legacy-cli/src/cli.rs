//! The command pipeline: load the command, validate its options, run it.
//!
//! One [`Cli`] is built per `exec`/`help` request and walks
//! `Init -> Loading -> Validating -> Executing -> Done`, landing in `Failed` on the first error.
//! Every step fires its lifecycle event through the hook registry.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use legacy_tunnel::ChildTunnel;
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tunnel_protocol::{Choice, ExecRequest, Question};

use crate::argv::{display_value, Argv, PLATFORM_KEY};
use crate::command::{
    CommandConfig, CommandRegistry, LoadedCommand, OptionSpec, PlatformConfig, RunEntry,
};
use crate::config::LegacyConfig;
use crate::error::CliError;
use crate::hooks::HookRegistry;
use crate::sdk::{PlatformInfo, Sdk};

pub const CLI_VERSION: &str = "5.999.0";

const SUPPORTED_COMMANDS: [&str; 3] = ["build", "clean", "run"];
/// A command without a completion signal is done once the tunnel has been idle this long.
const QUIET_PERIOD: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    Loading,
    Validating,
    Executing,
    Done,
    Failed,
}

pub struct CliOptions {
    pub request: ExecRequest,
    pub tunnel: Arc<ChildTunnel>,
    pub commands: CommandRegistry,
    pub platform_info: Arc<dyn PlatformInfo>,
    pub builtin_hooks: Option<PathBuf>,
}

/// The loaded command for one pipeline run, plus its platform sub-context for `build`.
#[derive(Debug)]
pub struct CommandContext {
    pub command: LoadedCommand,
    pub conf: CommandConfig,
    pub platform: Option<PlatformContext>,
}

#[derive(Debug)]
pub struct PlatformContext {
    pub name: String,
    pub conf: PlatformConfig,
    pub path: PathBuf,
}

pub struct Cli {
    command: String,
    argv: Mutex<Argv>,
    config: Mutex<LegacyConfig>,
    cwd: Option<PathBuf>,
    sdk: Sdk,
    hooks: Arc<HookRegistry>,
    tunnel: Arc<ChildTunnel>,
    commands: CommandRegistry,
    platform_info: Arc<dyn PlatformInfo>,
    prompting_enabled: bool,
    version: semver::Version,
    state: Mutex<PipelineState>,
    start_time: Mutex<Option<Instant>>,
}

impl Cli {
    pub fn new(options: CliOptions) -> Result<Arc<Self>, CliError> {
        let ExecRequest {
            argv,
            command,
            config,
            cwd,
            sdk_path,
            prompting_enabled,
        } = options.request;

        if !SUPPORTED_COMMANDS.contains(&command.as_str()) {
            return Err(CliError::InvalidCommand(command));
        }

        let version = semver::Version::parse(CLI_VERSION).context("invalid CLI version")?;
        let sdk = Sdk::load(sdk_path)?;
        let config = LegacyConfig::new(config);
        let hooks = Arc::new(HookRegistry::new(version.clone()));
        for dir in config.hook_paths() {
            hooks.scan_hooks(Path::new(&dir));
        }
        if let Some(dir) = &options.builtin_hooks {
            hooks.scan_hooks(dir);
        }
        hooks.scan_hooks(&sdk.hooks_dir());

        Ok(Arc::new(Self {
            argv: Mutex::new(Argv::new(&command, argv)),
            command,
            config: Mutex::new(config),
            cwd,
            sdk,
            hooks,
            tunnel: options.tunnel,
            commands: options.commands,
            platform_info: options.platform_info,
            prompting_enabled,
            version,
            state: Mutex::new(PipelineState::Init),
            start_time: Mutex::new(None),
        }))
    }

    pub fn command_name(&self) -> &str {
        &self.command
    }

    pub fn argv(&self) -> Argv {
        lock(&self.argv).clone()
    }

    pub fn set_arg(&self, name: &str, value: Value) {
        lock(&self.argv).set(name, value);
    }

    pub fn config(&self) -> LegacyConfig {
        lock(&self.config).clone()
    }

    pub fn set_config(&self, key: &str, value: Value) {
        lock(&self.config).set(key, value);
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn sdk(&self) -> &Sdk {
        &self.sdk
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    pub fn tunnel(&self) -> &Arc<ChildTunnel> {
        &self.tunnel
    }

    pub fn prompting_enabled(&self) -> bool {
        self.prompting_enabled
    }

    pub fn state(&self) -> PipelineState {
        *lock(&self.state)
    }

    /// When the command started executing, after validation and prompting.
    pub fn start_time(&self) -> Option<Instant> {
        *lock(&self.start_time)
    }

    pub fn env_info(&self) -> Value {
        let mut info = self.platform_info.env_info();
        info["sdkVersion"] = json!(self.sdk.manifest.version);
        info["installPath"] = json!(self.sdk.install_path());
        info
    }

    /// Sends a telemetry event. `ti.apiusage` events keep their kind as the event name.
    pub fn add_analytics_event(&self, event: &str, data: Value, kind: Option<&str>) {
        let name = match kind {
            Some("ti.apiusage") => "ti.apiusage",
            _ => event,
        };
        let mut payload = Map::new();
        payload.insert("event".into(), json!(name));
        if let Value::Object(data) = data {
            payload.extend(data);
        }
        self.tunnel.telemetry(Value::Object(payload));
    }

    /// Asks the user through the parent, or fails with the question attached when prompting is
    /// disabled.
    pub async fn ask(&self, mut question: Question) -> Result<Value, CliError> {
        question.required = Some(true);
        let error = question.error.take();
        if self.prompting_enabled {
            return Ok(self.tunnel.ask(question).await?);
        }
        let message = error
            .or_else(|| question.message.clone())
            .unwrap_or_else(|| format!("Missing value for \"{}\"", question.name));
        Err(CliError::prompt(message, question))
    }

    /// Runs the full pipeline and returns the command's result.
    pub async fn go(self: &Arc<Self>) -> Result<Value, CliError> {
        let outcome = self.run_pipeline().await;
        match &outcome {
            Ok(_) => self.transition(PipelineState::Done),
            Err(err) => {
                tracing::debug!(command = %self.command, error = %err, "pipeline failed");
                self.transition(PipelineState::Failed);
            }
        }
        outcome
    }

    /// Loads the command without running it and returns its option schema.
    pub async fn help(&self) -> Result<Value, CliError> {
        self.transition(PipelineState::Loading);
        let outcome = match self.load_command(false).await {
            Ok(ctx) => serde_json::to_value(&ctx.conf)
                .context("failed to serialize command config")
                .map_err(CliError::from),
            Err(err) => Err(err),
        };
        self.transition(match outcome {
            Ok(_) => PipelineState::Done,
            Err(_) => PipelineState::Failed,
        });
        outcome
    }

    async fn run_pipeline(self: &Arc<Self>) -> Result<Value, CliError> {
        self.transition(PipelineState::Loading);
        self.emit_lifecycle("cli:go", None).await?;
        let ctx = self.load_command(true).await?;
        self.emit_lifecycle("cli:command-loaded", Some(&ctx)).await?;

        self.transition(PipelineState::Validating);
        self.validate(&ctx).await?;

        self.transition(PipelineState::Executing);
        self.execute(&ctx).await
    }

    fn transition(&self, next: PipelineState) {
        let mut state = lock(&self.state);
        tracing::debug!(command = %self.command, from = ?*state, to = ?next, "pipeline state");
        *state = next;
    }

    async fn load_command(&self, check_platform: bool) -> Result<CommandContext, CliError> {
        let command = self.commands.load(&self.command, &self.sdk, &self.version)?;
        let conf = command.module.config(self).await?;
        let mut ctx = CommandContext {
            command,
            conf,
            platform: None,
        };
        if check_platform && self.command == "build" {
            self.attach_platform(&mut ctx).await?;
        }
        Ok(ctx)
    }

    async fn attach_platform(&self, ctx: &mut CommandContext) -> Result<(), CliError> {
        let requested = lock(&self.argv).get_str("platform").map(str::to_string);
        let raw = match requested {
            Some(platform) => platform,
            None => self.choose_platform().await?,
        };
        let name = if raw == "ios" && !self.sdk.has_platform("ios") {
            "iphone".to_string()
        } else {
            raw
        };

        let Some(conf) = ctx.conf.platforms.get(&name).cloned() else {
            tracing::debug!(platform = %name, "command has no platform-specific config");
            return Ok(());
        };
        {
            let mut argv = lock(&self.argv);
            argv.set("platform", json!(name));
            argv.set(PLATFORM_KEY, json!(name));
        }
        self.hooks.scan_hooks(&self.sdk.platform_hooks_dir(&name));
        ctx.platform = Some(PlatformContext {
            path: self.sdk.path.join(&name),
            name,
            conf,
        });
        Ok(())
    }

    async fn choose_platform(&self) -> Result<String, CliError> {
        let mut choices: Vec<Choice> = self
            .sdk
            .manifest
            .platforms
            .iter()
            .map(|platform| Choice::titled(self.sdk.platform_title(platform), platform.clone()))
            .collect();
        choices.sort_by_cached_key(|choice| {
            let title = choice.message.clone().unwrap_or_default();
            (title.to_lowercase(), title)
        });

        let question = Question::select(
            "platform",
            "For which platform do you want to build?",
            choices,
        )
        .with_error("Missing required option \"platform\"");
        let answer = self.resolve(question).await?;
        match answer {
            Value::String(platform) => Ok(platform),
            other => Err(CliError::Other(anyhow::anyhow!(
                "Invalid platform value \"{}\"",
                display_value(&other)
            ))),
        }
    }

    async fn validate(&self, ctx: &CommandContext) -> Result<(), CliError> {
        self.emit_lifecycle("cli:pre-validate", Some(ctx)).await?;

        let mut options: Vec<PendingOption> = ctx
            .conf
            .options
            .iter()
            .chain(
                ctx.platform
                    .iter()
                    .flat_map(|platform| platform.conf.options.iter()),
            )
            .map(|(name, spec)| PendingOption {
                name: name.clone(),
                spec: spec.clone(),
                fired: false,
            })
            .collect();
        // ordered options first, ascending; the rest keep their place
        options.sort_by(|a, b| match (a.spec.order, b.spec.order) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });

        for opt in options.iter_mut() {
            let current = lock(&self.argv).get(&opt.name).cloned();
            match current {
                None => {
                    if opt.spec.required && verify_if_required(&opt.spec).await {
                        let error = format!("Missing required option \"{}\"", opt.name);
                        let answer = self.resolve(option_question(opt, error).await).await?;
                        self.set_arg(&opt.name, answer);
                    }
                }
                Some(value) if !opt.accepts(&value) => {
                    let error = format!("Invalid {} value \"{}\"", opt.name, display_value(&value));
                    let answer = self.resolve(option_question(opt, error).await).await?;
                    self.set_arg(&opt.name, answer);
                }
                Some(value) => {
                    let value = match &opt.spec.hooks.validate {
                        Some(validate) => match validate(value.clone()).await {
                            Ok(adjusted) => adjusted,
                            Err(err) => {
                                tracing::trace!(option = %opt.name, error = %err, "validation failed");
                                let error =
                                    format!("Invalid {} value \"{}\"", opt.name, display_value(&value));
                                self.resolve(option_question(opt, error).await).await?
                            }
                        },
                        None => value,
                    };
                    let value = opt.fire(value);
                    self.set_arg(&opt.name, value);
                }
            }
        }

        ctx.command.module.validate(self).await?;
        self.emit_lifecycle("cli:post-validate", Some(ctx)).await?;

        for opt in options.iter_mut().filter(|opt| !opt.fired) {
            let Some(callback) = opt.spec.hooks.callback.clone() else {
                continue;
            };
            let current = lock(&self.argv)
                .get(&opt.name)
                .cloned()
                .unwrap_or_else(|| json!(""));
            opt.fired = true;
            if let Some(value) = callback(current) {
                self.set_arg(&opt.name, value);
            }
        }
        Ok(())
    }

    async fn execute(self: &Arc<Self>, ctx: &CommandContext) -> Result<Value, CliError> {
        self.emit_lifecycle("cli:pre-execute", Some(ctx)).await?;
        *lock(&self.start_time) = Some(Instant::now());

        let name = &ctx.command.name;
        tracing::trace!(command = %name, "executing command");
        let outcome = match ctx.command.module.run(Arc::clone(self))? {
            RunEntry::Future(run) => run.await,
            RunEntry::Callback(start) => {
                let (done, rx) = RunEntry::done_channel();
                start(done);
                rx.await.unwrap_or_else(|_| {
                    Err(anyhow::anyhow!(
                        "Command \"{name}\" dropped its completion callback"
                    ))
                })
            }
            RunEntry::Detached(start) => {
                tracing::debug!(command = %name, "command does not have a finished callback");
                let activity = self.tunnel.activity();
                start();
                wait_for_quiet(activity).await;
                Ok(Value::Null)
            }
        };

        let mut payload = self.lifecycle_payload(Some(ctx));
        payload["err"] = match &outcome {
            Err(err) => json!(err.to_string()),
            Ok(_) => Value::Null,
        };
        payload["result"] = outcome.as_ref().ok().cloned().unwrap_or(Value::Null);
        // a failing post-execute hook outranks the command's own error
        self.hooks.emit(&["cli:post-execute"], payload).await?;
        outcome.map_err(CliError::from_anyhow)
    }

    async fn resolve(&self, question: Question) -> Result<Value, CliError> {
        if let Some(only) = question.sole_choice() {
            return Ok(only.clone());
        }
        self.ask(question).await
    }

    fn lifecycle_payload(&self, ctx: Option<&CommandContext>) -> Value {
        json!({
            "command": self.command,
            "argv": self.argv().to_value(),
            "platform": ctx.and_then(|ctx| ctx.platform.as_ref()).map(|platform| platform.name.clone()),
        })
    }

    /// Fires a lifecycle event; hooks may hand back adjusted arguments in `payload.argv`.
    async fn emit_lifecycle(&self, event: &str, ctx: Option<&CommandContext>) -> Result<(), CliError> {
        let before = self.argv();
        let data = self.hooks.emit(&[event], self.lifecycle_payload(ctx)).await?;
        if let Some(Value::Object(adjusted)) = data.payload.get("argv") {
            lock(&self.argv).apply_changes(&before, adjusted);
        }
        Ok(())
    }
}

struct PendingOption {
    name: String,
    spec: OptionSpec,
    fired: bool,
}

impl PendingOption {
    fn accepts(&self, value: &Value) -> bool {
        let Some(values) = self.spec.checked_values() else {
            return true;
        };
        let value = display_value(value);
        values.iter().any(|allowed| *allowed == value)
    }

    /// Applies the option's callback once; later calls are skipped by the caller.
    fn fire(&mut self, value: Value) -> Value {
        self.fired = true;
        match &self.spec.hooks.callback {
            Some(callback) => callback(value.clone()).unwrap_or(value),
            None => value,
        }
    }
}

async fn verify_if_required(spec: &OptionSpec) -> bool {
    match &spec.hooks.verify_if_required {
        Some(verify) => verify().await,
        None => true,
    }
}

async fn option_question(opt: &PendingOption, error: String) -> Question {
    if let Some(values) = opt.spec.checked_values() {
        let choices = values.iter().map(|value| Choice::value(value.clone())).collect();
        return Question::select(opt.name.clone(), format!("Please select a valid {}", opt.name), choices)
            .with_error(error);
    }
    if let Some(prompt) = &opt.spec.hooks.prompt {
        let mut question = prompt().await;
        if question.error.is_none() {
            question.error = Some(error);
        }
        return question;
    }
    Question::text(opt.name.clone(), format!("Please enter a valid {}", opt.name)).with_error(error)
}

async fn wait_for_quiet(mut activity: watch::Receiver<u64>) {
    while let Ok(Ok(())) = tokio::time::timeout(QUIET_PERIOD, activity.changed()).await {}
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
