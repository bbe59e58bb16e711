//! Front end for the legacy `build`, `clean` and `run` commands.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use legacy_tunnel::{ExecMode, LegacySpawner, OutputMode, Prompter, ServiceDispatcher};
use regex::Regex;
use serde_json::{json, Map, Value};
use tunnel_protocol::ExecRequest;

use crate::cli::LegacyArgs;
use crate::config::DaemonConfig;
use crate::prompt::TerminalPrompter;
use crate::services::SDK_FIND;

/// A titled block of `(usage, description)` lines for the build help screen.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OptionGroup {
    pub(crate) title: String,
    pub(crate) entries: Vec<(String, String)>,
}

pub(crate) struct LegacyRunner {
    spawner: LegacySpawner,
    services: Arc<dyn ServiceDispatcher>,
    config: Arc<DaemonConfig>,
    option_cache: Mutex<HashMap<String, Vec<OptionGroup>>>,
}

impl LegacyRunner {
    pub(crate) fn new(
        spawner: LegacySpawner,
        services: Arc<dyn ServiceDispatcher>,
        config: Arc<DaemonConfig>,
    ) -> Self {
        Self {
            spawner,
            services,
            config,
            option_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Runs one legacy command for the project and returns the command's result.
    pub(crate) async fn exec(&self, command: &str, args: LegacyArgs) -> anyhow::Result<Option<Value>> {
        let cwd = std::env::current_dir().context("failed to read the current directory")?;
        let project_dir = resolve_project_dir(args.project_dir.as_deref(), &cwd)?;
        let sdk_name = match args.sdk.clone() {
            Some(sdk) => sdk,
            None => self.project_sdk(&project_dir)?,
        };
        let sdk_path = self.find_sdk(&sdk_name).await?;
        let argv = legacy_argv(command, &project_dir, &args)?;

        let prompting_enabled = !args.no_prompt;
        let request = ExecRequest {
            argv,
            command: command.to_string(),
            config: self.config.titanium.clone(),
            cwd: Some(project_dir),
            sdk_path,
            prompting_enabled,
        };
        let prompter: Option<Arc<dyn Prompter>> = if prompting_enabled {
            Some(Arc::new(TerminalPrompter::stdio()))
        } else {
            None
        };
        tracing::info!(command, sdk = %sdk_name, "running legacy command");
        let result = self
            .spawner
            .run(ExecMode::Exec, request, prompter, OutputMode::inherit())
            .await?;
        Ok(result)
    }

    /// Platform build options of an SDK, fetched once per platform and SDK path.
    pub(crate) async fn build_options(
        &self,
        platform: Option<&str>,
        sdk: Option<&str>,
    ) -> anyhow::Result<Vec<OptionGroup>> {
        let sdk_name = match sdk {
            Some(sdk) => sdk.to_string(),
            None => self
                .config
                .default_sdk
                .clone()
                .context("no SDK given and no default-sdk configured")?,
        };
        let sdk_path = self.find_sdk(&sdk_name).await?;
        let cache_key = format!("{}|{}", platform.unwrap_or_default(), sdk_path.display());
        if let Some(groups) = self.cache().get(&cache_key) {
            return Ok(groups.clone());
        }

        tracing::debug!(
            platform = platform.unwrap_or("all platforms"),
            sdk = %sdk_path.display(),
            "fetching build help"
        );
        let request = ExecRequest {
            command: "build".to_string(),
            config: self.config.titanium.clone(),
            sdk_path,
            ..ExecRequest::default()
        };
        let config = self
            .spawner
            .run(ExecMode::Help, request, None, OutputMode::Log)
            .await?
            .context("the legacy CLI returned no build help")?;
        let groups = collect_build_options(&config, platform);
        self.cache().insert(cache_key, groups.clone());
        Ok(groups)
    }

    async fn find_sdk(&self, name: &str) -> anyhow::Result<PathBuf> {
        let info = self
            .services
            .call(SDK_FIND, json!({ "name": name }))
            .await
            .with_context(|| format!("failed to locate Titanium SDK \"{name}\""))?;
        info.get("path")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .with_context(|| format!("SDK lookup for \"{name}\" returned no path"))
    }

    fn project_sdk(&self, project_dir: &Path) -> anyhow::Result<String> {
        if let Some(version) = read_sdk_version(&project_dir.join("tiapp.xml"))? {
            return Ok(version);
        }
        self.config
            .default_sdk
            .clone()
            .context("tiapp.xml does not name an sdk-version and no default-sdk is configured")
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<OptionGroup>>> {
        self.option_cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The project directory, which must contain a `tiapp.xml`.
pub(crate) fn resolve_project_dir(project_dir: Option<&Path>, cwd: &Path) -> anyhow::Result<PathBuf> {
    let dir = match project_dir {
        Some(dir) if dir.is_absolute() => dir.to_path_buf(),
        Some(dir) => cwd.join(dir),
        None => cwd.to_path_buf(),
    };
    if !dir.join("tiapp.xml").is_file() {
        anyhow::bail!("Invalid project directory {}", dir.display());
    }
    Ok(dir)
}

pub(crate) fn read_sdk_version(tiapp: &Path) -> anyhow::Result<Option<String>> {
    let raw = std::fs::read_to_string(tiapp)
        .with_context(|| format!("failed to read {}", tiapp.display()))?;
    let pattern = Regex::new(r"<sdk-version>\s*([^<]+?)\s*</sdk-version>")?;
    Ok(pattern
        .captures(&raw)
        .and_then(|captures| captures.get(1))
        .map(|version| version.as_str().to_string()))
}

/// Arguments handed to the child. The platform goes through as typed; the child owns its
/// normalization.
fn legacy_argv(command: &str, project_dir: &Path, args: &LegacyArgs) -> anyhow::Result<Map<String, Value>> {
    let mut argv = Map::new();
    argv.insert("projectDir".into(), json!(project_dir));
    if let Some(platform) = &args.platform {
        argv.insert("platform".into(), json!(platform));
    }
    if command == "build" {
        argv.insert("buildOnly".into(), Value::Bool(true));
    }
    for raw in &args.args {
        let (key, value) = parse_extra_arg(raw)?;
        argv.insert(key, value);
    }
    Ok(argv)
}

/// `key=value`; the value is taken as JSON when it parses, otherwise as a string.
fn parse_extra_arg(raw: &str) -> anyhow::Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("expected key=value, got \"{raw}\""))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("missing argument name in \"{raw}\"");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Flattens the `help` output into option groups, one per platform plus one for LiveView.
pub(crate) fn collect_build_options(config: &Value, platform: Option<&str>) -> Vec<OptionGroup> {
    let liveview = Regex::new("^liveview").ok();
    let is_liveview = |name: &str| liveview.as_ref().is_some_and(|re| re.is_match(name));
    let mut groups = Vec::new();
    let mut lv = Vec::new();

    let platforms = config.get("platforms").and_then(Value::as_object);
    for (name, conf) in platforms.into_iter().flatten() {
        if platform.is_some_and(|wanted| !names_platform(wanted, name, conf)) {
            continue;
        }
        let mut entries = Vec::new();
        for (flag, spec) in entries_of(conf, "flags") {
            let entry = (format!("--{flag}"), capitalize(desc_of(spec)));
            if is_liveview(flag.as_str()) {
                lv.push(entry);
            } else {
                entries.push(entry);
            }
        }
        for (option, spec) in entries_of(conf, "options") {
            let mut usage = spec
                .get("abbr")
                .and_then(Value::as_str)
                .map(|abbr| format!("-{abbr}, "))
                .unwrap_or_default();
            let hint = spec.get("hint").and_then(Value::as_str).unwrap_or("value");
            usage.push_str(&format!("--{option} [{hint}]"));
            let entry = (usage, capitalize(desc_of(spec)));
            if is_liveview(option.as_str()) {
                lv.push(entry);
            } else {
                entries.push(entry);
            }
        }
        if !entries.is_empty() {
            let title = conf.get("title").and_then(Value::as_str).unwrap_or(name);
            groups.push(OptionGroup {
                title: format!("{title} build options"),
                entries,
            });
        }
    }
    if !lv.is_empty() {
        groups.push(OptionGroup {
            title: "LiveView Options".to_string(),
            entries: lv,
        });
    }
    groups
}

/// Matches a platform by its key or, ignoring case, by its title (`ios` picks `iphone`).
fn names_platform(wanted: &str, name: &str, conf: &Value) -> bool {
    wanted == name
        || conf
            .get("title")
            .and_then(Value::as_str)
            .is_some_and(|title| title.eq_ignore_ascii_case(wanted))
}

/// Non-hidden entries of a `flags`/`options` table.
fn entries_of<'a>(conf: &'a Value, key: &str) -> impl Iterator<Item = (&'a String, &'a Value)> {
    conf.get(key)
        .and_then(Value::as_object)
        .into_iter()
        .flatten()
        .filter(|(_, spec)| !spec.get("hidden").and_then(Value::as_bool).unwrap_or(false))
}

fn desc_of(spec: &Value) -> &str {
    spec.get("desc").and_then(Value::as_str).unwrap_or_default()
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_dir_needs_tiapp() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = resolve_project_dir(None, dir.path()).expect_err("no tiapp");
        assert!(err.to_string().contains("Invalid project directory"));

        std::fs::create_dir_all(dir.path().join("app")).expect("app dir");
        std::fs::write(
            dir.path().join("app/tiapp.xml"),
            "<ti:app>\n  <sdk-version> 9.0.3.GA </sdk-version>\n</ti:app>\n",
        )
        .expect("tiapp");
        let resolved = resolve_project_dir(Some(Path::new("app")), dir.path()).expect("project");
        assert_eq!(resolved, dir.path().join("app"));
        assert_eq!(
            read_sdk_version(&resolved.join("tiapp.xml")).expect("read"),
            Some("9.0.3.GA".to_string())
        );
    }

    #[test]
    fn extra_args_parse_json_values() {
        assert_eq!(
            parse_extra_arg("deployType=development").expect("arg"),
            ("deployType".to_string(), json!("development"))
        );
        assert_eq!(parse_extra_arg("skipJsMinify=true").expect("arg").1, json!(true));
        assert_eq!(parse_extra_arg("port=8080").expect("arg").1, json!(8080));
        assert!(parse_extra_arg("novalue").is_err());
        assert!(parse_extra_arg("=1").is_err());
    }

    #[test]
    fn build_options_follow_the_help_schema() {
        let config = json!({
            "flags": { "build-only": { "desc": "only build" } },
            "platforms": {
                "android": {
                    "title": "Android",
                    "flags": {
                        "liveview": { "desc": "enable LiveView" },
                        "secret": { "desc": "hidden", "hidden": true }
                    },
                    "options": {
                        "target": { "abbr": "T", "desc": "the target to build for", "hint": "value" },
                        "keystore": { "desc": "the location of the keystore", "hint": "path" }
                    }
                },
                "iphone": {
                    "title": "iOS",
                    "options": { "device-id": { "abbr": "C", "desc": "the udid" } }
                }
            }
        });

        let groups = collect_build_options(&config, None);
        assert_eq!(
            groups,
            vec![
                OptionGroup {
                    title: "Android build options".into(),
                    entries: vec![
                        ("--keystore [path]".into(), "The location of the keystore".into()),
                        ("-T, --target [value]".into(), "The target to build for".into()),
                    ],
                },
                OptionGroup {
                    title: "iOS build options".into(),
                    entries: vec![("-C, --device-id [value]".into(), "The udid".into())],
                },
                OptionGroup {
                    title: "LiveView Options".into(),
                    entries: vec![("--liveview".into(), "Enable LiveView".into())],
                },
            ]
        );

        let only_ios = collect_build_options(&config, Some("iphone"));
        assert_eq!(only_ios.len(), 1);
        assert_eq!(only_ios[0].title, "iOS build options");
        assert_eq!(collect_build_options(&config, Some("ios")), only_ios);
    }

    #[test]
    fn platform_is_passed_to_the_child_as_typed() {
        let args = LegacyArgs {
            platform: Some("ios".into()),
            args: vec!["target=simulator".into()],
            ..LegacyArgs::default()
        };
        let argv = legacy_argv("build", Path::new("/work/app"), &args).expect("argv");
        assert_eq!(argv["platform"], json!("ios"));
        assert_eq!(argv["projectDir"], json!("/work/app"));
        assert_eq!(argv["buildOnly"], json!(true));
        assert_eq!(argv["target"], json!("simulator"));

        let argv = legacy_argv("clean", Path::new("/work/app"), &LegacyArgs::default()).expect("argv");
        assert!(!argv.contains_key("buildOnly"));
        assert!(!argv.contains_key("platform"));
    }
}
