use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::PoisonError;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use serde::Deserialize;
use tokio::process::Command;

use super::{HookData, HookFn, HookRegistry, HookResult, HookSpec, Phase};

const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of every directory scanned so far.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScanReport {
    pub loaded: Vec<PathBuf>,
    pub incompatible: Vec<PathBuf>,
    pub errored: Vec<PathBuf>,
    pub errors: HashMap<PathBuf, String>,
    /// Every manifest seen per plugin id, including duplicates that were skipped.
    pub ids: HashMap<String, Vec<(PathBuf, Option<String>)>>,
}

#[derive(Default)]
pub(super) struct ScanState {
    report: ScanReport,
    scanned: HashSet<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct HookManifest {
    id: Option<String>,
    version: Option<String>,
    cli_version: Option<String>,
    #[serde(default)]
    hooks: Vec<ScriptHookSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ScriptHookSpec {
    event: String,
    #[serde(default = "default_phase")]
    phase: Phase,
    priority: Option<i64>,
    command: String,
    timeout: Option<String>,
}

fn default_phase() -> Phase {
    Phase::Post
}

enum Loaded {
    Registered,
    Incompatible,
    Duplicate,
}

impl HookRegistry {
    /// Loads hook manifests (`*.toml`) from `dir`, or from `dir` itself when it is a file.
    ///
    /// Each directory is scanned once. A missing directory is skipped quietly; a manifest that
    /// fails to load is recorded in the report and does not stop the scan.
    pub fn scan_hooks(&self, dir: &Path) {
        let dir = expand_home(dir);
        tracing::trace!(dir = %dir.display(), "scanning hooks");
        {
            let mut state = self.scan.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.scanned.insert(dir.clone()) {
                return;
            }
        }

        let files = match list_candidates(&dir) {
            Ok(files) => files,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                tracing::trace!(dir = %dir.display(), error = %err, "error scanning hooks");
                return;
            }
        };

        for file in files {
            let started = Instant::now();
            match self.load_manifest(&file) {
                Ok(Loaded::Registered) => {
                    tracing::trace!(
                        file = %file.display(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "loaded CLI hook"
                    );
                    self.record(|report| report.loaded.push(file.clone()));
                }
                Ok(Loaded::Incompatible) => {
                    self.record(|report| report.incompatible.push(file.clone()));
                }
                Ok(Loaded::Duplicate) => {}
                Err(err) => {
                    tracing::trace!(file = %file.display(), error = %format!("{err:#}"), "error loading hook");
                    self.record(|report| {
                        report.errored.push(file.clone());
                        report.errors.insert(file.clone(), format!("{err:#}"));
                    });
                }
            }
        }
    }

    pub fn scan_report(&self) -> ScanReport {
        self.scan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .report
            .clone()
    }

    fn record(&self, update: impl FnOnce(&mut ScanReport)) {
        let mut state = self.scan.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut state.report);
    }

    fn load_manifest(&self, file: &Path) -> anyhow::Result<Loaded> {
        let raw = std::fs::read_to_string(file)
            .with_context(|| format!("failed to read hook manifest {}", file.display()))?;
        let manifest: HookManifest = toml::from_str(&raw)
            .with_context(|| format!("failed to parse hook manifest {}", file.display()))?;

        if let Some(id) = &manifest.id {
            let mut state = self.scan.lock().unwrap_or_else(PoisonError::into_inner);
            let seen = state.report.ids.entry(id.clone()).or_default();
            seen.push((file.to_path_buf(), manifest.version.clone()));
            if seen.len() > 1 {
                tracing::debug!(id, file = %file.display(), "skipping hook with duplicate id");
                return Ok(Loaded::Duplicate);
            }
        }

        if let Some(range) = &manifest.cli_version {
            let range = semver::VersionReq::parse(range)
                .with_context(|| format!("invalid cli-version \"{range}\""))?;
            if !range.matches(&self.cli_version) {
                return Ok(Loaded::Incompatible);
            }
        }

        let base = file.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        let mut hooks = Vec::with_capacity(manifest.hooks.len());
        for spec in manifest.hooks {
            hooks.push(ScriptHook::from_spec(spec, &base)?);
        }
        for (event, phase, priority, hook) in hooks {
            let hook = HookFn::from(hook);
            let spec = match phase {
                Phase::Pre => HookSpec::pre(hook),
                Phase::Post => HookSpec::post(hook),
            };
            self.on(&event, HookSpec { priority, ..spec });
        }
        Ok(Loaded::Registered)
    }
}

/// An external program run as a hook: the hook data arrives as JSON on stdin and replacement
/// data may come back as JSON on stdout.
#[derive(Clone, Debug)]
struct ScriptHook {
    program: PathBuf,
    args: Vec<String>,
    cwd: PathBuf,
    timeout: Duration,
    label: String,
}

impl ScriptHook {
    fn from_spec(
        spec: ScriptHookSpec,
        base: &Path,
    ) -> anyhow::Result<(String, Phase, Option<i64>, ScriptHook)> {
        let mut words = shell_words::split(&spec.command)
            .with_context(|| format!("invalid command for \"{}\" hook", spec.event))?
            .into_iter();
        let Some(program) = words.next() else {
            bail!("empty command for \"{}\" hook", spec.event);
        };
        let program = if program.starts_with("./") || program.starts_with("../") {
            base.join(program)
        } else {
            PathBuf::from(program)
        };
        let timeout = match &spec.timeout {
            Some(raw) => humantime::parse_duration(raw)
                .with_context(|| format!("invalid timeout \"{raw}\" for \"{}\" hook", spec.event))?,
            None => DEFAULT_HOOK_TIMEOUT,
        };
        let hook = ScriptHook {
            label: format!("{} hook {}", spec.event, program.display()),
            program,
            args: words.collect(),
            cwd: base.to_path_buf(),
            timeout,
        };
        Ok((spec.event, spec.phase, spec.priority, hook))
    }

    async fn run(&self, data: HookData) -> HookResult {
        let input = serde_json::to_vec(&data)?;
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.cwd)
            .env("LEGACY_HOOK_EVENT", &data.event);
        let output =
            system_utils::run_command_with_input(&mut cmd, &input, self.timeout, &self.label).await?;
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.label,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(None);
        }
        let data = serde_json::from_str(stdout)
            .with_context(|| format!("{} printed invalid hook data", self.label))?;
        Ok(Some(data))
    }
}

impl From<ScriptHook> for HookFn {
    fn from(hook: ScriptHook) -> Self {
        HookFn::simple(move |data| {
            let hook = hook.clone();
            async move { hook.run(data).await }
        })
    }
}

fn list_candidates(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let meta = std::fs::metadata(dir)?;
    let mut files = if meta.is_dir() {
        std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .collect::<Vec<_>>()
    } else {
        vec![dir.to_path_buf()]
    };
    files.sort();
    files.retain(|file| is_manifest(file));
    Ok(files)
}

fn is_manifest(file: &Path) -> bool {
    let ignored_parent = file
        .parent()
        .and_then(Path::file_name)
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.') || name.starts_with('_'));
    file.is_file() && file.extension().is_some_and(|ext| ext == "toml") && !ignored_parent
}

fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn registry() -> HookRegistry {
        HookRegistry::new(semver::Version::new(5, 999, 0))
    }

    fn write(path: &Path, body: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, body).expect("write");
    }

    #[test]
    fn duplicate_ids_load_once_and_incompatible_are_recorded() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(
            &dir.path().join("a.toml"),
            "id = \"liveview\"\nversion = \"1.0.0\"\n[[hooks]]\nevent = \"build.config\"\ncommand = \"true\"\n",
        );
        write(
            &dir.path().join("b.toml"),
            "id = \"liveview\"\nversion = \"2.0.0\"\n[[hooks]]\nevent = \"build.config\"\ncommand = \"true\"\n",
        );
        write(
            &dir.path().join("c.toml"),
            "cli-version = \">=6.0.0\"\n[[hooks]]\nevent = \"cli:go\"\ncommand = \"true\"\n",
        );
        write(&dir.path().join("d.toml"), "hooks = 3\n");
        write(&dir.path().join("notes.txt"), "ignored");

        let hooks = registry();
        hooks.scan_hooks(dir.path());
        let report = hooks.scan_report();

        assert_eq!(report.loaded, vec![dir.path().join("a.toml")]);
        assert_eq!(report.incompatible, vec![dir.path().join("c.toml")]);
        assert_eq!(report.errored, vec![dir.path().join("d.toml")]);
        assert_eq!(report.ids["liveview"].len(), 2);
        assert!(hooks.has_hooks("build.config"));
        assert!(!hooks.has_hooks("cli:go"));
    }

    #[test]
    fn missing_directories_and_rescans_are_quiet() {
        let hooks = registry();
        hooks.scan_hooks(Path::new("/definitely/not/here"));
        hooks.scan_hooks(Path::new("/definitely/not/here"));
        assert_eq!(hooks.scan_report(), ScanReport::default());
    }

    #[test]
    fn hidden_and_underscore_directories_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let hidden = dir.path().join("_disabled");
        write(
            &hidden.join("hook.toml"),
            "[[hooks]]\nevent = \"cli:go\"\ncommand = \"true\"\n",
        );
        let hooks = registry();
        hooks.scan_hooks(&hidden);
        assert!(hooks.scan_report().loaded.is_empty());
    }

    #[tokio::test]
    async fn script_hooks_exchange_json_over_stdio() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(
            &dir.path().join("hook.sh"),
            "cat >/dev/null\nprintf '%s' '{\"type\":\"build.pre.compile\",\"payload\":\"from script\"}'\n",
        );
        write(
            &dir.path().join("rename.toml"),
            r#"
[[hooks]]
event = "build.pre.compile"
phase = "pre"
priority = 10
command = "sh ./hook.sh"
timeout = "5s"
"#,
        );
        let hooks = registry();
        hooks.scan_hooks(dir.path());
        assert_eq!(hooks.scan_report().errored, Vec::<PathBuf>::new());

        let data = hooks
            .emit(&["build.pre.compile"], json!("original"))
            .await
            .expect("emit");
        assert_eq!(data.payload, json!("from script"));
    }

    #[tokio::test]
    async fn failing_script_fails_the_chain() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(
            &dir.path().join("fail.toml"),
            "[[hooks]]\nevent = \"cli:go\"\ncommand = \"sh -c 'echo nope >&2; exit 4'\"\n",
        );
        let hooks = registry();
        hooks.scan_hooks(dir.path());
        let err = hooks.emit(&["cli:go"], json!({})).await.expect_err("script failed");
        assert!(err.to_string().contains("nope"));
    }
}
