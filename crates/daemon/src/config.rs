use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BOOTSTRAP_NAME: &str = "titanium-legacy-bootstrap";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(crate) struct DaemonConfig {
    pub(crate) bootstrap: Option<PathBuf>,
    #[serde(default)]
    pub(crate) sdk_paths: Vec<String>,
    pub(crate) default_sdk: Option<String>,
    call_timeout: Option<String>,
    pub(crate) log_dir: Option<String>,
    /// Settings handed to the legacy CLI as its config.
    #[serde(default)]
    pub(crate) titanium: Value,
    #[serde(default)]
    pub(crate) accounts: Vec<AccountConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(crate) struct AccountConfig {
    pub(crate) name: String,
    pub(crate) email: Option<String>,
    pub(crate) org: Option<String>,
    #[serde(default)]
    pub(crate) active: bool,
}

impl DaemonConfig {
    pub(crate) fn call_timeout(&self) -> anyhow::Result<Option<Duration>> {
        self.call_timeout
            .as_deref()
            .map(|raw| {
                humantime::parse_duration(raw)
                    .with_context(|| format!("invalid call-timeout \"{raw}\""))
            })
            .transpose()
    }

    /// The configured bootstrap, or the one installed next to this executable.
    pub(crate) fn bootstrap_path(&self) -> PathBuf {
        if let Some(path) = &self.bootstrap {
            return expand_tilde(&path.to_string_lossy());
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(BOOTSTRAP_NAME)))
            .unwrap_or_else(|| PathBuf::from(BOOTSTRAP_NAME))
    }

    pub(crate) fn sdk_roots(&self) -> Vec<PathBuf> {
        self.sdk_paths.iter().map(|path| expand_tilde(path)).collect()
    }

    pub(crate) fn log_dir(&self) -> Option<PathBuf> {
        self.log_dir.as_deref().map(expand_tilde)
    }
}

/// Reads the daemon config. A missing file yields the defaults.
pub(crate) fn load_daemon_config(path: &Path) -> anyhow::Result<DaemonConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(DaemonConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse_daemon_config(&raw).with_context(|| format!("failed to parse config {}", path.display()))
}

fn parse_daemon_config(raw: &str) -> anyhow::Result<DaemonConfig> {
    let config: DaemonConfig = toml::from_str(raw)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &DaemonConfig) -> anyhow::Result<()> {
    config.call_timeout()?;
    if !config.titanium.is_null() && !config.titanium.is_object() {
        anyhow::bail!("[titanium] must be a table");
    }
    if config.sdk_paths.iter().any(|path| path.trim().is_empty()) {
        anyhow::bail!("sdk-paths entries must not be empty");
    }
    let mut names = HashSet::new();
    for account in &config.accounts {
        if account.name.trim().is_empty() {
            anyhow::bail!("account name must not be empty");
        }
        if !names.insert(account.name.as_str()) {
            anyhow::bail!("duplicate account \"{}\"", account.name);
        }
    }
    if config.accounts.iter().filter(|account| account.active).count() > 1 {
        anyhow::bail!("at most one account can be active");
    }
    Ok(())
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home);
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_full_config() {
        let config = parse_daemon_config(
            r#"
bootstrap = "/opt/titanium/bin/titanium-legacy-bootstrap"
sdk-paths = ["/opt/titanium/mobilesdk/linux"]
default-sdk = "9.0.3.GA"
call-timeout = "30s"
log-dir = "/var/log/titanium"

[titanium.cli]
logLevel = "debug"

[titanium.paths]
hooks = ["/opt/titanium/hooks"]

[[accounts]]
name = "dev@example.com"
email = "dev@example.com"
org = "Example"
active = true

[[accounts]]
name = "ci"
"#,
        )
        .expect("config");
        assert_eq!(config.call_timeout().expect("timeout"), Some(Duration::from_secs(30)));
        assert_eq!(config.default_sdk.as_deref(), Some("9.0.3.GA"));
        assert_eq!(config.titanium["cli"]["logLevel"], json!("debug"));
        assert_eq!(config.accounts.len(), 2);
        assert!(config.accounts[0].active);
        assert_eq!(
            config.bootstrap_path(),
            PathBuf::from("/opt/titanium/bin/titanium-legacy-bootstrap")
        );
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_daemon_config(&dir.path().join("absent.toml")).expect("defaults");
        assert!(config.sdk_paths.is_empty());
        assert!(config.titanium.is_null());
        assert_eq!(config.call_timeout().expect("timeout"), None);
    }

    #[test]
    fn rejects_invalid_values() {
        let err = parse_daemon_config("call-timeout = \"soon\"").expect_err("bad timeout");
        assert!(err.to_string().contains("call-timeout"));

        let err = parse_daemon_config("[[accounts]]\nname = \"a\"\n[[accounts]]\nname = \"a\"\n")
            .expect_err("duplicate");
        assert!(err.to_string().contains("duplicate account"));

        let err = parse_daemon_config(
            "[[accounts]]\nname = \"a\"\nactive = true\n[[accounts]]\nname = \"b\"\nactive = true\n",
        )
        .expect_err("two active");
        assert!(err.to_string().contains("at most one"));

        assert!(parse_daemon_config("listen-addr = \"127.0.0.1:1\"").is_err());
    }
}
