use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct SdkManifest {
    pub version: String,
    #[serde(default)]
    pub platforms: Vec<String>,
}

/// An installed SDK tree rooted at `path`.
#[derive(Clone, Debug)]
pub struct Sdk {
    pub path: PathBuf,
    pub manifest: SdkManifest,
}

impl Sdk {
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let manifest_path = path.join("manifest.json");
        let raw = std::fs::read_to_string(&manifest_path)
            .with_context(|| format!("failed to read SDK manifest {}", manifest_path.display()))?;
        let manifest: SdkManifest = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse SDK manifest {}", manifest_path.display()))?;
        Ok(Self { path, manifest })
    }

    pub fn has_platform(&self, name: &str) -> bool {
        self.manifest.platforms.iter().any(|platform| platform == name)
    }

    /// Display title from `<platform>/package.json`, or the platform name.
    pub fn platform_title(&self, platform: &str) -> String {
        let package = self.path.join(platform).join("package.json");
        std::fs::read_to_string(package)
            .ok()
            .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
            .and_then(|json| json.get("title").and_then(Value::as_str).map(str::to_string))
            .filter(|title| !title.is_empty())
            .unwrap_or_else(|| platform.to_string())
    }

    pub fn command_descriptor(&self, name: &str) -> PathBuf {
        self.path.join("cli").join("commands").join(format!("{name}.toml"))
    }

    pub fn hooks_dir(&self) -> PathBuf {
        self.path.join("cli").join("hooks")
    }

    pub fn platform_hooks_dir(&self, platform: &str) -> PathBuf {
        self.path.join(platform).join("cli").join("hooks")
    }

    /// The directory the SDK is installed under, three levels up from the SDK itself.
    pub fn install_path(&self) -> PathBuf {
        let mut path: &Path = &self.path;
        for _ in 0..3 {
            path = path.parent().unwrap_or(path);
        }
        path.to_path_buf()
    }
}

/// Host details reported to legacy commands.
pub trait PlatformInfo: Send + Sync {
    fn os_name(&self) -> String;
    fn os_version(&self) -> String;
    fn arch(&self) -> String;
    fn cpus(&self) -> usize;
    fn memory(&self) -> u64;

    fn env_info(&self) -> Value {
        json!({
            "os": self.os_name(),
            "osver": self.os_version(),
            "ostype": self.arch(),
            "oscpu": self.cpus(),
            "memory": self.memory(),
        })
    }
}

/// Reads host details from the running system.
pub struct SystemPlatformInfo;

impl PlatformInfo for SystemPlatformInfo {
    fn os_name(&self) -> String {
        match std::env::consts::OS {
            "macos" => "osx".to_string(),
            other => other.to_string(),
        }
    }

    fn os_version(&self) -> String {
        std::fs::read_to_string("/proc/sys/kernel/osrelease")
            .map(|release| release.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    fn arch(&self) -> String {
        match std::env::consts::ARCH {
            "x86_64" | "aarch64" => "64bit".to_string(),
            _ => "32bit".to_string(),
        }
    }

    fn cpus(&self) -> usize {
        std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1)
    }

    fn memory(&self) -> u64 {
        std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|meminfo| {
                meminfo.lines().find_map(|line| {
                    let kb = line.strip_prefix("MemTotal:")?.trim().strip_suffix("kB")?;
                    kb.trim().parse::<u64>().ok()
                })
            })
            .map(|kb| kb * 1024)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_sdk(root: &Path) {
        std::fs::write(
            root.join("manifest.json"),
            r#"{ "version": "9.0.3", "platforms": ["android", "iphone"] }"#,
        )
        .expect("manifest");
        std::fs::create_dir_all(root.join("iphone")).expect("platform dir");
        std::fs::write(root.join("iphone/package.json"), r#"{ "title": "iOS" }"#)
            .expect("package.json");
    }

    #[test]
    fn loads_manifest_and_titles() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_sdk(dir.path());
        let sdk = Sdk::load(dir.path()).expect("sdk");
        assert_eq!(sdk.manifest.version, "9.0.3");
        assert!(sdk.has_platform("android"));
        assert!(!sdk.has_platform("ios"));
        assert_eq!(sdk.platform_title("iphone"), "iOS");
        assert_eq!(sdk.platform_title("android"), "android");
        assert!(sdk
            .command_descriptor("build")
            .ends_with("cli/commands/build.toml"));
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Sdk::load(dir.path()).expect_err("missing manifest");
        assert!(err.to_string().contains("manifest.json"));
    }

    struct Fixed;

    impl PlatformInfo for Fixed {
        fn os_name(&self) -> String {
            "linux".into()
        }
        fn os_version(&self) -> String {
            "6.1".into()
        }
        fn arch(&self) -> String {
            "64bit".into()
        }
        fn cpus(&self) -> usize {
            8
        }
        fn memory(&self) -> u64 {
            1024
        }
    }

    #[test]
    fn env_info_uses_injected_provider() {
        assert_eq!(
            Fixed.env_info(),
            json!({ "os": "linux", "osver": "6.1", "ostype": "64bit", "oscpu": 8, "memory": 1024 })
        );
    }
}
