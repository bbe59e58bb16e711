use serde_json::{json, Map, Value};

const IGNORE_DIRS: &str = r"^(\.svn|_svn|\.git|\.hg|\.?[Cc][Vv][Ss]|\.bzr|\$RECYCLE\.BIN)$";
const IGNORE_FILES: &str = r"^(\.gitignore|\.npmignore|\.cvsignore|\.DS_Store|\._.*|[Tt]humbs.db|\.vspscc|\.vssscc|\.sublime-project|\.sublime-workspace|\.project|\.tmproj)$";

/// Settings handed to legacy commands and hooks, layered over the legacy CLI defaults.
#[derive(Clone, Debug, PartialEq)]
pub struct LegacyConfig {
    root: Value,
}

impl LegacyConfig {
    pub fn new(user: Value) -> Self {
        let mut root = defaults();
        merge_deep(&mut root, user);
        Self { root }
    }

    /// Looks up a dotted key such as `cli.width`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        key.split('.')
            .filter(|part| !part.is_empty())
            .try_fold(&self.root, |node, part| node.get(part))
    }

    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).cloned().unwrap_or(default)
    }

    /// Sets a dotted key, creating intermediate objects and replacing non-object values on the way.
    pub fn set(&mut self, key: &str, value: Value) {
        let parts: Vec<&str> = key.split('.').filter(|part| !part.is_empty()).collect();
        let Some((last, parents)) = parts.split_last() else {
            return;
        };
        let mut node = &mut self.root;
        for part in parents {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            node = match node {
                Value::Object(map) => map
                    .entry(part.to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
                _ => return,
            };
        }
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        if let Value::Object(map) = node {
            map.insert(last.to_string(), value);
        }
    }

    /// Hook directories from `paths.hooks`, de-duplicated in order.
    pub fn hook_paths(&self) -> Vec<String> {
        let mut seen = Vec::new();
        let entries = self
            .get("paths.hooks")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect::<Vec<_>>())
            .unwrap_or_default();
        for entry in entries {
            if !seen.iter().any(|path: &String| path == entry) {
                seen.push(entry.to_string());
            }
        }
        seen
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }
}

fn defaults() -> Value {
    json!({
        "app": { "workspace": "" },
        "cli": {
            "colors": true,
            "completion": false,
            "logLevel": "trace",
            "prompt": true,
            "progressBars": true,
            "failOnWrongSDK": false,
            "httpProxyServer": "",
            "rejectUnauthorized": true,
            "width": 100,
            "ignoreDirs": IGNORE_DIRS,
            "ignoreFiles": IGNORE_FILES,
        },
        "paths": {
            "commands": [],
            "hooks": [],
            "modules": [],
            "plugins": [],
            "sdks": [],
            "templates": [],
        },
        "user": { "locale": "en_US" },
    })
}

/// Objects merge key by key; anything else replaces the target.
fn merge_deep(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_deep(existing, value)
                    }
                    _ => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (target, source) => *target = source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_settings_merge_over_defaults() {
        let config = LegacyConfig::new(json!({
            "cli": { "width": 80 },
            "paths": { "hooks": ["/opt/hooks"] },
            "android": { "sdkPath": "/opt/android" },
        }));
        assert_eq!(config.get("cli.width"), Some(&json!(80)));
        assert_eq!(config.get("cli.colors"), Some(&json!(true)));
        assert_eq!(config.get("user.locale"), Some(&json!("en_US")));
        assert_eq!(config.get("android.sdkPath"), Some(&json!("/opt/android")));
        assert_eq!(config.get("paths.hooks"), Some(&json!(["/opt/hooks"])));
    }

    #[test]
    fn null_user_config_keeps_defaults() {
        let config = LegacyConfig::new(Value::Null);
        assert_eq!(config.get("cli.logLevel"), Some(&json!("trace")));
        assert!(config.get("cli.missing").is_none());
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut config = LegacyConfig::new(Value::Null);
        config.set("android.sdkPath", json!("/sdk"));
        config.set("app.workspace.nested", json!(1));
        assert_eq!(config.get("android.sdkPath"), Some(&json!("/sdk")));
        assert_eq!(config.get("app.workspace.nested"), Some(&json!(1)));
        assert_eq!(config.get_or("app.idprefix", json!("com")), json!("com"));
    }

    #[test]
    fn hook_paths_are_unique() {
        let config = LegacyConfig::new(json!({
            "paths": { "hooks": ["/a", "/b", "/a", 3] }
        }));
        assert_eq!(config.hook_paths(), vec!["/a".to_string(), "/b".to_string()]);
    }
}
