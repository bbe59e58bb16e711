use serde_json::{Map, Value};

pub const COMMAND_KEY: &str = "$command";
pub const PLATFORM_KEY: &str = "$platform";

/// Parsed command arguments as legacy commands expect them.
///
/// Every key is stored in both spellings (`projectDir` and `project-dir`) and the two always
/// hold the same value, since option schemas use the dashed spelling and commands read camelCase.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Argv {
    values: Map<String, Value>,
}

impl Argv {
    pub fn new(command: &str, input: Map<String, Value>) -> Self {
        let mut argv = Self::default();
        argv.values
            .insert(COMMAND_KEY.to_string(), Value::String(command.to_string()));
        for (key, value) in input {
            argv.set(&key, value);
        }
        argv
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values
            .get(name)
            .or_else(|| self.values.get(&dashed(name)))
            .filter(|value| !value.is_null())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn set(&mut self, name: &str, value: Value) {
        for alias in [dashed(name), camel(name)] {
            if alias != name {
                self.values.insert(alias, value.clone());
            }
        }
        self.values.insert(name.to_string(), value);
    }

    /// Applies the keys of `adjusted` whose value differs from `before`.
    ///
    /// Unchanged twins are skipped so they can't overwrite a changed spelling of the same key.
    pub fn apply_changes(&mut self, before: &Argv, adjusted: &Map<String, Value>) {
        for (key, value) in adjusted {
            if before.values.get(key) != Some(value) {
                self.set(key, value.clone());
            }
        }
    }

    pub fn command(&self) -> &str {
        self.get_str(COMMAND_KEY).unwrap_or_default()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }
}

/// `projectDir` -> `project-dir`
pub fn dashed(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for ch in name.chars() {
        if ch.is_ascii_uppercase() {
            out.push('-');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// `project-dir` -> `projectDir`
pub fn camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut chars = name.chars().peekable();
    while let Some(ch) = chars.next() {
        match chars.peek() {
            Some(next) if ch == '-' && !out.is_empty() && next.is_ascii_lowercase() => {
                out.push(next.to_ascii_uppercase());
                chars.next();
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Renders an argument value the way it appears in messages.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn camel_case_keys_are_stored_both_ways() {
        let argv = Argv::new(
            "build",
            input(json!({ "projectDir": "/tmp/app", "buildOnly": true, "platform": "android" })),
        );
        assert_eq!(argv.get_str("projectDir"), Some("/tmp/app"));
        assert_eq!(argv.get_str("project-dir"), Some("/tmp/app"));
        assert_eq!(argv.get("build-only"), Some(&json!(true)));
        assert_eq!(argv.get_str("platform"), Some("android"));
        assert_eq!(argv.command(), "build");
    }

    #[test]
    fn null_values_count_as_absent() {
        let argv = Argv::new("clean", input(json!({ "target": null })));
        assert!(argv.get("target").is_none());
    }

    #[test]
    fn dashed_writes_update_the_camel_twin() {
        let mut argv = Argv::new("build", input(json!({ "deviceId": "emulator-5554" })));
        argv.set("device-id", json!("pixel"));
        assert_eq!(argv.get_str("deviceId"), Some("pixel"));
        assert_eq!(argv.to_value()["deviceId"], json!("pixel"));
        assert_eq!(argv.to_value()["device-id"], json!("pixel"));
    }

    #[test]
    fn only_changed_spellings_are_applied() {
        let before = Argv::new("build", input(json!({ "projectDir": "/old", "target": "device" })));
        let mut adjusted = before.to_value().as_object().cloned().unwrap_or_default();
        adjusted.insert("project-dir".into(), json!("/new"));

        let mut argv = before.clone();
        argv.apply_changes(&before, &adjusted);
        assert_eq!(argv.get_str("projectDir"), Some("/new"));
        assert_eq!(argv.get_str("project-dir"), Some("/new"));
        assert_eq!(argv.get_str("target"), Some("device"));
    }

    #[test]
    fn camel_case_reverses_dashing() {
        assert_eq!(camel("project-dir"), "projectDir");
        assert_eq!(camel("i-o-s-version"), "iOSVersion");
        assert_eq!(camel("platform"), "platform");
        assert_eq!(camel("$platform"), "$platform");
        assert_eq!(camel("-x"), "-x");
    }

    #[test]
    fn dashing_handles_runs_of_capitals() {
        assert_eq!(dashed("deviceId"), "device-id");
        assert_eq!(dashed("iOSVersion"), "i-o-s-version");
        assert_eq!(dashed("platform"), "platform");
    }
}
