use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use legacy_tunnel::{ServiceDispatcher, ServiceError};
use serde_json::{json, Value};

use crate::config::AccountConfig;

pub(crate) const SDK_FIND: &str = "/sdk/find";
pub(crate) const SDK_LIST: &str = "/sdk/list";
pub(crate) const AUTH_LIST: &str = "/amplify/2.x/auth";
pub(crate) const AUTH_LOGIN: &str = "/amplify/2.x/auth/login";
pub(crate) const CHECK_DOWNLOADS: &str = "/module/check-downloads";

/// In-process services the legacy CLI can reach through `call`.
pub(crate) struct ServiceRegistry {
    sdk_roots: Vec<PathBuf>,
    accounts: Mutex<Vec<AccountConfig>>,
}

impl ServiceRegistry {
    pub(crate) fn new(sdk_roots: Vec<PathBuf>, accounts: Vec<AccountConfig>) -> Self {
        Self {
            sdk_roots,
            accounts: Mutex::new(accounts),
        }
    }

    fn find_sdk(&self, data: &Value) -> Result<Value, ServiceError> {
        let name = data
            .get("name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ServiceError::new("Missing SDK name").with_status(400))?;
        self.sdk_roots
            .iter()
            .map(|root| root.join(name))
            .find_map(|path| describe_sdk(&path))
            .ok_or_else(|| ServiceError::not_found(format!("Titanium SDK \"{name}\" not found")))
    }

    fn list_sdks(&self) -> Value {
        let mut sdks: Vec<Value> = self
            .sdk_roots
            .iter()
            .filter_map(|root| std::fs::read_dir(root).ok())
            .flat_map(|entries| entries.filter_map(Result::ok))
            .filter_map(|entry| describe_sdk(&entry.path()))
            .collect();
        sdks.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        Value::Array(sdks)
    }

    fn list_accounts(&self) -> Value {
        let accounts = self.lock_accounts();
        Value::Array(accounts.iter().map(account_json).collect())
    }

    fn login(&self, data: &Value) -> Result<Value, ServiceError> {
        let force = data.get("force").and_then(Value::as_bool).unwrap_or(false);
        let username = data.get("username").and_then(Value::as_str);
        let mut accounts = self.lock_accounts();

        if !force {
            if let Some(active) = accounts.iter().find(|account| account.active) {
                return Err(ServiceError::new("Account already authenticated")
                    .with_code("EAUTHENTICATED")
                    .with_status(400)
                    .with_data(account_json(active)));
            }
        }

        let index = match username {
            Some(username) => accounts
                .iter()
                .position(|account| account.name == username || account.email.as_deref() == Some(username))
                .ok_or_else(|| {
                    ServiceError::new(format!("Authentication failed: unknown user \"{username}\""))
                        .with_code("ERR_AUTH_FAILED")
                        .with_status(401)
                })?,
            None if accounts.is_empty() => {
                return Err(ServiceError::new("Authentication failed: no accounts configured")
                    .with_code("ERR_AUTH_FAILED")
                    .with_status(401))
            }
            None => 0,
        };
        for (i, account) in accounts.iter_mut().enumerate() {
            account.active = i == index;
        }
        tracing::info!(account = %accounts[index].name, "logged in");
        Ok(account_json(&accounts[index]))
    }

    fn check_downloads(&self, data: &Value) -> Result<Value, ServiceError> {
        let name = data.get("accountName").and_then(Value::as_str).unwrap_or_default();
        if !self.lock_accounts().iter().any(|account| account.name == name) {
            return Err(ServiceError::not_found(format!("Unknown account \"{name}\"")));
        }
        Ok(json!({ "accountName": name, "downloads": [] }))
    }

    fn lock_accounts(&self) -> std::sync::MutexGuard<'_, Vec<AccountConfig>> {
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ServiceDispatcher for ServiceRegistry {
    async fn call(&self, path: &str, data: Value) -> Result<Value, ServiceError> {
        tracing::debug!(path, "dispatching legacy service call");
        match path {
            SDK_FIND => self.find_sdk(&data),
            SDK_LIST => Ok(self.list_sdks()),
            AUTH_LIST => Ok(self.list_accounts()),
            AUTH_LOGIN => self.login(&data),
            CHECK_DOWNLOADS => self.check_downloads(&data),
            other => Err(ServiceError::not_found(format!("Service \"{other}\" not found"))),
        }
    }
}

fn describe_sdk(path: &Path) -> Option<Value> {
    let raw = std::fs::read_to_string(path.join("manifest.json")).ok()?;
    let manifest: Value = serde_json::from_str(&raw).ok()?;
    let name = path.file_name()?.to_string_lossy().into_owned();
    Some(json!({
        "name": name,
        "path": path,
        "version": manifest.get("version").cloned().unwrap_or(Value::Null),
        "manifest": manifest,
    }))
}

fn account_json(account: &AccountConfig) -> Value {
    json!({
        "name": account.name,
        "active": account.active,
        "org": { "name": account.org.clone().unwrap_or_default() },
        "user": { "email": account.email },
    })
}
