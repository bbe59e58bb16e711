use std::io::Write;

use legacy_tunnel::ServiceDispatcher;
use serde_json::{json, Value};

use crate::cli::LoginArgs;
use crate::services::{AUTH_LOGIN, CHECK_DOWNLOADS};

/// Logs in through the auth service and reports the outcome. Returns the exit code.
pub(crate) async fn login(
    services: &dyn ServiceDispatcher,
    args: &LoginArgs,
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> anyhow::Result<i32> {
    let data = json!({ "username": args.username, "force": args.force });
    match services.call(AUTH_LOGIN, data).await {
        Ok(account) => {
            let name = account.get("name").and_then(Value::as_str).unwrap_or_default();
            if let Err(error) = services
                .call(CHECK_DOWNLOADS, json!({ "accountName": name }))
                .await
            {
                tracing::debug!(%error, "module download check failed");
            }
            if args.json {
                writeln!(out, "{}", serde_json::to_string_pretty(&account)?)?;
            } else {
                writeln!(out, "Logged in as {}.", display_name(&account))?;
            }
            Ok(0)
        }
        Err(error) if error.code.as_deref() == Some("EAUTHENTICATED") => {
            let account = error.data.unwrap_or(Value::Null);
            if args.json {
                writeln!(out, "{}", serde_json::to_string_pretty(&account)?)?;
            } else {
                let org = account["org"]["name"].as_str().unwrap_or_default();
                writeln!(
                    out,
                    "You are already logged into {org} as {}.",
                    display_name(&account)
                )?;
            }
            Ok(0)
        }
        Err(error) if error.code.as_deref() == Some("ERR_AUTH_FAILED") => {
            writeln!(err, "{}", error.message)?;
            Ok(1)
        }
        Err(error) => Err(error.into()),
    }
}

fn display_name(account: &Value) -> &str {
    account["user"]["email"]
        .as_str()
        .or_else(|| account["name"].as_str())
        .unwrap_or_default()
}
