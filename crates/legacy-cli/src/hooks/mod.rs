//! Pre/post hook registry fired around pipeline events and build steps.
//!
//! Callbacks are kept per event and phase, ordered by ascending priority with ties in
//! registration order. A hook may be registered at any time, including from inside a running
//! hook, since every emit works on a snapshot of the callbacks.

mod scan;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

pub use scan::ScanReport;
use scan::ScanState;

pub const DEFAULT_PRIORITY: i64 = 1000;

pub type HookResult = anyhow::Result<Option<HookData>>;

/// The value threaded through a hook chain.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct HookData {
    #[serde(rename = "type")]
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl HookData {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
            result: None,
        }
    }
}

/// Completion callback for [`HookFn::NodeStyle`] hooks. Consumed by the first call.
pub struct Done {
    tx: oneshot::Sender<HookResult>,
}

impl Done {
    pub fn call(self, result: HookResult) {
        let _ = self.tx.send(result);
    }

    pub fn ok(self, data: Option<HookData>) {
        self.call(Ok(data));
    }

    pub fn fail(self, err: anyhow::Error) {
        self.call(Err(err));
    }
}

#[derive(Clone)]
pub enum HookFn {
    /// Receives the data and may resolve with a replacement.
    Simple(Arc<dyn Fn(HookData) -> BoxFuture<'static, HookResult> + Send + Sync>),
    /// Receives the data and a [`Done`] it must call with an error or a replacement.
    NodeStyle(Arc<dyn Fn(HookData, Done) + Send + Sync>),
}

impl HookFn {
    pub fn simple<F, Fut>(f: F) -> Self
    where
        F: Fn(HookData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        HookFn::Simple(Arc::new(move |data| -> BoxFuture<'static, HookResult> {
            Box::pin(f(data))
        }))
    }

    pub fn node_style<F>(f: F) -> Self
    where
        F: Fn(HookData, Done) + Send + Sync + 'static,
    {
        HookFn::NodeStyle(Arc::new(f))
    }

    async fn invoke(&self, data: HookData) -> Result<Option<HookData>, Invocation> {
        match self {
            HookFn::Simple(f) => f(data).await.map_err(Invocation::Failed),
            HookFn::NodeStyle(f) => {
                let (tx, rx) = oneshot::channel();
                f(data, Done { tx });
                match rx.await {
                    Ok(result) => result.map_err(Invocation::Failed),
                    Err(_) => Err(Invocation::Dropped),
                }
            }
        }
    }
}

impl fmt::Debug for HookFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookFn::Simple(_) => f.write_str("HookFn::Simple"),
            HookFn::NodeStyle(_) => f.write_str("HookFn::NodeStyle"),
        }
    }
}

enum Invocation {
    Failed(anyhow::Error),
    Dropped,
}

/// What `on` registers. A bare [`HookFn`] becomes a `post` hook.
#[derive(Clone, Debug, Default)]
pub struct HookSpec {
    pub pre: Option<HookFn>,
    pub post: Option<HookFn>,
    pub priority: Option<i64>,
}

impl HookSpec {
    pub fn pre(hook: HookFn) -> Self {
        Self {
            pre: Some(hook),
            ..Self::default()
        }
    }

    pub fn post(hook: HookFn) -> Self {
        Self {
            post: Some(hook),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }
}

impl From<HookFn> for HookSpec {
    fn from(hook: HookFn) -> Self {
        HookSpec::post(hook)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Pre,
    Post,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Pre => f.write_str("pre"),
            Phase::Post => f.write_str("post"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("\"{event}\" {phase} hook failed: {source}")]
    Failed {
        event: String,
        phase: Phase,
        #[source]
        source: anyhow::Error,
    },

    #[error("\"{event}\" {phase} hook dropped its completion callback")]
    DoneDropped { event: String, phase: Phase },

    #[error("{source}")]
    Function {
        event: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Default)]
struct HookTable {
    pre: HashMap<String, Vec<Registered>>,
    post: HashMap<String, Vec<Registered>>,
}

struct Registered {
    priority: i64,
    hook: HookFn,
}

pub struct HookRegistry {
    table: Mutex<HookTable>,
    scan: Mutex<ScanState>,
    cli_version: semver::Version,
}

impl HookRegistry {
    pub fn new(cli_version: semver::Version) -> Self {
        Self {
            table: Mutex::new(HookTable::default()),
            scan: Mutex::new(ScanState::default()),
            cli_version,
        }
    }

    pub fn on(&self, name: &str, spec: impl Into<HookSpec>) -> &Self {
        let spec = spec.into();
        let priority = spec.priority.unwrap_or(DEFAULT_PRIORITY);
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(hook) = spec.pre {
            insert_sorted(table.pre.entry(name.to_string()).or_default(), priority, hook);
        }
        if let Some(hook) = spec.post {
            insert_sorted(table.post.entry(name.to_string()).or_default(), priority, hook);
        }
        self
    }

    pub fn add_hook(&self, name: &str, spec: impl Into<HookSpec>) -> &Self {
        self.on(name, spec)
    }

    /// Fires each distinct event in turn; every chain starts from the payload the previous one
    /// produced.
    pub async fn emit(&self, names: &[&str], payload: Value) -> Result<HookData, HookError> {
        let mut unique: Vec<&str> = Vec::with_capacity(names.len());
        for name in names {
            if !unique.contains(name) {
                unique.push(*name);
            }
        }

        let mut data = HookData::new(unique.first().copied().unwrap_or_default(), payload);
        for name in unique {
            let start = HookData::new(name, std::mem::take(&mut data.payload));
            let after_pre = self.run_phase(Phase::Pre, name, start).await?;
            data = self.run_phase(Phase::Post, name, after_pre).await?;
        }
        Ok(data)
    }

    pub async fn fire_hook(&self, names: &[&str], payload: Value) -> Result<HookData, HookError> {
        self.emit(names, payload).await
    }

    /// Runs the `pre` hooks, then `f`, then the `post` hooks. `f`'s output becomes `result`.
    pub async fn wrap<F, Fut>(&self, name: &str, payload: Value, f: F) -> Result<HookData, HookError>
    where
        F: FnOnce(HookData) -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        let mut data = self
            .run_phase(Phase::Pre, name, HookData::new(name, payload))
            .await?;
        let result = f(data.clone()).await.map_err(|source| HookError::Function {
            event: name.to_string(),
            source,
        })?;
        data.result = Some(result);
        self.run_phase(Phase::Post, name, data).await
    }

    pub fn has_hooks(&self, name: &str) -> bool {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.pre.contains_key(name) || table.post.contains_key(name)
    }

    async fn run_phase(
        &self,
        phase: Phase,
        name: &str,
        mut data: HookData,
    ) -> Result<HookData, HookError> {
        for hook in self.snapshot(phase, name) {
            match hook.invoke(data.clone()).await {
                Ok(Some(next)) => {
                    if phase == Phase::Pre || next.event == name {
                        data = next;
                    } else {
                        tracing::debug!(event = name, returned = %next.event, "ignoring post hook data for another event");
                    }
                }
                Ok(None) => {}
                Err(Invocation::Failed(source)) => {
                    return Err(HookError::Failed {
                        event: name.to_string(),
                        phase,
                        source,
                    })
                }
                Err(Invocation::Dropped) => {
                    return Err(HookError::DoneDropped {
                        event: name.to_string(),
                        phase,
                    })
                }
            }
        }
        Ok(data)
    }

    fn snapshot(&self, phase: Phase, name: &str) -> Vec<HookFn> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let chain = match phase {
            Phase::Pre => table.pre.get(name),
            Phase::Post => table.post.get(name),
        };
        chain
            .map(|chain| chain.iter().map(|entry| entry.hook.clone()).collect())
            .unwrap_or_default()
    }
}

fn insert_sorted(chain: &mut Vec<Registered>, priority: i64, hook: HookFn) {
    let index = chain.partition_point(|entry| entry.priority <= priority);
    chain.insert(index, Registered { priority, hook });
}
