use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use crate::error::TunnelError;

pub type Reply = Result<Value, TunnelError>;

/// Outstanding requests keyed by correlation id.
///
/// Each entry resolves at most once: the first terminal reply removes it and any later reply for
/// the same id finds nothing. Closing the table rejects everything still waiting and refuses new
/// registrations.
#[derive(Default)]
pub struct PendingRequests {
    state: Mutex<PendingState>,
}

#[derive(Default)]
struct PendingState {
    entries: HashMap<String, oneshot::Sender<Reply>>,
    closed: bool,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh id and the receiver its reply will arrive on.
    pub async fn register(&self) -> Result<(String, oneshot::Receiver<Reply>), TunnelError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(TunnelError::Disconnected);
        }
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        state.entries.insert(id.clone(), tx);
        Ok((id, rx))
    }

    pub async fn resolve(&self, id: &str, value: Value) -> bool {
        self.complete(id, Ok(value)).await
    }

    pub async fn reject(&self, id: &str, err: TunnelError) -> bool {
        self.complete(id, Err(err)).await
    }

    /// Drops an entry without replying, for requesters that gave up.
    pub async fn forget(&self, id: &str) -> bool {
        self.state.lock().await.entries.remove(id).is_some()
    }

    /// Rejects every outstanding request with [`TunnelError::Disconnected`].
    pub async fn close(&self) -> usize {
        let drained: Vec<_> = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.entries.drain().collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(TunnelError::Disconnected));
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn complete(&self, id: &str, reply: Reply) -> bool {
        let sender = self.state.lock().await.entries.remove(id);
        match sender {
            Some(tx) => {
                // the receiver may have timed out already; nothing to do then
                let _ = tx.send(reply);
                true
            }
            None => {
                tracing::debug!(id, "dropping reply for unknown request");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn replies_match_by_id_regardless_of_order() {
        let pending = PendingRequests::new();
        let mut requests = Vec::new();
        for _ in 0..5 {
            requests.push(pending.register().await.expect("register"));
        }

        for (index, (id, _)) in requests.iter().enumerate().rev() {
            assert!(pending.resolve(id, json!(index)).await);
        }

        for (index, (_, rx)) in requests.into_iter().enumerate() {
            let value = rx.await.expect("reply").expect("ok");
            assert_eq!(value, json!(index));
        }
        assert!(pending.is_empty().await);
    }

    #[tokio::test]
    async fn second_reply_is_a_no_op() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register().await.expect("register");
        assert!(pending.resolve(&id, json!("first")).await);
        assert!(!pending.resolve(&id, json!("second")).await);
        assert!(!pending.reject(&id, TunnelError::Disconnected).await);
        assert_eq!(rx.await.expect("reply").expect("ok"), json!("first"));
    }

    #[tokio::test]
    async fn close_rejects_everything_and_refuses_new_entries() {
        let pending = PendingRequests::new();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            receivers.push(pending.register().await.expect("register").1);
        }
        assert_eq!(pending.close().await, 3);
        for rx in receivers {
            let err = rx.await.expect("reply").expect_err("rejected");
            assert!(err.is_disconnect());
        }
        assert!(matches!(
            pending.register().await,
            Err(TunnelError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let pending = PendingRequests::new();
        let mut ids = std::collections::HashSet::new();
        for _ in 0..100 {
            let (id, _rx) = pending.register().await.expect("register");
            assert!(ids.insert(id));
        }
    }
}
