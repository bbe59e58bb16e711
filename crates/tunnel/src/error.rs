use std::time::Duration;

use tunnel_protocol::ErrorPayload;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TunnelError {
    #[error("IPC channel has been closed")]
    Disconnected,

    #[error("can't send \"{kind}\" message because IPC channel has been closed")]
    SendClosed { kind: &'static str },

    #[error("\"{kind}\" request timed out after {}ms", after.as_millis())]
    Timeout { kind: &'static str, after: Duration },

    #[error("{0}")]
    Remote(ErrorPayload),
}

impl TunnelError {
    /// The error code reported by the other side, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            TunnelError::Remote(payload) => payload.code.as_deref(),
            _ => None,
        }
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            TunnelError::Disconnected | TunnelError::SendClosed { .. }
        )
    }
}
