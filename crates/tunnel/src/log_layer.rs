use std::fmt::Write as _;
use std::sync::Arc;

use serde_json::Value;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::child::ChildTunnel;

/// Forwards every tracing event in the child to the parent as a `log` envelope.
pub struct TunnelLogLayer {
    tunnel: Arc<ChildTunnel>,
}

impl TunnelLogLayer {
    pub fn new(tunnel: Arc<ChildTunnel>) -> Self {
        Self { tunnel }
    }
}

impl<S> Layer<S> for TunnelLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // write failures are logged from inside the outbox
        if metadata.target().starts_with("legacy_tunnel::transport") || !self.tunnel.is_connected() {
            return;
        }

        let mut line = LineVisitor::default();
        event.record(&mut line);
        self.tunnel.log(vec![Value::String(format!(
            "[{}] {}: {}",
            metadata.level(),
            metadata.target(),
            line.finish()
        ))]);
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl LineVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
