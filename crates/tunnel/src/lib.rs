//! Out-of-process execution tunnel between the daemon and the legacy CLI.
//!
//! The parent launches the bootstrap through [`LegacySpawner`] and the child talks back through
//! [`ChildTunnel`]. Both sides exchange newline-delimited JSON envelopes over a Unix socket the
//! child finds at fd 3.

pub mod child;
pub mod error;
pub mod ipc;
pub mod log_layer;
pub mod pending;
pub mod spawner;
pub mod transport;

pub use child::{
    serve, ChildTunnel, ExecFailure, ExecHandler, ExecMode, ExecOutcome, TunnelOptions,
};
pub use error::TunnelError;
pub use log_layer::TunnelLogLayer;
pub use pending::PendingRequests;
pub use spawner::{
    LegacySpawner, OutputMode, Prompter, ServiceDispatcher, ServiceError, SpawnError,
    TelemetrySink, TracingTelemetry,
};
