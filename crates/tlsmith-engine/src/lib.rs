//! Layered message pipeline and workflow executor for adversarial TLS, DTLS,
//! QUIC and HTTPS testing.
//!
//! Protocol units (records, handshake messages, extensions, frames, HTTP
//! messages) are decoded from bytes, have their fields computed or
//! overridden, are encoded back and apply their effects to a per-connection
//! [`ConnectionState`]. A [`LayerStack`] frames units for the wire, and a
//! [`WorkflowExecutor`] drives a scripted [`WorkflowTrace`] against it while
//! tracking whether execution matched the plan.

#![forbid(unsafe_code)]

#[macro_use]
mod macros;

pub mod alert;
pub mod config;
pub mod extensions;
pub mod fragment;
pub mod handshake;
pub mod http;
pub mod layer;
pub mod message;
pub mod quic;
pub mod record;
pub mod state;
pub mod transport;
pub mod unit;
pub mod workflow;

use serde::{Deserialize, Serialize};

pub use config::{EngineConfig, EngineConfigBuilder};
pub use layer::{LayerConfiguration, LayerStack, LayerType, ReceivePolicy};
pub use state::ConnectionState;
pub use tlsmith_types::{EngineError, SkipSignal};
pub use unit::{Field, Origin, Override, ProtocolUnit, UnitFamily, UnitKind, UnitRegistry};
pub use workflow::{
    ActionOutcome, CancelHandle, ExecutionResult, ExecutorStatus, WorkflowAction,
    WorkflowExecutor, WorkflowTrace,
};

/// Which side of the connection the engine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn peer(self) -> Self {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}
