//! plugind daemon - routes client requests to supervised plugins
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │                 plugind                   │
//! ├──────────────────────────────────────────┤
//! │  IPC Server   │  Dispatcher  │ LogBuffer │
//! │  (socket)     │  (routes)    │ (logcat)  │
//! ├──────────────────────────────────────────┤
//! │         Supervisor (plugin registry)      │
//! ├──────────────────────────────────────────┤
//! │  internal │ external host │ ...           │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Clients speak length-prefixed JSON envelopes; external plugin hosts speak
//! newline-delimited JSON over their stdio.

pub mod client;
pub mod dispatcher;
pub mod health;
pub mod log_buffer;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::{ClientStream, DaemonClient};
pub use dispatcher::{Dispatcher, ResponseStream};
pub use health::HealthStatus;
pub use log_buffer::{LogBuffer, LogLine};
pub use protocol::{ClientMessage, EnvelopeType, RequestEnvelope, ResponseEnvelope};
pub use server::DaemonServer;
