//! # torsession
//!
//! Supervision of a local Tor daemon and a typed client for its control
//! channel.
//!
//! The crate owns the whole startup story of a cookie-authenticated Tor
//! instance: it prepares the socket directory, waits for the daemon to
//! write its authentication cookie, opens and authenticates the control
//! socket, then tracks bootstrap progress and connectivity events for the
//! lifetime of the session. Applications observe the session through a
//! cloneable [`TorSession`] handle.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Application                │
//! ├─────────────────────────────────────────┤
//! │   session (coordinator state machine)   │
//! ├──────────────┬──────────────┬───────────┤
//! │  readiness   │   control    │  circuit  │
//! ├──────────────┴──────────────┴───────────┤
//! │        launcher (daemon process)        │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Circuit policy, relay selection, and onion routing itself belong to the
//! daemon; this crate only supervises it and surfaces its state.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod circuit;
pub mod control;
pub mod error;
pub mod launcher;
pub mod logging;
mod readiness;
pub mod session;

pub use circuit::{Circuit, Node};
pub use control::{ControlChannel, ControlEvent, ProxyConfig};
pub use error::{Error, Result};
pub use launcher::{AccessGate, AlwaysAllowed, LaunchOptions, TorLauncher, TorProcess};
pub use session::{LifecycleState, SessionOptions, TorSession};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
