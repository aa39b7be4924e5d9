//! Control-channel client for a local Tor daemon.
//!
//! Implements the client side of the ControlPort protocol
//! (spec: control-spec.txt) over a Unix domain socket: a single
//! authenticated connection carrying request/reply commands interleaved
//! with asynchronous `650` event notifications.
//!
//! Only one [`ControlChannel`] is meant to exist per supervised daemon;
//! the session coordinator owns it and hands out nothing but results.

mod channel;
pub(crate) mod event;

pub use channel::{ControlChannel, ProxyConfig};
pub use event::ControlEvent;

/// Event class carrying client status notifications.
pub const STATUS_CLIENT: &str = "STATUS_CLIENT";

/// Severity of the status events this crate reacts to.
pub const SEVERITY_NOTICE: &str = "NOTICE";

/// Action token of bootstrap-progress events.
pub const ACTION_BOOTSTRAP: &str = "BOOTSTRAP";

/// Action token reported once the daemon has a working circuit.
pub const ACTION_CIRCUIT_ESTABLISHED: &str = "CIRCUIT_ESTABLISHED";

/// Action token reported when the daemon loses connectivity.
pub const ACTION_CIRCUIT_NOT_ESTABLISHED: &str = "CIRCUIT_NOT_ESTABLISHED";
