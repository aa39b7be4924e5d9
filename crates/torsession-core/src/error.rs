//! Error types for torsession.

use thiserror::Error;

/// Errors surfaced by session startup and the control channel.
///
/// Variants carry pre-rendered `String` causes and are `Clone`, so one
/// terminal outcome can be delivered to every caller queued on the same
/// start attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Could not prepare the socket directory or watch for the cookie file.
    #[error("filesystem error: {0}")]
    Filesystem(String),

    /// The entitlement gate denied the start request.
    #[error("no active subscription")]
    NoSubscription,

    /// The control socket could not be opened, or the channel went away.
    #[error("control connection failed: {0}")]
    ControlConnection(String),

    /// Reserved: a bounded wait on daemon readiness that never fired.
    #[error("control connection timed out")]
    ControlConnectionTimeout,

    /// The AUTHENTICATE handshake was rejected, wrapping the cause.
    #[error("control authentication failed: {0}")]
    ControlAuthentication(String),

    /// Malformed or unexpected control-protocol reply.
    #[error("control protocol error: {0}")]
    Protocol(String),
}

/// Result type alias using torsession's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
