//! Session lifecycle coordination for a supervised Tor daemon.
//!
//! [`TorSession`] owns the whole startup story: prepare the socket
//! directory, launch the daemon, wait for its authentication cookie, open
//! and authenticate the control channel, then track bootstrap progress and
//! connectivity for the lifetime of the session.
//!
//! All mutable state (lifecycle, bootstrap percentage, proxy config, the
//! pending-waiter queues) lives on one coordinator task; callers talk to
//! it through a cloned handle over a single command queue, so no state is
//! ever touched from two contexts.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::circuit::{self, Circuit};
use crate::control::{
    ControlChannel, ProxyConfig, ACTION_BOOTSTRAP, SEVERITY_NOTICE, STATUS_CLIENT,
};
use crate::error::{Error, Result};
use crate::launcher::{AccessGate, AlwaysAllowed, LaunchOptions, TorLauncher};
use crate::logging::RedactedBytes;
use crate::readiness;

/// Filename of the cookie the daemon writes once its control surface is up.
pub const COOKIE_FILE_NAME: &str = "control_auth_cookie";

/// Filename of the control socket inside the session socket directory.
pub const SOCKET_FILE_NAME: &str = "control.socket";

/// Overall lifecycle of one supervised session.
///
/// Transitions only move forward within an attempt; a fresh `start` from
/// `Failed` begins a new attempt at `Starting`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    /// No control channel; nothing in flight.
    Idle,
    /// Socket directory prepared, daemon spawned, waiting for the cookie.
    Starting,
    /// Control channel open, handshake in flight.
    Authenticating,
    /// Authenticated; configuration and event subscriptions established.
    Ready,
    /// The last attempt ended with this error.
    Failed(Error),
}

/// Construction-time collaborators and paths for a session.
#[derive(Clone)]
pub struct SessionOptions {
    /// Directory holding the control socket and authentication cookie.
    pub socket_dir: PathBuf,
    /// Daemon state directory.
    pub data_dir: PathBuf,
    /// Optional GeoIP database passed through to the daemon.
    pub geoip_file: Option<PathBuf>,
    /// Optional IPv6 GeoIP database passed through to the daemon.
    pub geoip6_file: Option<PathBuf>,
    /// Daemon process collaborator.
    pub launcher: Arc<dyn TorLauncher>,
    /// Entitlement gate consulted at the top of every `start`.
    pub gate: Arc<dyn AccessGate>,
}

impl SessionOptions {
    /// Options with a permissive gate and no GeoIP databases.
    pub fn new(socket_dir: PathBuf, data_dir: PathBuf, launcher: Arc<dyn TorLauncher>) -> Self {
        Self {
            socket_dir,
            data_dir,
            geoip_file: None,
            geoip6_file: None,
            launcher,
            gate: Arc::new(AlwaysAllowed),
        }
    }

    fn cookie_path(&self) -> PathBuf {
        self.socket_dir.join(COOKIE_FILE_NAME)
    }

    fn socket_path(&self) -> PathBuf {
        self.socket_dir.join(SOCKET_FILE_NAME)
    }

    fn launch_options(&self) -> LaunchOptions {
        let mut options = LaunchOptions::new(self.data_dir.clone(), self.socket_path());
        options.geoip_file = self.geoip_file.clone();
        options.geoip6_file = self.geoip6_file.clone();
        options
    }
}

enum SessionCommand {
    Start(oneshot::Sender<Result<()>>),
    ProxyConfig(oneshot::Sender<Option<ProxyConfig>>),
    Circuits(oneshot::Sender<Option<Vec<Circuit>>>),
    CookieReady { attempt: u64, cookie: Vec<u8> },
    CookieFailed { attempt: u64, error: Error },
    Connectivity { attempt: u64, up: bool },
    Bootstrap { attempt: u64, percent: u8 },
}

/// Cloneable handle to a running session coordinator.
#[derive(Clone)]
pub struct TorSession {
    tx: mpsc::UnboundedSender<SessionCommand>,
    state_rx: watch::Receiver<LifecycleState>,
    bootstrap_rx: watch::Receiver<u8>,
}

impl TorSession {
    /// Spawn the coordinator task and return its handle.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn(options: SessionOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LifecycleState::Idle);
        let (bootstrap_tx, bootstrap_rx) = watch::channel(0u8);
        let coordinator = Coordinator {
            options,
            internal: tx.clone(),
            state: state_tx,
            bootstrap: bootstrap_tx,
            attempt: 0,
            channel: None,
            proxy: None,
            proxy_resolved: false,
            start_waiters: Vec::new(),
            proxy_waiters: Vec::new(),
        };
        tokio::spawn(coordinator.run(rx));
        Self {
            tx,
            state_rx,
            bootstrap_rx,
        }
    }

    /// Ensure the daemon is running and the control session is ready.
    ///
    /// Concurrent callers coalesce onto one attempt: exactly one channel is
    /// opened and one handshake performed, and every caller observes the
    /// same terminal outcome.
    pub async fn start(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Start(reply_tx))
            .map_err(|_| Error::ControlConnection("session coordinator stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::ControlConnection("session coordinator stopped".into()))?
    }

    /// Proxy parameters for application traffic, once known.
    ///
    /// Resolves as soon as a session attempt reaches `Ready` (immediately
    /// for later callers). `None` means the session needs no proxy, or the
    /// last attempt failed.
    pub async fn proxy_config(&self) -> Option<ProxyConfig> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(SessionCommand::ProxyConfig(reply_tx)).is_err() {
            return None;
        }
        reply_rx.await.unwrap_or(None)
    }

    /// Fresh snapshot of the daemon's circuits, or `None` without a ready
    /// control channel.
    pub async fn circuits(&self) -> Option<Vec<Circuit>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(SessionCommand::Circuits(reply_tx)).is_err() {
            return None;
        }
        reply_rx.await.unwrap_or(None)
    }

    /// True while the session is authenticated and ready.
    pub fn running(&self) -> bool {
        matches!(*self.state_rx.borrow(), LifecycleState::Ready)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state_rx.borrow().clone()
    }

    /// Observe lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state_rx.clone()
    }

    /// Current bootstrap percentage, 0-100.
    pub fn bootstrap_progress(&self) -> u8 {
        *self.bootstrap_rx.borrow()
    }

    /// Observe bootstrap progress updates.
    pub fn subscribe_bootstrap(&self) -> watch::Receiver<u8> {
        self.bootstrap_rx.clone()
    }
}

struct Coordinator {
    options: SessionOptions,
    internal: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Sender<LifecycleState>,
    bootstrap: watch::Sender<u8>,
    /// Monotonic attempt counter; completions from stale attempts are
    /// ignored when they race a restart.
    attempt: u64,
    channel: Option<ControlChannel>,
    proxy: Option<ProxyConfig>,
    proxy_resolved: bool,
    start_waiters: Vec<oneshot::Sender<Result<()>>>,
    proxy_waiters: Vec<oneshot::Sender<Option<ProxyConfig>>>,
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                SessionCommand::Start(reply) => self.handle_start(reply),
                SessionCommand::ProxyConfig(reply) => self.handle_proxy_config(reply),
                SessionCommand::Circuits(reply) => self.handle_circuits(reply).await,
                SessionCommand::CookieReady { attempt, cookie } => {
                    self.handle_cookie(attempt, cookie).await;
                }
                SessionCommand::CookieFailed { attempt, error } => {
                    if attempt == self.attempt {
                        self.fail(error);
                    }
                }
                SessionCommand::Connectivity { attempt, up } => {
                    self.handle_connectivity(attempt, up);
                }
                SessionCommand::Bootstrap { attempt, percent } => {
                    self.handle_bootstrap(attempt, percent);
                }
            }
        }
    }

    fn current_state(&self) -> LifecycleState {
        self.state.borrow().clone()
    }

    fn handle_start(&mut self, reply: oneshot::Sender<Result<()>>) {
        if !self.options.gate.possible() {
            let _ = reply.send(Err(Error::NoSubscription));
            return;
        }
        match self.current_state() {
            LifecycleState::Ready => {
                let _ = reply.send(Ok(()));
            }
            LifecycleState::Starting | LifecycleState::Authenticating => {
                debug!("start coalesced onto attempt in progress");
                self.start_waiters.push(reply);
            }
            LifecycleState::Idle | LifecycleState::Failed(_) => {
                self.start_waiters.push(reply);
                self.begin_attempt();
            }
        }
    }

    fn begin_attempt(&mut self) {
        self.attempt += 1;
        self.proxy = None;
        self.proxy_resolved = false;
        self.bootstrap.send_replace(0);
        if let Some(channel) = self.channel.take() {
            tokio::spawn(async move { channel.disconnect().await });
        }

        info!(attempt = self.attempt, "starting tor session");
        self.state.send_replace(LifecycleState::Starting);

        if let Err(e) = prepare_socket_dir(&self.options) {
            self.fail(e);
            return;
        }

        let dir = self.options.socket_dir.clone();
        let internal = self.internal.clone();
        let attempt = self.attempt;
        tokio::spawn(async move {
            let message = match readiness::wait_for_file(&dir, COOKIE_FILE_NAME).await {
                Ok(cookie) => SessionCommand::CookieReady { attempt, cookie },
                Err(error) => SessionCommand::CookieFailed { attempt, error },
            };
            let _ = internal.send(message);
        });

        if !self.options.launcher.is_running() {
            if let Err(e) = self.options.launcher.launch(&self.options.launch_options()) {
                self.fail(e);
            }
        }
    }

    async fn handle_cookie(&mut self, attempt: u64, cookie: Vec<u8>) {
        if attempt != self.attempt || self.current_state() != LifecycleState::Starting {
            return;
        }
        debug!(cookie = %RedactedBytes(&cookie), "readiness signal received");
        self.state.send_replace(LifecycleState::Authenticating);

        let channel = match ControlChannel::connect(&self.options.socket_path()).await {
            Ok(channel) => channel,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        if let Err(e) = channel.authenticate(&cookie).await {
            channel.disconnect().await;
            self.fail(e);
            return;
        }

        // Absence of a SOCKS listener is a valid, fully resolved outcome;
        // only a query error is worth surfacing, and then only in the log.
        self.proxy = match channel.proxy_config().await {
            Ok(proxy) => proxy,
            Err(e) => {
                warn!(error = %e, "session configuration query failed");
                None
            }
        };
        self.proxy_resolved = true;
        for waiter in self.proxy_waiters.drain(..) {
            let _ = waiter.send(self.proxy.clone());
        }

        let internal = self.internal.clone();
        channel
            .add_connectivity_observer(move |up| {
                let _ = internal.send(SessionCommand::Connectivity { attempt, up });
            })
            .await;

        let internal = self.internal.clone();
        channel
            .add_event_observer(move |event| {
                if event.kind == STATUS_CLIENT
                    && event.severity == SEVERITY_NOTICE
                    && event.action == ACTION_BOOTSTRAP
                {
                    if let Some(percent) = event
                        .arguments
                        .get("PROGRESS")
                        .and_then(|p| p.parse::<u8>().ok())
                    {
                        let _ = internal.send(SessionCommand::Bootstrap { attempt, percent });
                        return true;
                    }
                }
                false
            })
            .await;

        if let Err(e) = channel.subscribe_status_events().await {
            warn!(error = %e, "event subscription failed");
        }

        self.channel = Some(channel);
        self.state.send_replace(LifecycleState::Ready);
        info!("tor session ready");
        for waiter in self.start_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn handle_proxy_config(&mut self, reply: oneshot::Sender<Option<ProxyConfig>>) {
        if self.proxy_resolved {
            let _ = reply.send(self.proxy.clone());
            return;
        }
        match self.current_state() {
            LifecycleState::Starting | LifecycleState::Authenticating => {
                self.proxy_waiters.push(reply);
            }
            _ => {
                let _ = reply.send(None);
            }
        }
    }

    async fn handle_circuits(&mut self, reply: oneshot::Sender<Option<Vec<Circuit>>>) {
        let Some(channel) = self.channel.as_ref() else {
            let _ = reply.send(None);
            return;
        };
        match circuit::query_circuits(channel).await {
            Ok(circuits) => {
                let _ = reply.send(Some(circuits));
            }
            Err(e) => {
                debug!(error = %e, "circuit query failed");
                let _ = reply.send(None);
            }
        }
    }

    fn handle_connectivity(&mut self, attempt: u64, up: bool) {
        if attempt != self.attempt {
            return;
        }
        debug!(up, "connectivity changed");
        self.bootstrap.send_replace(if up { 100 } else { 0 });
    }

    fn handle_bootstrap(&mut self, attempt: u64, percent: u8) {
        if attempt != self.attempt {
            return;
        }
        let percent = percent.min(100);
        if percent > *self.bootstrap.borrow() {
            debug!(percent, "bootstrap progress");
            self.bootstrap.send_replace(percent);
        }
    }

    /// Terminal failure for the current attempt: broadcast the outcome to
    /// every queued waiter and leave the state at `Failed` until the next
    /// explicit `start`.
    fn fail(&mut self, error: Error) {
        warn!(error = %error, "session attempt failed");
        if let Some(channel) = self.channel.take() {
            tokio::spawn(async move { channel.disconnect().await });
        }
        self.state.send_replace(LifecycleState::Failed(error.clone()));
        for waiter in self.start_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        for waiter in self.proxy_waiters.drain(..) {
            let _ = waiter.send(None);
        }
    }
}

/// Remove stale cookie/socket artifacts and recreate the socket directory
/// with owner-only permissions.
fn prepare_socket_dir(options: &SessionOptions) -> Result<()> {
    let dir = &options.socket_dir;
    for stale in [options.cookie_path(), options.socket_path()] {
        match fs::remove_file(&stale) {
            Ok(()) => debug!(path = %stale.display(), "removed stale artifact"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::Filesystem(format!(
                    "cannot remove {}: {e}",
                    stale.display()
                )));
            }
        }
    }
    fs::create_dir_all(dir)
        .map_err(|e| Error::Filesystem(format!("cannot create {}: {e}", dir.display())))?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
        .map_err(|e| Error::Filesystem(format!("cannot restrict {}: {e}", dir.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_socket_dir_sets_restrictive_mode() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let options = SessionOptions::new(
            tmp.path().join("control"),
            tmp.path().join("data"),
            Arc::new(crate::launcher::TorProcess::new()),
        );
        prepare_socket_dir(&options).expect("prepare should succeed");
        let mode = fs::metadata(&options.socket_dir)
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_prepare_socket_dir_removes_stale_artifacts() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("control");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join(COOKIE_FILE_NAME), b"stale").expect("write stale cookie");
        let options = SessionOptions::new(
            dir.clone(),
            tmp.path().join("data"),
            Arc::new(crate::launcher::TorProcess::new()),
        );
        prepare_socket_dir(&options).expect("prepare should succeed");
        assert!(!dir.join(COOKIE_FILE_NAME).exists());
    }
}
