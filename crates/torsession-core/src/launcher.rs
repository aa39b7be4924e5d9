//! Collaborator boundaries: the daemon process and the entitlement gate.
//!
//! The session coordinator never reaches into the daemon's internals; it
//! only asks a [`TorLauncher`] to make sure an instance exists and trusts
//! it to eventually write the cookie file and listen on the socket.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

use tracing::{debug, info};

use crate::error::{Error, Result};

/// Options handed to the daemon collaborator at launch time.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Daemon state directory.
    pub data_dir: PathBuf,
    /// Path of the control socket the daemon should listen on.
    pub control_socket: PathBuf,
    /// Enable cookie-file authentication on the control socket.
    pub cookie_auth: bool,
    /// Optional GeoIP database for IPv4 country lookups.
    pub geoip_file: Option<PathBuf>,
    /// Optional GeoIP database for IPv6 country lookups.
    pub geoip6_file: Option<PathBuf>,
    /// Tolerate a missing primary configuration file.
    pub ignore_missing_torrc: bool,
}

impl LaunchOptions {
    /// Options for a daemon rooted at `data_dir`, controlled via
    /// `control_socket`, with cookie authentication on.
    pub fn new(data_dir: PathBuf, control_socket: PathBuf) -> Self {
        Self {
            data_dir,
            control_socket,
            cookie_auth: true,
            geoip_file: None,
            geoip6_file: None,
            ignore_missing_torrc: true,
        }
    }

    /// Render the options as daemon command-line arguments.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.ignore_missing_torrc {
            args.push("--ignore-missing-torrc".to_string());
        }
        args.push("DataDirectory".to_string());
        args.push(self.data_dir.display().to_string());
        args.push("ControlSocket".to_string());
        args.push(self.control_socket.display().to_string());
        args.push("CookieAuthentication".to_string());
        args.push(if self.cookie_auth { "1" } else { "0" }.to_string());
        args.push("SocksPort".to_string());
        args.push("auto".to_string());
        if let Some(geoip) = &self.geoip_file {
            args.push("GeoIPFile".to_string());
            args.push(geoip.display().to_string());
        }
        if let Some(geoip6) = &self.geoip6_file {
            args.push("GeoIPv6File".to_string());
            args.push(geoip6.display().to_string());
        }
        args
    }
}

/// Launches (or finds) the daemon instance a session supervises.
pub trait TorLauncher: Send + Sync {
    /// Start the daemon with the given options. Launching when an instance
    /// is already alive must be a no-op.
    fn launch(&self, options: &LaunchOptions) -> Result<()>;

    /// True while a daemon launched by this launcher is still alive.
    fn is_running(&self) -> bool;
}

/// Entitlement gate consulted at the top of every `start` call.
pub trait AccessGate: Send + Sync {
    /// Whether starting the daemon is currently permitted.
    fn possible(&self) -> bool;
}

/// Gate that always permits startup.
pub struct AlwaysAllowed;

impl AccessGate for AlwaysAllowed {
    fn possible(&self) -> bool {
        true
    }
}

/// Spawns the system `tor` binary as a supervised child process.
pub struct TorProcess {
    program: String,
    child: Mutex<Option<Child>>,
}

impl TorProcess {
    /// Launcher for the `tor` binary on `PATH`.
    pub fn new() -> Self {
        Self::with_program("tor")
    }

    /// Launcher for a specific daemon executable.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            child: Mutex::new(None),
        }
    }
}

impl Default for TorProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl TorLauncher for TorProcess {
    fn launch(&self, options: &LaunchOptions) -> Result<()> {
        let mut guard = self.child.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(child) = guard.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                debug!("daemon already running, not relaunching");
                return Ok(());
            }
        }
        let child = Command::new(&self.program)
            .args(options.to_args())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Filesystem(format!("cannot launch {}: {e}", self.program)))?;
        info!(pid = child.id(), program = %self.program, "daemon launched");
        *guard = Some(child);
        Ok(())
    }

    fn is_running(&self) -> bool {
        let mut guard = self.child.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_args_renders_option_pairs() {
        let options = LaunchOptions::new("/var/tor".into(), "/var/tor/control.socket".into());
        let args = options.to_args();
        assert_eq!(args[0], "--ignore-missing-torrc");
        let rendered = args.join(" ");
        assert!(rendered.contains("DataDirectory /var/tor"));
        assert!(rendered.contains("ControlSocket /var/tor/control.socket"));
        assert!(rendered.contains("CookieAuthentication 1"));
        assert!(rendered.contains("SocksPort auto"));
        assert!(!rendered.contains("GeoIPFile"));
    }

    #[test]
    fn test_to_args_includes_geoip_when_set() {
        let mut options = LaunchOptions::new("/d".into(), "/d/s".into());
        options.geoip_file = Some("/usr/share/tor/geoip".into());
        options.geoip6_file = Some("/usr/share/tor/geoip6".into());
        let rendered = options.to_args().join(" ");
        assert!(rendered.contains("GeoIPFile /usr/share/tor/geoip"));
        assert!(rendered.contains("GeoIPv6File /usr/share/tor/geoip6"));
    }

    #[test]
    fn test_fresh_process_launcher_reports_not_running() {
        assert!(!TorProcess::new().is_running());
    }

    #[test]
    fn test_always_allowed_gate() {
        assert!(AlwaysAllowed.possible());
    }
}
