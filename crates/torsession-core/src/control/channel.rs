//! The control-socket connection and its command/reply pump.

use std::collections::VecDeque;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use super::event::{ConnectivityObserver, ControlEvent, EventObserver};
use super::{ACTION_CIRCUIT_ESTABLISHED, ACTION_CIRCUIT_NOT_ESTABLISHED, STATUS_CLIENT};
use crate::error::{Error, Result};
use crate::logging::redact_command;

/// SOCKS proxy parameters extracted from the daemon's session configuration.
///
/// Absence of a config after a successful session means the daemon exposes
/// no SOCKS listener and application traffic needs no proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Listener host, e.g. `127.0.0.1`.
    pub host: String,
    /// Listener port.
    pub port: u16,
    /// Optional SOCKS username.
    pub username: Option<String>,
    /// Optional SOCKS password.
    pub password: Option<String>,
}

/// A complete reply to one control-port command.
#[derive(Debug, Clone)]
struct Reply {
    status: u16,
    lines: Vec<String>,
}

enum ChannelRequest {
    Command {
        line: String,
        respond_to: oneshot::Sender<Result<Reply>>,
    },
    AddEventObserver(EventObserver),
    AddConnectivityObserver(ConnectivityObserver),
    Disconnect,
}

/// Handle to the single live control-socket connection.
///
/// Cloning the handle shares the connection; the underlying task keeps
/// commands strictly sequenced and routes asynchronous events to the
/// registered observers in registration order.
#[derive(Clone)]
pub struct ControlChannel {
    tx: mpsc::Sender<ChannelRequest>,
}

impl ControlChannel {
    /// Open the control socket and spawn the connection task.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            Error::ControlConnection(format!("{}: {e}", socket_path.display()))
        })?;
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(connection_task(BufReader::new(read_half), write_half, rx));
        debug!(path = %socket_path.display(), "control socket connected");
        Ok(Self { tx })
    }

    async fn command(&self, line: String) -> Result<Reply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ChannelRequest::Command {
                line,
                respond_to: reply_tx,
            })
            .await
            .map_err(|_| Error::ControlConnection("channel closed".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::ControlConnection("channel closed".into()))?
    }

    /// Perform the cookie handshake. Errors wrap the rejection cause.
    pub async fn authenticate(&self, cookie: &[u8]) -> Result<()> {
        match self
            .command(format!("AUTHENTICATE {}", hex::encode(cookie)))
            .await
        {
            Ok(_) => {
                debug!("control channel authenticated");
                Ok(())
            }
            Err(Error::Protocol(cause)) => Err(Error::ControlAuthentication(cause)),
            Err(other) => Err(Error::ControlAuthentication(other.to_string())),
        }
    }

    /// Query the SOCKS listener the daemon exposes, if any.
    ///
    /// A daemon without a SOCKS listener is not an error; it yields `None`.
    pub async fn proxy_config(&self) -> Result<Option<ProxyConfig>> {
        let reply = self.command("GETINFO net/listeners/socks".into()).await?;
        Ok(parse_socks_listeners(&reply.lines))
    }

    /// Fetch the raw circuit-status listing, one descriptor line per circuit.
    pub async fn raw_circuits(&self) -> Result<Vec<String>> {
        let reply = self.command("GETINFO circuit-status".into()).await?;
        let mut raw = Vec::new();
        let mut in_status = false;
        for line in &reply.lines {
            if let Some(rest) = line.strip_prefix("circuit-status=") {
                in_status = true;
                if !rest.is_empty() {
                    raw.push(rest.to_string());
                }
            } else if in_status && line != "OK" {
                raw.push(line.clone());
            }
        }
        Ok(raw)
    }

    /// Generic single-key `GETINFO` query. Multi-line values are joined
    /// with newlines; a missing or empty value yields `None`.
    pub async fn getinfo(&self, key: &str) -> Result<Option<String>> {
        let reply = self.command(format!("GETINFO {key}")).await?;
        let prefix = format!("{key}=");
        let mut lines = reply.lines.iter();
        for line in lines.by_ref() {
            if let Some(value) = line.strip_prefix(&prefix) {
                if !value.is_empty() {
                    return Ok(Some(value.to_string()));
                }
                let block: Vec<&str> = lines
                    .by_ref()
                    .map(String::as_str)
                    .filter(|l| *l != "OK")
                    .collect();
                let joined = block.join("\n");
                return Ok(if joined.is_empty() { None } else { Some(joined) });
            }
        }
        Ok(None)
    }

    /// Ask the daemon to push `STATUS_CLIENT` events on this connection.
    pub async fn subscribe_status_events(&self) -> Result<()> {
        self.command(format!("SETEVENTS {STATUS_CLIENT}")).await?;
        Ok(())
    }

    /// Register a persistent structured-event subscriber.
    ///
    /// Observers fire in registration order; every observer sees every
    /// event regardless of what earlier observers reported consuming.
    pub async fn add_event_observer<F>(&self, observer: F)
    where
        F: Fn(&ControlEvent) -> bool + Send + 'static,
    {
        if self
            .tx
            .send(ChannelRequest::AddEventObserver(Box::new(observer)))
            .await
            .is_err()
        {
            warn!("cannot register event observer: control channel closed");
        }
    }

    /// Register a persistent connectivity subscriber, fired with `true`
    /// when the daemon establishes a circuit and `false` when it loses one.
    pub async fn add_connectivity_observer<F>(&self, observer: F)
    where
        F: Fn(bool) + Send + 'static,
    {
        if self
            .tx
            .send(ChannelRequest::AddConnectivityObserver(Box::new(observer)))
            .await
            .is_err()
        {
            warn!("cannot register connectivity observer: control channel closed");
        }
    }

    /// Tear the connection down. Safe to call repeatedly or when the
    /// connection is already gone.
    pub async fn disconnect(&self) {
        let _ = self.tx.send(ChannelRequest::Disconnect).await;
    }
}

/// Feeds trimmed reply lines from the socket into the connection task.
async fn read_task(mut reader: BufReader<OwnedReadHalf>, lines: mpsc::Sender<String>) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim_end();
                if trimmed.is_empty() {
                    continue;
                }
                if lines.send(trimmed.to_string()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "control socket read failed");
                break;
            }
        }
    }
}

async fn connection_task(
    reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<ChannelRequest>,
) {
    let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
    tokio::spawn(read_task(reader, line_tx));

    let mut pending: VecDeque<oneshot::Sender<Result<Reply>>> = VecDeque::new();
    let mut event_observers: Vec<EventObserver> = Vec::new();
    let mut connectivity_observers: Vec<ConnectivityObserver> = Vec::new();
    let mut reply_lines: Vec<String> = Vec::new();
    let mut in_data_block = false;

    loop {
        tokio::select! {
            request = rx.recv() => match request {
                Some(ChannelRequest::Command { line, respond_to }) => {
                    trace!(command = %redact_command(&line), "control command");
                    if let Err(e) = writer.write_all(format!("{line}\r\n").as_bytes()).await {
                        let _ = respond_to.send(Err(Error::ControlConnection(e.to_string())));
                        continue;
                    }
                    if let Err(e) = writer.flush().await {
                        let _ = respond_to.send(Err(Error::ControlConnection(e.to_string())));
                        continue;
                    }
                    pending.push_back(respond_to);
                }
                Some(ChannelRequest::AddEventObserver(observer)) => {
                    event_observers.push(observer);
                }
                Some(ChannelRequest::AddConnectivityObserver(observer)) => {
                    connectivity_observers.push(observer);
                }
                Some(ChannelRequest::Disconnect) | None => break,
            },
            line = line_rx.recv() => match line {
                Some(line) => {
                    if in_data_block {
                        if line == "." {
                            in_data_block = false;
                        } else {
                            reply_lines.push(line);
                        }
                        continue;
                    }
                    let Some((status, separator, payload)) = parse_status_line(&line) else {
                        warn!(line = %line, "unparseable control line");
                        continue;
                    };
                    if status == 650 {
                        match ControlEvent::parse(payload) {
                            Some(event) => dispatch_event(
                                &event,
                                &event_observers,
                                &connectivity_observers,
                            ),
                            None => trace!(line = %line, "empty event line"),
                        }
                        continue;
                    }
                    reply_lines.push(payload.to_string());
                    match separator {
                        '+' => in_data_block = true,
                        '-' => {}
                        _ => {
                            // Final line; the accumulated reply is complete.
                            let reply = Reply {
                                status,
                                lines: std::mem::take(&mut reply_lines),
                            };
                            match pending.pop_front() {
                                Some(respond_to) => {
                                    let outcome = if reply.status < 400 {
                                        Ok(reply)
                                    } else {
                                        Err(Error::Protocol(line.clone()))
                                    };
                                    let _ = respond_to.send(outcome);
                                }
                                None => warn!(line = %line, "reply without pending command"),
                            }
                        }
                    }
                }
                None => break,
            },
        }
    }

    for respond_to in pending.drain(..) {
        let _ = respond_to.send(Err(Error::ControlConnection("connection closed".into())));
    }
    debug!("control connection closed");
}

/// Split a reply line into `(status, separator, payload)`.
fn parse_status_line(line: &str) -> Option<(u16, char, &str)> {
    if line.len() < 4 || !line.is_char_boundary(3) {
        return None;
    }
    let status = line[..3].parse::<u16>().ok()?;
    let separator = line[3..].chars().next()?;
    if !matches!(separator, ' ' | '-' | '+') {
        return None;
    }
    Some((status, separator, &line[4..]))
}

fn dispatch_event(
    event: &ControlEvent,
    event_observers: &[EventObserver],
    connectivity_observers: &[ConnectivityObserver],
) {
    if event.kind == STATUS_CLIENT {
        let connectivity = match event.action.as_str() {
            a if a == ACTION_CIRCUIT_ESTABLISHED => Some(true),
            a if a == ACTION_CIRCUIT_NOT_ESTABLISHED => Some(false),
            _ => None,
        };
        if let Some(up) = connectivity {
            for observer in connectivity_observers {
                observer(up);
            }
        }
    }
    let mut consumed = 0usize;
    for observer in event_observers {
        if observer(event) {
            consumed += 1;
        }
    }
    trace!(
        kind = %event.kind,
        action = %event.action,
        observers = event_observers.len(),
        consumed,
        "event dispatched"
    );
}

/// Pick the first usable TCP listener out of a `net/listeners/socks` reply.
fn parse_socks_listeners(lines: &[String]) -> Option<ProxyConfig> {
    let raw = lines
        .iter()
        .find_map(|l| l.strip_prefix("net/listeners/socks="))?;
    for token in raw.split_whitespace() {
        let addr = token.trim_matches('"');
        if addr.is_empty() || addr.starts_with("unix:") {
            continue;
        }
        if let Some((host, port)) = addr.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                return Some(ProxyConfig {
                    host: host.to_string(),
                    port,
                    username: None,
                    password: None,
                });
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_status_line() {
        assert_eq!(parse_status_line("250 OK"), Some((250, ' ', "OK")));
        assert_eq!(
            parse_status_line("250-version=1.2.3"),
            Some((250, '-', "version=1.2.3"))
        );
        assert_eq!(
            parse_status_line("250+circuit-status="),
            Some((250, '+', "circuit-status="))
        );
        assert_eq!(parse_status_line("nonsense"), None);
        assert_eq!(parse_status_line("25"), None);
    }

    #[test]
    fn test_parse_socks_listeners_tcp() {
        let config = parse_socks_listeners(&lines(&[
            "net/listeners/socks=\"127.0.0.1:9050\"",
            "OK",
        ]))
        .expect("listener should parse");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9050);
        assert_eq!(config.username, None);
    }

    #[test]
    fn test_parse_socks_listeners_prefers_tcp_over_unix() {
        let config = parse_socks_listeners(&lines(&[
            "net/listeners/socks=\"unix:/run/tor/socks\" \"127.0.0.1:9150\"",
        ]))
        .expect("tcp listener should win");
        assert_eq!(config.port, 9150);
    }

    #[test]
    fn test_parse_socks_listeners_absent() {
        assert_eq!(parse_socks_listeners(&lines(&["net/listeners/socks="])), None);
        assert_eq!(parse_socks_listeners(&lines(&["OK"])), None);
    }
}
