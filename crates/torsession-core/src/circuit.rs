//! Structured circuit and relay records parsed from circuit-status listings.
//!
//! This is a pure read-only translation layer: every query produces fresh
//! snapshots of live daemon state, nothing is cached, and empty textual
//! fields are normalized to absent.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::control::event::{tokenize, unquote};
use crate::control::ControlChannel;
use crate::error::Result;

/// A relay in a circuit path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Two-letter country code, if known.
    pub country: Option<String>,
    /// Relay identity fingerprint, without the leading `$`.
    pub fingerprint: Option<String>,
    /// IPv4 address, if known.
    pub ipv4: Option<String>,
    /// IPv6 address, if known.
    pub ipv6: Option<String>,
    /// Relay nickname.
    pub nickname: Option<String>,
}

/// One circuit as reported by the daemon at query time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Circuit {
    /// Circuit identifier.
    pub id: Option<String>,
    /// Status token, e.g. `BUILT` or `LAUNCHED`.
    pub status: Option<String>,
    /// Ordered relay path; empty until the circuit is built.
    pub path: Vec<Node>,
    /// Build flags with empty entries dropped.
    pub build_flags: Vec<String>,
    /// Circuit purpose, e.g. `GENERAL`.
    pub purpose: Option<String>,
    /// Hidden-service state, if the circuit serves one.
    pub hs_state: Option<String>,
    /// Rendezvous query, if any.
    pub rend_query: Option<String>,
    /// Creation timestamp.
    pub time_created: Option<DateTime<Utc>>,
    /// Local failure reason.
    pub reason: Option<String>,
    /// Failure reason reported by the remote side.
    pub remote_reason: Option<String>,
    /// SOCKS username tied to this circuit, if isolated by credentials.
    pub socks_username: Option<String>,
    /// SOCKS password tied to this circuit.
    pub socks_password: Option<String>,
}

/// Parse one raw circuit-status line into a structured record.
pub fn parse_circuit(line: &str) -> Option<Circuit> {
    let mut tokens = tokenize(line).into_iter();
    let id = non_empty(&tokens.next()?);
    let status = tokens.next().and_then(|s| non_empty(&s));
    let mut circuit = Circuit {
        id,
        status,
        ..Default::default()
    };
    for token in tokens {
        match token.split_once('=') {
            Some((key, value)) => {
                let value = unquote(value);
                match key {
                    "BUILD_FLAGS" => {
                        circuit.build_flags = value
                            .split(',')
                            .filter(|flag| !flag.is_empty())
                            .map(str::to_string)
                            .collect();
                    }
                    "PURPOSE" => circuit.purpose = non_empty(&value),
                    "HS_STATE" => circuit.hs_state = non_empty(&value),
                    "REND_QUERY" => circuit.rend_query = non_empty(&value),
                    "TIME_CREATED" => circuit.time_created = parse_time(&value),
                    "REASON" => circuit.reason = non_empty(&value),
                    "REMOTE_REASON" => circuit.remote_reason = non_empty(&value),
                    "SOCKS_USERNAME" => circuit.socks_username = non_empty(&value),
                    "SOCKS_PASSWORD" => circuit.socks_password = non_empty(&value),
                    _ => {}
                }
            }
            None => circuit.path = parse_path(&token),
        }
    }
    Some(circuit)
}

/// Fetch, parse, and enrich the daemon's current circuit list.
pub async fn query_circuits(channel: &ControlChannel) -> Result<Vec<Circuit>> {
    let raw = channel.raw_circuits().await?;
    let mut circuits: Vec<Circuit> = raw.iter().filter_map(|line| parse_circuit(line)).collect();
    for circuit in &mut circuits {
        for node in &mut circuit.path {
            enrich_node(channel, node).await;
        }
    }
    Ok(circuits)
}

/// Best-effort fill-in of relay details the status line does not carry:
/// address and nickname from the consensus entry, then the country code of
/// the IPv4 address. Lookup failures leave the fields absent.
async fn enrich_node(channel: &ControlChannel, node: &mut Node) {
    let Some(fingerprint) = node.fingerprint.clone() else {
        return;
    };
    if let Ok(Some(entry)) = channel.getinfo(&format!("ns/id/{fingerprint}")).await {
        apply_ns_entry(node, &entry);
    }
    if let Some(ipv4) = node.ipv4.clone() {
        if let Ok(Some(country)) = channel.getinfo(&format!("ip-to-country/{ipv4}")).await {
            node.country = non_empty(&country);
        }
    }
}

/// Apply a router-status consensus entry (`r` and `a` lines) to a node.
fn apply_ns_entry(node: &mut Node, entry: &str) {
    for line in entry.lines() {
        if let Some(rest) = line.strip_prefix("r ") {
            let fields: Vec<&str> = rest.split_whitespace().collect();
            // r <nickname> <identity> <digest> <date> <time> <IP> <ORPort> <DirPort>
            if fields.len() >= 8 {
                if node.nickname.is_none() {
                    node.nickname = non_empty(fields[0]);
                }
                node.ipv4 = non_empty(fields[fields.len() - 3]);
            }
        } else if let Some(rest) = line.strip_prefix("a ") {
            if let Some(addr) = rest.trim().strip_prefix('[') {
                if let Some((ipv6, _port)) = addr.split_once(']') {
                    node.ipv6 = non_empty(ipv6);
                }
            }
        }
    }
}

fn parse_path(raw: &str) -> Vec<Node> {
    raw.split(',')
        .filter(|entry| !entry.is_empty())
        .map(parse_node)
        .collect()
}

/// Parse a single long-name path entry, e.g. `$ABCD0123...~nickname`.
fn parse_node(entry: &str) -> Node {
    let entry = entry.trim();
    let (fingerprint, nickname) = match entry.split_once(['~', '=']) {
        Some((fp, nick)) => (fp, Some(nick)),
        None => (entry, None),
    };
    Node {
        fingerprint: non_empty(fingerprint.trim_start_matches('$')),
        nickname: nickname.and_then(non_empty),
        ..Default::default()
    }
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|t| t.and_utc())
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FP1: &str = "B2D9A3A21EA49AFE4B8909004FF1ED5FF1CCCD61";
    const FP2: &str = "0011223344556677889900112233445566778899";

    #[test]
    fn test_parse_built_circuit() {
        let line = format!(
            "7 BUILT ${FP1}~alpha,${FP2}~bravo BUILD_FLAGS=IS_INTERNAL,NEED_CAPACITY \
             PURPOSE=GENERAL TIME_CREATED=2026-08-30T12:00:05.123456"
        );
        let circuit = parse_circuit(&line).expect("circuit should parse");
        assert_eq!(circuit.id.as_deref(), Some("7"));
        assert_eq!(circuit.status.as_deref(), Some("BUILT"));
        assert_eq!(circuit.purpose.as_deref(), Some("GENERAL"));
        assert_eq!(circuit.build_flags, vec!["IS_INTERNAL", "NEED_CAPACITY"]);
        assert_eq!(circuit.path.len(), 2);
        assert_eq!(circuit.path[0].fingerprint.as_deref(), Some(FP1));
        assert_eq!(circuit.path[0].nickname.as_deref(), Some("alpha"));
        assert_eq!(circuit.path[1].nickname.as_deref(), Some("bravo"));
        assert!(circuit.time_created.is_some());
        assert_eq!(circuit.reason, None);
    }

    #[test]
    fn test_parse_launched_circuit_without_path() {
        let circuit = parse_circuit("3 LAUNCHED PURPOSE=GENERAL").expect("should parse");
        assert_eq!(circuit.status.as_deref(), Some("LAUNCHED"));
        assert!(circuit.path.is_empty());
    }

    #[test]
    fn test_empty_fields_normalize_to_absent() {
        let circuit =
            parse_circuit("9 FAILED PURPOSE= REASON=TIMEOUT REMOTE_REASON= BUILD_FLAGS=")
                .expect("should parse");
        assert_eq!(circuit.purpose, None);
        assert_eq!(circuit.reason.as_deref(), Some("TIMEOUT"));
        assert_eq!(circuit.remote_reason, None);
        assert!(circuit.build_flags.is_empty());
    }

    #[test]
    fn test_parse_quoted_socks_credentials() {
        let circuit = parse_circuit(
            "4 BUILT SOCKS_USERNAME=\"session one\" SOCKS_PASSWORD=\"\" PURPOSE=GENERAL",
        )
        .expect("should parse");
        assert_eq!(circuit.socks_username.as_deref(), Some("session one"));
        assert_eq!(circuit.socks_password, None);
    }

    #[test]
    fn test_parse_node_variants() {
        let node = parse_node(&format!("${FP1}~nick"));
        assert_eq!(node.fingerprint.as_deref(), Some(FP1));
        assert_eq!(node.nickname.as_deref(), Some("nick"));

        let bare = parse_node(&format!("${FP2}"));
        assert_eq!(bare.fingerprint.as_deref(), Some(FP2));
        assert_eq!(bare.nickname, None);
    }

    #[test]
    fn test_apply_ns_entry() {
        let entry = format!(
            "r charlie {FP2} ABCDEF 2026-08-30 11:59:00 10.1.2.3 9001 0\na [2001:db8::1]:9001"
        );
        let mut node = Node {
            fingerprint: Some(FP2.to_string()),
            ..Default::default()
        };
        apply_ns_entry(&mut node, &entry);
        assert_eq!(node.nickname.as_deref(), Some("charlie"));
        assert_eq!(node.ipv4.as_deref(), Some("10.1.2.3"));
        assert_eq!(node.ipv6.as_deref(), Some("2001:db8::1"));
    }

    #[test]
    fn test_blank_line_yields_nothing() {
        assert_eq!(parse_circuit(""), None);
    }
}
