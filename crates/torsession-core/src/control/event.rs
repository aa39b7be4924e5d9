//! Asynchronous control-port event notifications.

use std::collections::HashMap;

/// A structured asynchronous notification pushed by the daemon.
///
/// Wire form is a `650` line such as
/// `650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=57 SUMMARY="Loading relays"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlEvent {
    /// Event class, e.g. `STATUS_CLIENT`.
    pub kind: String,
    /// Severity token, e.g. `NOTICE`.
    pub severity: String,
    /// Action token, e.g. `BOOTSTRAP`.
    pub action: String,
    /// Remaining `KEY=value` arguments; quoted values are unquoted.
    pub arguments: HashMap<String, String>,
}

impl ControlEvent {
    /// Parse the payload of a `650` line (the text after the status code).
    pub(crate) fn parse(payload: &str) -> Option<Self> {
        let mut tokens = tokenize(payload).into_iter();
        let kind = tokens.next()?;
        let severity = tokens.next().unwrap_or_default();
        let action = tokens.next().unwrap_or_default();
        let mut arguments = HashMap::new();
        for token in tokens {
            if let Some((key, value)) = token.split_once('=') {
                arguments.insert(key.to_string(), unquote(value));
            }
        }
        Some(Self {
            kind,
            severity,
            action,
            arguments,
        })
    }
}

/// Persistent subscriber for structured events. The return value reports
/// whether the observer consumed the event; consumption never suppresses
/// delivery to other observers.
pub(crate) type EventObserver = Box<dyn Fn(&ControlEvent) -> bool + Send>;

/// Persistent subscriber for connectivity toggles.
pub(crate) type ConnectivityObserver = Box<dyn Fn(bool) + Send>;

/// Split a control-protocol line into whitespace-separated tokens,
/// keeping double-quoted spans (with `\"` and `\\` escapes) intact.
pub(crate) fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let bytes = line.as_bytes();
    let mut start = None;
    let mut in_quotes = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b' ' if !in_quotes => {
                if let Some(s) = start.take() {
                    tokens.push(line[s..i].to_string());
                }
            }
            b'"' => {
                in_quotes = !in_quotes;
                start.get_or_insert(i);
            }
            b'\\' if in_quotes => {
                start.get_or_insert(i);
                i += 1;
            }
            _ => {
                start.get_or_insert(i);
            }
        }
        i += 1;
    }
    if let Some(s) = start {
        tokens.push(line[s..].to_string());
    }
    tokens
}

/// Remove surrounding double quotes and resolve `\"` and `\\` escapes.
pub(crate) fn unquote(value: &str) -> String {
    let inner = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }
    out
}
