//! Logging helpers that keep control-channel credentials out of log output.

use std::fmt;

/// A byte-slice wrapper that logs only the length, never the contents.
///
/// Used for the authentication cookie, which is a shared secret.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl fmt::Display for RedactedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl fmt::Debug for RedactedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Strip credential material from a control command before logging it.
pub(crate) fn redact_command(command: &str) -> String {
    if command.starts_with("AUTHENTICATE") {
        "AUTHENTICATE [REDACTED]".to_string()
    } else {
        command.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_bytes_hides_contents() {
        let cookie = [0xAAu8; 32];
        assert_eq!(format!("{}", RedactedBytes(&cookie)), "[32 bytes]");
    }

    #[test]
    fn test_redact_command() {
        assert_eq!(
            redact_command("AUTHENTICATE deadbeef"),
            "AUTHENTICATE [REDACTED]"
        );
        assert_eq!(redact_command("GETINFO version"), "GETINFO version");
    }
}
