//! Startup handshake between the host and a freshly spawned plugin.
//!
//! Before any RPC happens the child must prove it speaks this protocol by
//! writing a single line on stdout:
//!
//! ```text
//! MEDLEY_PLUGIN|<cookie-value>|<protocol-version>|tcp|<addr>
//! ```
//!
//! The cookie key/value pair and the protocol version must match this
//! crate's constants exactly; anything else aborts the load with
//! `HandshakeFailed` so the host never drives RPC at an unrelated binary.
//! The trailing fields negotiate the endpoint the host dials for the framed
//! transport.

use crate::error::RuntimeError;
use crate::wire::{COOKIE_KEY, COOKIE_VALUE, PROTOCOL_VERSION};
use std::net::SocketAddr;

/// A parsed and not-yet-validated handshake line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub cookie_key: String,
    pub cookie_value: String,
    pub protocol_version: u32,
    pub endpoint: SocketAddr,
}

impl Handshake {
    /// Parse the raw line a child printed on stdout.
    pub fn parse(line: &str) -> Result<Self, RuntimeError> {
        let line = line.trim();
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() != 5 {
            return Err(RuntimeError::HandshakeFailed {
                reason: format!("expected 5 fields, got {}", parts.len()),
            });
        }
        let protocol_version: u32 =
            parts[2]
                .parse()
                .map_err(|_| RuntimeError::HandshakeFailed {
                    reason: format!("non-numeric protocol version {:?}", parts[2]),
                })?;
        if parts[3] != "tcp" {
            return Err(RuntimeError::HandshakeFailed {
                reason: format!("unsupported transport {:?}", parts[3]),
            });
        }
        let endpoint: SocketAddr = parts[4]
            .parse()
            .map_err(|_| RuntimeError::HandshakeFailed {
                reason: format!("unparseable endpoint {:?}", parts[4]),
            })?;
        Ok(Self {
            cookie_key: parts[0].to_string(),
            cookie_value: parts[1].to_string(),
            protocol_version,
            endpoint,
        })
    }

    /// Enforce the exact-match rules on cookie and version.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.cookie_key != COOKIE_KEY || self.cookie_value != COOKIE_VALUE {
            return Err(RuntimeError::HandshakeFailed {
                reason: "magic cookie mismatch".into(),
            });
        }
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(RuntimeError::HandshakeFailed {
                reason: format!(
                    "protocol version {} (host speaks {})",
                    self.protocol_version, PROTOCOL_VERSION
                ),
            });
        }
        Ok(())
    }

    /// Parse and validate in one step.
    pub fn read(line: &str) -> Result<Self, RuntimeError> {
        let handshake = Self::parse(line)?;
        handshake.validate()?;
        Ok(handshake)
    }

    /// Render the line a conforming plugin prints for `addr`.
    pub fn line_for(addr: SocketAddr) -> String {
        format!("{COOKIE_KEY}|{COOKIE_VALUE}|{PROTOCOL_VERSION}|tcp|{addr}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_a_conforming_line() {
        let addr: SocketAddr = "127.0.0.1:43817".parse().unwrap();
        let hs = Handshake::read(&Handshake::line_for(addr)).unwrap();
        assert_eq!(hs.endpoint, addr);
        assert_eq!(hs.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn rejects_wrong_cookie() {
        let line = format!("{COOKIE_KEY}|deadbeef|{PROTOCOL_VERSION}|tcp|127.0.0.1:1");
        let err = Handshake::read(&line).unwrap_err();
        assert!(matches!(err, RuntimeError::HandshakeFailed { .. }));
    }

    #[test]
    fn rejects_wrong_version() {
        let line = format!("{COOKIE_KEY}|{COOKIE_VALUE}|99|tcp|127.0.0.1:1");
        assert!(Handshake::read(&line).is_err());
    }

    #[test]
    fn rejects_garbage() {
        for line in ["", "hello world", "a|b", "a|b|c|d|e|f"] {
            assert!(
                Handshake::parse(line).is_err(),
                "line {line:?} should not parse"
            );
        }
    }

    #[test]
    fn rejects_non_tcp_transport() {
        let line = format!("{COOKIE_KEY}|{COOKIE_VALUE}|{PROTOCOL_VERSION}|unix|127.0.0.1:1");
        assert!(Handshake::parse(&line).is_err());
    }
}
