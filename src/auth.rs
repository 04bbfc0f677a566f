//! The SASL line protocol D-Bus performs before switching to the binary
//! protocol.
//!
//! Each line is terminated by `\r\n`. The client starts by sending a single
//! NUL byte, authenticates with `AUTH EXTERNAL` and optionally negotiates
//! file descriptor passing before sending `BEGIN`.

use std::fmt;

use crate::error::{Error, ErrorKind, Result};

/// A command sent by the client during authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest<'a> {
    /// EXTERNAL authentication with the hex-encoded uid as its payload.
    External(&'a str),
    /// Ask the server to agree to file descriptor passing.
    NegotiateUnixFd,
    /// End authentication and switch to the binary protocol.
    Begin,
}

impl fmt::Display for AuthRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthRequest::External(uid) => write!(f, "AUTH EXTERNAL {uid}\r\n"),
            AuthRequest::NegotiateUnixFd => write!(f, "NEGOTIATE_UNIX_FD\r\n"),
            AuthRequest::Begin => write!(f, "BEGIN\r\n"),
        }
    }
}

/// A response line from the server during authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResponse {
    /// Authentication succeeded. Carries the server GUID.
    Ok(String),
    /// Authentication was rejected. Carries the mechanisms the server
    /// supports.
    Rejected(String),
    /// The server wants additional data. EXTERNAL never does.
    Data(String),
    /// The server did not understand the last command.
    Error(String),
    /// The server agreed to file descriptor passing.
    AgreeUnixFd,
}

impl AuthResponse {
    /// Parse a single `\r\n` terminated response line.
    pub fn parse_line(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);

        let (command, rest) = match line.split_once(' ') {
            Some((command, rest)) => (command, rest),
            None => (line, ""),
        };

        match command {
            "OK" => Ok(AuthResponse::Ok(rest.to_owned())),
            "REJECTED" => Ok(AuthResponse::Rejected(rest.to_owned())),
            "DATA" => Ok(AuthResponse::Data(rest.to_owned())),
            "ERROR" => Ok(AuthResponse::Error(rest.to_owned())),
            "AGREE_UNIX_FD" => Ok(AuthResponse::AgreeUnixFd),
            _ => Err(Error::new(ErrorKind::Auth(
                format!("got unknown response line `{line}`").into(),
            ))),
        }
    }
}

/// Encode a uid the way `AUTH EXTERNAL` expects it: the decimal string,
/// hex-encoded.
pub fn external_payload(uid: u32) -> String {
    hex::encode(uid.to_string())
}

/// The `AUTH EXTERNAL` payload for the current process.
#[cfg(unix)]
pub(crate) fn external_payload_for_self() -> String {
    let uid = unsafe { libc::getuid() };
    external_payload(uid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_payload() {
        assert_eq!(external_payload(1000), "31303030");
        assert_eq!(external_payload(0), "30");
        assert_eq!(external_payload(u32::MAX), "34323934393637323935");
    }

    #[test]
    fn test_request_lines() {
        assert_eq!(
            AuthRequest::External("31303030").to_string(),
            "AUTH EXTERNAL 31303030\r\n"
        );
        assert_eq!(
            AuthRequest::NegotiateUnixFd.to_string(),
            "NEGOTIATE_UNIX_FD\r\n"
        );
        assert_eq!(AuthRequest::Begin.to_string(), "BEGIN\r\n");
    }

    #[test]
    fn test_parse_lines() {
        assert_eq!(
            AuthResponse::parse_line("OK 6fa00redacted00guid\r\n").unwrap(),
            AuthResponse::Ok("6fa00redacted00guid".to_owned())
        );
        assert_eq!(
            AuthResponse::parse_line("REJECTED EXTERNAL DBUS_COOKIE_SHA1\r\n").unwrap(),
            AuthResponse::Rejected("EXTERNAL DBUS_COOKIE_SHA1".to_owned())
        );
        assert_eq!(
            AuthResponse::parse_line("AGREE_UNIX_FD\r\n").unwrap(),
            AuthResponse::AgreeUnixFd
        );
        assert_eq!(
            AuthResponse::parse_line("ERROR Unsupported command\r\n").unwrap(),
            AuthResponse::Error("Unsupported command".to_owned())
        );
        assert!(AuthResponse::parse_line("BOGUS\r\n").is_err());
    }
}
