//! The virt error taxonomy.
//!
//! Errors raised by the authorisation service travel between processes as
//! `ERR turnip virt error: <KIND> <message>` packets. Inside a process they
//! are the [`VirtError`] sum type; rendering to and parsing from the wire
//! form happens only at the proxy boundaries, and the outermost frontends
//! decide how much of it the client gets to see.
use std::fmt;

use bstr::ByteSlice as _;

/// Prefix of every error packet payload.
pub const ERROR_PREFIX: &[u8] = b"ERR ";
/// Prefix marking an error as originating at the authorisation service.
pub const VIRT_ERROR_PREFIX: &[u8] = b"turnip virt error: ";

/// Build an error-packet payload: `ERR <message>\n`.
pub fn err_line(message: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(ERROR_PREFIX.len() + message.len() + 1);
    payload.extend_from_slice(ERROR_PREFIX);
    payload.extend_from_slice(message);
    payload.push(b'\n');
    payload
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    Unauthorized,
    GatewayTimeout,
    InternalServerError,
}

impl ErrorKind {
    pub fn as_wire(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::GatewayTimeout => "GATEWAY_TIMEOUT",
            ErrorKind::InternalServerError => "INTERNAL_SERVER_ERROR",
        }
    }

    pub fn from_wire(name: &[u8]) -> Option<Self> {
        match name {
            b"NOT_FOUND" => Some(ErrorKind::NotFound),
            b"FORBIDDEN" => Some(ErrorKind::Forbidden),
            b"UNAUTHORIZED" => Some(ErrorKind::Unauthorized),
            b"GATEWAY_TIMEOUT" => Some(ErrorKind::GatewayTimeout),
            b"INTERNAL_SERVER_ERROR" => Some(ErrorKind::InternalServerError),
            _ => None,
        }
    }

    /// Translate an authorisation-service fault code.
    ///
    /// Fault 410 maps to `Unauthorized` here; the HTTP basic-auth path
    /// instead treats it as "anonymous allowed". That asymmetry is part of
    /// the service contract.
    pub fn from_fault_code(code: i32) -> Self {
        match code {
            1 => ErrorKind::NotFound,
            2 => ErrorKind::Forbidden,
            3 | 410 => ErrorKind::Unauthorized,
            _ => ErrorKind::InternalServerError,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// An error whose kind originates at the authorisation service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtError {
    pub kind: ErrorKind,
    pub message: String,
}

impl VirtError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Render as an error-packet payload:
    /// `ERR turnip virt error: <KIND> <message>\n`.
    pub fn to_packet_payload(&self) -> Vec<u8> {
        let mut message = VIRT_ERROR_PREFIX.to_vec();
        message.extend_from_slice(self.kind.as_wire().as_bytes());
        message.push(b' ');
        message.extend_from_slice(self.message.as_bytes());
        err_line(&message)
    }

    /// Parse an error-packet payload, if it is a virt error.
    ///
    /// Unknown kinds parse as `InternalServerError`; the message is always
    /// the part after the kind.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let rest = payload.strip_prefix(ERROR_PREFIX)?;
        let rest = rest.strip_prefix(VIRT_ERROR_PREFIX)?;
        let rest = rest.strip_suffix(b"\n").unwrap_or(rest);
        let (name, message) = match rest.iter().position(|b| *b == b' ') {
            Some(sp) => (&rest[..sp], &rest[sp + 1..]),
            None => (rest, &rest[rest.len()..]),
        };
        let kind = ErrorKind::from_wire(name).unwrap_or(ErrorKind::InternalServerError);
        Some(VirtError {
            kind,
            message: message.to_str_lossy().into_owned(),
        })
    }
}

impl fmt::Display for VirtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.message)
    }
}

impl std::error::Error for VirtError {}

/// Rewrite a virt error packet payload as an ordinary error, dropping the
/// kind. The distinction only matters to the smart HTTP frontend; clients
/// that cannot ask for credentials have no use for it.
pub fn strip_virt_kind(payload: &[u8]) -> Option<Vec<u8>> {
    let error = VirtError::parse(payload)?;
    Some(err_line(error.message.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let error = VirtError::new(ErrorKind::NotFound, "Repository does not exist.");
        let payload = error.to_packet_payload();
        assert_eq!(
            payload,
            b"ERR turnip virt error: NOT_FOUND Repository does not exist.\n"
        );
        assert_eq!(VirtError::parse(&payload), Some(error));
    }

    #[test]
    fn test_parse_unknown_kind() {
        let parsed = VirtError::parse(b"ERR turnip virt error: WAT broke\n").unwrap();
        assert_eq!(parsed.kind, ErrorKind::InternalServerError);
        assert_eq!(parsed.message, "broke");
    }

    #[test]
    fn test_parse_rejects_plain_errors() {
        assert_eq!(VirtError::parse(b"ERR something else\n"), None);
        assert_eq!(VirtError::parse(b"not an error"), None);
    }

    #[test]
    fn test_fault_codes() {
        assert_eq!(ErrorKind::from_fault_code(1), ErrorKind::NotFound);
        assert_eq!(ErrorKind::from_fault_code(2), ErrorKind::Forbidden);
        assert_eq!(ErrorKind::from_fault_code(3), ErrorKind::Unauthorized);
        assert_eq!(ErrorKind::from_fault_code(410), ErrorKind::Unauthorized);
        assert_eq!(
            ErrorKind::from_fault_code(999),
            ErrorKind::InternalServerError
        );
    }
}
