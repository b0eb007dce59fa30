//! Error taxonomy for the Stratus client core

use thiserror::Error;

/// Result type alias for all Stratus core operations
pub type Result<T> = std::result::Result<T, Error>;

/// The closed set of failure outcomes used across the SDK.
///
/// Every public operation fails with exactly one of these. The set is
/// deliberately `Copy` so outcomes can be stored in request records and
/// replayed to callbacks without allocation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// Hostname resolution for the server URI failed
    #[error("DNS lookup failed")]
    DnsLookup,

    /// The operation is not available on this build or platform
    #[error("not implemented")]
    NotImplemented,

    /// Resource allocation failed (memory, slots, OS handles)
    #[error("allocation failed")]
    MemAlloc,

    /// The requested value is absent (empty or null body on a get)
    #[error("value is null")]
    Null,

    /// Malformed input (server URI, path too long, bad manifest shape)
    #[error("invalid format")]
    InvalidFormat,

    /// Payload serialization failed
    #[error("serialization failed")]
    Serialize,

    /// Transport-level I/O failure
    #[error("transport I/O error")]
    Io,

    /// No response arrived in time, or a wait was exhausted
    #[error("timed out")]
    Timeout,

    /// The bounded request queue is full
    #[error("request queue full")]
    QueueFull,

    /// The client is not running
    #[error("client not running")]
    InvalidState,

    /// The operation is not permitted in the current configuration
    #[error("not allowed")]
    NotAllowed,

    /// The server answered with a non-2.xx response code
    #[error("server responded {class}.{code:02}")]
    Fail {
        /// CoAP response class (the 4 in 4.03)
        class: u8,
        /// CoAP response detail (the 03 in 4.03)
        code: u8,
    },
}

/// Outcome of one request/response exchange as seen by completion callbacks.
///
/// Preserves the raw CoAP response code next to the derived status so a
/// caller can distinguish, say, 4.01 from 4.04 on a [`Error::Fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerResponse {
    /// `Ok(())` iff `class == 2`
    pub status: Result<()>,
    /// CoAP response class (the 2 in 2.05)
    pub class: u8,
    /// CoAP response detail (the 05 in 2.05)
    pub code: u8,
}

impl ServerResponse {
    /// Build a response from a received CoAP code.
    pub fn from_code(class: u8, code: u8) -> Self {
        let status = if class == 2 {
            Ok(())
        } else {
            Err(Error::Fail { class, code })
        };
        Self {
            status,
            class,
            code,
        }
    }

    /// The synthetic response used when the server never answered.
    pub fn timeout() -> Self {
        Self {
            status: Err(Error::Timeout),
            class: 0,
            code: 0,
        }
    }

    /// Whether the server accepted the request (2.xx).
    pub fn is_success(&self) -> bool {
        self.status.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_iff_class_two() {
        assert!(ServerResponse::from_code(2, 5).is_success());
        assert!(!ServerResponse::from_code(4, 4).is_success());
        assert_eq!(
            ServerResponse::from_code(4, 3).status,
            Err(Error::Fail { class: 4, code: 3 })
        );
    }

    #[test]
    fn timeout_response_is_not_success() {
        let response = ServerResponse::timeout();
        assert!(!response.is_success());
        assert_eq!(response.status, Err(Error::Timeout));
    }

    #[test]
    fn fail_display_includes_code() {
        let err = Error::Fail { class: 4, code: 3 };
        assert_eq!(err.to_string(), "server responded 4.03");
    }
}
