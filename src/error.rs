//! Error types for the covert transport core.

use thiserror::Error;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while establishing or driving a covert session.
#[derive(Error, Debug)]
pub enum Error {
    /// Key generation, certificate template build, signing or DER encoding failed
    #[error("certification error: {0}")]
    Certification(String),

    /// DTLS handshake failed (timeout, bad flight, verification failure)
    #[error("handshake failure: {0}")]
    Handshake(String),

    /// A completed handshake carried a ClientHello random with no registration
    #[error("no matching registration for client hello random")]
    NoMatchingRegistration,

    /// A second acceptor registered the same derived connection ID
    #[error("seed already registered")]
    SeedAlreadyRegistered,

    /// The registration names a different transport; the dispatcher should try others
    #[error("registration is not for this transport")]
    NotThisTransport,

    /// Both rendezvous arms failed
    #[error("rendezvous failed: dial: {dial}; accept: {accept}")]
    Rendezvous {
        /// Failure from the outbound dial arm
        dial: String,
        /// Failure from the listener accept arm
        accept: String,
    },

    /// TUN open, ioctl, or injection write failed
    #[error("dnat failure: {0}")]
    Dnat(String),

    /// SCTP association setup or stream handling failed
    #[error("sctp error: {0}")]
    Sctp(String),

    /// The heartbeat watchdog closed the connection for inactivity
    #[error("heartbeat timeout: connection closed by watchdog")]
    HeartbeatTimeout,

    /// The operation was canceled by its caller
    #[error("operation canceled")]
    Canceled,

    /// Malformed wire data
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// The connection is closed
    #[error("connection closed")]
    Closed,
}

impl Error {
    /// Create a new certification error
    pub fn certification(msg: impl Into<String>) -> Self {
        Error::Certification(msg.into())
    }

    /// Create a new handshake error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::Handshake(msg.into())
    }

    /// Create a new DNAT error
    pub fn dnat(msg: impl Into<String>) -> Self {
        Error::Dnat(msg.into())
    }

    /// Create a new SCTP error
    pub fn sctp(msg: impl Into<String>) -> Self {
        Error::Sctp(msg.into())
    }

    /// Create a new invalid-message error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidMessage(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// True when the error concerns a single session.
    ///
    /// These are recovered into counters and never crash the listener;
    /// startup-level failures (socket bind, TUN init, bad env) are fatal.
    pub fn is_per_session(&self) -> bool {
        !matches!(self, Error::Config(_) | Error::Dnat(_))
    }

    /// Check if this error was caused by cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NoMatchingRegistration;
        assert_eq!(
            err.to_string(),
            "no matching registration for client hello random"
        );

        let err = Error::Rendezvous {
            dial: "timeout".into(),
            accept: "canceled".into(),
        };
        assert!(err.to_string().contains("timeout"));
        assert!(err.to_string().contains("canceled"));
    }

    #[test]
    fn test_per_session_classification() {
        assert!(Error::NoMatchingRegistration.is_per_session());
        assert!(Error::SeedAlreadyRegistered.is_per_session());
        assert!(!Error::dnat("tun open failed").is_per_session());
        assert!(!Error::config("bad CJ_CORECOUNT").is_per_session());
    }
}
