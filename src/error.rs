// Error types for the transport edge and startup configuration.
//
// Runtime signal conditions (quality loss, upstream resets, transient input
// faults) are recovered locally inside each sensor pipeline and never
// surface as errors; what remains here is the wire boundary and the
// fail-fast startup checks.

use std::fmt;
use std::io;

/// Errors on the OSC transport edge.
#[derive(Debug)]
pub enum TransportError {
    /// Failed to bind a UDP socket
    Bind { addr: String, source: io::Error },

    /// A datagram that is not decodable as OSC
    Decode { details: String },

    /// Well-formed OSC that violates the wire contract
    Malformed { addr: String, details: String },

    /// Sending a beat datagram failed
    Send { target: String, source: io::Error },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Bind { addr, source } => {
                write!(f, "failed to bind {}: {}", addr, source)
            }
            TransportError::Decode { details } => {
                write!(f, "undecodable OSC datagram: {}", details)
            }
            TransportError::Malformed { addr, details } => {
                write!(f, "malformed message at {}: {}", addr, details)
            }
            TransportError::Send { target, source } => {
                write!(f, "failed to send to {}: {}", target, source)
            }
        }
    }
}

impl std::error::Error for TransportError {}

/// Configuration errors; fatal at startup only.
#[derive(Debug)]
pub enum ConfigError {
    /// A tunable constant is outside its physical bounds
    InvalidTunable { name: &'static str, details: String },

    /// An egress target is not a resolvable socket address
    InvalidTarget { value: String, details: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidTunable { name, details } => {
                write!(f, "invalid tunable {}: {}", name, details)
            }
            ConfigError::InvalidTarget { value, details } => {
                write!(f, "invalid beat target {:?}: {}", value, details)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Malformed {
            addr: "/ppg/9".to_string(),
            details: "sensor id out of range".to_string(),
        };
        let display = format!("{}", err);
        assert!(display.contains("/ppg/9"));
        assert!(display.contains("out of range"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidTarget {
            value: "nowhere".to_string(),
            details: "missing port".to_string(),
        };
        assert!(format!("{}", err).contains("nowhere"));
    }
}
