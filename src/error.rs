//! Error types for the interception relay

use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tokio_rustls::rustls;

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for relay operations
#[derive(Error, Debug)]
pub enum Error {
  /// Key generation, serial number or certificate encoding failed
  #[error("certificate generation failed ({context}): {source}")]
  CertGeneration {
    /// Which step of the issuance failed
    context: &'static str,
    /// Underlying cause
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  /// TLS configuration error
  #[error("TLS error: {0}")]
  Tls(#[from] rustls::Error),

  /// The listening socket could not be bound
  #[error("failed to bind {addr}: {source}")]
  Bind {
    /// Requested local address
    addr: String,
    /// Underlying cause
    #[source]
    source: io::Error,
  },

  /// The upstream server could not be reached or failed its handshake
  #[error("failed to dial upstream {addr}: {source}")]
  Dial {
    /// Upstream address
    addr: String,
    /// Underlying cause
    #[source]
    source: io::Error,
  },

  /// The client-side TLS handshake failed
  #[error("TLS handshake with {peer} failed: {source}")]
  Handshake {
    /// Client address
    peer: SocketAddr,
    /// Underlying cause
    #[source]
    source: io::Error,
  },

  /// The configured hostname is not a valid TLS server name
  #[error("invalid server name: {0}")]
  InvalidServerName(String),

  /// Invalid or missing configuration
  #[error("configuration error: {0}")]
  Config(String),

  /// Trust store mutation failed
  #[error("trust store error: {0}")]
  TrustStore(String),

  /// IO error
  #[error("IO error: {0}")]
  Io(#[from] io::Error),
}

impl Error {
  /// Create a certificate generation error and log it
  pub fn cert_generation<E>(context: &'static str, source: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    let error = Error::CertGeneration {
      context,
      source: Box::new(source),
    };
    tracing::error!("{}", error);
    error
  }

  /// Create a configuration error and log it
  pub fn config(msg: impl Into<String>) -> Self {
    let error = Error::Config(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a trust store error and log it
  pub fn trust_store(msg: impl Into<String>) -> Self {
    let error = Error::TrustStore(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Whether the error must stop the process rather than a single session.
  ///
  /// Without certificate material, a bound listener or a consistent trust
  /// store nothing can be served safely.
  pub fn is_fatal(&self) -> bool {
    match self {
      Error::CertGeneration { .. }
      | Error::Tls(_)
      | Error::Bind { .. }
      | Error::InvalidServerName(_)
      | Error::Config(_)
      | Error::TrustStore(_) => true,
      Error::Dial { .. } | Error::Handshake { .. } | Error::Io(_) => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fatal_classification() {
    let bind = Error::Bind {
      addr: "127.0.0.1:443".to_string(),
      source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
    };
    assert!(bind.is_fatal());
    assert!(Error::TrustStore("security exited 1".to_string()).is_fatal());
    let cert = Error::cert_generation("generate private key", rcgen::Error::CouldNotParseKeyPair);
    assert!(cert.is_fatal());

    let dial = Error::Dial {
      addr: "127.0.0.1:1".to_string(),
      source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
    };
    assert!(!dial.is_fatal());
    assert!(!Error::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_fatal());
  }

  #[test]
  fn test_error_carries_operation_and_cause() {
    let dial = Error::Dial {
      addr: "upstream.test:443".to_string(),
      source: io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
    };
    let message = dial.to_string();
    assert!(message.contains("upstream.test:443"));
    assert!(message.contains("connection refused"));
  }
}
