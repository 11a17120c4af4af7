// src/error.rs

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive] // Allows adding more variants later without breaking change
pub enum SamplerError {
  // --- I/O Errors ---
  #[error("I/O error: {0}")]
  Io(#[from] io::Error),

  // --- Timeouts ---
  #[error("Operation timed out")]
  Timeout,

  // --- Connection Errors ---
  #[error("Connection refused by peer: {0}")]
  ConnectionRefused(String),
  #[error("Host is unreachable: {0}")]
  HostUnreachable(String),
  #[error("Connection closed by peer or transport")]
  ConnectionClosed,
  #[error("Endpoint resolution failed: {0}")]
  EndpointResolutionFailed(String),

  // --- Security Errors ---
  #[error("Authentication failed: {0}")]
  AuthenticationFailure(String),
  #[error("Security error: {0}")]
  SecurityError(String),

  // --- Protocol Errors ---
  #[error("MQTT protocol violation: {0}")]
  ProtocolViolation(String),
  #[error("Subscription to '{0}' rejected by broker")]
  SubscribeRejected(String),

  // --- Option Errors ---
  #[error("Unknown sampler option: {0}")]
  InvalidOption(String),
  #[error("Invalid value '{value}' for option {option}")]
  InvalidOptionValue { option: &'static str, value: String },

  // --- State Errors ---
  #[error("Operation is invalid for the current sampler state: {0}")]
  InvalidState(&'static str),
  #[error("Operation interrupted")]
  Interrupted,

  // --- Internal Errors ---
  #[error("Internal error: {0}")]
  Internal(String),
}

impl SamplerError {
  /// Maps a connect-time `io::Error` onto the matching variant, keeping the endpoint for context.
  pub fn from_io_endpoint(e: io::Error, endpoint: &str) -> Self {
    match e.kind() {
      io::ErrorKind::ConnectionRefused => SamplerError::ConnectionRefused(endpoint.to_string()),
      io::ErrorKind::TimedOut => SamplerError::Timeout,
      io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => {
        SamplerError::ConnectionClosed
      }
      io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
        SamplerError::HostUnreachable(endpoint.to_string())
      }
      _ => SamplerError::Io(e),
    }
  }

  /// Whether a connect attempt that failed with this error is worth repeating.
  pub(crate) fn is_retryable_connect_error(&self) -> bool {
    matches!(
      self,
      SamplerError::ConnectionRefused(_)
        | SamplerError::HostUnreachable(_)
        | SamplerError::ConnectionClosed
        | SamplerError::Io(_)
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn io_errors_map_by_kind() {
    let refused = SamplerError::from_io_endpoint(io::Error::from(io::ErrorKind::ConnectionRefused), "tcp://h:1");
    assert!(matches!(refused, SamplerError::ConnectionRefused(ref ep) if ep == "tcp://h:1"));

    let reset = SamplerError::from_io_endpoint(io::Error::from(io::ErrorKind::ConnectionReset), "tcp://h:1");
    assert!(matches!(reset, SamplerError::ConnectionClosed));

    let other = SamplerError::from_io_endpoint(io::Error::from(io::ErrorKind::Other), "tcp://h:1");
    assert!(matches!(other, SamplerError::Io(_)));
  }

  #[test]
  fn auth_failures_are_not_retried() {
    assert!(!SamplerError::AuthenticationFailure("bad".into()).is_retryable_connect_error());
    assert!(SamplerError::ConnectionRefused("x".into()).is_retryable_connect_error());
  }
}
