// src/client/mod.rs

//! The protocol-client seam: what the sampler needs from an MQTT client library.

pub mod mqtt;

use crate::config::ConnectionParameters;
use crate::error::SamplerError;

use async_trait::async_trait;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

pub use mqtt::MqttClient;

/// Delivery guarantee requested for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum QoS {
  AtMostOnce = 0,
  AtLeastOnce = 1,
  ExactlyOnce = 2,
}

impl QoS {
  pub fn from_u8(value: u8) -> Option<Self> {
    match value {
      0 => Some(QoS::AtMostOnce),
      1 => Some(QoS::AtLeastOnce),
      2 => Some(QoS::ExactlyOnce),
      _ => None,
    }
  }
}

/// Opens broker connections. One instance is shared by every virtual user.
#[async_trait]
pub trait ProtocolClient: Send + Sync + 'static {
  /// Opens and handshakes a connection. The caller bounds the wait with its connect timeout.
  async fn connect(&self, params: &ConnectionParameters) -> Result<Box<dyn Connection>, SamplerError>;
}

/// An established broker session, owned by exactly one virtual user.
///
/// Dropping the handle closes the transport without a protocol-level goodbye.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
  /// Human-readable identity used in sample messages and logs.
  fn description(&self) -> String;

  fn is_connected(&self) -> bool;

  /// Subscribes to `topic`, returning the QoS the broker granted.
  async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<QoS, SamplerError>;

  /// Closes the session. Consumes the handle, so it cannot be called twice.
  async fn disconnect(self: Box<Self>) -> Result<(), SamplerError>;
}

/// Byte stream a secured connection runs over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Black-box factory that upgrades a TCP stream for the `Ssl` transport.
#[async_trait]
pub trait SecurityContext: Send + Sync + 'static {
  async fn secure(&self, stream: TcpStream, server_name: &str) -> Result<BoxedStream, SamplerError>;
}
