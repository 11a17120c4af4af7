// src/client/mqtt/packet.rs

//! The MQTT 3.1.1 control packets needed to open, subscribe, keep alive and close a session.

use crate::client::QoS;

use bitflags::bitflags;

pub const PROTOCOL_NAME: &str = "MQTT";
pub const PROTOCOL_LEVEL_3_1_1: u8 = 4;

// Control packet types (upper nibble of the fixed header).
pub const CONNECT: u8 = 1;
pub const CONNACK: u8 = 2;
pub const PUBLISH: u8 = 3;
pub const SUBSCRIBE: u8 = 8;
pub const SUBACK: u8 = 9;
pub const PINGREQ: u8 = 12;
pub const PINGRESP: u8 = 13;
pub const DISCONNECT: u8 = 14;

/// Largest value the variable-length "remaining length" field can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

bitflags! {
  /// Flags byte of the CONNECT variable header.
  #[derive(Debug, Clone, Copy, PartialEq, Eq)]
  pub struct ConnectFlags: u8 {
    const CLEAN_SESSION = 0b0000_0010;
    const WILL          = 0b0000_0100;
    const WILL_QOS      = 0b0001_1000;
    const WILL_RETAIN   = 0b0010_0000;
    const PASSWORD      = 0b0100_0000;
    const USERNAME      = 0b1000_0000;
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
  pub client_id: String,
  pub keep_alive_secs: u16,
  pub clean_session: bool,
  pub username: Option<String>,
  pub password: Option<String>,
}

impl Connect {
  pub(crate) fn flags(&self) -> ConnectFlags {
    let mut flags = ConnectFlags::empty();
    if self.clean_session {
      flags |= ConnectFlags::CLEAN_SESSION;
    }
    if self.username.is_some() {
      flags |= ConnectFlags::USERNAME;
    }
    if self.password.is_some() {
      flags |= ConnectFlags::PASSWORD;
    }
    flags
  }
}

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
  Accepted,
  UnacceptableProtocolVersion,
  IdentifierRejected,
  ServerUnavailable,
  BadUserNameOrPassword,
  NotAuthorized,
}

impl ConnectReturnCode {
  pub fn from_u8(code: u8) -> Option<Self> {
    match code {
      0 => Some(Self::Accepted),
      1 => Some(Self::UnacceptableProtocolVersion),
      2 => Some(Self::IdentifierRejected),
      3 => Some(Self::ServerUnavailable),
      4 => Some(Self::BadUserNameOrPassword),
      5 => Some(Self::NotAuthorized),
      _ => None,
    }
  }

  pub fn as_u8(&self) -> u8 {
    match self {
      Self::Accepted => 0,
      Self::UnacceptableProtocolVersion => 1,
      Self::IdentifierRejected => 2,
      Self::ServerUnavailable => 3,
      Self::BadUserNameOrPassword => 4,
      Self::NotAuthorized => 5,
    }
  }
}

/// Per-filter SUBACK result: the granted QoS, or failure (0x80).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
  Granted(QoS),
  Failure,
}

impl SubscribeReturnCode {
  pub fn from_u8(code: u8) -> Option<Self> {
    match code {
      0x80 => Some(Self::Failure),
      other => QoS::from_u8(other).map(Self::Granted),
    }
  }

  pub fn as_u8(&self) -> u8 {
    match self {
      Self::Granted(qos) => *qos as u8,
      Self::Failure => 0x80,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
  Connect(Connect),
  ConnAck {
    session_present: bool,
    code: ConnectReturnCode,
  },
  Subscribe {
    packet_id: u16,
    filters: Vec<(String, QoS)>,
  },
  SubAck {
    packet_id: u16,
    return_codes: Vec<SubscribeReturnCode>,
  },
  PingReq,
  PingResp,
  Disconnect,
  /// Any packet this client does not act on (e.g. a PUBLISH of a retained message).
  /// The body has already been consumed.
  Other { packet_type: u8 },
}

impl Packet {
  pub fn name(&self) -> &'static str {
    match self {
      Packet::Connect(_) => "CONNECT",
      Packet::ConnAck { .. } => "CONNACK",
      Packet::Subscribe { .. } => "SUBSCRIBE",
      Packet::SubAck { .. } => "SUBACK",
      Packet::PingReq => "PINGREQ",
      Packet::PingResp => "PINGRESP",
      Packet::Disconnect => "DISCONNECT",
      Packet::Other { .. } => "OTHER",
    }
  }
}
