// src/client/mqtt/codec.rs

use super::packet::*;
use crate::client::QoS;
use crate::error::SamplerError;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Largest inbound body accepted. A sampler only ever receives small acknowledgements.
pub const MAX_DECODED_BODY: usize = 64 * 1024;

/// Codec for MQTT 3.1.1 control packet framing.
#[derive(Debug, Default)]
pub struct MqttCodec {
  decoding_state: DecodingState,
}

#[derive(Debug, Default, Clone, Copy)]
enum DecodingState {
  #[default]
  ReadHeader, // Waiting for the type/flags byte + remaining length
  ReadBody(FixedHeader), // Waiting for `remaining` body bytes
}

#[derive(Debug, Clone, Copy)]
struct FixedHeader {
  packet_type: u8,
  flags: u8,
  remaining: usize,
}

impl MqttCodec {
  pub fn new() -> Self {
    Self::default()
  }
}

// --- Encoder Implementation (Packet -> BytesMut) ---
impl Encoder<Packet> for MqttCodec {
  type Error = SamplerError;

  fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
    let mut body = BytesMut::new();
    let first_byte = match &item {
      Packet::Connect(connect) => {
        put_string(&mut body, PROTOCOL_NAME)?;
        body.put_u8(PROTOCOL_LEVEL_3_1_1);
        body.put_u8(connect.flags().bits());
        body.put_u16(connect.keep_alive_secs);
        put_string(&mut body, &connect.client_id)?;
        if let Some(username) = &connect.username {
          put_string(&mut body, username)?;
        }
        if let Some(password) = &connect.password {
          put_string(&mut body, password)?;
        }
        CONNECT << 4
      }
      Packet::ConnAck { session_present, code } => {
        body.put_u8(*session_present as u8);
        body.put_u8(code.as_u8());
        CONNACK << 4
      }
      Packet::Subscribe { packet_id, filters } => {
        if filters.is_empty() {
          return Err(SamplerError::ProtocolViolation("SUBSCRIBE without topic filters".into()));
        }
        body.put_u16(*packet_id);
        for (filter, qos) in filters {
          put_string(&mut body, filter)?;
          body.put_u8(*qos as u8);
        }
        // SUBSCRIBE carries the mandatory 0b0010 flags.
        (SUBSCRIBE << 4) | 0b0010
      }
      Packet::SubAck { packet_id, return_codes } => {
        body.put_u16(*packet_id);
        for code in return_codes {
          body.put_u8(code.as_u8());
        }
        SUBACK << 4
      }
      Packet::PingReq => PINGREQ << 4,
      Packet::PingResp => PINGRESP << 4,
      Packet::Disconnect => DISCONNECT << 4,
      Packet::Other { packet_type } => {
        return Err(SamplerError::Internal(format!(
          "refusing to encode opaque packet type {}",
          packet_type
        )))
      }
    };

    if body.len() > MAX_REMAINING_LENGTH {
      return Err(SamplerError::ProtocolViolation(format!(
        "{} body of {} bytes exceeds the remaining-length limit",
        item.name(),
        body.len()
      )));
    }

    dst.reserve(1 + 4 + body.len());
    dst.put_u8(first_byte);
    put_remaining_length(dst, body.len());
    dst.put_slice(&body);
    Ok(())
  }
}

// --- Decoder Implementation (BytesMut -> Packet) ---
impl Decoder for MqttCodec {
  type Item = Packet;
  type Error = SamplerError;

  fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
    loop {
      match self.decoding_state {
        DecodingState::ReadHeader => {
          let Some((remaining, length_bytes)) = peek_remaining_length(src)? else {
            return Ok(None); // Need more data for the header
          };
          if remaining > MAX_DECODED_BODY {
            return Err(SamplerError::ProtocolViolation(format!(
              "declared body of {} bytes exceeds the {} byte limit",
              remaining, MAX_DECODED_BODY
            )));
          }
          let first = src[0];
          src.advance(1 + length_bytes);
          self.decoding_state = DecodingState::ReadBody(FixedHeader {
            packet_type: first >> 4,
            flags: first & 0x0F,
            remaining,
          });
        }

        DecodingState::ReadBody(header) => {
          if src.len() < header.remaining {
            src.reserve(header.remaining - src.len());
            return Ok(None);
          }
          let body = src.split_to(header.remaining).freeze();
          self.decoding_state = DecodingState::ReadHeader;
          return decode_body(header, body).map(Some);
        }
      }
    }
  }
}

fn decode_body(header: FixedHeader, mut body: Bytes) -> Result<Packet, SamplerError> {
  let packet = match header.packet_type {
    CONNECT => {
      let protocol = get_string(&mut body)?;
      let level = get_u8(&mut body)?;
      if protocol != PROTOCOL_NAME || level != PROTOCOL_LEVEL_3_1_1 {
        return Err(SamplerError::ProtocolViolation(format!(
          "unsupported protocol {} level {}",
          protocol, level
        )));
      }
      let flags = ConnectFlags::from_bits(get_u8(&mut body)?)
        .ok_or_else(|| SamplerError::ProtocolViolation("reserved CONNECT flag set".into()))?;
      if flags.contains(ConnectFlags::WILL) {
        return Err(SamplerError::ProtocolViolation("will messages are not supported".into()));
      }
      let keep_alive_secs = get_u16(&mut body)?;
      let client_id = get_string(&mut body)?;
      let username = if flags.contains(ConnectFlags::USERNAME) {
        Some(get_string(&mut body)?)
      } else {
        None
      };
      let password = if flags.contains(ConnectFlags::PASSWORD) {
        Some(get_string(&mut body)?)
      } else {
        None
      };
      Packet::Connect(Connect {
        client_id,
        keep_alive_secs,
        clean_session: flags.contains(ConnectFlags::CLEAN_SESSION),
        username,
        password,
      })
    }
    CONNACK => {
      let ack_flags = get_u8(&mut body)?;
      let raw_code = get_u8(&mut body)?;
      let code = ConnectReturnCode::from_u8(raw_code)
        .ok_or_else(|| SamplerError::ProtocolViolation(format!("unknown CONNACK code {}", raw_code)))?;
      Packet::ConnAck {
        session_present: ack_flags & 0x01 != 0,
        code,
      }
    }
    SUBSCRIBE => {
      if header.flags != 0b0010 {
        return Err(SamplerError::ProtocolViolation("malformed SUBSCRIBE flags".into()));
      }
      let packet_id = get_u16(&mut body)?;
      let mut filters = Vec::new();
      while body.has_remaining() {
        let filter = get_string(&mut body)?;
        let raw_qos = get_u8(&mut body)?;
        let qos = QoS::from_u8(raw_qos)
          .ok_or_else(|| SamplerError::ProtocolViolation(format!("invalid requested QoS {}", raw_qos)))?;
        filters.push((filter, qos));
      }
      if filters.is_empty() {
        return Err(SamplerError::ProtocolViolation("SUBSCRIBE without topic filters".into()));
      }
      Packet::Subscribe { packet_id, filters }
    }
    SUBACK => {
      let packet_id = get_u16(&mut body)?;
      let mut return_codes = Vec::with_capacity(body.remaining());
      while body.has_remaining() {
        let raw = body.get_u8();
        let code = SubscribeReturnCode::from_u8(raw)
          .ok_or_else(|| SamplerError::ProtocolViolation(format!("invalid SUBACK code {:#04x}", raw)))?;
        return_codes.push(code);
      }
      Packet::SubAck { packet_id, return_codes }
    }
    PINGREQ => Packet::PingReq,
    PINGRESP => Packet::PingResp,
    DISCONNECT => Packet::Disconnect,
    other => Packet::Other { packet_type: other },
  };
  Ok(packet)
}

/// Reads the fixed header without consuming it.
/// Returns the remaining length and how many bytes encoded it.
fn peek_remaining_length(src: &BytesMut) -> Result<Option<(usize, usize)>, SamplerError> {
  let mut value = 0usize;
  let mut multiplier = 1usize;
  for i in 0..4 {
    let Some(&byte) = src.get(1 + i) else {
      return Ok(None);
    };
    value += (byte & 0x7F) as usize * multiplier;
    if byte & 0x80 == 0 {
      return Ok(Some((value, i + 1)));
    }
    multiplier *= 128;
  }
  Err(SamplerError::ProtocolViolation("malformed remaining length".into()))
}

fn put_remaining_length(dst: &mut BytesMut, mut len: usize) {
  loop {
    let mut byte = (len % 128) as u8;
    len /= 128;
    if len > 0 {
      byte |= 0x80;
    }
    dst.put_u8(byte);
    if len == 0 {
      break;
    }
  }
}

fn put_string(dst: &mut BytesMut, value: &str) -> Result<(), SamplerError> {
  let len = u16::try_from(value.len())
    .map_err(|_| SamplerError::ProtocolViolation(format!("string of {} bytes is too long", value.len())))?;
  dst.put_u16(len);
  dst.put_slice(value.as_bytes());
  Ok(())
}

fn truncated() -> SamplerError {
  SamplerError::ProtocolViolation("packet body truncated".into())
}

fn get_u8(src: &mut Bytes) -> Result<u8, SamplerError> {
  if src.remaining() < 1 {
    return Err(truncated());
  }
  Ok(src.get_u8())
}

fn get_u16(src: &mut Bytes) -> Result<u16, SamplerError> {
  if src.remaining() < 2 {
    return Err(truncated());
  }
  Ok(src.get_u16())
}

fn get_string(src: &mut Bytes) -> Result<String, SamplerError> {
  let len = get_u16(src)? as usize;
  if src.remaining() < len {
    return Err(truncated());
  }
  let raw = src.split_to(len);
  String::from_utf8(raw.to_vec()).map_err(|_| SamplerError::ProtocolViolation("string is not valid UTF-8".into()))
}
