// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! MQTT v5 control packet codec.
//!
//! One tagged sum over the fifteen packet types with a decode dispatch keyed
//! by the control nibble and a uniform encode that prepends the fixed
//! header with the variable-byte remaining length.

pub mod connack;
pub mod connect;
pub mod disconnect;
pub mod property;
pub mod publish;
pub mod pubresp;
pub mod subscribe;
pub mod unsubscribe;
pub mod wire;

pub use connack::Connack;
pub use connect::{decode_connect_flags, Connect, ConnectFlags, Will};
pub use disconnect::{Auth, Disconnect};
pub use property::Property;
pub use publish::Publish;
pub use pubresp::PubResp;
pub use subscribe::{RetainHandling, Suback, Subscribe, SubscriptionOptions};
pub use unsubscribe::{Unsuback, Unsubscribe};

use crate::error::{MqttError, Result};
use wire::{Reader, Writer};

/// MQTT control packet types (high nibble of the first byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl TryFrom<u8> for PacketType {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            15 => Ok(PacketType::Auth),
            _ => Err(MqttError::malformed()),
        }
    }
}

/// Quality of service. Ordered so `min` performs QoS arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
#[repr(u8)]
pub enum Qos {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for Qos {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            _ => Err(MqttError::malformed()),
        }
    }
}

/// One framed MQTT v5 control packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback(PubResp),
    Pubrec(PubResp),
    Pubrel(PubResp),
    Pubcomp(PubResp),
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback(Unsuback),
    Pingreq,
    Pingresp,
    Disconnect(Disconnect),
    Auth(Auth),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::Connack(_) => PacketType::Connack,
            Packet::Publish(_) => PacketType::Publish,
            Packet::Puback(_) => PacketType::Puback,
            Packet::Pubrec(_) => PacketType::Pubrec,
            Packet::Pubrel(_) => PacketType::Pubrel,
            Packet::Pubcomp(_) => PacketType::Pubcomp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::Suback(_) => PacketType::Suback,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::Unsuback(_) => PacketType::Unsuback,
            Packet::Pingreq => PacketType::Pingreq,
            Packet::Pingresp => PacketType::Pingresp,
            Packet::Disconnect(_) => PacketType::Disconnect,
            Packet::Auth(_) => PacketType::Auth,
        }
    }

    /// Decode one packet from its first byte and body. The low nibble is
    /// validated per packet type: PUBLISH carries DUP/QoS/RETAIN,
    /// PUBREL/SUBSCRIBE/UNSUBSCRIBE require 0b0010, everything else 0.
    pub fn decode(first_byte: u8, body: &[u8]) -> Result<Packet> {
        let packet_type = PacketType::try_from(first_byte >> 4)?;
        let flags = first_byte & 0x0F;
        let mut r = Reader::new(body);

        match packet_type {
            PacketType::Publish => {}
            PacketType::Pubrel | PacketType::Subscribe | PacketType::Unsubscribe => {
                if flags != 0x02 {
                    return Err(MqttError::malformed());
                }
            }
            _ => {
                if flags != 0 {
                    return Err(MqttError::malformed());
                }
            }
        }

        let packet = match packet_type {
            PacketType::Connect => Packet::Connect(Connect::decode(&mut r)?),
            PacketType::Connack => Packet::Connack(Connack::decode(&mut r)?),
            PacketType::Publish => Packet::Publish(Publish::decode(flags, &mut r)?),
            PacketType::Puback => Packet::Puback(PubResp::decode(&mut r)?),
            PacketType::Pubrec => Packet::Pubrec(PubResp::decode(&mut r)?),
            PacketType::Pubrel => Packet::Pubrel(PubResp::decode(&mut r)?),
            PacketType::Pubcomp => Packet::Pubcomp(PubResp::decode(&mut r)?),
            PacketType::Subscribe => Packet::Subscribe(Subscribe::decode(&mut r)?),
            PacketType::Suback => Packet::Suback(Suback::decode(&mut r)?),
            PacketType::Unsubscribe => Packet::Unsubscribe(Unsubscribe::decode(&mut r)?),
            PacketType::Unsuback => Packet::Unsuback(Unsuback::decode(&mut r)?),
            PacketType::Pingreq => {
                if !r.is_empty() {
                    return Err(MqttError::malformed());
                }
                Packet::Pingreq
            }
            PacketType::Pingresp => {
                if !r.is_empty() {
                    return Err(MqttError::malformed());
                }
                Packet::Pingresp
            }
            PacketType::Disconnect => Packet::Disconnect(Disconnect::decode(&mut r)?),
            PacketType::Auth => Packet::Auth(Auth::decode(&mut r)?),
        };
        Ok(packet)
    }

    fn fixed_flags(&self) -> u8 {
        match self {
            Packet::Publish(p) => p.flags(),
            Packet::Pubrel(_) | Packet::Subscribe(_) | Packet::Unsubscribe(_) => 0x02,
            _ => 0,
        }
    }

    /// Serialize the packet, fixed header included.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Writer::new();
        match self {
            Packet::Connect(p) => p.encode_body(&mut body),
            Packet::Connack(p) => p.encode_body(&mut body),
            Packet::Publish(p) => p.encode_body(&mut body),
            Packet::Puback(p) | Packet::Pubrec(p) | Packet::Pubrel(p) | Packet::Pubcomp(p) => {
                p.encode_body(&mut body)
            }
            Packet::Subscribe(p) => p.encode_body(&mut body),
            Packet::Suback(p) => p.encode_body(&mut body),
            Packet::Unsubscribe(p) => p.encode_body(&mut body),
            Packet::Unsuback(p) => p.encode_body(&mut body),
            Packet::Pingreq | Packet::Pingresp => {}
            Packet::Disconnect(p) => p.encode_body(&mut body),
            Packet::Auth(p) => p.encode_body(&mut body),
        }
        let body = body.into_inner();

        let mut out = Writer::new();
        out.write_u8(((self.packet_type() as u8) << 4) | self.fixed_flags());
        out.write_varint(body.len() as u32);
        let mut out = out.into_inner();
        out.extend_from_slice(&body);
        out
    }
}

/// Result of scanning a buffer for a complete fixed header.
pub struct FrameHeader {
    pub first_byte: u8,
    /// Bytes occupied by the fixed header (control byte + length).
    pub header_len: usize,
    /// Remaining length declared by the header.
    pub body_len: usize,
}

/// Scan the front of `buf` for a complete fixed header. Returns Ok(None)
/// when more bytes are needed; a fifth continuation byte in the remaining
/// length is malformed.
pub fn peek_frame(buf: &[u8]) -> Result<Option<FrameHeader>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let first_byte = buf[0];
    let mut body_len: u32 = 0;
    let mut shift = 0;
    let mut idx = 1;
    loop {
        if idx >= buf.len() {
            return Ok(None);
        }
        let byte = buf[idx];
        body_len |= u32::from(byte & 0x7F) << shift;
        idx += 1;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return Err(MqttError::malformed());
        }
    }
    Ok(Some(FrameHeader {
        first_byte,
        header_len: idx,
        body_len: body_len as usize,
    }))
}
