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

use bytes::Bytes;

use crate::error::{MqttError, Result};
use crate::packet::property::{self, Property};
use crate::packet::wire::{Reader, Writer};
use crate::packet::Qos;
use crate::reason_code::ReasonCode;

/// Will message carried in CONNECT.
#[derive(Debug, Clone, PartialEq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub retain: bool,
    pub properties: Vec<Property>,
}

/// Validated CONNECT flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectFlags {
    pub clean_start: bool,
    pub will_flag: bool,
    pub will_qos: Qos,
    pub will_retain: bool,
    pub password_flag: bool,
    pub username_flag: bool,
}

/// Validate the CONNECT flags byte: bit 0 is reserved and must be zero; with
/// will-flag clear, will-qos and will-retain must be zero; will-qos 3 is
/// malformed.
pub fn decode_connect_flags(byte: u8) -> Result<ConnectFlags> {
    if byte & 0x01 != 0 {
        return Err(MqttError::malformed());
    }
    let will_flag = byte & 0x04 != 0;
    let will_qos_bits = (byte >> 3) & 0x03;
    let will_retain = byte & 0x20 != 0;
    if !will_flag && (will_qos_bits != 0 || will_retain) {
        return Err(MqttError::malformed());
    }
    let will_qos = Qos::try_from(will_qos_bits)?;
    Ok(ConnectFlags {
        clean_start: byte & 0x02 != 0,
        will_flag,
        will_qos,
        will_retain,
        password_flag: byte & 0x40 != 0,
        username_flag: byte & 0x80 != 0,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    pub clean_start: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub properties: Vec<Property>,
}

impl Connect {
    pub fn decode(r: &mut Reader<'_>) -> Result<Connect> {
        let protocol_name = r.read_string()?;
        if protocol_name != "MQTT" {
            return Err(MqttError::malformed());
        }
        let protocol_version = r.read_u8()?;
        if protocol_version != 5 {
            return Err(MqttError::Protocol(ReasonCode::UnsupportedProtocolVersion));
        }
        let flags = decode_connect_flags(r.read_u8()?)?;
        let keep_alive = r.read_u16()?;
        let properties = property::decode_block(r, property::allowed::CONNECT)?;
        if properties
            .iter()
            .any(|p| matches!(p, Property::AuthenticationData(_)))
            && !properties
                .iter()
                .any(|p| matches!(p, Property::AuthenticationMethod(_)))
        {
            return Err(MqttError::protocol());
        }

        let client_id = r.read_string()?;
        let will = if flags.will_flag {
            let will_properties = property::decode_block(r, property::allowed::WILL)?;
            let topic = r.read_string()?;
            let payload = Bytes::copy_from_slice(&r.read_binary()?);
            Some(Will {
                topic,
                payload,
                qos: flags.will_qos,
                retain: flags.will_retain,
                properties: will_properties,
            })
        } else {
            None
        };
        let username = if flags.username_flag {
            Some(r.read_string()?)
        } else {
            None
        };
        let password = if flags.password_flag {
            Some(r.read_binary()?)
        } else {
            None
        };
        if !r.is_empty() {
            return Err(MqttError::malformed());
        }

        Ok(Connect {
            clean_start: flags.clean_start,
            keep_alive,
            client_id,
            will,
            username,
            password,
            properties,
        })
    }

    pub fn encode_body(&self, w: &mut Writer) {
        w.write_string("MQTT");
        w.write_u8(5);
        let mut flags = 0u8;
        if self.clean_start {
            flags |= 0x02;
        }
        if let Some(ref will) = self.will {
            flags |= 0x04;
            flags |= (will.qos as u8) << 3;
            if will.retain {
                flags |= 0x20;
            }
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        if self.username.is_some() {
            flags |= 0x80;
        }
        w.write_u8(flags);
        w.write_u16(self.keep_alive);
        property::encode_block(w, &self.properties);
        w.write_string(&self.client_id);
        if let Some(ref will) = self.will {
            property::encode_block(w, &will.properties);
            w.write_string(&will.topic);
            w.write_binary(&will.payload);
        }
        if let Some(ref username) = self.username {
            w.write_string(username);
        }
        if let Some(ref password) = self.password {
            w.write_binary(password);
        }
    }
}
