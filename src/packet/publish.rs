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

#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    pub dup: bool,
    pub qos: Qos,
    pub retain: bool,
    /// Empty only when a bound topic alias stands in for the name.
    pub topic: String,
    pub packet_id: Option<u16>,
    pub properties: Vec<Property>,
    pub payload: Bytes,
}

impl Publish {
    /// Decode from the fixed-header flags nibble and the body.
    pub fn decode(flags: u8, r: &mut Reader<'_>) -> Result<Publish> {
        let dup = flags & 0x08 != 0;
        let qos = Qos::try_from((flags >> 1) & 0x03)?;
        let retain = flags & 0x01 != 0;
        if dup && qos == Qos::AtMostOnce {
            return Err(MqttError::malformed());
        }
        let topic = r.read_string()?;
        let packet_id = if qos != Qos::AtMostOnce {
            let pid = r.read_u16()?;
            if pid == 0 {
                return Err(MqttError::malformed());
            }
            Some(pid)
        } else {
            None
        };
        let properties = property::decode_block(r, property::allowed::PUBLISH)?;
        let payload = Bytes::copy_from_slice(r.read_remaining());
        Ok(Publish {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            properties,
            payload,
        })
    }

    /// Flags nibble for the fixed header.
    pub fn flags(&self) -> u8 {
        let mut flags = (self.qos as u8) << 1;
        if self.dup {
            flags |= 0x08;
        }
        if self.retain {
            flags |= 0x01;
        }
        flags
    }

    pub fn encode_body(&self, w: &mut Writer) {
        w.write_string(&self.topic);
        if let Some(pid) = self.packet_id {
            w.write_u16(pid);
        }
        property::encode_block(w, &self.properties);
        w.write_slice(&self.payload);
    }
}
