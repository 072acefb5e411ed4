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

use crate::error::{MqttError, Result};
use crate::packet::property::{self, Property};
use crate::packet::wire::{Reader, Writer};
use crate::reason_code::ReasonCode;

/// Shared shape of PUBACK, PUBREC, PUBREL and PUBCOMP: a packet identifier,
/// an optional reason code (absent means Success) and optional properties.
#[derive(Debug, Clone, PartialEq)]
pub struct PubResp {
    pub packet_id: u16,
    pub reason_code: ReasonCode,
    pub properties: Vec<Property>,
}

impl PubResp {
    pub fn new(packet_id: u16, reason_code: ReasonCode) -> Self {
        Self {
            packet_id,
            reason_code,
            properties: Vec::new(),
        }
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<PubResp> {
        let packet_id = r.read_u16()?;
        if packet_id == 0 {
            return Err(MqttError::malformed());
        }
        // The reason code and properties may both be omitted (remaining
        // length 2), meaning Success with no properties.
        let (reason_code, properties) = if r.is_empty() {
            (ReasonCode::Success, Vec::new())
        } else {
            let rc = ReasonCode::try_from(r.read_u8()?).map_err(|_| MqttError::malformed())?;
            let props = if r.is_empty() {
                Vec::new()
            } else {
                property::decode_block(r, property::allowed::PUB_RESP)?
            };
            (rc, props)
        };
        if !r.is_empty() {
            return Err(MqttError::malformed());
        }
        Ok(PubResp {
            packet_id,
            reason_code,
            properties,
        })
    }

    pub fn encode_body(&self, w: &mut Writer) {
        w.write_u16(self.packet_id);
        if self.reason_code == ReasonCode::Success && self.properties.is_empty() {
            return;
        }
        w.write_u8(self.reason_code as u8);
        property::encode_block(w, &self.properties);
    }
}
