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

#[derive(Debug, Clone, PartialEq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub properties: Vec<Property>,
    pub filters: Vec<String>,
}

impl Unsubscribe {
    pub fn decode(r: &mut Reader<'_>) -> Result<Unsubscribe> {
        let packet_id = r.read_u16()?;
        if packet_id == 0 {
            return Err(MqttError::malformed());
        }
        let properties = property::decode_block(r, property::allowed::UNSUBSCRIBE)?;
        let mut filters = Vec::new();
        while !r.is_empty() {
            filters.push(r.read_string()?);
        }
        if filters.is_empty() {
            return Err(MqttError::protocol());
        }
        Ok(Unsubscribe {
            packet_id,
            properties,
            filters,
        })
    }

    pub fn encode_body(&self, w: &mut Writer) {
        w.write_u16(self.packet_id);
        property::encode_block(w, &self.properties);
        for filter in &self.filters {
            w.write_string(filter);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Unsuback {
    pub packet_id: u16,
    pub properties: Vec<Property>,
    pub reason_codes: Vec<ReasonCode>,
}

impl Unsuback {
    pub fn decode(r: &mut Reader<'_>) -> Result<Unsuback> {
        let packet_id = r.read_u16()?;
        let properties = property::decode_block(r, property::allowed::UNSUBACK)?;
        let mut reason_codes = Vec::new();
        while !r.is_empty() {
            reason_codes
                .push(ReasonCode::try_from(r.read_u8()?).map_err(|_| MqttError::malformed())?);
        }
        if reason_codes.is_empty() {
            return Err(MqttError::protocol());
        }
        Ok(Unsuback {
            packet_id,
            properties,
            reason_codes,
        })
    }

    pub fn encode_body(&self, w: &mut Writer) {
        w.write_u16(self.packet_id);
        property::encode_block(w, &self.properties);
        for rc in &self.reason_codes {
            w.write_u8(*rc as u8);
        }
    }
}
