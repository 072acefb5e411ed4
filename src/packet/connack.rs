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
pub struct Connack {
    pub session_present: bool,
    pub reason_code: ReasonCode,
    pub properties: Vec<Property>,
}

impl Connack {
    pub fn decode(r: &mut Reader<'_>) -> Result<Connack> {
        let ack_flags = r.read_u8()?;
        if ack_flags & 0xFE != 0 {
            return Err(MqttError::malformed());
        }
        let reason_code =
            ReasonCode::try_from(r.read_u8()?).map_err(|_| MqttError::malformed())?;
        let properties = property::decode_block(r, property::allowed::CONNACK)?;
        Ok(Connack {
            session_present: ack_flags & 0x01 != 0,
            reason_code,
            properties,
        })
    }

    pub fn encode_body(&self, w: &mut Writer) {
        w.write_u8(u8::from(self.session_present));
        w.write_u8(self.reason_code as u8);
        property::encode_block(w, &self.properties);
    }
}
