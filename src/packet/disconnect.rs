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
pub struct Disconnect {
    pub reason_code: ReasonCode,
    pub properties: Vec<Property>,
}

impl Disconnect {
    pub fn new(reason_code: ReasonCode) -> Self {
        Self {
            reason_code,
            properties: Vec::new(),
        }
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Disconnect> {
        // An empty body means NormalDisconnection with no properties.
        if r.is_empty() {
            return Ok(Disconnect::new(ReasonCode::NORMAL_DISCONNECTION));
        }
        let reason_code =
            ReasonCode::try_from(r.read_u8()?).map_err(|_| MqttError::malformed())?;
        let properties = if r.is_empty() {
            Vec::new()
        } else {
            property::decode_block(r, property::allowed::DISCONNECT)?
        };
        if !r.is_empty() {
            return Err(MqttError::malformed());
        }
        Ok(Disconnect {
            reason_code,
            properties,
        })
    }

    pub fn encode_body(&self, w: &mut Writer) {
        if self.reason_code == ReasonCode::NORMAL_DISCONNECTION && self.properties.is_empty() {
            return;
        }
        w.write_u8(self.reason_code as u8);
        property::encode_block(w, &self.properties);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Auth {
    pub reason_code: ReasonCode,
    pub properties: Vec<Property>,
}

impl Auth {
    pub fn decode(r: &mut Reader<'_>) -> Result<Auth> {
        if r.is_empty() {
            return Ok(Auth {
                reason_code: ReasonCode::Success,
                properties: Vec::new(),
            });
        }
        let reason_code =
            ReasonCode::try_from(r.read_u8()?).map_err(|_| MqttError::malformed())?;
        if !matches!(
            reason_code,
            ReasonCode::Success | ReasonCode::ContinueAuthentication | ReasonCode::ReAuthenticate
        ) {
            return Err(MqttError::protocol());
        }
        let properties = if r.is_empty() {
            Vec::new()
        } else {
            property::decode_block(r, property::allowed::AUTH)?
        };
        if !r.is_empty() {
            return Err(MqttError::malformed());
        }
        Ok(Auth {
            reason_code,
            properties,
        })
    }

    pub fn encode_body(&self, w: &mut Writer) {
        if self.reason_code == ReasonCode::Success && self.properties.is_empty() {
            return;
        }
        w.write_u8(self.reason_code as u8);
        property::encode_block(w, &self.properties);
    }
}
