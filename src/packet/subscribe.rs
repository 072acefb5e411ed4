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
use crate::packet::Qos;
use crate::reason_code::ReasonCode;

/// Retain-handling mode of a subscription (bits 4-5 of the options byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RetainHandling {
    #[default]
    SendAlways = 0,
    SendIfNew = 1,
    DoNotSend = 2,
}

/// MQTT v5 subscription options byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionOptions {
    pub qos: Qos,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

impl SubscriptionOptions {
    /// Parse the SUBSCRIBE options byte. Bits 6-7 are reserved and must be
    /// zero; retain-handling 3 is malformed.
    pub fn from_byte(byte: u8) -> Result<Self> {
        if byte & 0xC0 != 0 {
            return Err(MqttError::malformed());
        }
        let qos = Qos::try_from(byte & 0x03)?;
        let retain_handling = match (byte >> 4) & 0x03 {
            0 => RetainHandling::SendAlways,
            1 => RetainHandling::SendIfNew,
            2 => RetainHandling::DoNotSend,
            _ => return Err(MqttError::malformed()),
        };
        Ok(Self {
            qos,
            no_local: byte & 0x04 != 0,
            retain_as_published: byte & 0x08 != 0,
            retain_handling,
        })
    }

    pub fn to_byte(self) -> u8 {
        let mut byte = self.qos as u8;
        if self.no_local {
            byte |= 0x04;
        }
        if self.retain_as_published {
            byte |= 0x08;
        }
        byte | ((self.retain_handling as u8) << 4)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub properties: Vec<Property>,
    pub filters: Vec<(String, SubscriptionOptions)>,
}

impl Subscribe {
    pub fn decode(r: &mut Reader<'_>) -> Result<Subscribe> {
        let packet_id = r.read_u16()?;
        if packet_id == 0 {
            return Err(MqttError::malformed());
        }
        let properties = property::decode_block(r, property::allowed::SUBSCRIBE)?;
        let mut filters = Vec::new();
        while !r.is_empty() {
            let filter = r.read_string()?;
            let options = SubscriptionOptions::from_byte(r.read_u8()?)?;
            filters.push((filter, options));
        }
        if filters.is_empty() {
            return Err(MqttError::protocol());
        }
        Ok(Subscribe {
            packet_id,
            properties,
            filters,
        })
    }

    /// Subscription identifier carried in the properties, if any.
    pub fn subscription_id(&self) -> Option<u32> {
        self.properties.iter().find_map(|p| match p {
            Property::SubscriptionIdentifier(v) => Some(*v),
            _ => None,
        })
    }

    pub fn encode_body(&self, w: &mut Writer) {
        w.write_u16(self.packet_id);
        property::encode_block(w, &self.properties);
        for (filter, options) in &self.filters {
            w.write_string(filter);
            w.write_u8(options.to_byte());
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Suback {
    pub packet_id: u16,
    pub properties: Vec<Property>,
    pub reason_codes: Vec<ReasonCode>,
}

impl Suback {
    pub fn decode(r: &mut Reader<'_>) -> Result<Suback> {
        let packet_id = r.read_u16()?;
        let properties = property::decode_block(r, property::allowed::SUBACK)?;
        let mut reason_codes = Vec::new();
        while !r.is_empty() {
            reason_codes
                .push(ReasonCode::try_from(r.read_u8()?).map_err(|_| MqttError::malformed())?);
        }
        if reason_codes.is_empty() {
            return Err(MqttError::protocol());
        }
        Ok(Suback {
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
