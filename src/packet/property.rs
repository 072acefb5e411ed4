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

//! MQTT v5 properties: typed representation, per-packet permitted sets, and
//! the variable-byte-length-prefixed block encoding.

use crate::error::{MqttError, Result};
use crate::packet::wire::{varint_len, Reader, Writer, VARINT_MAX};

/// Property identifiers (single byte on the wire).
pub mod id {
    pub const PAYLOAD_FORMAT_INDICATOR: u8 = 0x01;
    pub const MESSAGE_EXPIRY_INTERVAL: u8 = 0x02;
    pub const CONTENT_TYPE: u8 = 0x03;
    pub const RESPONSE_TOPIC: u8 = 0x08;
    pub const CORRELATION_DATA: u8 = 0x09;
    pub const SUBSCRIPTION_IDENTIFIER: u8 = 0x0B;
    pub const SESSION_EXPIRY_INTERVAL: u8 = 0x11;
    pub const ASSIGNED_CLIENT_IDENTIFIER: u8 = 0x12;
    pub const SERVER_KEEP_ALIVE: u8 = 0x13;
    pub const AUTHENTICATION_METHOD: u8 = 0x15;
    pub const AUTHENTICATION_DATA: u8 = 0x16;
    pub const REQUEST_PROBLEM_INFORMATION: u8 = 0x17;
    pub const WILL_DELAY_INTERVAL: u8 = 0x18;
    pub const REQUEST_RESPONSE_INFORMATION: u8 = 0x19;
    pub const RESPONSE_INFORMATION: u8 = 0x1A;
    pub const SERVER_REFERENCE: u8 = 0x1C;
    pub const REASON_STRING: u8 = 0x1F;
    pub const RECEIVE_MAXIMUM: u8 = 0x21;
    pub const TOPIC_ALIAS_MAXIMUM: u8 = 0x22;
    pub const TOPIC_ALIAS: u8 = 0x23;
    pub const MAXIMUM_QOS: u8 = 0x24;
    pub const RETAIN_AVAILABLE: u8 = 0x25;
    pub const USER_PROPERTY: u8 = 0x26;
    pub const MAXIMUM_PACKET_SIZE: u8 = 0x27;
    pub const WILDCARD_SUBSCRIPTION_AVAILABLE: u8 = 0x28;
    pub const SUBSCRIPTION_IDENTIFIER_AVAILABLE: u8 = 0x29;
    pub const SHARED_SUBSCRIPTION_AVAILABLE: u8 = 0x2A;
}

/// Per-packet permitted property sets.
pub mod allowed {
    use super::id::*;

    pub const CONNECT: &[u8] = &[
        SESSION_EXPIRY_INTERVAL,
        RECEIVE_MAXIMUM,
        MAXIMUM_PACKET_SIZE,
        TOPIC_ALIAS_MAXIMUM,
        REQUEST_RESPONSE_INFORMATION,
        REQUEST_PROBLEM_INFORMATION,
        USER_PROPERTY,
        AUTHENTICATION_METHOD,
        AUTHENTICATION_DATA,
    ];
    pub const WILL: &[u8] = &[
        WILL_DELAY_INTERVAL,
        PAYLOAD_FORMAT_INDICATOR,
        MESSAGE_EXPIRY_INTERVAL,
        CONTENT_TYPE,
        RESPONSE_TOPIC,
        CORRELATION_DATA,
        USER_PROPERTY,
    ];
    pub const CONNACK: &[u8] = &[
        SESSION_EXPIRY_INTERVAL,
        RECEIVE_MAXIMUM,
        MAXIMUM_QOS,
        RETAIN_AVAILABLE,
        MAXIMUM_PACKET_SIZE,
        ASSIGNED_CLIENT_IDENTIFIER,
        TOPIC_ALIAS_MAXIMUM,
        REASON_STRING,
        USER_PROPERTY,
        WILDCARD_SUBSCRIPTION_AVAILABLE,
        SUBSCRIPTION_IDENTIFIER_AVAILABLE,
        SHARED_SUBSCRIPTION_AVAILABLE,
        SERVER_KEEP_ALIVE,
        RESPONSE_INFORMATION,
        SERVER_REFERENCE,
        AUTHENTICATION_METHOD,
        AUTHENTICATION_DATA,
    ];
    pub const PUBLISH: &[u8] = &[
        PAYLOAD_FORMAT_INDICATOR,
        MESSAGE_EXPIRY_INTERVAL,
        TOPIC_ALIAS,
        RESPONSE_TOPIC,
        CORRELATION_DATA,
        USER_PROPERTY,
        SUBSCRIPTION_IDENTIFIER,
        CONTENT_TYPE,
    ];
    pub const PUB_RESP: &[u8] = &[REASON_STRING, USER_PROPERTY];
    pub const SUBSCRIBE: &[u8] = &[SUBSCRIPTION_IDENTIFIER, USER_PROPERTY];
    pub const SUBACK: &[u8] = &[REASON_STRING, USER_PROPERTY];
    pub const UNSUBSCRIBE: &[u8] = &[USER_PROPERTY];
    pub const UNSUBACK: &[u8] = &[REASON_STRING, USER_PROPERTY];
    pub const DISCONNECT: &[u8] = &[
        SESSION_EXPIRY_INTERVAL,
        REASON_STRING,
        USER_PROPERTY,
        SERVER_REFERENCE,
    ];
    pub const AUTH: &[u8] = &[
        AUTHENTICATION_METHOD,
        AUTHENTICATION_DATA,
        REASON_STRING,
        USER_PROPERTY,
    ];
}

/// One MQTT v5 property. User properties are an ordered list of name/value
/// pairs; everything else appears at most once per packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    PayloadFormatIndicator(u8),
    MessageExpiryInterval(u32),
    ContentType(String),
    ResponseTopic(String),
    CorrelationData(Vec<u8>),
    SubscriptionIdentifier(u32),
    SessionExpiryInterval(u32),
    AssignedClientIdentifier(String),
    ServerKeepAlive(u16),
    AuthenticationMethod(String),
    AuthenticationData(Vec<u8>),
    RequestProblemInformation(u8),
    WillDelayInterval(u32),
    RequestResponseInformation(u8),
    ResponseInformation(String),
    ServerReference(String),
    ReasonString(String),
    ReceiveMaximum(u16),
    TopicAliasMaximum(u16),
    TopicAlias(u16),
    MaximumQos(u8),
    RetainAvailable(u8),
    UserProperty(String, String),
    MaximumPacketSize(u32),
    WildcardSubscriptionAvailable(u8),
    SubscriptionIdentifierAvailable(u8),
    SharedSubscriptionAvailable(u8),
}

impl Property {
    pub fn id(&self) -> u8 {
        use Property::*;
        match self {
            PayloadFormatIndicator(_) => id::PAYLOAD_FORMAT_INDICATOR,
            MessageExpiryInterval(_) => id::MESSAGE_EXPIRY_INTERVAL,
            ContentType(_) => id::CONTENT_TYPE,
            ResponseTopic(_) => id::RESPONSE_TOPIC,
            CorrelationData(_) => id::CORRELATION_DATA,
            SubscriptionIdentifier(_) => id::SUBSCRIPTION_IDENTIFIER,
            SessionExpiryInterval(_) => id::SESSION_EXPIRY_INTERVAL,
            AssignedClientIdentifier(_) => id::ASSIGNED_CLIENT_IDENTIFIER,
            ServerKeepAlive(_) => id::SERVER_KEEP_ALIVE,
            AuthenticationMethod(_) => id::AUTHENTICATION_METHOD,
            AuthenticationData(_) => id::AUTHENTICATION_DATA,
            RequestProblemInformation(_) => id::REQUEST_PROBLEM_INFORMATION,
            WillDelayInterval(_) => id::WILL_DELAY_INTERVAL,
            RequestResponseInformation(_) => id::REQUEST_RESPONSE_INFORMATION,
            ResponseInformation(_) => id::RESPONSE_INFORMATION,
            ServerReference(_) => id::SERVER_REFERENCE,
            ReasonString(_) => id::REASON_STRING,
            ReceiveMaximum(_) => id::RECEIVE_MAXIMUM,
            TopicAliasMaximum(_) => id::TOPIC_ALIAS_MAXIMUM,
            TopicAlias(_) => id::TOPIC_ALIAS,
            MaximumQos(_) => id::MAXIMUM_QOS,
            RetainAvailable(_) => id::RETAIN_AVAILABLE,
            UserProperty(_, _) => id::USER_PROPERTY,
            MaximumPacketSize(_) => id::MAXIMUM_PACKET_SIZE,
            WildcardSubscriptionAvailable(_) => id::WILDCARD_SUBSCRIPTION_AVAILABLE,
            SubscriptionIdentifierAvailable(_) => id::SUBSCRIPTION_IDENTIFIER_AVAILABLE,
            SharedSubscriptionAvailable(_) => id::SHARED_SUBSCRIPTION_AVAILABLE,
        }
    }

    fn decode_one(r: &mut Reader<'_>) -> Result<Property> {
        let prop_id = r.read_u8()?;
        let prop = match prop_id {
            id::PAYLOAD_FORMAT_INDICATOR => Property::PayloadFormatIndicator(r.read_u8()?),
            id::MESSAGE_EXPIRY_INTERVAL => Property::MessageExpiryInterval(r.read_u32()?),
            id::CONTENT_TYPE => Property::ContentType(r.read_string()?),
            id::RESPONSE_TOPIC => Property::ResponseTopic(r.read_string()?),
            id::CORRELATION_DATA => Property::CorrelationData(r.read_binary()?),
            id::SUBSCRIPTION_IDENTIFIER => {
                let value = r.read_varint()?;
                if value == 0 {
                    return Err(MqttError::protocol());
                }
                Property::SubscriptionIdentifier(value)
            }
            id::SESSION_EXPIRY_INTERVAL => Property::SessionExpiryInterval(r.read_u32()?),
            id::ASSIGNED_CLIENT_IDENTIFIER => Property::AssignedClientIdentifier(r.read_string()?),
            id::SERVER_KEEP_ALIVE => Property::ServerKeepAlive(r.read_u16()?),
            id::AUTHENTICATION_METHOD => Property::AuthenticationMethod(r.read_string()?),
            id::AUTHENTICATION_DATA => Property::AuthenticationData(r.read_binary()?),
            id::REQUEST_PROBLEM_INFORMATION => {
                Property::RequestProblemInformation(bool_byte(r.read_u8()?)?)
            }
            id::WILL_DELAY_INTERVAL => Property::WillDelayInterval(r.read_u32()?),
            id::REQUEST_RESPONSE_INFORMATION => {
                Property::RequestResponseInformation(bool_byte(r.read_u8()?)?)
            }
            id::RESPONSE_INFORMATION => Property::ResponseInformation(r.read_string()?),
            id::SERVER_REFERENCE => Property::ServerReference(r.read_string()?),
            id::REASON_STRING => Property::ReasonString(r.read_string()?),
            id::RECEIVE_MAXIMUM => {
                let value = r.read_u16()?;
                if value == 0 {
                    return Err(MqttError::protocol());
                }
                Property::ReceiveMaximum(value)
            }
            id::TOPIC_ALIAS_MAXIMUM => Property::TopicAliasMaximum(r.read_u16()?),
            id::TOPIC_ALIAS => Property::TopicAlias(r.read_u16()?),
            id::MAXIMUM_QOS => {
                let value = r.read_u8()?;
                if value > 1 {
                    return Err(MqttError::protocol());
                }
                Property::MaximumQos(value)
            }
            id::RETAIN_AVAILABLE => Property::RetainAvailable(bool_byte(r.read_u8()?)?),
            id::USER_PROPERTY => {
                let name = r.read_string()?;
                let value = r.read_string()?;
                Property::UserProperty(name, value)
            }
            id::MAXIMUM_PACKET_SIZE => {
                let value = r.read_u32()?;
                if value == 0 {
                    return Err(MqttError::protocol());
                }
                Property::MaximumPacketSize(value)
            }
            id::WILDCARD_SUBSCRIPTION_AVAILABLE => {
                Property::WildcardSubscriptionAvailable(bool_byte(r.read_u8()?)?)
            }
            id::SUBSCRIPTION_IDENTIFIER_AVAILABLE => {
                Property::SubscriptionIdentifierAvailable(bool_byte(r.read_u8()?)?)
            }
            id::SHARED_SUBSCRIPTION_AVAILABLE => {
                Property::SharedSubscriptionAvailable(bool_byte(r.read_u8()?)?)
            }
            _ => return Err(MqttError::malformed()),
        };
        Ok(prop)
    }

    fn encode_one(&self, w: &mut Writer) {
        use Property::*;
        w.write_u8(self.id());
        match self {
            PayloadFormatIndicator(v)
            | RequestProblemInformation(v)
            | RequestResponseInformation(v)
            | MaximumQos(v)
            | RetainAvailable(v)
            | WildcardSubscriptionAvailable(v)
            | SubscriptionIdentifierAvailable(v)
            | SharedSubscriptionAvailable(v) => w.write_u8(*v),
            MessageExpiryInterval(v) | SessionExpiryInterval(v) | WillDelayInterval(v)
            | MaximumPacketSize(v) => w.write_u32(*v),
            ContentType(v) | ResponseTopic(v) | AssignedClientIdentifier(v)
            | AuthenticationMethod(v) | ResponseInformation(v) | ServerReference(v)
            | ReasonString(v) => w.write_string(v),
            CorrelationData(v) | AuthenticationData(v) => w.write_binary(v),
            SubscriptionIdentifier(v) => w.write_varint(*v),
            ServerKeepAlive(v) | ReceiveMaximum(v) | TopicAliasMaximum(v) | TopicAlias(v) => {
                w.write_u16(*v)
            }
            UserProperty(name, value) => {
                w.write_string(name);
                w.write_string(value);
            }
        }
    }

    fn encoded_len(&self) -> usize {
        use Property::*;
        1 + match self {
            PayloadFormatIndicator(_)
            | RequestProblemInformation(_)
            | RequestResponseInformation(_)
            | MaximumQos(_)
            | RetainAvailable(_)
            | WildcardSubscriptionAvailable(_)
            | SubscriptionIdentifierAvailable(_)
            | SharedSubscriptionAvailable(_) => 1,
            MessageExpiryInterval(_) | SessionExpiryInterval(_) | WillDelayInterval(_)
            | MaximumPacketSize(_) => 4,
            ContentType(v) | ResponseTopic(v) | AssignedClientIdentifier(v)
            | AuthenticationMethod(v) | ResponseInformation(v) | ServerReference(v)
            | ReasonString(v) => 2 + v.len(),
            CorrelationData(v) | AuthenticationData(v) => 2 + v.len(),
            SubscriptionIdentifier(v) => varint_len(*v),
            ServerKeepAlive(_) | ReceiveMaximum(_) | TopicAliasMaximum(_) | TopicAlias(_) => 2,
            UserProperty(name, value) => 4 + name.len() + value.len(),
        }
    }
}

fn bool_byte(value: u8) -> Result<u8> {
    if value > 1 {
        return Err(MqttError::protocol());
    }
    Ok(value)
}

/// Decode a properties block: variable-byte length followed by that many
/// bytes of properties. Unknown identifiers and duplicated non-user
/// properties (SubscriptionIdentifier excepted, which may repeat in a
/// PUBLISH) are malformed; identifiers outside `permitted` are malformed.
pub fn decode_block(r: &mut Reader<'_>, permitted: &[u8]) -> Result<Vec<Property>> {
    let len = r.read_varint()? as usize;
    let body = r.read_bytes(len)?;
    let mut sub = Reader::new(body);
    let mut props = Vec::new();
    let mut seen: u64 = 0;
    while !sub.is_empty() {
        let prop = Property::decode_one(&mut sub)?;
        let prop_id = prop.id();
        if !permitted.contains(&prop_id) {
            return Err(MqttError::malformed());
        }
        if prop_id != id::USER_PROPERTY && prop_id != id::SUBSCRIPTION_IDENTIFIER {
            let bit = 1u64 << prop_id;
            if seen & bit != 0 {
                return Err(MqttError::malformed());
            }
            seen |= bit;
        }
        props.push(prop);
    }
    Ok(props)
}

/// Encode a properties block in stable order: session-expiry first, the
/// other non-user properties in their stored order, user properties last in
/// insertion order.
pub fn encode_block(w: &mut Writer, props: &[Property]) {
    let total: usize = props.iter().map(Property::encoded_len).sum();
    debug_assert!(total as u32 <= VARINT_MAX);
    w.write_varint(total as u32);
    for prop in props {
        if matches!(prop, Property::SessionExpiryInterval(_)) {
            prop.encode_one(w);
        }
    }
    for prop in props {
        if !matches!(
            prop,
            Property::SessionExpiryInterval(_) | Property::UserProperty(_, _)
        ) {
            prop.encode_one(w);
        }
    }
    for prop in props {
        if matches!(prop, Property::UserProperty(_, _)) {
            prop.encode_one(w);
        }
    }
}

/// Encoded size of a property block including its length prefix.
pub fn block_len(props: &[Property]) -> usize {
    let total: usize = props.iter().map(Property::encoded_len).sum();
    varint_len(total as u32) + total
}
