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
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::Token;
use tracing::trace;

use crate::packet::property::Property;
use crate::packet::{Publish, Qos};

pub use crate::subscription_store::ClientId;

/// Offline message stored for QoS1/QoS2
#[derive(Debug, Clone)]
pub struct OfflineMessage {
    pub topic_name: String,
    pub qos: Qos,
    pub retain: bool,
    pub payload: Bytes,
    pub properties: Vec<Property>,
    /// Deadline derived from MessageExpiryInterval, if present
    pub expires_at: Option<Instant>,
}

/// Will message (Last Will and Testament)
#[derive(Debug, Clone)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub retain: bool,
    pub properties: Vec<Property>,
    /// Will Delay Interval in seconds
    pub delay_interval: u32,
}

/// Delivery phase of an outbound QoS1/QoS2 publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPhase {
    /// QoS1: PUBLISH sent, PUBACK outstanding
    AwaitingPuback,
    /// QoS2: PUBLISH sent, PUBREC outstanding
    AwaitingPubrec,
    /// QoS2: PUBREL sent, PUBCOMP outstanding
    AwaitingPubcomp,
}

/// Outbound in-flight entry: the packet plus where it sits in the handshake.
#[derive(Debug, Clone)]
pub struct InflightMessage {
    pub publish: Publish,
    pub phase: DeliveryPhase,
}

/// Packet identifier allocator: 1..=65535, monotonic with wraparound,
/// skipping identifiers still in flight.
#[derive(Debug)]
struct PacketIdAllocator {
    next: u16,
}

impl PacketIdAllocator {
    fn new() -> Self {
        Self { next: 1 }
    }

    fn allocate(&mut self, in_flight: &HashMap<u16, InflightMessage>) -> Option<u16> {
        for _ in 0..u16::MAX {
            let candidate = self.next;
            self.next = if self.next == u16::MAX { 1 } else { self.next + 1 };
            if !in_flight.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

/// Per-client session state, owned by the broker core and keyed by ClientID.
///
/// Outlives its connection when the client asked for retention
/// (session-expiry-interval > 0): the `connection` link is cleared on
/// disconnect and the expiry clock starts.
#[derive(Debug)]
pub struct Session {
    pub client_id: ClientId,
    /// Selector token of the live connection, absent while offline
    connection: Option<Token>,
    pub clean_start: bool,
    pub session_expiry_interval: u32,
    /// Expiry deadline, set while the session is offline
    pub expires_at: Option<Instant>,
    pub will: Option<WillMessage>,
    /// Will delivery deadline, set after an ungraceful disconnect
    pub will_fires_at: Option<Instant>,
    /// Inbound QoS2 packets between PUBREC and PUBREL, keyed by packet id.
    /// The pending publish is routed when PUBREL arrives.
    pub inbound_qos2: HashMap<u16, Publish>,
    /// Outbound QoS1/QoS2 packets awaiting acknowledgment
    pub outbound_inflight: HashMap<u16, InflightMessage>,
    allocator: PacketIdAllocator,
    /// Client's advertised Receive Maximum: cap on concurrent outbound QoS>0
    pub receive_maximum: u16,
    /// Publishes waiting for the receive-maximum window to open
    pub pending_outbound: VecDeque<Publish>,
    /// Messages queued while the session was offline (QoS1/QoS2 only)
    offline_messages: Vec<OfflineMessage>,
}

impl Session {
    pub fn new(
        client_id: ClientId,
        connection: Token,
        clean_start: bool,
        session_expiry_interval: u32,
        receive_maximum: u16,
    ) -> Self {
        Self {
            client_id,
            connection: Some(connection),
            clean_start,
            session_expiry_interval,
            expires_at: None,
            will: None,
            will_fires_at: None,
            inbound_qos2: HashMap::new(),
            outbound_inflight: HashMap::new(),
            allocator: PacketIdAllocator::new(),
            receive_maximum,
            pending_outbound: VecDeque::new(),
            offline_messages: Vec::new(),
        }
    }

    pub fn connection(&self) -> Option<Token> {
        self.connection
    }

    pub fn is_online(&self) -> bool {
        self.connection.is_some()
    }

    /// Reattach on session resumption; clears the expiry and will timers.
    pub fn attach(&mut self, connection: Token, receive_maximum: u16) {
        self.connection = Some(connection);
        self.receive_maximum = receive_maximum;
        self.expires_at = None;
        self.will_fires_at = None;
    }

    /// Mark offline. The expiry clock starts; the will clock starts only for
    /// ungraceful ends (the caller decides by leaving or taking the will).
    pub fn detach(&mut self, now: Instant) {
        self.connection = None;
        self.expires_at = Some(
            now + Duration::from_secs(u64::from(self.session_expiry_interval)),
        );
    }

    /// Whether there is room for another outbound QoS>0 publish.
    pub fn window_open(&self) -> bool {
        self.outbound_inflight.len() < usize::from(self.receive_maximum)
    }

    /// Allocate a packet id avoiding those still in flight.
    pub fn allocate_packet_id(&mut self) -> Option<u16> {
        self.allocator.allocate(&self.outbound_inflight)
    }

    /// Add offline message (QoS1/QoS2 only; QoS0 is dropped while offline)
    pub fn add_offline_message(&mut self, message: OfflineMessage) {
        if matches!(message.qos, Qos::AtLeastOnce | Qos::ExactlyOnce) {
            self.offline_messages.push(message);
            trace!(
                "Added offline message for session '{}', total: {}",
                self.client_id,
                self.offline_messages.len()
            );
        }
    }

    /// Take all offline messages
    pub fn take_offline_messages(&mut self) -> Vec<OfflineMessage> {
        std::mem::take(&mut self.offline_messages)
    }

    /// Drop queued messages whose message-expiry deadline has passed.
    pub fn prune_expired_messages(&mut self, now: Instant) {
        self.offline_messages
            .retain(|m| m.expires_at.is_none_or(|deadline| deadline > now));
    }
}

/// Session registry keyed by ClientID.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: HashMap<ClientId, Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, client_id: &str) -> Option<&Session> {
        self.sessions.get(client_id)
    }

    pub fn get_mut(&mut self, client_id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(client_id)
    }

    pub fn insert(&mut self, session: Session) {
        self.sessions.insert(session.client_id.clone(), session);
    }

    pub fn remove(&mut self, client_id: &str) -> Option<Session> {
        self.sessions.remove(client_id)
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    /// ClientIDs of offline sessions whose expiry deadline has passed.
    pub fn expired_ids(&self, now: Instant) -> Vec<ClientId> {
        self.sessions
            .values()
            .filter(|s| !s.is_online())
            .filter(|s| s.expires_at.is_some_and(|deadline| deadline <= now))
            .map(|s| s.client_id.clone())
            .collect()
    }

    /// ClientIDs of sessions whose will-delay deadline has passed.
    pub fn will_due_ids(&self, now: Instant) -> Vec<ClientId> {
        self.sessions
            .values()
            .filter(|s| s.will.is_some())
            .filter(|s| s.will_fires_at.is_some_and(|deadline| deadline <= now))
            .map(|s| s.client_id.clone())
            .collect()
    }
}
