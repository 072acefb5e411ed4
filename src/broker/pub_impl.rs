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

//! PUBLISH handling and the fanout path: topic-alias resolution, retained
//! store updates, trie matching with no-local / QoS downgrade /
//! retain-as-published, shared-subscription selection, cluster forwarding,
//! and the QoS1/QoS2 acknowledgment flows.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::Token;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::cluster::PeerFrame;
use crate::error::MqttError;
use crate::packet::property::Property;
use crate::packet::{Packet, PubResp, Publish, Qos};
use crate::reason_code::ReasonCode;
use crate::session_store::{DeliveryPhase, InflightMessage, OfflineMessage};

use super::{Broker, CloseIntent};

/// Where a publish entered the broker; decides no-local suppression and
/// whether it may be forwarded to cluster peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// A connected client, identified by ClientID.
    Client(String),
    /// A cluster peer; carries the origin node tag. Never forwarded again.
    Peer(Uuid),
    /// The broker itself (wills).
    Server,
}

impl Broker {
    /// Inbound PUBLISH from a client connection.
    pub(super) fn handle_publish(
        &mut self,
        token: Token,
        mut publish: Publish,
        now: Instant,
    ) -> Option<CloseIntent> {
        // Topic-alias resolution is per-connection state.
        let alias = publish.properties.iter().find_map(|p| match p {
            Property::TopicAlias(v) => Some(*v),
            _ => None,
        });
        let (client_id, username) = {
            let conn = self.connections.get_mut(&token)?;
            if let Some(alias) = alias {
                if alias == 0 || alias > self.config.topic_alias_maximum {
                    return Some(CloseIntent::error(&MqttError::Protocol(
                        ReasonCode::TopicAliasInvalid,
                    )));
                }
                if publish.topic.is_empty() {
                    match conn.alias_in.get(&alias) {
                        Some(topic) => publish.topic = topic.clone(),
                        None => {
                            // Alias used before it was bound.
                            return Some(CloseIntent::error(&MqttError::protocol()));
                        }
                    }
                } else {
                    conn.alias_in.insert(alias, publish.topic.clone());
                }
                // The alias binding stops at this connection.
                publish
                    .properties
                    .retain(|p| !matches!(p, Property::TopicAlias(_)));
            } else if publish.topic.is_empty() {
                return Some(CloseIntent::error(&MqttError::protocol()));
            }
            (conn.client_id.clone()?, conn.username.clone())
        };

        if publish.topic.contains('+') || publish.topic.contains('#') {
            return Some(CloseIntent::error(&MqttError::Protocol(
                ReasonCode::TopicNameInvalid,
            )));
        }
        if publish.qos > self.config.maximum_qos {
            return Some(CloseIntent::error(&MqttError::Protocol(
                ReasonCode::QosNotSupported,
            )));
        }
        if publish.retain && !self.config.retain_available {
            return Some(CloseIntent::error(&MqttError::Protocol(
                ReasonCode::RetainNotSupported,
            )));
        }

        let authorized = match self.authenticator {
            Some(ref authenticator) => {
                authenticator.allow_publish(username.as_deref(), &publish.topic)
            }
            None => true,
        };
        if !authorized {
            debug!(
                "publish to '{}' denied for client '{client_id}'",
                publish.topic
            );
            match publish.qos {
                Qos::AtMostOnce => return None,
                Qos::AtLeastOnce => {
                    let resp = PubResp::new(publish.packet_id?, ReasonCode::NotAuthorized);
                    self.send_packet(token, &Packet::Puback(resp));
                    return None;
                }
                Qos::ExactlyOnce => {
                    let resp = PubResp::new(publish.packet_id?, ReasonCode::NotAuthorized);
                    self.send_packet(token, &Packet::Pubrec(resp));
                    return None;
                }
            }
        }

        match publish.qos {
            Qos::AtMostOnce => {
                self.publish(
                    Origin::Client(client_id),
                    &publish.topic.clone(),
                    publish.qos,
                    publish.retain,
                    publish.properties,
                    publish.payload,
                    now,
                );
                None
            }
            Qos::AtLeastOnce => {
                let packet_id = publish.packet_id?;
                let matched = self.publish(
                    Origin::Client(client_id),
                    &publish.topic.clone(),
                    publish.qos,
                    publish.retain,
                    publish.properties,
                    publish.payload,
                    now,
                );
                let reason_code = if matched {
                    ReasonCode::Success
                } else {
                    ReasonCode::NoMatchingSubscribers
                };
                self.send_packet(token, &Packet::Puback(PubResp::new(packet_id, reason_code)));
                None
            }
            Qos::ExactlyOnce => self.handle_publish_qos2(token, &client_id, publish, now),
        }
    }

    /// QoS2 inbound: PUBREC now, delivery deferred to PUBREL. A duplicate
    /// PUBLISH for a packet id already recorded is acknowledged but not
    /// stored again.
    fn handle_publish_qos2(
        &mut self,
        token: Token,
        client_id: &str,
        publish: Publish,
        _now: Instant,
    ) -> Option<CloseIntent> {
        let packet_id = publish.packet_id?;
        let receive_maximum = self.config.receive_maximum;

        let reason_code = {
            let Some(session) = self.sessions.get_mut(client_id) else {
                return Some(CloseIntent::error(&MqttError::Internal(format!(
                    "no session for connected client '{client_id}'"
                ))));
            };
            if session.inbound_qos2.contains_key(&packet_id) {
                trace!(
                    "duplicate QoS2 PUBLISH pid={packet_id} from '{client_id}', re-acknowledging"
                );
                ReasonCode::Success
            } else {
                if session.inbound_qos2.len() >= usize::from(receive_maximum) {
                    return Some(CloseIntent::error(&MqttError::Resource(
                        ReasonCode::ReceiveMaximumExceeded,
                    )));
                }
                let matched = !self.subscriptions.find_subscribers(&publish.topic).is_empty();
                let session = self.sessions.get_mut(client_id).expect("checked above");
                session.inbound_qos2.insert(packet_id, publish);
                if matched {
                    ReasonCode::Success
                } else {
                    ReasonCode::NoMatchingSubscribers
                }
            }
        };

        self.send_packet(token, &Packet::Pubrec(PubResp::new(packet_id, reason_code)));
        None
    }

    /// PUBACK for an outbound QoS1 publish.
    pub(super) fn handle_puback(
        &mut self,
        token: Token,
        resp: PubResp,
        now: Instant,
    ) -> Option<CloseIntent> {
        let client_id = self.connections.get(&token)?.client_id.clone()?;
        let removed = {
            let session = self.sessions.get_mut(&client_id)?;
            match session.outbound_inflight.get(&resp.packet_id) {
                Some(inflight) if inflight.phase == DeliveryPhase::AwaitingPuback => {
                    session.outbound_inflight.remove(&resp.packet_id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.try_send_pending(&client_id, now);
        } else {
            debug!(
                "PUBACK for unknown pid={} from '{client_id}'",
                resp.packet_id
            );
        }
        None
    }

    /// PUBREC for an outbound QoS2 publish: advance to PUBREL.
    pub(super) fn handle_pubrec(
        &mut self,
        token: Token,
        resp: PubResp,
        now: Instant,
    ) -> Option<CloseIntent> {
        let client_id = self.connections.get(&token)?.client_id.clone()?;
        enum Next {
            Release,
            Abort,
            Unknown,
        }
        let next = {
            let session = self.sessions.get_mut(&client_id)?;
            match session.outbound_inflight.get_mut(&resp.packet_id) {
                Some(inflight) if inflight.phase == DeliveryPhase::AwaitingPubrec => {
                    if resp.reason_code.is_error() {
                        session.outbound_inflight.remove(&resp.packet_id);
                        Next::Abort
                    } else {
                        inflight.phase = DeliveryPhase::AwaitingPubcomp;
                        Next::Release
                    }
                }
                _ => Next::Unknown,
            }
        };
        match next {
            Next::Release => {
                self.send_packet(
                    token,
                    &Packet::Pubrel(PubResp::new(resp.packet_id, ReasonCode::Success)),
                );
            }
            Next::Abort => {
                trace!(
                    "QoS2 delivery pid={} to '{client_id}' aborted by {:?}",
                    resp.packet_id,
                    resp.reason_code
                );
                self.try_send_pending(&client_id, now);
            }
            Next::Unknown => {
                self.send_packet(
                    token,
                    &Packet::Pubrel(PubResp::new(
                        resp.packet_id,
                        ReasonCode::PacketIdentifierNotFound,
                    )),
                );
            }
        }
        None
    }

    /// PUBREL from a client: release the stored QoS2 publish to subscribers.
    pub(super) fn handle_pubrel(
        &mut self,
        token: Token,
        resp: PubResp,
        now: Instant,
    ) -> Option<CloseIntent> {
        let client_id = self.connections.get(&token)?.client_id.clone()?;
        let released = {
            let session = self.sessions.get_mut(&client_id)?;
            session.inbound_qos2.remove(&resp.packet_id)
        };
        let reason_code = match released {
            Some(publish) => {
                self.publish(
                    Origin::Client(client_id),
                    &publish.topic.clone(),
                    publish.qos,
                    publish.retain,
                    publish.properties,
                    publish.payload,
                    now,
                );
                ReasonCode::Success
            }
            None => ReasonCode::PacketIdentifierNotFound,
        };
        self.send_packet(
            token,
            &Packet::Pubcomp(PubResp::new(resp.packet_id, reason_code)),
        );
        None
    }

    /// PUBCOMP closes an outbound QoS2 handshake.
    pub(super) fn handle_pubcomp(
        &mut self,
        token: Token,
        resp: PubResp,
        now: Instant,
    ) -> Option<CloseIntent> {
        let client_id = self.connections.get(&token)?.client_id.clone()?;
        let removed = {
            let session = self.sessions.get_mut(&client_id)?;
            match session.outbound_inflight.get(&resp.packet_id) {
                Some(inflight) if inflight.phase == DeliveryPhase::AwaitingPubcomp => {
                    session.outbound_inflight.remove(&resp.packet_id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.try_send_pending(&client_id, now);
        } else {
            debug!(
                "PUBCOMP for unknown pid={} from '{client_id}'",
                resp.packet_id
            );
        }
        None
    }

    /// Route one application message: retained-store update, trie fanout,
    /// shared-subscription selection, cluster forwarding. Returns whether
    /// any local subscription matched.
    pub fn publish(
        &mut self,
        origin: Origin,
        topic: &str,
        qos: Qos,
        retain: bool,
        properties: Vec<Property>,
        payload: Bytes,
        now: Instant,
    ) -> bool {
        if retain && self.config.retain_available {
            if payload.is_empty() {
                // Empty payload with retain flag: remove retained message
                self.retained.remove(topic);
            } else {
                self.retained
                    .store(topic, qos, payload.clone(), properties.clone(), now);
            }
        }

        // Collapse overlapping subscriptions to one delivery per session:
        // strongest QoS wins, retain-as-published and subscription ids merge.
        struct Target {
            qos: Qos,
            retain: bool,
            sub_ids: Vec<u32>,
        }
        let matched = self.subscriptions.find_subscribers(topic);
        let matched_any = !matched.is_empty();
        let mut targets: HashMap<String, Target> = HashMap::new();
        for m in matched {
            if m.options.no_local {
                if let Origin::Client(ref publisher) = origin {
                    if publisher == &m.client_id {
                        continue;
                    }
                }
            }
            let effective_qos = qos.min(m.options.qos);
            let effective_retain = if m.options.retain_as_published {
                retain
            } else {
                false
            };
            let entry = targets.entry(m.client_id).or_insert(Target {
                qos: effective_qos,
                retain: effective_retain,
                sub_ids: Vec::new(),
            });
            entry.qos = entry.qos.max(effective_qos);
            entry.retain |= effective_retain;
            if let Some(sub_id) = m.sub_id {
                if !entry.sub_ids.contains(&sub_id) {
                    entry.sub_ids.push(sub_id);
                }
            }
        }

        for (client_id, target) in targets {
            let mut props = properties.clone();
            for sub_id in target.sub_ids {
                props.push(Property::SubscriptionIdentifier(sub_id));
            }
            self.deliver_publish(
                &client_id,
                topic,
                target.qos,
                target.retain,
                props,
                payload.clone(),
                now,
            );
        }

        // One member per matching share group.
        let shared = self.shared.select(topic);
        let shared_any = !shared.is_empty();
        for delivery in shared {
            let mut props = properties.clone();
            if let Some(sub_id) = delivery.details.sub_id {
                props.push(Property::SubscriptionIdentifier(sub_id));
            }
            let effective_qos = qos.min(delivery.details.options.qos);
            let effective_retain = if delivery.details.options.retain_as_published {
                retain
            } else {
                false
            };
            self.deliver_publish(
                &delivery.client_id,
                topic,
                effective_qos,
                effective_retain,
                props,
                payload.clone(),
                now,
            );
        }

        // Forward to interested peers, except when the message already came
        // from one (the origin tag breaks routing loops).
        if !matches!(origin, Origin::Peer(_)) {
            let frame = PeerFrame::Forward {
                origin: self.cluster.node_id(),
                topic: topic.to_string(),
                qos,
                retain,
                properties: properties.clone(),
                payload: payload.clone(),
            }
            .encode();
            for token in self.cluster.peers_interested(topic) {
                if let Some(conn) = self.connections.get_mut(&token) {
                    conn.enqueue_bytes(&frame);
                }
                self.pump(token);
            }
        }

        matched_any || shared_any
    }

    /// Deliver one publish to one session: straight onto the wire for QoS0,
    /// through the in-flight window for QoS1/2, into the offline queue when
    /// the session has no connection.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn deliver_publish(
        &mut self,
        client_id: &str,
        topic: &str,
        qos: Qos,
        retain: bool,
        properties: Vec<Property>,
        payload: Bytes,
        now: Instant,
    ) {
        enum Action {
            Send(Token, Publish),
            None,
        }
        let action = {
            let Some(session) = self.sessions.get_mut(client_id) else {
                trace!("no session for subscriber '{client_id}', dropping publish");
                return;
            };
            match session.connection() {
                Some(token) if qos == Qos::AtMostOnce => Action::Send(
                    token,
                    Publish {
                        dup: false,
                        qos,
                        retain,
                        topic: topic.to_string(),
                        packet_id: None,
                        properties,
                        payload,
                    },
                ),
                None if qos == Qos::AtMostOnce => Action::None,
                Some(token) => {
                    if session.window_open() {
                        match session.allocate_packet_id() {
                            Some(packet_id) => {
                                let publish = Publish {
                                    dup: false,
                                    qos,
                                    retain,
                                    topic: topic.to_string(),
                                    packet_id: Some(packet_id),
                                    properties,
                                    payload,
                                };
                                let phase = match qos {
                                    Qos::AtLeastOnce => DeliveryPhase::AwaitingPuback,
                                    _ => DeliveryPhase::AwaitingPubrec,
                                };
                                session.outbound_inflight.insert(
                                    packet_id,
                                    InflightMessage {
                                        publish: publish.clone(),
                                        phase,
                                    },
                                );
                                Action::Send(token, publish)
                            }
                            None => Action::None,
                        }
                    } else {
                        // Window closed: park until an acknowledgment frees a
                        // slot.
                        session.pending_outbound.push_back(Publish {
                            dup: false,
                            qos,
                            retain,
                            topic: topic.to_string(),
                            packet_id: None,
                            properties,
                            payload,
                        });
                        Action::None
                    }
                }
                None => {
                    let expires_at = properties
                        .iter()
                        .find_map(|p| match p {
                            Property::MessageExpiryInterval(secs) => Some(*secs),
                            _ => None,
                        })
                        .map(|secs| now + Duration::from_secs(u64::from(secs)));
                    session.add_offline_message(OfflineMessage {
                        topic_name: topic.to_string(),
                        qos,
                        retain,
                        payload,
                        properties,
                        expires_at,
                    });
                    Action::None
                }
            }
        };

        if let Action::Send(token, publish) = action {
            self.send_publish(token, publish);
        }
    }

    /// Last hop before the wire: optional server-to-client topic alias
    /// mapping, then the shared send path.
    pub(super) fn send_publish(&mut self, token: Token, mut publish: Publish) {
        if self.config.auto_map_topic_alias {
            if let Some(conn) = self.connections.get_mut(&token) {
                if conn.client_alias_maximum > 0 {
                    if let Some(&alias) = conn.alias_out.get(&publish.topic) {
                        publish.properties.push(Property::TopicAlias(alias));
                        publish.topic = String::new();
                    } else if conn.alias_out_next <= conn.client_alias_maximum {
                        let alias = conn.alias_out_next;
                        conn.alias_out_next += 1;
                        conn.alias_out.insert(publish.topic.clone(), alias);
                        publish.properties.push(Property::TopicAlias(alias));
                    }
                }
            }
        }
        self.send_packet(token, &Packet::Publish(publish));
    }

    /// Move parked publishes into the in-flight window while it has room.
    pub(super) fn try_send_pending(&mut self, client_id: &str, _now: Instant) {
        loop {
            let action = {
                let Some(session) = self.sessions.get_mut(client_id) else {
                    return;
                };
                let Some(token) = session.connection() else {
                    return;
                };
                if !session.window_open() {
                    return;
                }
                let Some(mut publish) = session.pending_outbound.pop_front() else {
                    return;
                };
                match session.allocate_packet_id() {
                    Some(packet_id) => {
                        publish.packet_id = Some(packet_id);
                        let phase = match publish.qos {
                            Qos::AtLeastOnce => DeliveryPhase::AwaitingPuback,
                            _ => DeliveryPhase::AwaitingPubrec,
                        };
                        session.outbound_inflight.insert(
                            packet_id,
                            InflightMessage {
                                publish: publish.clone(),
                                phase,
                            },
                        );
                        Some((token, publish))
                    }
                    None => {
                        session.pending_outbound.push_front(publish);
                        None
                    }
                }
            };
            match action {
                Some((token, publish)) => self.send_publish(token, publish),
                None => return,
            }
        }
    }
}
