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

//! Broker core: owns the connection registry, the session registry, the
//! subscription trie, the retained store and the cluster peer registry.
//! Everything runs on the selector thread; handlers reach the core through
//! their selector token.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Registry, Token};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::auth_impl::{AuthDecision, Authenticator};
use crate::cluster::{self, Cluster, PeerFrame};
use crate::config::BrokerConfig;
use crate::connection::{ConnState, Connection, Transport};
use crate::error::MqttError;
use crate::packet::property::Property;
use crate::packet::{
    Auth, Connack, Connect, Disconnect, Packet, PubResp, Qos, RetainHandling,
    SubscriptionOptions, Will,
};
use crate::reason_code::ReasonCode;
use crate::retained_store::RetainedStore;
use crate::server::tls::TlsStream;
use crate::session_store::{DeliveryPhase, Session, SessionStore, WillMessage};
use crate::shared_subscription_manager::{SharedSubscriptionDetails, SharedSubscriptionManager};
use crate::storage::{SessionSnapshot, SessionStorage, SnapshotSubscription};
use crate::subscription_store::SubscriptionStore;

mod pub_impl;
mod sub_impl;

pub use pub_impl::Origin;

/// Listener tokens occupy the low numbers.
const FIRST_CONNECTION_TOKEN: usize = 16;

/// Grace period for draining a DISCONNECT before the socket is dropped.
const DISCONNECT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a connection is being torn down; decides whether a DISCONNECT is
/// sent and whether the session's will is discarded.
struct CloseIntent {
    send: Option<ReasonCode>,
    discard_will: bool,
}

impl CloseIntent {
    fn error(e: &MqttError) -> Self {
        Self {
            send: e.send_disconnect().then_some(e.reason()),
            discard_will: false,
        }
    }

    fn silent() -> Self {
        Self {
            send: None,
            discard_will: false,
        }
    }
}

/// Main broker coordinating all client and peer connections.
pub struct Broker {
    config: BrokerConfig,
    registry: Registry,
    next_token: usize,
    connections: HashMap<Token, Connection>,
    sessions: SessionStore,
    subscriptions: SubscriptionStore,
    retained: RetainedStore,
    shared: SharedSubscriptionManager,
    cluster: Cluster,
    authenticator: Option<Box<dyn Authenticator + Send>>,
    storage: Box<dyn SessionStorage>,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        registry: Registry,
        authenticator: Option<Box<dyn Authenticator + Send>>,
        storage: Box<dyn SessionStorage>,
    ) -> Self {
        Self {
            config,
            registry,
            next_token: FIRST_CONNECTION_TOKEN,
            connections: HashMap::new(),
            sessions: SessionStore::new(),
            subscriptions: SubscriptionStore::new(),
            retained: RetainedStore::new(),
            shared: SharedSubscriptionManager::new(),
            cluster: Cluster::new(Uuid::new_v4()),
            authenticator,
            storage,
        }
    }

    pub fn select_tick(&self) -> Duration {
        self.config.select_tick
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Attach an accepted client socket, plain or TLS.
    pub fn accept_client(&mut self, stream: TcpStream, tls: Option<Arc<rustls::ServerConfig>>) {
        let transport = match tls {
            Some(config) => match TlsStream::new(stream, config) {
                Ok(tls_stream) => Transport::Tls(Box::new(tls_stream)),
                Err(e) => {
                    error!("failed to start TLS session: {e}");
                    return;
                }
            },
            None => Transport::Plain(stream),
        };
        let token = self.alloc_token();
        let mut conn = Connection::new(
            transport,
            token,
            Instant::now(),
            self.config.connect_timeout,
            self.config.maximum_packet_size,
        );
        if let Err(e) = conn.sync_interest(&self.registry) {
            error!("failed to register client socket: {e}");
            return;
        }
        self.connections.insert(token, conn);
    }

    /// Attach an inbound cluster peer socket.
    pub fn accept_peer(&mut self, stream: TcpStream) {
        self.attach_peer(stream, None);
    }

    /// Dial a peer broker and attach the socket.
    pub fn add_cluster_connection(&mut self, addr: SocketAddr) -> anyhow::Result<()> {
        let stream = cluster::dial(addr)?;
        self.attach_peer(stream, Some(addr));
        Ok(())
    }

    fn attach_peer(&mut self, stream: TcpStream, addr: Option<SocketAddr>) {
        let token = self.alloc_token();
        let mut conn = Connection::new(
            Transport::Plain(stream),
            token,
            Instant::now(),
            self.config.connect_timeout,
            None,
        );
        // Hello plus a full replay of the local subscription set.
        conn.enqueue_bytes(&self.cluster.hello().encode());
        for filter in self.subscriptions.all_filters() {
            conn.enqueue_bytes(&PeerFrame::SubAdd { filter }.encode());
        }
        if let Err(e) = conn.sync_interest(&self.registry) {
            error!("failed to register peer socket: {e}");
            return;
        }
        self.connections.insert(token, conn);
        self.cluster.add_peer(token, addr);
        info!("cluster peer attached on {token:?}");
    }

    /// Readiness dispatch for one connection token.
    pub fn socket_ready(&mut self, token: Token, readable: bool, writable: bool) {
        if !self.connections.contains_key(&token) {
            return;
        }
        let now = Instant::now();

        if writable {
            let result = self
                .connections
                .get_mut(&token)
                .expect("checked above")
                .send_remaining();
            match result {
                Ok(()) => {
                    let drained_disconnect = self
                        .connections
                        .get(&token)
                        .map(|c| c.state == ConnState::Disconnecting && c.drained())
                        .unwrap_or(false);
                    if drained_disconnect {
                        self.close_connection(token, CloseIntent::silent(), now);
                        return;
                    }
                }
                Err(e) => {
                    debug!("write failed on {token:?}: {e}");
                    self.closed_with_exception(token, now);
                    return;
                }
            }
        }

        if readable {
            if let Some(intent) = self.handle_readable(token, now) {
                self.close_connection(token, intent, now);
                return;
            }
        }

        self.pump(token);
    }

    /// Drain buffered frames for one readable connection. Returns a close
    /// intent when the connection must go down.
    fn handle_readable(&mut self, token: Token, now: Instant) -> Option<CloseIntent> {
        let is_peer = self.cluster.is_peer(token);
        let eof = {
            let conn = self.connections.get_mut(&token)?;
            match conn.fill() {
                Ok(eof) => eof,
                Err(e) => {
                    debug!("read failed on {token:?}: {e}");
                    return Some(CloseIntent::error(&e));
                }
            }
        };

        if is_peer {
            if let Some(intent) = self.drain_peer_frames(token, now) {
                return Some(intent);
            }
        } else if let Some(intent) = self.drain_client_packets(token, now) {
            return Some(intent);
        }

        if eof && self.connections.contains_key(&token) {
            self.closed_gracefully(token, now);
        }
        None
    }

    fn drain_peer_frames(&mut self, token: Token, now: Instant) -> Option<CloseIntent> {
        let frames = {
            let conn = self.connections.get_mut(&token)?;
            match cluster::take_frames(conn.read_buf_mut()) {
                Ok(frames) => frames,
                Err(e) => return Some(CloseIntent::error(&e)),
            }
        };
        for frame in frames {
            match self.cluster.handle_frame(token, frame) {
                Ok(Some(PeerFrame::Forward {
                    origin,
                    topic,
                    qos,
                    retain,
                    properties,
                    payload,
                })) => {
                    self.publish(
                        Origin::Peer(origin),
                        &topic,
                        qos,
                        retain,
                        properties,
                        payload,
                        now,
                    );
                }
                Ok(_) => {}
                Err(e) => return Some(CloseIntent::error(&e)),
            }
        }
        None
    }

    fn drain_client_packets(&mut self, token: Token, now: Instant) -> Option<CloseIntent> {
        loop {
            let packet = {
                let conn = self.connections.get_mut(&token)?;
                match conn.read() {
                    Ok(Some(packet)) => {
                        conn.touch(now);
                        packet
                    }
                    Ok(None) => return None,
                    Err(e) => return Some(CloseIntent::error(&e)),
                }
            };
            if let Some(intent) = self.handle_packet(token, packet, now) {
                return Some(intent);
            }
            if !self.connections.contains_key(&token) {
                return None;
            }
        }
    }

    /// Per-connection protocol state machine dispatch.
    fn handle_packet(&mut self, token: Token, packet: Packet, now: Instant) -> Option<CloseIntent> {
        let state = self.connections.get(&token)?.state;
        match state {
            ConnState::AwaitingConnect => match packet {
                Packet::Connect(connect) => self.handle_connect(token, connect, now),
                Packet::Auth(auth) => self.handle_auth(token, auth, now),
                other => {
                    // Only CONNECT may open the conversation; close without
                    // a DISCONNECT since the peer never completed one.
                    warn!(
                        "{:?} before CONNECT on {token:?}; closing",
                        other.packet_type()
                    );
                    Some(CloseIntent::silent())
                }
            },
            ConnState::Connected => match packet {
                Packet::Connect(_) => {
                    // A second CONNECT is a protocol error.
                    Some(CloseIntent::error(&MqttError::protocol()))
                }
                Packet::Publish(publish) => self.handle_publish(token, publish, now),
                Packet::Puback(resp) => self.handle_puback(token, resp, now),
                Packet::Pubrec(resp) => self.handle_pubrec(token, resp, now),
                Packet::Pubrel(resp) => self.handle_pubrel(token, resp, now),
                Packet::Pubcomp(resp) => self.handle_pubcomp(token, resp, now),
                Packet::Subscribe(subscribe) => self.handle_subscribe(token, subscribe, now),
                Packet::Unsubscribe(unsubscribe) => {
                    self.handle_unsubscribe(token, unsubscribe, now)
                }
                Packet::Pingreq => {
                    self.send_packet(token, &Packet::Pingresp);
                    None
                }
                Packet::Disconnect(disconnect) => self.handle_disconnect(token, disconnect, now),
                Packet::Auth(auth) => self.handle_auth(token, auth, now),
                Packet::Connack(_) | Packet::Suback(_) | Packet::Unsuback(_) | Packet::Pingresp => {
                    // Server-to-client packets have no business arriving here.
                    Some(CloseIntent::error(&MqttError::protocol()))
                }
            },
            ConnState::Disconnecting => None,
        }
    }

    /// CONNECT admission: authentication, takeover, session resumption or
    /// creation, CONNACK advertisement, queued-message replay.
    fn handle_connect(
        &mut self,
        token: Token,
        connect: Connect,
        now: Instant,
    ) -> Option<CloseIntent> {
        let auth_method = connect.properties.iter().find_map(|p| match p {
            Property::AuthenticationMethod(m) => Some(m.clone()),
            _ => None,
        });
        let auth_data = connect.properties.iter().find_map(|p| match p {
            Property::AuthenticationData(d) => Some(d.clone()),
            _ => None,
        });

        // A broker configured for one enhanced-auth method accepts no other.
        if let Some(ref required) = self.config.authentication_method {
            if auth_method.as_deref() != Some(required.as_str()) {
                self.send_packet(
                    token,
                    &Packet::Connack(Connack {
                        session_present: false,
                        reason_code: ReasonCode::BadAuthenticationMethod,
                        properties: Vec::new(),
                    }),
                );
                return Some(CloseIntent::silent());
            }
        }

        let decision = match self.authenticator {
            Some(ref authenticator) => authenticator.authenticate(
                &connect.client_id,
                connect.username.as_deref(),
                connect.password.as_deref(),
                auth_method.as_deref(),
                auth_data.as_deref(),
            ),
            None => AuthDecision::Accept,
        };

        match decision {
            AuthDecision::Deny(reason_code) => {
                info!(
                    "CONNECT denied for client '{}': {reason_code:?}",
                    connect.client_id
                );
                self.send_packet(
                    token,
                    &Packet::Connack(Connack {
                        session_present: false,
                        reason_code,
                        properties: Vec::new(),
                    }),
                );
                Some(CloseIntent::silent())
            }
            AuthDecision::AcceptWithChallenge(data) => {
                let Some(method) = auth_method else {
                    // A challenge needs an AUTH exchange, which needs a method.
                    return Some(CloseIntent::error(&MqttError::Protocol(
                        ReasonCode::BadAuthenticationMethod,
                    )));
                };
                let conn = self.connections.get_mut(&token)?;
                conn.auth_method = Some(method.clone());
                conn.pending_connect = Some(Box::new(connect));
                self.send_packet(
                    token,
                    &Packet::Auth(Auth {
                        reason_code: ReasonCode::ContinueAuthentication,
                        properties: vec![
                            Property::AuthenticationMethod(method),
                            Property::AuthenticationData(data),
                        ],
                    }),
                );
                None
            }
            AuthDecision::Accept => self.complete_connect(token, connect, now),
        }
    }

    fn handle_auth(&mut self, token: Token, auth: Auth, now: Instant) -> Option<CloseIntent> {
        let (state, pending, method) = {
            let conn = self.connections.get(&token)?;
            (
                conn.state,
                conn.pending_connect.clone(),
                conn.auth_method.clone(),
            )
        };

        let packet_method = auth.properties.iter().find_map(|p| match p {
            Property::AuthenticationMethod(m) => Some(m.clone()),
            _ => None,
        });
        if packet_method.is_some() && packet_method != method {
            // The method must not change mid-exchange.
            return Some(CloseIntent::error(&MqttError::protocol()));
        }
        let auth_data = auth.properties.iter().find_map(|p| match p {
            Property::AuthenticationData(d) => Some(d.clone()),
            _ => None,
        });

        match state {
            ConnState::AwaitingConnect => {
                let Some(connect) = pending else {
                    return Some(CloseIntent::error(&MqttError::protocol()));
                };
                let decision = match self.authenticator {
                    Some(ref authenticator) => authenticator.authenticate(
                        &connect.client_id,
                        connect.username.as_deref(),
                        connect.password.as_deref(),
                        method.as_deref(),
                        auth_data.as_deref(),
                    ),
                    None => AuthDecision::Accept,
                };
                match decision {
                    AuthDecision::Accept => {
                        if let Some(conn) = self.connections.get_mut(&token) {
                            conn.pending_connect = None;
                        }
                        self.complete_connect(token, *connect, now)
                    }
                    AuthDecision::AcceptWithChallenge(data) => {
                        let mut properties = Vec::new();
                        if let Some(method) = method {
                            properties.push(Property::AuthenticationMethod(method));
                        }
                        properties.push(Property::AuthenticationData(data));
                        self.send_packet(
                            token,
                            &Packet::Auth(Auth {
                                reason_code: ReasonCode::ContinueAuthentication,
                                properties,
                            }),
                        );
                        None
                    }
                    AuthDecision::Deny(reason_code) => {
                        self.send_packet(
                            token,
                            &Packet::Connack(Connack {
                                session_present: false,
                                reason_code,
                                properties: Vec::new(),
                            }),
                        );
                        Some(CloseIntent::silent())
                    }
                }
            }
            ConnState::Connected => {
                // Re-authentication on a live connection.
                if !matches!(
                    auth.reason_code,
                    ReasonCode::ReAuthenticate | ReasonCode::ContinueAuthentication
                ) {
                    return Some(CloseIntent::error(&MqttError::protocol()));
                }
                let (client_id, username) = {
                    let conn = self.connections.get(&token)?;
                    (conn.client_id.clone(), conn.username.clone())
                };
                let decision = match self.authenticator {
                    Some(ref authenticator) => authenticator.authenticate(
                        client_id.as_deref().unwrap_or_default(),
                        username.as_deref(),
                        None,
                        method.as_deref(),
                        auth_data.as_deref(),
                    ),
                    None => AuthDecision::Accept,
                };
                match decision {
                    AuthDecision::Accept => {
                        self.send_packet(
                            token,
                            &Packet::Auth(Auth {
                                reason_code: ReasonCode::Success,
                                properties: Vec::new(),
                            }),
                        );
                        None
                    }
                    AuthDecision::AcceptWithChallenge(data) => {
                        let mut properties = Vec::new();
                        if let Some(method) = method {
                            properties.push(Property::AuthenticationMethod(method));
                        }
                        properties.push(Property::AuthenticationData(data));
                        self.send_packet(
                            token,
                            &Packet::Auth(Auth {
                                reason_code: ReasonCode::ContinueAuthentication,
                                properties,
                            }),
                        );
                        None
                    }
                    AuthDecision::Deny(reason_code) => {
                        Some(CloseIntent::error(&MqttError::Protocol(reason_code)))
                    }
                }
            }
            ConnState::Disconnecting => None,
        }
    }

    fn complete_connect(
        &mut self,
        token: Token,
        connect: Connect,
        now: Instant,
    ) -> Option<CloseIntent> {
        // Empty ClientID gets an assigned one, echoed in CONNACK.
        let (client_id, assigned_client_id) = if connect.client_id.is_empty() {
            let assigned = format!("auto-{}", Uuid::new_v4().simple());
            (assigned.clone(), Some(assigned))
        } else {
            (connect.client_id.clone(), None)
        };

        let requested_expiry = connect
            .properties
            .iter()
            .find_map(|p| match p {
                Property::SessionExpiryInterval(v) => Some(*v),
                _ => None,
            })
            .unwrap_or(0);
        let session_expiry_interval = match self.config.maximum_session_expiry {
            Some(max) => requested_expiry.min(max),
            None => requested_expiry,
        };
        let client_receive_maximum = connect
            .properties
            .iter()
            .find_map(|p| match p {
                Property::ReceiveMaximum(v) => Some(*v),
                _ => None,
            })
            .unwrap_or(u16::MAX);
        let client_alias_maximum = connect
            .properties
            .iter()
            .find_map(|p| match p {
                Property::TopicAliasMaximum(v) => Some(*v),
                _ => None,
            })
            .unwrap_or(0);
        let client_max_packet_size = connect.properties.iter().find_map(|p| match p {
            Property::MaximumPacketSize(v) => Some(*v),
            _ => None,
        });

        // Gate the will against the feature set before touching any state.
        if let Some(ref will) = connect.will {
            let reject = if will.qos > self.config.maximum_qos {
                Some(ReasonCode::QosNotSupported)
            } else if will.retain && !self.config.retain_available {
                Some(ReasonCode::RetainNotSupported)
            } else {
                None
            };
            if let Some(reason_code) = reject {
                self.send_packet(
                    token,
                    &Packet::Connack(Connack {
                        session_present: false,
                        reason_code,
                        properties: Vec::new(),
                    }),
                );
                return Some(CloseIntent::silent());
            }
        }
        let will_message = connect.will.as_ref().map(Self::will_from_connect);

        // Session takeover: a live connection under the same ClientID is
        // disconnected first.
        if let Some(old_token) = self.sessions.get(&client_id).and_then(|s| s.connection()) {
            info!("session takeover for client '{client_id}'");
            self.close_connection(
                old_token,
                CloseIntent {
                    send: Some(ReasonCode::SessionTakenOver),
                    discard_will: false,
                },
                now,
            );
        }

        if connect.clean_start && self.sessions.contains(&client_id) {
            self.destroy_session(&client_id, now);
        }

        let resumable = self
            .sessions
            .get(&client_id)
            .map(|s| s.expires_at.is_none_or(|deadline| deadline > now))
            .unwrap_or(false);

        let session_present;
        if resumable {
            session_present = true;
            let session = self.sessions.get_mut(&client_id).expect("checked above");
            session.attach(token, client_receive_maximum);
            session.clean_start = false;
            session.session_expiry_interval = session_expiry_interval;
            session.will = will_message;
            trace!("resumed session for client '{client_id}'");
        } else {
            // A stale (expired) session is torn down in full before the
            // replacement; a plain remove would leak its trie entries.
            if self.sessions.contains(&client_id) {
                self.destroy_session(&client_id, now);
            }
            // Cold resume from the persistence boundary, else a fresh session.
            let restored = !connect.clean_start
                && self.restore_snapshot(&client_id, token, client_receive_maximum);
            session_present = restored;
            if restored {
                let session = self.sessions.get_mut(&client_id).expect("just restored");
                session.session_expiry_interval = session_expiry_interval;
                session.will = will_message;
            } else {
                let mut session = Session::new(
                    client_id.clone(),
                    token,
                    connect.clean_start,
                    session_expiry_interval,
                    client_receive_maximum,
                );
                session.will = will_message;
                self.sessions.insert(session);
            }
        }

        // Connection bookkeeping and keep-alive negotiation.
        let keep_alive = self.config.server_keep_alive.unwrap_or(connect.keep_alive);
        {
            let conn = self.connections.get_mut(&token)?;
            conn.state = ConnState::Connected;
            conn.client_id = Some(client_id.clone());
            conn.username = connect.username.clone();
            conn.client_alias_maximum = client_alias_maximum;
            conn.max_packet_size_out = client_max_packet_size;
            conn.set_keep_alive(keep_alive, now);
        }

        let properties =
            self.connack_properties(assigned_client_id, requested_expiry, session_expiry_interval);
        self.send_packet(
            token,
            &Packet::Connack(Connack {
                session_present,
                reason_code: ReasonCode::Success,
                properties,
            }),
        );
        info!(
            "client '{client_id}' connected (session_present={session_present}, keep_alive={keep_alive}s)"
        );

        self.replay_session(&client_id, now);
        None
    }

    fn will_from_connect(will: &Will) -> WillMessage {
        let delay_interval = will
            .properties
            .iter()
            .find_map(|p| match p {
                Property::WillDelayInterval(v) => Some(*v),
                _ => None,
            })
            .unwrap_or(0);
        // The delay property governs scheduling; it is not republished.
        let properties = will
            .properties
            .iter()
            .filter(|p| !matches!(p, Property::WillDelayInterval(_)))
            .cloned()
            .collect();
        WillMessage {
            topic: will.topic.clone(),
            payload: will.payload.clone(),
            qos: will.qos,
            retain: will.retain,
            properties,
            delay_interval,
        }
    }

    fn connack_properties(
        &self,
        assigned_client_id: Option<String>,
        requested_expiry: u32,
        granted_expiry: u32,
    ) -> Vec<Property> {
        let mut properties = Vec::new();
        if requested_expiry != granted_expiry {
            properties.push(Property::SessionExpiryInterval(granted_expiry));
        }
        if let Some(assigned) = assigned_client_id {
            properties.push(Property::AssignedClientIdentifier(assigned));
        }
        if self.config.receive_maximum != u16::MAX {
            properties.push(Property::ReceiveMaximum(self.config.receive_maximum));
        }
        if self.config.maximum_qos < Qos::ExactlyOnce {
            properties.push(Property::MaximumQos(self.config.maximum_qos as u8));
        }
        if !self.config.retain_available {
            properties.push(Property::RetainAvailable(0));
        }
        if let Some(size) = self.config.maximum_packet_size {
            properties.push(Property::MaximumPacketSize(size));
        }
        if self.config.topic_alias_maximum > 0 {
            properties.push(Property::TopicAliasMaximum(self.config.topic_alias_maximum));
        }
        if !self.config.wildcard_subscription_available {
            properties.push(Property::WildcardSubscriptionAvailable(0));
        }
        if !self.config.subscription_identifier_available {
            properties.push(Property::SubscriptionIdentifierAvailable(0));
        }
        if !self.config.shared_subscription_available {
            properties.push(Property::SharedSubscriptionAvailable(0));
        }
        if let Some(keep_alive) = self.config.server_keep_alive {
            properties.push(Property::ServerKeepAlive(keep_alive));
        }
        properties
    }

    /// Restore a session from the persistence boundary. Returns true when a
    /// snapshot existed and was applied.
    fn restore_snapshot(
        &mut self,
        client_id: &str,
        token: Token,
        client_receive_maximum: u16,
    ) -> bool {
        let bytes = match self.storage.load(client_id) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return false,
            Err(e) => {
                warn!("failed to load session snapshot for '{client_id}': {e}");
                return false;
            }
        };
        let snapshot = match SessionSnapshot::from_bytes(&bytes) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("corrupt session snapshot for '{client_id}': {e}");
                return false;
            }
        };

        let session = Session::new(
            client_id.to_string(),
            token,
            false,
            snapshot.session_expiry_interval,
            client_receive_maximum,
        );
        for sub in &snapshot.subscriptions {
            let Ok(qos) = Qos::try_from(sub.qos) else {
                continue;
            };
            let options = SubscriptionOptions {
                qos,
                no_local: sub.no_local,
                retain_as_published: sub.retain_as_published,
                retain_handling: match sub.retain_handling {
                    1 => RetainHandling::SendIfNew,
                    2 => RetainHandling::DoNotSend,
                    _ => RetainHandling::SendAlways,
                },
            };
            // Share-tagged entries go back into their group, not the trie.
            match sub.share_name {
                Some(ref share_name) => self.shared.insert(
                    share_name,
                    &sub.filter,
                    client_id,
                    SharedSubscriptionDetails {
                        options,
                        sub_id: sub.sub_id,
                    },
                ),
                None => {
                    let _ = self
                        .subscriptions
                        .subscribe(client_id, &sub.filter, options, sub.sub_id);
                }
            }
        }
        self.sessions.insert(session);
        debug!("restored session snapshot for '{client_id}'");
        true
    }

    fn snapshot_session(&mut self, client_id: &str) {
        let Some(session) = self.sessions.get(client_id) else {
            return;
        };
        let mut subscriptions: Vec<SnapshotSubscription> = self
            .subscriptions
            .client_subscriptions(client_id)
            .into_iter()
            .map(|s| SnapshotSubscription {
                filter: s.topic_filter,
                share_name: None,
                qos: s.options.qos as u8,
                no_local: s.options.no_local,
                retain_as_published: s.options.retain_as_published,
                retain_handling: s.options.retain_handling as u8,
                sub_id: s.sub_id,
            })
            .collect();
        for (share_name, filter, details) in self.shared.client_memberships(client_id) {
            subscriptions.push(SnapshotSubscription {
                filter,
                share_name: Some(share_name),
                qos: details.options.qos as u8,
                no_local: details.options.no_local,
                retain_as_published: details.options.retain_as_published,
                retain_handling: details.options.retain_handling as u8,
                sub_id: details.sub_id,
            });
        }
        let snapshot = SessionSnapshot {
            client_id: client_id.to_string(),
            session_expiry_interval: session.session_expiry_interval,
            subscriptions,
        };
        match snapshot.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.storage.save(client_id, &bytes) {
                    warn!("failed to save session snapshot for '{client_id}': {e}");
                }
            }
            Err(e) => warn!("failed to serialize session snapshot for '{client_id}': {e}"),
        }
    }

    /// Resend in-flight messages (DUP set), drain the offline queue, then
    /// anything waiting on the receive-maximum window.
    fn replay_session(&mut self, client_id: &str, now: Instant) {
        let (token, resend, offline) = {
            let Some(session) = self.sessions.get_mut(client_id) else {
                return;
            };
            let Some(token) = session.connection() else {
                return;
            };

            let mut resend: Vec<Packet> = Vec::new();
            let mut pids: Vec<u16> = session.outbound_inflight.keys().copied().collect();
            pids.sort_unstable();
            for pid in pids {
                let inflight = &session.outbound_inflight[&pid];
                match inflight.phase {
                    DeliveryPhase::AwaitingPuback | DeliveryPhase::AwaitingPubrec => {
                        let mut publish = inflight.publish.clone();
                        publish.dup = true;
                        resend.push(Packet::Publish(publish));
                    }
                    DeliveryPhase::AwaitingPubcomp => {
                        resend.push(Packet::Pubrel(PubResp::new(pid, ReasonCode::Success)));
                    }
                }
            }
            (token, resend, session.take_offline_messages())
        };

        for packet in &resend {
            self.send_packet(token, packet);
        }
        for message in offline {
            if message.expires_at.is_some_and(|deadline| deadline <= now) {
                continue;
            }
            let mut properties = message.properties;
            // MessageExpiryInterval carries the remaining time on delivery.
            if let Some(deadline) = message.expires_at {
                let remaining = deadline.saturating_duration_since(now).as_secs() as u32;
                for prop in properties.iter_mut() {
                    if let Property::MessageExpiryInterval(v) = prop {
                        *v = remaining;
                    }
                }
            }
            self.deliver_publish(
                client_id,
                &message.topic_name,
                message.qos,
                message.retain,
                properties,
                message.payload,
                now,
            );
        }
        self.try_send_pending(client_id, now);
    }

    fn handle_disconnect(
        &mut self,
        token: Token,
        disconnect: Disconnect,
        _now: Instant,
    ) -> Option<CloseIntent> {
        let client_id = self.connections.get(&token)?.client_id.clone();

        // The client may revise its session expiry at disconnect, but only
        // if it asked for retention at CONNECT.
        if let Some(client_id) = client_id {
            let new_expiry = disconnect.properties.iter().find_map(|p| match p {
                Property::SessionExpiryInterval(v) => Some(*v),
                _ => None,
            });
            if let Some(new_expiry) = new_expiry {
                let Some(session) = self.sessions.get_mut(&client_id) else {
                    return Some(CloseIntent::silent());
                };
                if session.session_expiry_interval == 0 && new_expiry != 0 {
                    return Some(CloseIntent::error(&MqttError::protocol()));
                }
                session.session_expiry_interval = match self.config.maximum_session_expiry {
                    Some(max) => new_expiry.min(max),
                    None => new_expiry,
                };
            }
        }

        trace!(
            "client DISCONNECT ({:?}) on {token:?}",
            disconnect.reason_code
        );
        Some(CloseIntent {
            send: None,
            discard_will: disconnect.reason_code == ReasonCode::NORMAL_DISCONNECTION,
        })
    }

    /// Lifecycle hook: the peer closed its end (EOF). An EOF without a
    /// DISCONNECT is still an ungraceful MQTT end, so the will stays
    /// scheduled.
    pub fn closed_gracefully(&mut self, token: Token, now: Instant) {
        self.close_connection(token, CloseIntent::silent(), now);
    }

    /// Lifecycle hook: I/O error on the socket.
    pub fn closed_with_exception(&mut self, token: Token, now: Instant) {
        self.close_connection(token, CloseIntent::silent(), now);
    }

    /// Server-initiated disconnect of a session's live connection.
    pub fn disconnect(&mut self, client_id: &str, reason: ReasonCode, now: Instant) {
        let Some(token) = self.sessions.get(client_id).and_then(|s| s.connection()) else {
            return;
        };
        self.close_connection(
            token,
            CloseIntent {
                send: Some(reason),
                discard_will: false,
            },
            now,
        );
    }

    /// Tear down one connection: optionally enqueue a DISCONNECT and drain
    /// it, deregister the socket, detach or destroy the session, drop peer
    /// routing state.
    fn close_connection(&mut self, token: Token, intent: CloseIntent, now: Instant) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };

        if let Some(reason) = intent.send {
            if conn.state == ConnState::Connected {
                conn.enqueue(&Packet::Disconnect(Disconnect::new(reason)));
            }
            let _ = conn.send_remaining();
            if !conn.drained() && conn.state == ConnState::Connected {
                // Park the connection until the DISCONNECT drains or the
                // grace period ends.
                conn.state = ConnState::Disconnecting;
                conn.connect_deadline = now + DISCONNECT_DRAIN_TIMEOUT;
                let client_id = conn.client_id.clone();
                let _ = conn.sync_interest(&self.registry);
                self.connections.insert(token, conn);
                if let Some(client_id) = client_id {
                    self.detach_session(&client_id, token, intent.discard_will, now);
                }
                return;
            }
        } else {
            let _ = conn.send_remaining();
        }

        conn.deregister(&self.registry);
        let client_id = conn.client_id.clone();
        drop(conn);

        if let Some(client_id) = client_id {
            self.detach_session(&client_id, token, intent.discard_will, now);
        }
        if self.cluster.is_peer(token) {
            self.remove_cluster_connection(token);
        }
    }

    /// Mark a session offline, schedule or discard its will, start the
    /// expiry clock, snapshot it for the persistence boundary.
    fn detach_session(&mut self, client_id: &str, token: Token, discard_will: bool, now: Instant) {
        let (destroy, will_due_now) = {
            let Some(session) = self.sessions.get_mut(client_id) else {
                return;
            };
            if session.connection() != Some(token) {
                // Already rebound by a takeover.
                return;
            }
            if discard_will {
                session.will = None;
            }
            session.detach(now);
            let delay = session.will.as_ref().map(|w| w.delay_interval);
            if let Some(delay) = delay {
                session.will_fires_at = Some(now + Duration::from_secs(u64::from(delay)));
            }
            (session.session_expiry_interval == 0, delay == Some(0))
        };

        if destroy {
            // No retention requested: the session ends now, the will (if
            // still scheduled) fires now.
            self.fire_will(client_id, now);
            self.destroy_session(client_id, now);
        } else {
            if will_due_now {
                // Zero will-delay publishes before any reconnect can cancel.
                self.fire_will(client_id, now);
            }
            self.snapshot_session(client_id);
            trace!("session '{client_id}' offline, expiry clock started");
        }
    }

    /// Remove a session and every trace of it from the routing state.
    fn destroy_session(&mut self, client_id: &str, _now: Instant) {
        if self.sessions.remove(client_id).is_none() {
            return;
        }
        let filters: Vec<String> = self
            .subscriptions
            .client_subscriptions(client_id)
            .into_iter()
            .map(|s| s.topic_filter)
            .collect();
        self.subscriptions.unsubscribe_all(client_id);
        self.shared.remove_client(client_id);
        self.drop_subscription_interest(&filters);
        if let Err(e) = self.storage.remove(client_id) {
            warn!("failed to remove session snapshot for '{client_id}': {e}");
        }
        debug!("session '{client_id}' destroyed");
    }

    /// Publish and clear a session's will.
    fn fire_will(&mut self, client_id: &str, now: Instant) {
        let will = {
            let Some(session) = self.sessions.get_mut(client_id) else {
                return;
            };
            session.will_fires_at = None;
            session.will.take()
        };
        let Some(will) = will else {
            return;
        };
        info!(
            "publishing will for client '{client_id}' on topic '{}'",
            will.topic
        );
        self.publish(
            Origin::Server,
            &will.topic,
            will.qos,
            will.retain,
            will.properties,
            will.payload,
            now,
        );
    }

    /// Drop a cluster peer from routing and close its socket. Local
    /// subscription state is untouched.
    pub fn remove_cluster_connection(&mut self, token: Token) {
        self.cluster.remove_peer(token);
        if let Some(mut conn) = self.connections.remove(&token) {
            conn.deregister(&self.registry);
        }
    }

    /// Propagate a new local filter to every peer.
    fn propagate_subscription_added(&mut self, filter: &str) {
        let frame = PeerFrame::SubAdd {
            filter: filter.to_string(),
        }
        .encode();
        for token in self.cluster.peer_tokens() {
            if let Some(conn) = self.connections.get_mut(&token) {
                conn.enqueue_bytes(&frame);
            }
            self.pump(token);
        }
    }

    /// Tell peers about filters no local subscriber holds anymore.
    fn drop_subscription_interest(&mut self, filters: &[String]) {
        let remaining = self.subscriptions.all_filters();
        for filter in filters {
            if remaining.contains(filter) {
                continue;
            }
            let frame = PeerFrame::SubRemove {
                filter: filter.clone(),
            }
            .encode();
            for token in self.cluster.peer_tokens() {
                if let Some(conn) = self.connections.get_mut(&token) {
                    conn.enqueue_bytes(&frame);
                }
                self.pump(token);
            }
        }
    }

    /// Encode and queue one packet, write what the socket will take, and
    /// keep the selector interest in sync. Write errors are left for the
    /// next readiness event to surface.
    fn send_packet(&mut self, token: Token, packet: &Packet) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        if !conn.enqueue(packet) {
            return;
        }
        if let Err(e) = conn.send_remaining() {
            debug!("deferred write error on {token:?}: {e}");
        }
        if let Err(e) = conn.sync_interest(&self.registry) {
            debug!("interest update failed on {token:?}: {e}");
        }
    }

    /// Flush and re-sync interest after a batch of work on one connection.
    fn pump(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        if let Err(e) = conn.send_remaining() {
            debug!("deferred write error on {token:?}: {e}");
        }
        if let Err(e) = conn.sync_interest(&self.registry) {
            debug!("interest update failed on {token:?}: {e}");
        }
    }

    /// Per-tick time-based work: connect timeouts, keep-alive enforcement,
    /// will delays, session expiry, message-expiry pruning.
    pub fn cleanup_operations(&mut self, now: Instant) {
        // Connections that never sent CONNECT in time, and parked
        // DISCONNECTs past their drain grace.
        let overdue: Vec<Token> = self
            .connections
            .values()
            .filter(|c| {
                matches!(
                    c.state,
                    ConnState::AwaitingConnect | ConnState::Disconnecting
                ) && now >= c.connect_deadline
                    && !self.cluster.is_peer(c.token)
            })
            .map(|c| c.token)
            .collect();
        for token in overdue {
            debug!("closing {token:?}: connect/drain deadline passed");
            self.close_connection(token, CloseIntent::silent(), now);
        }

        // Keep-alive missed for 1.5x the negotiated value.
        let stale: Vec<Token> = self
            .connections
            .values()
            .filter(|c| c.state == ConnState::Connected)
            .filter(|c| c.keep_alive_deadline.is_some_and(|deadline| deadline <= now))
            .map(|c| c.token)
            .collect();
        for token in stale {
            info!("closing {token:?}: keep-alive timeout");
            self.close_connection(
                token,
                CloseIntent {
                    send: Some(ReasonCode::KeepAliveTimeout),
                    discard_will: false,
                },
                now,
            );
        }

        // Wills whose delay elapsed.
        for client_id in self.sessions.will_due_ids(now) {
            self.fire_will(&client_id, now);
        }

        // Offline sessions past their expiry; a still-pending will fires
        // when the session ends.
        for client_id in self.sessions.expired_ids(now) {
            self.fire_will(&client_id, now);
            self.destroy_session(&client_id, now);
        }

        self.retained.prune_expired(now);
        for session in self.sessions.iter_mut() {
            session.prune_expired_messages(now);
        }
    }

    /// Close every connection with ServerShuttingDown.
    pub fn shutdown(&mut self) {
        let now = Instant::now();
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close_connection(
                token,
                CloseIntent {
                    send: Some(ReasonCode::ServerShuttingDown),
                    discard_will: false,
                },
                now,
            );
        }
    }
}
