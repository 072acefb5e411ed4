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
#![allow(dead_code)]

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use mqtt_broker_mio::auth_impl::Authenticator;
use mqtt_broker_mio::config::BrokerConfig;
use mqtt_broker_mio::packet::property::Property;
use mqtt_broker_mio::packet::{
    self, Connack, Connect, Packet, Qos, RetainHandling, Suback, SubscriptionOptions, Will,
};
use mqtt_broker_mio::server::Server;
use mqtt_broker_mio::storage::{NoopStorage, SessionStorage};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// In-process broker bound to an ephemeral port, run on a background thread.
pub struct TestBroker {
    pub addr: SocketAddr,
    pub cluster_addr: Option<SocketAddr>,
}

impl TestBroker {
    pub fn start() -> Self {
        Self::start_with(BrokerConfig::default())
    }

    pub fn start_with(config: BrokerConfig) -> Self {
        Self::start_with_auth(config, None)
    }

    pub fn start_with_auth(
        config: BrokerConfig,
        authenticator: Option<Box<dyn Authenticator + Send>>,
    ) -> Self {
        Self::start_custom(config, authenticator, Box::new(NoopStorage))
    }

    /// A broker backed by the given persistence boundary.
    pub fn start_with_storage(config: BrokerConfig, storage: Box<dyn SessionStorage>) -> Self {
        Self::start_custom(config, None, storage)
    }

    fn start_custom(
        mut config: BrokerConfig,
        authenticator: Option<Box<dyn Authenticator + Send>>,
        storage: Box<dyn SessionStorage>,
    ) -> Self {
        config.bind_host = "127.0.0.1".to_string();
        config.bind_port = 0;
        // Short tick keeps deadline-driven tests fast.
        config.select_tick = Duration::from_millis(20);
        let mut server = Server::bind(config, authenticator, storage).expect("bind broker");
        let addr = server.local_addr();
        let cluster_addr = server.cluster_addr();
        std::thread::spawn(move || {
            let _ = server.run();
        });
        Self { addr, cluster_addr }
    }

    /// A broker whose cluster plane dials the given peer at startup.
    pub fn start_clustered(peer: Option<SocketAddr>) -> Self {
        let config = BrokerConfig {
            cluster: Some(mqtt_broker_mio::config::ClusterSettings {
                bind_port: 0,
                peers: peer.iter().map(|a| a.to_string()).collect(),
            }),
            ..BrokerConfig::default()
        };
        Self::start_with(config)
    }
}

/// Raw MQTT v5 client speaking through the crate's own codec.
pub struct TestClient {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl TestClient {
    pub fn connect_tcp(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect to broker");
        stream.set_nodelay(true).expect("set nodelay");
        stream
            .set_read_timeout(Some(Duration::from_millis(50)))
            .expect("set read timeout");
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    pub fn send(&mut self, packet: &Packet) {
        self.stream
            .write_all(&packet.encode())
            .expect("write packet");
    }

    /// Write raw bytes, bypassing the codec (malformed-input tests).
    pub fn raw_write(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("write bytes");
    }

    /// Blocking receive with a deadline; panics when nothing arrives.
    pub fn recv(&mut self) -> Packet {
        self.try_recv(RECV_TIMEOUT)
            .expect("timed out waiting for packet")
    }

    /// Receive one packet within the timeout, or None.
    pub fn try_recv(&mut self, timeout: Duration) -> Option<Packet> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(header) = packet::peek_frame(&self.buf).expect("well-formed header") {
                let total = header.header_len + header.body_len;
                if self.buf.len() >= total {
                    let frame: Vec<u8> = self.buf.drain(..total).collect();
                    let packet = Packet::decode(header.first_byte, &frame[header.header_len..])
                        .expect("well-formed packet");
                    return Some(packet);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) => return None,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
                Err(e) => panic!("read failed: {e}"),
            }
        }
    }

    /// True once the broker has closed the socket and all buffered frames
    /// are drained.
    pub fn expect_close(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk) {
                Ok(0) => return true,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                }
                Err(_) => return true,
            }
        }
    }

    pub fn mqtt_connect(&mut self, client_id: &str, clean_start: bool) -> Connack {
        self.mqtt_connect_with(Connect {
            clean_start,
            keep_alive: 60,
            client_id: client_id.to_string(),
            will: None,
            username: None,
            password: None,
            properties: Vec::new(),
        })
    }

    pub fn mqtt_connect_session(
        &mut self,
        client_id: &str,
        clean_start: bool,
        session_expiry: u32,
    ) -> Connack {
        self.mqtt_connect_with(Connect {
            clean_start,
            keep_alive: 60,
            client_id: client_id.to_string(),
            will: None,
            username: None,
            password: None,
            properties: vec![Property::SessionExpiryInterval(session_expiry)],
        })
    }

    pub fn mqtt_connect_with(&mut self, connect: Connect) -> Connack {
        self.send(&Packet::Connect(connect));
        match self.recv() {
            Packet::Connack(connack) => connack,
            other => panic!("expected CONNACK, got {other:?}"),
        }
    }

    pub fn subscribe(&mut self, filter: &str, qos: Qos) -> Suback {
        self.subscribe_opts(
            filter,
            SubscriptionOptions {
                qos,
                ..SubscriptionOptions::default()
            },
        )
    }

    pub fn subscribe_opts(&mut self, filter: &str, options: SubscriptionOptions) -> Suback {
        self.send(&Packet::Subscribe(packet::Subscribe {
            packet_id: 1,
            properties: Vec::new(),
            filters: vec![(filter.to_string(), options)],
        }));
        match self.recv() {
            Packet::Suback(suback) => suback,
            other => panic!("expected SUBACK, got {other:?}"),
        }
    }

    pub fn publish_qos0(&mut self, topic: &str, payload: &[u8], retain: bool) {
        self.send(&Packet::Publish(packet::Publish {
            dup: false,
            qos: Qos::AtMostOnce,
            retain,
            topic: topic.to_string(),
            packet_id: None,
            properties: Vec::new(),
            payload: bytes::Bytes::copy_from_slice(payload),
        }));
    }

    /// QoS1 publish that waits for the PUBACK and returns it.
    pub fn publish_qos1(&mut self, topic: &str, payload: &[u8], packet_id: u16) -> packet::PubResp {
        self.send(&Packet::Publish(packet::Publish {
            dup: false,
            qos: Qos::AtLeastOnce,
            retain: false,
            topic: topic.to_string(),
            packet_id: Some(packet_id),
            properties: Vec::new(),
            payload: bytes::Bytes::copy_from_slice(payload),
        }));
        match self.recv() {
            Packet::Puback(resp) => resp,
            other => panic!("expected PUBACK, got {other:?}"),
        }
    }

    /// QoS1 publish without waiting for the acknowledgment.
    pub fn publish_qos1_no_wait(&mut self, topic: &str, payload: &[u8], packet_id: u16) {
        self.send(&Packet::Publish(packet::Publish {
            dup: false,
            qos: Qos::AtLeastOnce,
            retain: false,
            topic: topic.to_string(),
            packet_id: Some(packet_id),
            properties: Vec::new(),
            payload: bytes::Bytes::copy_from_slice(payload),
        }));
    }

    /// Receive a PUBLISH, acknowledging QoS1 automatically.
    pub fn recv_publish(&mut self) -> packet::Publish {
        match self.recv() {
            Packet::Publish(publish) => {
                if publish.qos == Qos::AtLeastOnce {
                    let pid = publish.packet_id.expect("QoS1 carries a packet id");
                    self.send(&Packet::Puback(packet::PubResp::new(
                        pid,
                        mqtt_broker_mio::ReasonCode::Success,
                    )));
                }
                publish
            }
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    }
}

/// Subscription options with retain-handling set.
pub fn opts_with_retain_handling(qos: Qos, retain_handling: RetainHandling) -> SubscriptionOptions {
    SubscriptionOptions {
        qos,
        retain_handling,
        ..SubscriptionOptions::default()
    }
}

/// A CONNECT carrying a will message.
pub fn connect_with_will(
    client_id: &str,
    topic: &str,
    payload: &[u8],
    delay: Option<u32>,
) -> Connect {
    let properties = delay
        .map(|d| vec![Property::WillDelayInterval(d)])
        .unwrap_or_default();
    Connect {
        clean_start: true,
        keep_alive: 60,
        client_id: client_id.to_string(),
        will: Some(Will {
            topic: topic.to_string(),
            payload: bytes::Bytes::copy_from_slice(payload),
            qos: Qos::AtMostOnce,
            retain: false,
            properties,
        }),
        username: None,
        password: None,
        properties: Vec::new(),
    }
}
