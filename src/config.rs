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

use std::time::Duration;

use crate::packet::Qos;

pub const DEFAULT_PLAIN_PORT: u16 = 1883;
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// TLS listener settings; absent means plain TCP.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub cert_path: String,
    pub key_path: String,
}

/// Cluster plane settings; absent means the broker runs standalone.
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    /// Port peers dial into.
    pub bind_port: u16,
    /// Seed peer addresses dialed at startup.
    pub peers: Vec<String>,
}

/// Broker configuration. Defaults follow the protocol defaults: plain TCP on
/// 1883, a 250 ms selector tick, 30 s connect timeout, every optional
/// feature enabled.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind_host: String,
    pub bind_port: u16,
    pub tls: Option<TlsSettings>,
    /// Upper bound on a single `poll` call; bounds cleanup staleness.
    pub select_tick: Duration,
    /// CONNECT must arrive within this long of the TCP accept.
    pub connect_timeout: Duration,
    /// Cap applied to the client-requested session expiry. None = unbounded.
    pub maximum_session_expiry: Option<u32>,
    /// Most QoS>0 publishes the broker accepts in flight per client.
    pub receive_maximum: u16,
    pub maximum_qos: Qos,
    pub retain_available: bool,
    pub wildcard_subscription_available: bool,
    pub subscription_identifier_available: bool,
    pub shared_subscription_available: bool,
    /// Overrides the client keep-alive when set; advertised in CONNACK.
    pub server_keep_alive: Option<u16>,
    /// Highest inbound topic alias the broker accepts. 0 disables aliases.
    pub topic_alias_maximum: u16,
    /// Largest inbound packet accepted; advertised in CONNACK. None = unlimited.
    pub maximum_packet_size: Option<u32>,
    /// Assign outbound topic aliases when the client offers a table.
    pub auto_map_topic_alias: bool,
    pub authentication_method: Option<String>,
    pub cluster: Option<ClusterSettings>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            bind_port: DEFAULT_PLAIN_PORT,
            tls: None,
            select_tick: Duration::from_millis(250),
            connect_timeout: Duration::from_millis(30_000),
            maximum_session_expiry: None,
            receive_maximum: 65_535,
            maximum_qos: Qos::ExactlyOnce,
            retain_available: true,
            wildcard_subscription_available: true,
            subscription_identifier_available: true,
            shared_subscription_available: true,
            server_keep_alive: None,
            topic_alias_maximum: 0,
            maximum_packet_size: None,
            auto_map_topic_alias: false,
            authentication_method: None,
            cluster: None,
        }
    }
}
