/**
 * MIT License
 *
 * Copyright (c) 2025 Takatoshi Kondo
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in all
 * copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
 * SOFTWARE.
 */
use clap::Parser;
use tracing::info;

use mqtt_broker_mio::auth_impl::{Authenticator, Security};
use mqtt_broker_mio::config::{
    BrokerConfig, ClusterSettings, TlsSettings, DEFAULT_PLAIN_PORT, DEFAULT_TLS_PORT,
};
use mqtt_broker_mio::packet::Qos;
use mqtt_broker_mio::server::Server;
use mqtt_broker_mio::storage::{DirStorage, NoopStorage, SessionStorage};
use mqtt_broker_mio::tracing_setup::{self, LogTarget};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "mqtt-broker")]
#[command(about = "Single-threaded MQTT v5 broker with readiness selection")]
struct Args {
    /// Log level
    #[arg(long, default_value = "info")]
    #[arg(value_parser = ["error", "warn", "info", "debug", "trace"])]
    log_level: String,

    /// Bind host
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Listener port (defaults to 1883, or 8883 with TLS)
    #[arg(long)]
    port: Option<u16>,

    /// Path to server certificate file (enables TLS together with server_key)
    #[arg(long)]
    server_crt: Option<String>,

    /// Path to server private key file
    #[arg(long)]
    server_key: Option<String>,

    /// Path to JSON authentication/authorization config
    #[arg(long)]
    auth_config: Option<String>,

    /// Directory for offline session snapshots
    #[arg(long)]
    session_dir: Option<String>,

    /// Selector tick in milliseconds
    #[arg(long, default_value_t = 250)]
    tick_ms: u64,

    /// CONNECT timeout in milliseconds
    #[arg(long, default_value_t = 30_000)]
    connect_timeout_ms: u64,

    /// Highest QoS granted to clients (0, 1 or 2)
    #[arg(long, default_value_t = 2)]
    maximum_qos: u8,

    /// Highest inbound topic alias accepted (0 disables aliases)
    #[arg(long, default_value_t = 0)]
    topic_alias_maximum: u16,

    /// Disable retained messages
    #[arg(long)]
    no_retain: bool,

    /// Disable wildcard subscriptions
    #[arg(long)]
    no_wildcard: bool,

    /// Disable shared subscriptions
    #[arg(long)]
    no_shared: bool,

    /// Cluster listener port (enables the cluster plane)
    #[arg(long)]
    cluster_port: Option<u16>,

    /// Peer broker address to dial at startup (host:port, repeatable)
    #[arg(long)]
    cluster_peer: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Parse log level
    let log_level = match args.log_level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" => tracing::Level::WARN,
        "info" => tracing::Level::INFO,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => unreachable!(), // clap validates this
    };
    let _guard = tracing_setup::init_tracing(log_level, LogTarget::Stdout)?;

    let tls = match (args.server_crt, args.server_key) {
        (Some(cert_path), Some(key_path)) => Some(TlsSettings {
            cert_path,
            key_path,
        }),
        (None, None) => None,
        _ => {
            anyhow::bail!("TLS requires both --server-crt and --server-key");
        }
    };

    let bind_port = args.port.unwrap_or(if tls.is_some() {
        DEFAULT_TLS_PORT
    } else {
        DEFAULT_PLAIN_PORT
    });

    let config = BrokerConfig {
        bind_host: args.host,
        bind_port,
        tls,
        select_tick: std::time::Duration::from_millis(args.tick_ms),
        connect_timeout: std::time::Duration::from_millis(args.connect_timeout_ms),
        maximum_qos: Qos::try_from(args.maximum_qos)
            .map_err(|_| anyhow::anyhow!("--maximum-qos must be 0, 1 or 2"))?,
        retain_available: !args.no_retain,
        wildcard_subscription_available: !args.no_wildcard,
        shared_subscription_available: !args.no_shared,
        topic_alias_maximum: args.topic_alias_maximum,
        cluster: args.cluster_port.map(|bind_port| ClusterSettings {
            bind_port,
            peers: args.cluster_peer.clone(),
        }),
        ..BrokerConfig::default()
    };

    let authenticator: Option<Box<dyn Authenticator + Send>> = match args.auth_config {
        Some(ref path) => {
            info!("loading auth config from {path}");
            Some(Box::new(Security::from_file(path)?))
        }
        None => None,
    };

    let storage: Box<dyn SessionStorage> = match args.session_dir {
        Some(ref dir) => Box::new(DirStorage::new(dir)?),
        None => Box::new(NoopStorage),
    };

    let mut server = Server::bind(config, authenticator, storage)?;
    info!("broker started on {}", server.local_addr());
    server.run()
}
