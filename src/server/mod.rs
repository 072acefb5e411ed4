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

//! Non-blocking acceptor plus readiness multiplexer. The run loop blocks up
//! to the select tick waiting for readiness, dispatches each ready
//! attachment, then asks the broker core for time-based cleanup. The
//! selector never does protocol work itself.

pub mod tls;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use tracing::{error, info, trace, warn};

use crate::auth_impl::Authenticator;
use crate::broker::Broker;
use crate::cluster::{ClusterDiscovery, StaticDiscovery};
use crate::config::BrokerConfig;
use crate::storage::SessionStorage;

/// Client acceptor attachment.
const LISTENER: Token = Token(0);
/// Cluster peer acceptor attachment.
const CLUSTER_LISTENER: Token = Token(1);

const POLL_EVENTS_SIZE: usize = 1024;

/// The broker server: one thread owning selector, codec and all broker
/// state.
pub struct Server {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    cluster_listener: Option<TcpListener>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    broker: Broker,
    local_addr: SocketAddr,
    cluster_addr: Option<SocketAddr>,
}

impl Server {
    /// Bind listeners and assemble the broker core. The TLS variant replaces
    /// the raw socket wrapper and is otherwise identical in contract.
    pub fn bind(
        config: BrokerConfig,
        authenticator: Option<Box<dyn Authenticator + Send>>,
        storage: Box<dyn SessionStorage>,
    ) -> anyhow::Result<Self> {
        let poll = Poll::new()?;

        let addr: SocketAddr = format!("{}:{}", config.bind_host, config.bind_port).parse()?;
        let mut listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let tls_config = match config.tls {
            Some(ref settings) => Some(tls::load_tls_config(
                &settings.cert_path,
                &settings.key_path,
            )?),
            None => None,
        };

        let cluster_listener = match config.cluster {
            Some(ref cluster) => {
                let addr: SocketAddr =
                    format!("{}:{}", config.bind_host, cluster.bind_port).parse()?;
                let mut listener = TcpListener::bind(addr)?;
                poll.registry()
                    .register(&mut listener, CLUSTER_LISTENER, Interest::READABLE)?;
                info!("cluster listener on {}", listener.local_addr()?);
                Some(listener)
            }
            None => None,
        };
        let cluster_addr = match cluster_listener {
            Some(ref listener) => Some(listener.local_addr()?),
            None => None,
        };

        let seed_peers: Vec<String> = config
            .cluster
            .as_ref()
            .map(|c| c.peers.clone())
            .unwrap_or_default();

        let mut broker = Broker::new(config, poll.registry().try_clone()?, authenticator, storage);

        let seed_addrs: Vec<SocketAddr> = seed_peers
            .iter()
            .filter_map(|peer| match peer.parse() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!("invalid seed peer address '{peer}': {e}");
                    None
                }
            })
            .collect();
        let mut discovery = StaticDiscovery::new(seed_addrs);
        Self::dial_discovered(&mut broker, &mut discovery);

        info!(
            "listening on {local_addr} ({})",
            if tls_config.is_some() { "tls" } else { "tcp" }
        );

        Ok(Self {
            poll,
            events: Events::with_capacity(POLL_EVENTS_SIZE),
            listener,
            cluster_listener,
            tls_config,
            broker,
            local_addr,
            cluster_addr,
        })
    }

    /// Address the client listener is bound to (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address of the cluster listener, when the cluster plane is enabled.
    pub fn cluster_addr(&self) -> Option<SocketAddr> {
        self.cluster_addr
    }

    /// Dial a peer broker and hand the socket to the selector.
    pub fn add_cluster_connection(&mut self, addr: SocketAddr) -> anyhow::Result<()> {
        self.broker.add_cluster_connection(addr)
    }

    /// Dial every address a discovery source yields.
    pub fn run_discovery(&mut self, discovery: &mut dyn ClusterDiscovery) {
        Self::dial_discovered(&mut self.broker, discovery);
    }

    fn dial_discovered(broker: &mut Broker, discovery: &mut dyn ClusterDiscovery) {
        for addr in discovery.discover() {
            if let Err(e) = broker.add_cluster_connection(addr) {
                warn!("failed to dial discovered peer {addr}: {e}");
            }
        }
    }

    /// Run until the process is stopped.
    pub fn run(&mut self) -> anyhow::Result<()> {
        loop {
            self.run_once()?;
        }
    }

    /// One pass: block up to the select tick, dispatch ready attachments,
    /// then run the broker's cleanup work. A handler error never propagates
    /// past its dispatch site.
    pub fn run_once(&mut self) -> anyhow::Result<()> {
        let timeout = self.broker.select_tick();
        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e.into());
        }

        for event in self.events.iter() {
            match event.token() {
                LISTENER => loop {
                    match self.listener.accept() {
                        Ok((stream, addr)) => {
                            trace!("accepted client connection from {addr}");
                            self.broker.accept_client(stream, self.tls_config.clone());
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            error!("accept failed: {e}");
                            break;
                        }
                    }
                },
                CLUSTER_LISTENER => {
                    if let Some(ref mut cluster_listener) = self.cluster_listener {
                        loop {
                            match cluster_listener.accept() {
                                Ok((stream, addr)) => {
                                    trace!("accepted cluster connection from {addr}");
                                    self.broker.accept_peer(stream);
                                }
                                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                                Err(e) => {
                                    error!("cluster accept failed: {e}");
                                    break;
                                }
                            }
                        }
                    }
                }
                token => {
                    self.broker
                        .socket_ready(token, event.is_readable(), event.is_writable());
                }
            }
        }

        self.broker.cleanup_operations(Instant::now());
        Ok(())
    }

    /// Close every connection with ServerShuttingDown and release sockets.
    pub fn shutdown(&mut self) {
        self.broker.shutdown();
        let _ = self.poll.registry().deregister(&mut self.listener);
        if let Some(ref mut cluster_listener) = self.cluster_listener {
            let _ = self.poll.registry().deregister(cluster_listener);
        }
    }
}
