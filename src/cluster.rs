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

//! Cluster plane: connections to peer brokers carrying two logical channels
//! over one TCP stream, a subscription-interest stream and a
//! forwarded-publish stream. Loops are prevented by tagging each forwarded
//! publish with its origin node id; a publish that entered from a peer is
//! never forwarded again.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::{Buf, Bytes, BytesMut};
use mio::net::TcpStream;
use mio::Token;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{MqttError, Result};
use crate::packet::property::{self, Property};
use crate::packet::wire::{Reader, Writer};
use crate::packet::Qos;
use crate::subscription_store::topic_matches_filter;

pub(crate) const MAGIC: &[u8; 4] = b"MQGB";
pub(crate) const PROTOCOL_VERSION: u16 = 1;
pub(crate) const MAX_FRAME_SIZE: usize = 1_048_576; // 1MB

/// Peer frame types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameType {
    Hello = 0x01,
    SubAdd = 0x02,
    SubRemove = 0x03,
    Forward = 0x04,
}

impl FrameType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::SubAdd),
            0x03 => Some(Self::SubRemove),
            0x04 => Some(Self::Forward),
            _ => None,
        }
    }
}

/// One frame on the peer protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerFrame {
    /// First frame in each direction: identifies the sending node.
    Hello { node_id: Uuid },
    /// Subscription interest added on the sending node.
    SubAdd { filter: String },
    /// Subscription interest removed on the sending node.
    SubRemove { filter: String },
    /// Application message forwarded for the receiving node's subscribers.
    Forward {
        origin: Uuid,
        topic: String,
        qos: Qos,
        retain: bool,
        properties: Vec<Property>,
        payload: Bytes,
    },
}

impl PeerFrame {
    /// Frame layout: magic + version on Hello only would complicate
    /// resynchronization, so every frame is `type:u8 len:u32 body`.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Writer::new();
        let frame_type = match self {
            PeerFrame::Hello { node_id } => {
                body.write_slice(MAGIC);
                body.write_u16(PROTOCOL_VERSION);
                body.write_slice(node_id.as_bytes());
                FrameType::Hello
            }
            PeerFrame::SubAdd { filter } => {
                body.write_string(filter);
                FrameType::SubAdd
            }
            PeerFrame::SubRemove { filter } => {
                body.write_string(filter);
                FrameType::SubRemove
            }
            PeerFrame::Forward {
                origin,
                topic,
                qos,
                retain,
                properties,
                payload,
            } => {
                body.write_slice(origin.as_bytes());
                body.write_string(topic);
                let mut bits = *qos as u8;
                if *retain {
                    bits |= 0x04;
                }
                body.write_u8(bits);
                property::encode_block(&mut body, properties);
                body.write_slice(payload);
                FrameType::Forward
            }
        };
        let body = body.into_inner();

        let mut out = Vec::with_capacity(5 + body.len());
        out.push(frame_type as u8);
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    fn decode(frame_type: FrameType, body: &[u8]) -> Result<PeerFrame> {
        let mut r = Reader::new(body);
        match frame_type {
            FrameType::Hello => {
                let magic = r.read_bytes(4)?;
                if magic != MAGIC {
                    return Err(MqttError::protocol());
                }
                let version = r.read_u16()?;
                if version != PROTOCOL_VERSION {
                    return Err(MqttError::protocol());
                }
                let node_id = Uuid::from_slice(r.read_bytes(16)?)
                    .map_err(|_| MqttError::malformed())?;
                Ok(PeerFrame::Hello { node_id })
            }
            FrameType::SubAdd => Ok(PeerFrame::SubAdd {
                filter: r.read_string()?,
            }),
            FrameType::SubRemove => Ok(PeerFrame::SubRemove {
                filter: r.read_string()?,
            }),
            FrameType::Forward => {
                let origin = Uuid::from_slice(r.read_bytes(16)?)
                    .map_err(|_| MqttError::malformed())?;
                let topic = r.read_string()?;
                let bits = r.read_u8()?;
                let qos = Qos::try_from(bits & 0x03)?;
                let retain = bits & 0x04 != 0;
                let properties = property::decode_block(&mut r, property::allowed::PUBLISH)?;
                let payload = Bytes::copy_from_slice(r.read_remaining());
                Ok(PeerFrame::Forward {
                    origin,
                    topic,
                    qos,
                    retain,
                    properties,
                    payload,
                })
            }
        }
    }
}

/// Split complete peer frames off the front of a read buffer.
pub fn take_frames(buf: &mut BytesMut) -> Result<Vec<PeerFrame>> {
    let mut frames = Vec::new();
    loop {
        if buf.len() < 5 {
            return Ok(frames);
        }
        let frame_type = FrameType::from_u8(buf[0]).ok_or_else(MqttError::protocol)?;
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(MqttError::Resource(
                crate::reason_code::ReasonCode::PacketTooLarge,
            ));
        }
        if buf.len() < 5 + len {
            return Ok(frames);
        }
        buf.advance(5);
        let body = buf.split_to(len);
        frames.push(PeerFrame::decode(frame_type, &body)?);
    }
}

/// State kept per peer broker connection.
#[derive(Debug)]
pub struct Peer {
    /// Identity learned from the peer's Hello; None until then.
    pub node_id: Option<Uuid>,
    /// Address we dialed, for outbound peers.
    pub addr: Option<SocketAddr>,
    /// Subscription filters the peer registered interest in.
    interest: Vec<String>,
}

impl Peer {
    fn new(addr: Option<SocketAddr>) -> Self {
        Self {
            node_id: None,
            addr,
            interest: Vec::new(),
        }
    }

    pub fn interested_in(&self, topic: &str) -> bool {
        self.interest
            .iter()
            .any(|filter| topic_matches_filter(filter, topic))
    }
}

/// Registry of peer broker connections, keyed by selector token.
#[derive(Debug)]
pub struct Cluster {
    node_id: Uuid,
    peers: HashMap<Token, Peer>,
}

impl Cluster {
    pub fn new(node_id: Uuid) -> Self {
        Self {
            node_id,
            peers: HashMap::new(),
        }
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn is_peer(&self, token: Token) -> bool {
        self.peers.contains_key(&token)
    }

    /// Track a new peer connection. The caller sends the Hello and the full
    /// local subscription replay.
    pub fn add_peer(&mut self, token: Token, addr: Option<SocketAddr>) {
        self.peers.insert(token, Peer::new(addr));
    }

    /// Forget a peer on I/O error or orderly close; its interest no longer
    /// participates in routing.
    pub fn remove_peer(&mut self, token: Token) -> Option<Peer> {
        let peer = self.peers.remove(&token);
        if let Some(ref peer) = peer {
            debug!("removed cluster peer {:?} (node {:?})", token, peer.node_id);
        }
        peer
    }

    /// Apply one frame from a peer. Returns a forwarded publish for local
    /// routing when the frame carries one.
    pub fn handle_frame(&mut self, token: Token, frame: PeerFrame) -> Result<Option<PeerFrame>> {
        let peer = self
            .peers
            .get_mut(&token)
            .ok_or_else(|| MqttError::Internal(format!("frame from unknown peer {token:?}")))?;

        match frame {
            PeerFrame::Hello { node_id } => {
                if node_id == self.node_id {
                    warn!("peer {token:?} announced our own node id; dropping");
                    return Err(MqttError::protocol());
                }
                trace!("peer {token:?} is node {node_id}");
                peer.node_id = Some(node_id);
                Ok(None)
            }
            PeerFrame::SubAdd { filter } => {
                if peer.node_id.is_none() {
                    return Err(MqttError::protocol());
                }
                if !peer.interest.contains(&filter) {
                    peer.interest.push(filter);
                }
                Ok(None)
            }
            PeerFrame::SubRemove { filter } => {
                if peer.node_id.is_none() {
                    return Err(MqttError::protocol());
                }
                peer.interest.retain(|f| f != &filter);
                Ok(None)
            }
            forward @ PeerFrame::Forward { .. } => {
                if peer.node_id.is_none() {
                    return Err(MqttError::protocol());
                }
                Ok(Some(forward))
            }
        }
    }

    /// Peers whose registered interest matches the topic.
    pub fn peers_interested(&self, topic: &str) -> Vec<Token> {
        self.peers
            .iter()
            .filter(|(_, peer)| peer.node_id.is_some() && peer.interested_in(topic))
            .map(|(token, _)| *token)
            .collect()
    }

    /// All peer tokens (interest propagation).
    pub fn peer_tokens(&self) -> Vec<Token> {
        self.peers.keys().copied().collect()
    }

    pub fn hello(&self) -> PeerFrame {
        PeerFrame::Hello {
            node_id: self.node_id,
        }
    }
}

/// Cluster node discovery boundary: yields addresses of peer brokers.
pub trait ClusterDiscovery {
    fn discover(&mut self) -> Vec<SocketAddr>;
}

/// Static seed list.
pub struct StaticDiscovery {
    addrs: Vec<SocketAddr>,
}

impl StaticDiscovery {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self { addrs }
    }
}

impl ClusterDiscovery for StaticDiscovery {
    fn discover(&mut self) -> Vec<SocketAddr> {
        std::mem::take(&mut self.addrs)
    }
}

/// Dial a peer broker; the selector owns the socket from here.
pub fn dial(addr: SocketAddr) -> std::io::Result<TcpStream> {
    TcpStream::connect(addr)
}
