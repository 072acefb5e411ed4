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

//! Per-socket event handler: read/write buffers, frame cursor over the read
//! buffer, partially-drained outbound queue, and the per-connection protocol
//! state machine fields.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::{debug, trace};

use crate::error::{MqttError, Result};
use crate::packet::{self, Connect, Packet};
use crate::reason_code::ReasonCode;
use crate::server::tls::TlsStream;

const READ_CHUNK: usize = 4096;

/// Protocol state of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for CONNECT within the connect timeout; anything else is a
    /// protocol violation.
    AwaitingConnect,
    Connected,
    /// DISCONNECT enqueued; close once the write buffer drains.
    Disconnecting,
}

/// Socket wrapper: plain TCP or rustls over the same readiness contract.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream>),
}

impl Transport {
    /// The mio-registerable socket.
    pub fn source(&mut self) -> &mut TcpStream {
        match self {
            Transport::Plain(sock) => sock,
            Transport::Tls(tls) => tls.socket_mut(),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(sock) => sock.read(buf),
            Transport::Tls(tls) => tls.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(sock) => sock.write(buf),
            Transport::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(sock) => sock.flush(),
            Transport::Tls(tls) => tls.flush(),
        }
    }

    /// Bytes parked inside the TLS layer (handshake or ciphertext).
    fn wants_write(&self) -> bool {
        match self {
            Transport::Plain(_) => false,
            Transport::Tls(tls) => tls.wants_write(),
        }
    }
}

/// One connection owned by the broker core and driven by the selector.
pub struct Connection {
    transport: Transport,
    pub token: Token,
    read_buf: BytesMut,
    write_buf: BytesMut,
    registered: Option<Interest>,
    pub state: ConnState,
    /// Set once CONNECT is admitted.
    pub client_id: Option<String>,
    /// Authenticated username for authorization checks.
    pub username: Option<String>,
    /// CONNECT parked while an AUTH exchange is outstanding.
    pub pending_connect: Option<Box<Connect>>,
    pub auth_method: Option<String>,
    /// CONNECT must arrive before this deadline.
    pub connect_deadline: Instant,
    /// Negotiated keep-alive; zero disables the timeout.
    pub keep_alive: Duration,
    pub keep_alive_deadline: Option<Instant>,
    /// Client-to-server topic alias bindings.
    pub alias_in: HashMap<u16, String>,
    /// Server-to-client alias assignments (topic -> alias).
    pub alias_out: HashMap<String, u16>,
    pub alias_out_next: u16,
    /// Client's advertised TopicAliasMaximum for the outbound direction.
    pub client_alias_maximum: u16,
    /// Client's advertised MaximumPacketSize for the outbound direction.
    pub max_packet_size_out: Option<u32>,
    /// Broker's inbound packet size limit.
    max_packet_size_in: Option<u32>,
}

impl Connection {
    pub fn new(
        transport: Transport,
        token: Token,
        now: Instant,
        connect_timeout: Duration,
        max_packet_size_in: Option<u32>,
    ) -> Self {
        Self {
            transport,
            token,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            registered: None,
            state: ConnState::AwaitingConnect,
            client_id: None,
            username: None,
            pending_connect: None,
            auth_method: None,
            connect_deadline: now + connect_timeout,
            keep_alive: Duration::ZERO,
            keep_alive_deadline: None,
            alias_in: HashMap::new(),
            alias_out: HashMap::new(),
            alias_out_next: 1,
            client_alias_maximum: 0,
            max_packet_size_out: None,
            max_packet_size_in,
        }
    }

    /// Pull everything the socket has into the read buffer. Returns true on
    /// end-of-stream.
    pub fn fill(&mut self) -> Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.transport.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(MqttError::Transport(e)),
            }
        }
    }

    /// Next fully-framed packet from the read buffer, or None when fewer
    /// bytes than a frame are buffered. Call repeatedly to drain all frames
    /// buffered by one readiness event.
    pub fn read(&mut self) -> Result<Option<Packet>> {
        let Some(header) = packet::peek_frame(&self.read_buf)? else {
            return Ok(None);
        };
        let total = header.header_len + header.body_len;
        if let Some(limit) = self.max_packet_size_in {
            if total as u64 > u64::from(limit) {
                return Err(MqttError::Resource(ReasonCode::PacketTooLarge));
            }
        }
        if self.read_buf.len() < total {
            return Ok(None);
        }
        let frame = self.read_buf.split_to(total);
        let packet = Packet::decode(header.first_byte, &frame[header.header_len..])?;
        trace!(
            "received {:?} ({} bytes) on {:?}",
            packet.packet_type(),
            total,
            self.token
        );
        Ok(Some(packet))
    }

    /// Raw read buffer, for attachments that frame differently (cluster
    /// peers).
    pub fn read_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    /// Queue an encoded packet. Returns false when the client's maximum
    /// packet size forbids sending it; the caller decides what dropping
    /// means for the delivery guarantee.
    pub fn enqueue(&mut self, packet: &Packet) -> bool {
        let bytes = packet.encode();
        if let Some(limit) = self.max_packet_size_out {
            if bytes.len() as u64 > u64::from(limit) {
                debug!(
                    "dropping {:?} for {:?}: {} bytes exceeds client maximum {}",
                    packet.packet_type(),
                    self.token,
                    bytes.len(),
                    limit
                );
                return false;
            }
        }
        self.write_buf.extend_from_slice(&bytes);
        true
    }

    /// Queue pre-encoded bytes (cluster peer frames).
    pub fn enqueue_bytes(&mut self, bytes: &[u8]) {
        self.write_buf.extend_from_slice(bytes);
    }

    /// Flush bytes left over from prior partial writes. Idempotent.
    pub fn send_remaining(&mut self) -> Result<()> {
        while !self.write_buf.is_empty() {
            match self.transport.write(&self.write_buf) {
                Ok(0) => {
                    return Err(MqttError::Transport(io::Error::from(
                        io::ErrorKind::WriteZero,
                    )))
                }
                Ok(n) => {
                    self.write_buf.advance(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(MqttError::Transport(e)),
            }
        }
        match self.transport.flush() {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(MqttError::Transport(e)),
        }
    }

    pub fn wants_write(&self) -> bool {
        !self.write_buf.is_empty() || self.transport.wants_write()
    }

    /// Write buffer fully drained (close-after-drain check).
    pub fn drained(&self) -> bool {
        !self.wants_write()
    }

    /// Record the negotiated keep-alive and start its clock.
    pub fn set_keep_alive(&mut self, secs: u16, now: Instant) {
        self.keep_alive = Duration::from_secs(u64::from(secs));
        self.touch(now);
    }

    /// Refresh the keep-alive deadline; missing it for 1.5x the negotiated
    /// value closes the connection.
    pub fn touch(&mut self, now: Instant) {
        if self.keep_alive.is_zero() {
            self.keep_alive_deadline = None;
        } else {
            self.keep_alive_deadline = Some(now + self.keep_alive * 3 / 2);
        }
    }

    /// Register with the selector, or update interest to match the write
    /// buffer state.
    pub fn sync_interest(&mut self, registry: &Registry) -> Result<()> {
        let interest = if self.wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let token = self.token;
        match self.registered {
            None => {
                registry.register(self.transport.source(), token, interest)?;
                self.registered = Some(interest);
            }
            Some(current) if current != interest => {
                registry.reregister(self.transport.source(), token, interest)?;
                self.registered = Some(interest);
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Remove from the selector before dropping the socket.
    pub fn deregister(&mut self, registry: &Registry) {
        if self.registered.take().is_some() {
            let _ = registry.deregister(self.transport.source());
        }
    }
}
