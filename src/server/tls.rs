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

//! TLS variant of the socket wrapper. The handshake happens transparently
//! inside `read`/`write`; once complete the stream offers the same readiness
//! contract as a plain socket.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::sync::Arc;

use mio::net::TcpStream;
use rustls::{ServerConfig, ServerConnection};

/// Load TLS configuration for the broker
pub fn load_tls_config(cert_path: &str, key_path: &str) -> anyhow::Result<Arc<ServerConfig>> {
    let cert_file = File::open(cert_path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file '{}': {}", cert_path, e))?;
    let mut cert_reader = BufReader::new(cert_file);
    let cert_chain: Vec<rustls::Certificate> = rustls_pemfile::certs(&mut cert_reader)?
        .into_iter()
        .map(rustls::Certificate)
        .collect();

    let key_file = File::open(key_path)
        .map_err(|e| anyhow::anyhow!("Failed to open private key file '{}': {}", key_path, e))?;
    let mut key_reader = BufReader::new(key_file);

    // Try PKCS8 first, then PKCS1
    let private_keys = rustls_pemfile::pkcs8_private_keys(&mut key_reader)?;
    let private_key = if private_keys.is_empty() {
        // Reset reader and try PKCS1
        key_reader = BufReader::new(File::open(key_path)?);
        let rsa_keys = rustls_pemfile::rsa_private_keys(&mut key_reader)?;
        if rsa_keys.is_empty() {
            return Err(anyhow::anyhow!(
                "No private keys found in '{}' (tried PKCS8 and PKCS1)",
                key_path
            ));
        }
        rustls::PrivateKey(rsa_keys[0].clone())
    } else {
        rustls::PrivateKey(private_keys[0].clone())
    };

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| anyhow::anyhow!("Invalid certificate/key pair: {}", e))?;

    Ok(Arc::new(config))
}

/// Server-side TLS stream over a non-blocking socket.
pub struct TlsStream {
    sock: TcpStream,
    conn: ServerConnection,
}

impl TlsStream {
    pub fn new(sock: TcpStream, config: Arc<ServerConfig>) -> io::Result<Self> {
        let conn = ServerConnection::new(config)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        Ok(Self { sock, conn })
    }

    pub fn socket_mut(&mut self) -> &mut TcpStream {
        &mut self.sock
    }

    /// Ciphertext (handshake included) waiting to go out.
    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Move buffered ciphertext to the socket until it would block.
    fn write_ciphertext(&mut self) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.sock) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // Pull ciphertext from the socket into the TLS state machine.
            let mut made_progress = false;
            if self.conn.wants_read() {
                match self.conn.read_tls(&mut self.sock) {
                    Ok(0) => return Ok(0),
                    Ok(_) => {
                        self.conn.process_new_packets().map_err(|e| {
                            io::Error::new(io::ErrorKind::InvalidData, e)
                        })?;
                        made_progress = true;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
            }

            // Handshake responses cannot wait for write readiness.
            self.write_ciphertext()?;

            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !made_progress {
                        return Err(io::Error::from(io::ErrorKind::WouldBlock));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.conn.writer().write(buf)?;
        self.write_ciphertext()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.write_ciphertext()?;
        self.sock.flush()
    }
}
