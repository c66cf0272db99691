//! Socket client transport (TCP and UDP)
//!
//! # Connection Lifecycle
//!
//! ```text
//! Unconnected --connect()--> Connected --disconnect()--> Unconnected
//!                                 |
//!                                 +-- peer closed / reset (TCP only) --> Unconnected
//! ```
//!
//! - **TCP**: `connect` performs a blocking connect to `host:port`.
//! - **UDP**: `connect` only allocates a datagram socket; every send goes to
//!   `host:port` and no reply is expected.
//!
//! # Framing
//!
//! Messages are written without a delimiter. A receive performs one bounded
//! read of at most `buffer_size` bytes and decodes it as one JSON document,
//! so each peer write must arrive as a single read. This holds for UDP and
//! for small TCP messages on a quiet link; it is not guaranteed for TCP in
//! general.

use super::{Protocol, Transport, read_timeout, resolve};
use crate::config::SocketConfig;
use crate::error::{Error, Result};
use crate::message::{self, Message};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::time::Duration;

/// Open client socket
enum ClientSocket {
    Tcp(TcpStream),
    Udp { socket: UdpSocket, peer: SocketAddr },
}

/// Socket client transport for TCP and UDP
pub struct SocketTransport {
    config: SocketConfig,
    socket: Option<ClientSocket>,
    connected: bool,
    /// Reusable receive buffer (`buffer_size` bytes)
    recv_buffer: Vec<u8>,
    log_target: String,
}

impl SocketTransport {
    /// Create an unconnected client
    ///
    /// Fails immediately on invalid parameters; no I/O happens here.
    pub fn new(config: SocketConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            recv_buffer: vec![0; config.buffer_size],
            config,
            socket: None,
            connected: false,
            log_target: module_path!().to_string(),
        })
    }

    /// Route this instance's log records to `target`
    pub fn with_log_target(mut self, target: impl Into<String>) -> Self {
        self.log_target = target.into();
        self
    }

    /// Configuration this transport was built from
    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    /// TCP or UDP
    pub fn protocol(&self) -> Protocol {
        self.config.protocol
    }

    /// Local address of the open socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.socket.as_ref()? {
            ClientSocket::Tcp(stream) => stream.local_addr().ok(),
            ClientSocket::Udp { socket, .. } => socket.local_addr().ok(),
        }
    }

    fn open(&self) -> Result<ClientSocket> {
        let peer = resolve(&self.config.host, self.config.port)?;
        match self.config.protocol {
            Protocol::Tcp => {
                let stream = TcpStream::connect(peer)?;
                // Teleop commands are tiny; don't let Nagle merge them
                if let Err(e) = stream.set_nodelay(true) {
                    log::warn!(
                        target: self.log_target.as_str(),
                        "Failed to set TCP_NODELAY: {}",
                        e
                    );
                }
                Ok(ClientSocket::Tcp(stream))
            }
            Protocol::Udp => {
                let bind_addr = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
                let socket = UdpSocket::bind(bind_addr)?;
                Ok(ClientSocket::Udp { socket, peer })
            }
        }
    }

    fn write_message(&mut self, message: &Message) -> Result<usize> {
        let bytes = message::encode(message)?;
        match self.socket.as_mut().ok_or(Error::NotConnected)? {
            ClientSocket::Tcp(stream) => {
                stream.write_all(&bytes)?;
                stream.flush()?;
            }
            ClientSocket::Udp { socket, peer } => {
                let sent = socket.send_to(&bytes, *peer)?;
                if sent != bytes.len() {
                    return Err(Error::Other(format!(
                        "datagram truncated: sent {} of {} bytes",
                        sent,
                        bytes.len()
                    )));
                }
            }
        }
        Ok(bytes.len())
    }

    /// One bounded read; `Ok(None)` on timeout
    fn read_payload(&mut self, timeout: Duration) -> Result<Option<usize>> {
        let timeout = Some(read_timeout(timeout));
        let result = match self.socket.as_mut().ok_or(Error::NotConnected)? {
            ClientSocket::Tcp(stream) => {
                stream.set_read_timeout(timeout)?;
                match stream.read(&mut self.recv_buffer) {
                    Ok(0) => return Err(Error::Disconnected),
                    other => other,
                }
            }
            ClientSocket::Udp { socket, .. } => {
                socket.set_read_timeout(timeout)?;
                socket.recv_from(&mut self.recv_buffer).map(|(n, from)| {
                    log::trace!(
                        target: self.log_target.as_str(),
                        "Datagram of {} bytes from {}",
                        n,
                        from
                    );
                    n
                })
            }
        };

        match result {
            Ok(n) => Ok(Some(n)),
            Err(e) => {
                let err = Error::Io(e);
                if err.is_timeout() { Ok(None) } else { Err(err) }
            }
        }
    }

    /// Drop the stream after the peer went away (TCP only)
    fn mark_connection_lost(&mut self) {
        if matches!(self.socket, Some(ClientSocket::Tcp(_))) {
            self.socket = None;
            self.connected = false;
            log::info!(
                target: self.log_target.as_str(),
                "TCP connection to {}:{} lost",
                self.config.host,
                self.config.port
            );
        }
    }
}

impl Transport for SocketTransport {
    fn connect(&mut self) -> bool {
        if self.connected {
            log::warn!(target: self.log_target.as_str(), "Already connected, ignoring connect()");
            return true;
        }

        match self.open() {
            Ok(socket) => {
                match &socket {
                    ClientSocket::Tcp(_) => log::info!(
                        target: self.log_target.as_str(),
                        "TCP connected to {}:{}",
                        self.config.host,
                        self.config.port
                    ),
                    ClientSocket::Udp { peer, .. } => log::info!(
                        target: self.log_target.as_str(),
                        "UDP socket ready for {}",
                        peer
                    ),
                }
                self.socket = Some(socket);
                self.connected = true;
                true
            }
            Err(e) => {
                log::error!(
                    target: self.log_target.as_str(),
                    "{} connect to {}:{} failed: {}",
                    self.config.protocol,
                    self.config.host,
                    self.config.port,
                    e
                );
                self.socket = None;
                self.connected = false;
                false
            }
        }
    }

    fn disconnect(&mut self) -> bool {
        if self.socket.take().is_some() {
            log::info!(target: self.log_target.as_str(), "Socket closed");
        }
        self.connected = false;
        true
    }

    fn send_command(&mut self, message: &Message) -> bool {
        if !self.connected {
            log::error!(target: self.log_target.as_str(), "Not connected, cannot send command");
            return false;
        }

        match self.write_message(message) {
            Ok(n) => {
                log::debug!(target: self.log_target.as_str(), "Sent {} bytes: {:?}", n, message);
                true
            }
            Err(e) => {
                log::error!(target: self.log_target.as_str(), "Failed to send command: {}", e);
                if e.is_connection_lost() {
                    self.mark_connection_lost();
                }
                false
            }
        }
    }

    fn receive_data(&mut self, timeout: Duration) -> Option<Message> {
        if !self.connected {
            log::error!(target: self.log_target.as_str(), "Not connected, cannot receive data");
            return None;
        }

        match self.read_payload(timeout) {
            Ok(Some(n)) => match message::decode(&self.recv_buffer[..n]) {
                Ok(msg) => {
                    log::debug!(target: self.log_target.as_str(), "Received: {:?}", msg);
                    Some(msg)
                }
                Err(e) => {
                    log::error!(
                        target: self.log_target.as_str(),
                        "Discarding malformed payload ({} bytes): {}",
                        n,
                        e
                    );
                    None
                }
            },
            Ok(None) => {
                log::debug!(
                    target: self.log_target.as_str(),
                    "Receive timed out after {:?}",
                    timeout
                );
                None
            }
            Err(e) if e.is_connection_lost() => {
                log::debug!(target: self.log_target.as_str(), "Receive failed: {}", e);
                self.mark_connection_lost();
                None
            }
            Err(e) => {
                log::error!(target: self.log_target.as_str(), "Failed to receive data: {}", e);
                None
            }
        }
    }

    fn check_connection(&self) -> bool {
        self.connected
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        if self.connected {
            self.disconnect();
        }
    }
}
