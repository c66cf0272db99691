//! Socket server transport (single peer, TCP and UDP)
//!
//! # Connection Lifecycle
//!
//! ```text
//! TCP: bind (SO_REUSEADDR) -> listen(backlog 1) -> accept one client -> Connected
//! UDP: bind -> Connected (no peer until the first datagram arrives)
//! ```
//!
//! The TCP accept blocks until a client shows up unless an accept timeout
//! is configured. Only one client is served; this is not a multi-client
//! server.
//!
//! # Peer Tracking
//!
//! For UDP, every successful `receive_data` records the datagram's source
//! as the peer, and `send_command` replies to it. The last sender wins.

use super::{Protocol, Transport, read_timeout, resolve};
use crate::config::SocketConfig;
use crate::error::{Error, Result};
use crate::message::{self, Message};
use socket2::{Domain, Socket, Type};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::time::{Duration, Instant};

/// Poll interval while waiting for a client with an accept timeout
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// TCP listen backlog (single peer)
const LISTEN_BACKLOG: i32 = 1;

/// Open server-side sockets
enum ServerSocket {
    Tcp {
        // Held so the port stays bound while the client is served
        _listener: TcpListener,
        stream: TcpStream,
    },
    Udp(UdpSocket),
}

/// Socket server transport serving exactly one peer
pub struct SocketServerTransport {
    config: SocketConfig,
    socket: Option<ServerSocket>,
    /// Accepted TCP client, or last UDP sender
    peer: Option<SocketAddr>,
    connected: bool,
    recv_buffer: Vec<u8>,
    log_target: String,
}

impl SocketServerTransport {
    /// Create a server that has not bound anything yet
    pub fn new(config: SocketConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            recv_buffer: vec![0; config.buffer_size],
            config,
            socket: None,
            peer: None,
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

    /// Current peer: the accepted TCP client or the last UDP sender
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Bound local address
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.socket.as_ref()? {
            ServerSocket::Tcp { stream, .. } => stream.local_addr().ok(),
            ServerSocket::Udp(socket) => socket.local_addr().ok(),
        }
    }

    fn listen(&self, addr: SocketAddr) -> Result<TcpListener> {
        let socket = Socket::new(
            Domain::for_address(addr),
            Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        Ok(socket.into())
    }

    fn accept(&self, listener: &TcpListener) -> Result<(TcpStream, SocketAddr)> {
        let Some(timeout) = self.config.accept_timeout() else {
            return Ok(listener.accept()?);
        };
        // Too far out to represent: same as waiting forever
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Ok(listener.accept()?);
        };

        listener.set_nonblocking(true)?;
        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    // Accepted sockets may inherit non-blocking mode on some platforms
                    stream.set_nonblocking(false)?;
                    return Ok((stream, addr));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            format!("no client connected within {:?}", timeout),
                        )));
                    }
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn open(&mut self) -> Result<ServerSocket> {
        let addr = resolve(&self.config.host, self.config.port)?;
        match self.config.protocol {
            Protocol::Tcp => {
                let listener = self.listen(addr)?;
                log::info!(target: self.log_target.as_str(), "TCP server listening on {}", addr);

                let (stream, client) = self.accept(&listener)?;
                if let Err(e) = stream.set_nodelay(true) {
                    log::warn!(
                        target: self.log_target.as_str(),
                        "Failed to set TCP_NODELAY: {}",
                        e
                    );
                }
                log::info!(target: self.log_target.as_str(), "TCP client connected: {}", client);
                self.peer = Some(client);
                Ok(ServerSocket::Tcp {
                    _listener: listener,
                    stream,
                })
            }
            Protocol::Udp => {
                let socket = UdpSocket::bind(addr)?;
                log::info!(target: self.log_target.as_str(), "UDP server bound to {}", addr);
                Ok(ServerSocket::Udp(socket))
            }
        }
    }

    fn write_message(&mut self, message: &Message) -> Result<usize> {
        let bytes = message::encode(message)?;
        match self.socket.as_mut().ok_or(Error::NotConnected)? {
            ServerSocket::Tcp { stream, .. } => {
                stream.write_all(&bytes)?;
                stream.flush()?;
            }
            ServerSocket::Udp(socket) => {
                let peer = self
                    .peer
                    .ok_or_else(|| Error::Other("no client address recorded yet".into()))?;
                socket.send_to(&bytes, peer)?;
            }
        }
        Ok(bytes.len())
    }

    /// One bounded read; `Ok(None)` on timeout. Updates the UDP peer.
    fn read_payload(&mut self, timeout: Duration) -> Result<Option<usize>> {
        let timeout = Some(read_timeout(timeout));
        let result = match self.socket.as_mut().ok_or(Error::NotConnected)? {
            ServerSocket::Tcp { stream, .. } => {
                stream.set_read_timeout(timeout)?;
                match stream.read(&mut self.recv_buffer) {
                    Ok(0) => return Err(Error::Disconnected),
                    other => other,
                }
            }
            ServerSocket::Udp(socket) => {
                socket.set_read_timeout(timeout)?;
                socket.recv_from(&mut self.recv_buffer).map(|(n, from)| {
                    if self.peer != Some(from) {
                        log::debug!(target: self.log_target.as_str(), "UDP peer is now {}", from);
                        self.peer = Some(from);
                    }
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

    /// Close everything after the TCP client went away
    fn mark_connection_lost(&mut self) {
        if matches!(self.socket, Some(ServerSocket::Tcp { .. })) {
            log::info!(
                target: self.log_target.as_str(),
                "TCP client {:?} disconnected",
                self.peer
            );
            self.socket = None;
            self.peer = None;
            self.connected = false;
        }
    }
}

impl Transport for SocketServerTransport {
    fn connect(&mut self) -> bool {
        if self.connected {
            log::warn!(
                target: self.log_target.as_str(),
                "Server already running, ignoring connect()"
            );
            return true;
        }

        match self.open() {
            Ok(socket) => {
                self.socket = Some(socket);
                self.connected = true;
                true
            }
            Err(e) => {
                log::error!(
                    target: self.log_target.as_str(),
                    "{} server start on {}:{} failed: {}",
                    self.config.protocol,
                    self.config.host,
                    self.config.port,
                    e
                );
                self.socket = None;
                self.peer = None;
                self.connected = false;
                false
            }
        }
    }

    fn disconnect(&mut self) -> bool {
        if self.socket.take().is_some() {
            log::info!(target: self.log_target.as_str(), "Server closed");
        }
        self.peer = None;
        self.connected = false;
        true
    }

    fn send_command(&mut self, message: &Message) -> bool {
        if !self.connected {
            log::error!(target: self.log_target.as_str(), "Server not running, cannot send");
            return false;
        }

        match self.write_message(message) {
            Ok(n) => {
                log::debug!(
                    target: self.log_target.as_str(),
                    "Sent {} bytes to {:?}: {:?}",
                    n,
                    self.peer,
                    message
                );
                true
            }
            Err(e) => {
                log::error!(target: self.log_target.as_str(), "Failed to send data: {}", e);
                if e.is_connection_lost() {
                    self.mark_connection_lost();
                }
                false
            }
        }
    }

    fn receive_data(&mut self, timeout: Duration) -> Option<Message> {
        if !self.connected {
            log::error!(target: self.log_target.as_str(), "Server not running, cannot receive");
            return None;
        }

        match self.read_payload(timeout) {
            Ok(Some(n)) => match message::decode(&self.recv_buffer[..n]) {
                Ok(msg) => {
                    log::debug!(
                        target: self.log_target.as_str(),
                        "Received from {:?}: {:?}",
                        self.peer,
                        msg
                    );
                    Some(msg)
                }
                Err(e) => {
                    log::error!(
                        target: self.log_target.as_str(),
                        "Discarding malformed payload ({} bytes) from {:?}: {}",
                        n,
                        self.peer,
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

impl Drop for SocketServerTransport {
    fn drop(&mut self) {
        if self.connected {
            self.disconnect();
        }
    }
}
