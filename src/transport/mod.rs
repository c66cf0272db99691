//! Transport layer for teleoperation messaging
//!
//! Three bindings implement the same [`Transport`] contract:
//!
//! | Binding | Media | Framing |
//! |---------|-------|---------|
//! | [`SocketTransport`] | TCP / UDP client | one write = one message |
//! | [`SocketServerTransport`] | TCP / UDP single-peer server | one write = one message |
//! | [`SerialTransport`] | UART | `\n`-terminated JSON, plus raw bytes |
//!
//! All operations are blocking and fail-safe: runtime failures are logged
//! and reported as `false` / `None`, never as an error value.

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::message::Message;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

mod serial;
mod server;
mod socket;

pub use serial::{SerialTransport, list_available_ports};
pub use server::SocketServerTransport;
pub use socket::SocketTransport;

/// Smallest read timeout handed to the OS (a zero timeout is rejected)
pub(crate) const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Transport trait for teleoperation message exchange
///
/// `receive_data` returns `None` for a timeout, a closed peer and a
/// malformed payload alike; only the log tells them apart.
pub trait Transport: Send {
    /// Acquire the underlying resource. Returns false (and stays
    /// disconnected) on any failure.
    fn connect(&mut self) -> bool;

    /// Release the resource. Safe to call repeatedly; always clears the
    /// connected flag.
    fn disconnect(&mut self) -> bool;

    /// Encode `message` as JSON and write it, without retrying
    fn send_command(&mut self, message: &Message) -> bool;

    /// Wait up to `timeout` for one complete message
    fn receive_data(&mut self, timeout: Duration) -> Option<Message>;

    /// Current connected flag (no I/O)
    fn check_connection(&self) -> bool;
}

/// Socket protocol selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Protocol {
    /// Stream socket, connection oriented
    #[default]
    Tcp,
    /// Datagram socket, connectionless
    Udp,
}

impl Protocol {
    /// Upper-case protocol name as used in logs and config files
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            _ => Err(Error::InvalidParameter(format!(
                "protocol must be TCP or UDP, got {:?}",
                s
            ))),
        }
    }
}

impl TryFrom<String> for Protocol {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Protocol> for String {
    fn from(protocol: Protocol) -> Self {
        protocol.as_str().to_string()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Create a transport based on configuration
pub fn create_transport(config: &TransportConfig) -> Result<Box<dyn Transport>> {
    match config {
        TransportConfig::Socket(socket) => Ok(Box::new(SocketTransport::new(socket.clone())?)),
        TransportConfig::Server(socket) => {
            Ok(Box::new(SocketServerTransport::new(socket.clone())?))
        }
        TransportConfig::Serial(serial) => Ok(Box::new(SerialTransport::new(serial.clone())?)),
    }
}

/// Clamp a caller timeout to something the OS accepts as a read timeout
pub(crate) fn read_timeout(timeout: Duration) -> Duration {
    timeout.max(MIN_READ_TIMEOUT)
}

/// Resolve `host:port`, preferring IPv4 like the peers this talks to
pub(crate) fn resolve(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address found for {}:{}", host, port),
            )
        })
}
