//! Configuration for teleop-io
//!
//! Transports can be configured programmatically through the builder
//! methods on [`SocketConfig`] / [`SerialConfig`], or loaded from a TOML file:
//!
//! ```toml
//! [transport]
//! kind = "socket"      # socket | server | serial
//! host = "127.0.0.1"
//! port = 8888
//! protocol = "tcp"
//!
//! [logging]
//! level = "info"
//! ```

use crate::error::{Error, Result};
use crate::transport::Protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default receive buffer for socket reads (bytes)
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Top-level application configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AppConfig {
    pub transport: TransportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which binding to construct, with its parameters
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// TCP/UDP client
    Socket(SocketConfig),
    /// TCP/UDP single-peer server
    Server(SocketConfig),
    /// Serial line
    Serial(SerialConfig),
}

/// Socket parameters (client and server)
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SocketConfig {
    /// Peer host for clients, bind address for servers
    #[serde(default = "default_host")]
    pub host: String,

    /// Port number (1-65535)
    #[serde(default = "default_port")]
    pub port: u16,

    /// TCP or UDP (case-insensitive in files)
    #[serde(default)]
    pub protocol: Protocol,

    /// Receive buffer size in bytes; larger messages are truncated
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Server only: give up waiting for a TCP client after this many seconds.
    /// Unset means wait forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_timeout_secs: Option<f64>,
}

impl SocketConfig {
    /// Create a socket configuration, validating the protocol name
    pub fn new(host: impl Into<String>, port: u16, protocol: &str) -> Result<Self> {
        let config = Self {
            host: host.into(),
            port,
            protocol: protocol.parse()?,
            buffer_size: DEFAULT_BUFFER_SIZE,
            accept_timeout_secs: None,
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the receive buffer size in bytes
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Give up waiting for a TCP client after `timeout` (server only)
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout_secs = Some(timeout.as_secs_f64());
        self
    }

    /// Accept timeout as a duration, if configured
    ///
    /// A value too large for `Duration` counts as unset.
    pub fn accept_timeout(&self) -> Option<Duration> {
        self.accept_timeout_secs.and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Check ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::InvalidParameter("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(Error::InvalidParameter("port must be in 1-65535".into()));
        }
        if self.buffer_size == 0 {
            return Err(Error::InvalidParameter("buffer_size must be positive".into()));
        }
        if let Some(secs) = self.accept_timeout_secs
            && let Err(e) = Duration::try_from_secs_f64(secs)
        {
            return Err(Error::InvalidParameter(format!("accept_timeout_secs {}: {}", secs, e)));
        }
        Ok(())
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            protocol: Protocol::Tcp,
            buffer_size: DEFAULT_BUFFER_SIZE,
            accept_timeout_secs: None,
        }
    }
}

/// Serial line parameters
///
/// Values are kept in their conventional textual form (`parity = "N"`,
/// `stopbits = 1.5`) and checked by `SerialTransport::new`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SerialConfig {
    /// Device path (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,

    /// Baud rate (e.g. 9600, 115200)
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,

    /// Default read timeout in seconds
    #[serde(default = "default_serial_timeout")]
    pub timeout: f64,

    /// Data bits: 5, 6, 7 or 8
    #[serde(default = "default_bytesize")]
    pub bytesize: u8,

    /// Parity: N, E, O, M or S
    #[serde(default = "default_parity")]
    pub parity: String,

    /// Stop bits: 1, 1.5 or 2
    #[serde(default = "default_stopbits")]
    pub stopbits: f32,
}

impl SerialConfig {
    /// 8N1 with a one second read timeout
    pub fn new(port: impl Into<String>, baudrate: u32) -> Self {
        Self {
            port: port.into(),
            baudrate,
            timeout: default_serial_timeout(),
            bytesize: default_bytesize(),
            parity: default_parity(),
            stopbits: default_stopbits(),
        }
    }

    /// Set the default read timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.as_secs_f64();
        self
    }

    /// Set the number of data bits
    pub fn with_bytesize(mut self, bytesize: u8) -> Self {
        self.bytesize = bytesize;
        self
    }

    /// Set parity by its one-letter name (N, E, O, M, S)
    pub fn with_parity(mut self, parity: &str) -> Self {
        self.parity = parity.to_string();
        self
    }

    /// Set the number of stop bits
    pub fn with_stopbits(mut self, stopbits: f32) -> Self {
        self.stopbits = stopbits;
        self
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// Load configuration from TOML file
    ///
    /// # Example
    /// ```no_run
    /// use teleop_io::config::AppConfig;
    ///
    /// let config = AppConfig::from_file("teleop.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        if let TransportConfig::Socket(socket) | TransportConfig::Server(socket) = &config.transport
        {
            socket.validate()?;
        }
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}

impl Default for AppConfig {
    /// TCP client to a local robot on port 8888
    fn default() -> Self {
        Self {
            transport: TransportConfig::Socket(SocketConfig::default()),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8888
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_baudrate() -> u32 {
    115200
}

fn default_serial_timeout() -> f64 {
    1.0
}

fn default_bytesize() -> u8 {
    8
}

fn default_parity() -> String {
    "N".to_string()
}

fn default_stopbits() -> f32 {
    1.0
}

fn default_log_level() -> String {
    "info".to_string()
}
