//! teleop-io - Teleoperation transports for robot command/feedback exchange
//!
//! A control application talks to a remote robot through one [`Transport`]
//! without caring which medium carries the bytes:
//!
//! - [`SocketTransport`]: TCP or UDP client
//! - [`SocketServerTransport`]: TCP or UDP server for a single peer
//! - [`SerialTransport`]: newline-delimited JSON over a serial line, plus raw bytes
//!
//! Messages are opaque JSON objects ([`Message`]).
//!
//! ```no_run
//! use std::time::Duration;
//! use teleop_io::{SocketConfig, SocketTransport, Transport};
//!
//! let mut client = SocketTransport::new(SocketConfig::new("127.0.0.1", 8888, "tcp")?)?;
//! if client.connect() {
//!     let command = serde_json::json!({"type": "move", "linear_velocity": 0.5});
//!     client.send_command(command.as_object().unwrap());
//!     if let Some(feedback) = client.receive_data(Duration::from_secs(2)) {
//!         println!("{:?}", feedback);
//!     }
//!     client.disconnect();
//! }
//! # Ok::<(), teleop_io::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod transport;

// Re-export commonly used types
pub use config::{AppConfig, SerialConfig, SocketConfig, TransportConfig};
pub use error::{Error, Result};
pub use message::Message;
pub use transport::{
    Protocol, SerialTransport, SocketServerTransport, SocketTransport, Transport,
    create_transport, list_available_ports,
};
