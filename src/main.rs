//! teleop-io demo driver
//!
//! Runs one connect / send / receive / disconnect cycle over the selected
//! transport.
//!
//! ```text
//! teleop-io tcp-server --port 8888        # terminal 1
//! teleop-io tcp-client --port 8888        # terminal 2
//! teleop-io udp-client --port 9999
//! teleop-io serial --port /dev/ttyUSB0 --baudrate 115200
//! teleop-io list-ports
//! teleop-io run --config teleop.toml
//! ```
//!
//! Set `--log-level debug` (or `RUST_LOG`) to see per-message traffic.

use clap::{Parser, Subcommand};
use serde_json::json;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use teleop_io::config::AppConfig;
use teleop_io::error::{Error, Result};
use teleop_io::{
    Message, SerialConfig, SerialTransport, SocketConfig, SocketServerTransport, SocketTransport,
    Transport, create_transport, list_available_ports,
};

/// Teleoperation transport demo
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a move command over TCP and wait for feedback
    TcpClient {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(short, long, default_value_t = 8888)]
        port: u16,
        /// Feedback timeout in seconds
        #[arg(short, long, default_value_t = 2.0)]
        timeout: f64,
    },
    /// Wait for one TCP client, receive a command and reply with feedback
    TcpServer {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(short, long, default_value_t = 8888)]
        port: u16,
        /// Command timeout in seconds
        #[arg(short, long, default_value_t = 5.0)]
        timeout: f64,
        /// Give up waiting for a client after this many seconds
        #[arg(long)]
        accept_timeout: Option<f64>,
    },
    /// Send a stop command over UDP (a reply is optional)
    UdpClient {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(short, long, default_value_t = 9999)]
        port: u16,
        #[arg(short, long, default_value_t = 1.0)]
        timeout: f64,
    },
    /// Exchange a JSON command and a raw byte frame over a serial line
    Serial {
        #[arg(short, long, default_value = "/dev/ttyUSB0")]
        port: String,
        #[arg(short, long, default_value_t = 115200)]
        baudrate: u32,
        #[arg(short, long, default_value_t = 2.0)]
        timeout: f64,
    },
    /// List serial devices
    ListPorts,
    /// Build the transport described by a TOML file and exchange one message
    Run {
        #[arg(short, long, default_value = "teleop.toml")]
        config: String,
        #[arg(short, long, default_value_t = 2.0)]
        timeout: f64,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // File-driven runs take their default log level from the file
    let file_config = match &args.command {
        Command::Run { config, .. } => Some(AppConfig::from_file(config)?),
        _ => None,
    };
    let level = args
        .log_level
        .clone()
        .or_else(|| file_config.as_ref().map(|c| c.logging.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    log::info!("teleop-io v{} starting", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::TcpClient {
            host,
            port,
            timeout,
        } => tcp_client(SocketConfig::new(host, port, "tcp")?, secs(timeout)?),
        Command::TcpServer {
            host,
            port,
            timeout,
            accept_timeout,
        } => {
            let mut config = SocketConfig::new(host, port, "tcp")?;
            if let Some(accept) = accept_timeout {
                config = config.with_accept_timeout(secs(accept)?);
            }
            tcp_server(config, secs(timeout)?)
        }
        Command::UdpClient {
            host,
            port,
            timeout,
        } => udp_client(SocketConfig::new(host, port, "udp")?, secs(timeout)?),
        Command::Serial {
            port,
            baudrate,
            timeout,
        } => serial(
            SerialConfig::new(port, baudrate).with_timeout(Duration::from_secs(1)),
            secs(timeout)?,
        ),
        Command::ListPorts => {
            let ports = list_available_ports();
            if ports.is_empty() {
                println!("No serial ports found");
            }
            for port in ports {
                println!("{}", port);
            }
            Ok(())
        }
        Command::Run { timeout, .. } => match file_config {
            Some(config) => {
                let mut transport = create_transport(&config.transport)?;
                exchange(transport.as_mut(), &move_command(), secs(timeout)?)
            }
            None => Err(Error::Other("configuration not loaded".into())),
        },
    }
}

fn secs(value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| Error::InvalidParameter(format!("timeout {}: {}", value, e)))
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

fn as_message(value: serde_json::Value) -> Message {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Message::new(),
    }
}

fn move_command() -> Message {
    as_message(json!({
        "type": "move",
        "linear_velocity": 0.5,
        "angular_velocity": 0.3,
        "timestamp": now_secs(),
    }))
}

/// Connect, send one message, wait for one reply, disconnect
fn exchange(transport: &mut dyn Transport, command: &Message, timeout: Duration) -> Result<()> {
    if !transport.connect() {
        return Err(Error::Other("connect failed".into()));
    }

    println!("Sending: {}", serde_json::Value::Object(command.clone()));
    if !transport.send_command(command) {
        log::warn!("Command was not sent");
    }

    match transport.receive_data(timeout) {
        Some(feedback) => println!("Feedback: {}", serde_json::Value::Object(feedback)),
        None => println!("No feedback within {:?}", timeout),
    }

    transport.disconnect();
    Ok(())
}

fn tcp_client(config: SocketConfig, timeout: Duration) -> Result<()> {
    let mut client = SocketTransport::new(config)?;
    exchange(&mut client, &move_command(), timeout)
}

fn udp_client(config: SocketConfig, timeout: Duration) -> Result<()> {
    let mut client = SocketTransport::new(config)?;
    let command = as_message(json!({
        "type": "stop",
        "emergency": false,
        "timestamp": now_secs(),
    }));
    // Silence is normal here: nothing obliges a UDP peer to answer
    exchange(&mut client, &command, timeout)
}

fn tcp_server(config: SocketConfig, timeout: Duration) -> Result<()> {
    let mut server = SocketServerTransport::new(config)?;
    println!("Waiting for a client...");
    if !server.connect() {
        return Err(Error::Other("server start failed".into()));
    }

    match server.receive_data(timeout) {
        Some(command) => {
            println!("Command: {}", serde_json::Value::Object(command));
            let feedback = as_message(json!({
                "status": "success",
                "position": [1.2, 3.4, 5.6],
                "velocity": 0.5,
                "timestamp": now_secs(),
            }));
            if !server.send_command(&feedback) {
                log::warn!("Feedback was not sent");
            }
        }
        None => println!("No command within {:?}", timeout),
    }

    server.disconnect();
    Ok(())
}

fn serial(config: SerialConfig, timeout: Duration) -> Result<()> {
    println!("Available ports: {:?}", list_available_ports());

    let mut port = SerialTransport::new(config)?;
    if !port.connect() {
        return Err(Error::Other(format!(
            "could not open {} (is the device attached and readable by this user?)",
            port.port_name()
        )));
    }

    port.clear_buffers();
    let command = as_message(json!({
        "type": "move",
        "speed": 100,
        "direction": "forward",
        "timestamp": now_secs(),
    }));
    println!("Sending: {}", serde_json::Value::Object(command.clone()));
    port.send_command(&command);

    std::thread::sleep(Duration::from_millis(100));
    match port.receive_data(timeout) {
        Some(feedback) => println!("Feedback: {}", serde_json::Value::Object(feedback)),
        None => println!("No feedback within {:?}", timeout),
    }

    let frame = [0x01u8, 0x02, 0x03, 0x04, 0x05];
    println!("Sending raw: {}", hex(&frame));
    port.send_raw_bytes(&frame);
    match port.receive_raw_bytes(frame.len(), Duration::from_secs(1)) {
        Some(data) => println!("Received raw: {}", hex(&data)),
        None => println!("No raw data"),
    }

    port.disconnect();
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
