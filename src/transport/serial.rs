//! Serial transport implementation
//!
//! # Framing
//!
//! JSON mode writes one message per line (`{...}\n`) and reads up to the
//! next `\n`. Bytes that arrive after a terminator are kept for the next
//! read, so back-to-back messages are never lost.
//!
//! Raw mode (`send_raw_bytes` / `receive_raw_bytes`) bypasses JSON entirely
//! for devices that speak a binary protocol.
//!
//! # Timeouts
//!
//! The port keeps the timeout it was opened with. Receive calls install the
//! caller's timeout for their duration only; it is restored on every exit
//! path when the scoped guard drops.

use super::{Transport, read_timeout};
use crate::config::SerialConfig;
use crate::error::{Error, Result};
use crate::message::{self, Message};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::Write;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

/// Bytes requested per read while waiting for a line terminator
const READ_CHUNK_SIZE: usize = 256;

/// Longest unterminated line kept pending before it is dropped as noise
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Upper bound for a single blocking read; longer waits loop
const MAX_READ_ATTEMPT: Duration = Duration::from_secs(60);

/// Validated line parameters
#[derive(Debug, Clone, Copy, PartialEq)]
struct LineSettings {
    data_bits: DataBits,
    parity: Parity,
    stop_bits: StopBits,
    timeout: Duration,
}

impl LineSettings {
    fn from_config(config: &SerialConfig) -> Result<Self> {
        if config.port.trim().is_empty() {
            return Err(Error::InvalidParameter("serial port must not be empty".into()));
        }
        if config.baudrate == 0 {
            return Err(Error::InvalidParameter("baudrate must be positive".into()));
        }
        let timeout = Duration::try_from_secs_f64(config.timeout).map_err(|e| {
            Error::InvalidParameter(format!("timeout {} seconds: {}", config.timeout, e))
        })?;

        let data_bits = match config.bytesize {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => {
                return Err(Error::InvalidParameter(format!(
                    "bytesize must be 5, 6, 7 or 8, got {}",
                    other
                )));
            }
        };

        let parity = match config.parity.trim().to_ascii_uppercase().as_str() {
            "N" => Parity::None,
            "E" => Parity::Even,
            "O" => Parity::Odd,
            "M" | "S" => {
                return Err(Error::NotSupported(format!(
                    "parity {:?} (mark/space) is not available on this serial backend",
                    config.parity
                )));
            }
            _ => {
                return Err(Error::InvalidParameter(format!(
                    "parity must be one of N, E, O, M, S, got {:?}",
                    config.parity
                )));
            }
        };

        let stop_bits = if config.stopbits == 1.0 {
            StopBits::One
        } else if config.stopbits == 2.0 {
            StopBits::Two
        } else if config.stopbits == 1.5 {
            return Err(Error::NotSupported(
                "1.5 stop bits are not available on this serial backend".into(),
            ));
        } else {
            return Err(Error::InvalidParameter(format!(
                "stopbits must be 1, 1.5 or 2, got {}",
                config.stopbits
            )));
        };

        Ok(Self {
            data_bits,
            parity,
            stop_bits,
            timeout,
        })
    }
}

/// Clamp one read attempt to what the port accepts
fn attempt_timeout(timeout: Duration) -> Duration {
    read_timeout(timeout).min(MAX_READ_ATTEMPT)
}

/// Read deadline; `None` when `timeout` is too large to represent, which
/// means wait until data arrives
fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

/// Temporarily installs a read timeout on a port, restoring the previous
/// one when dropped
struct ScopedTimeout<'a> {
    port: &'a mut Box<dyn SerialPort>,
    original: Duration,
    log_target: &'a str,
}

impl<'a> ScopedTimeout<'a> {
    fn new(
        port: &'a mut Box<dyn SerialPort>,
        log_target: &'a str,
        timeout: Duration,
    ) -> Result<Self> {
        let original = port.timeout();
        port.set_timeout(attempt_timeout(timeout))?;
        Ok(Self {
            port,
            original,
            log_target,
        })
    }
}

impl Deref for ScopedTimeout<'_> {
    type Target = dyn SerialPort;

    fn deref(&self) -> &Self::Target {
        &**self.port
    }
}

impl DerefMut for ScopedTimeout<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.port
    }
}

impl Drop for ScopedTimeout<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.port.set_timeout(self.original) {
            log::warn!(
                target: self.log_target,
                "Failed to restore serial timeout {:?}: {}",
                self.original,
                e
            );
        }
    }
}

/// One read attempt bounded by `deadline`; 0 means nothing arrived in time.
///
/// At least one attempt is made even when the deadline already passed, so a
/// zero timeout still picks up bytes that are already waiting.
fn read_before(
    port: &mut ScopedTimeout<'_>,
    chunk: &mut [u8],
    deadline: Option<Instant>,
) -> Result<usize> {
    let remaining = match deadline {
        Some(deadline) => deadline.saturating_duration_since(Instant::now()),
        None => MAX_READ_ATTEMPT,
    };
    port.set_timeout(attempt_timeout(remaining))?;
    match port.read(chunk) {
        Ok(n) => Ok(n),
        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Serial transport for UART communication
pub struct SerialTransport {
    config: SerialConfig,
    settings: LineSettings,
    port: Option<Box<dyn SerialPort>>,
    connected: bool,
    /// Bytes received but not yet handed out
    pending: Vec<u8>,
    log_target: String,
}

impl SerialTransport {
    /// Create a closed serial transport
    ///
    /// Line parameters are validated here; the device is not touched until
    /// `connect`.
    pub fn new(config: SerialConfig) -> Result<Self> {
        let settings = LineSettings::from_config(&config)?;
        Ok(Self {
            config,
            settings,
            port: None,
            connected: false,
            pending: Vec::new(),
            log_target: module_path!().to_string(),
        })
    }

    /// Route this instance's log records to `target`
    pub fn with_log_target(mut self, target: impl Into<String>) -> Self {
        self.log_target = target.into();
        self
    }

    /// Configuration this transport was built from
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    /// Device path this transport opens
    pub fn port_name(&self) -> &str {
        &self.config.port
    }

    fn is_open(&self) -> bool {
        self.connected && self.port.is_some()
    }

    fn open(&self) -> Result<Box<dyn SerialPort>> {
        let port = serialport::new(&self.config.port, self.config.baudrate)
            .data_bits(self.settings.data_bits)
            .parity(self.settings.parity)
            .stop_bits(self.settings.stop_bits)
            .flow_control(FlowControl::None)
            .timeout(self.settings.timeout)
            .open()?;

        // Drop anything left over from before we opened the device
        port.clear(ClearBuffer::All)?;
        Ok(port)
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    /// Next complete line (terminator included), or `None` on timeout.
    /// A partial line stays pending up to `MAX_LINE_LENGTH` bytes.
    fn read_line(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        if let Some(line) = message::take_line(&mut self.pending) {
            return Ok(Some(line));
        }

        let port = self.port.as_mut().ok_or(Error::NotConnected)?;
        let mut port = ScopedTimeout::new(port, &self.log_target, timeout)?;
        let deadline = deadline_after(timeout);
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        loop {
            let n = read_before(&mut port, &mut chunk, deadline)?;
            if n > 0 {
                let scan_from = self.pending.len();
                self.pending.extend_from_slice(&chunk[..n]);
                if self.pending[scan_from..].contains(&message::LINE_DELIMITER) {
                    return Ok(message::take_line(&mut self.pending));
                }
                if self.pending.len() > MAX_LINE_LENGTH {
                    log::error!(
                        target: self.log_target.as_str(),
                        "Discarding {} bytes without a line terminator",
                        self.pending.len()
                    );
                    self.pending.clear();
                }
            }
            if expired(deadline) {
                return Ok(None);
            }
        }
    }

    /// Up to `size` bytes; fewer if the deadline passes first
    fn read_exact_before(&mut self, size: usize, timeout: Duration) -> Result<Vec<u8>> {
        let take = size.min(self.pending.len());
        let mut data: Vec<u8> = self.pending.drain(..take).collect();
        if data.len() == size {
            return Ok(data);
        }

        let port = self.port.as_mut().ok_or(Error::NotConnected)?;
        let mut port = ScopedTimeout::new(port, &self.log_target, timeout)?;
        let deadline = deadline_after(timeout);
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        while data.len() < size {
            let want = (size - data.len()).min(READ_CHUNK_SIZE);
            let n = read_before(&mut port, &mut chunk[..want], deadline)?;
            data.extend_from_slice(&chunk[..n]);
            if n == 0 && !data.is_empty() {
                break;
            }
            if expired(deadline) {
                break;
            }
        }
        Ok(data)
    }

    /// Write raw bytes without JSON framing, flushing before returning
    pub fn send_raw_bytes(&mut self, data: &[u8]) -> bool {
        if !self.is_open() {
            log::error!(target: self.log_target.as_str(), "Serial port not open, cannot send data");
            return false;
        }

        match self.write_bytes(data) {
            Ok(()) => {
                log::debug!(target: self.log_target.as_str(), "Sent {} raw bytes", data.len());
                true
            }
            Err(e) => {
                log::error!(target: self.log_target.as_str(), "Failed to send raw bytes: {}", e);
                false
            }
        }
    }

    /// Read `size` raw bytes, waiting at most `timeout`
    ///
    /// Returns what arrived before the deadline (possibly fewer than `size`
    /// bytes), or `None` if nothing did.
    pub fn receive_raw_bytes(&mut self, size: usize, timeout: Duration) -> Option<Vec<u8>> {
        if !self.is_open() {
            log::error!(
                target: self.log_target.as_str(),
                "Serial port not open, cannot receive data"
            );
            return None;
        }
        if size == 0 {
            return None;
        }

        match self.read_exact_before(size, timeout) {
            Ok(data) if data.is_empty() => {
                log::debug!(target: self.log_target.as_str(), "No raw data within {:?}", timeout);
                None
            }
            Ok(data) => {
                if data.len() < size {
                    log::debug!(
                        target: self.log_target.as_str(),
                        "Short raw read: {} of {} bytes",
                        data.len(),
                        size
                    );
                } else {
                    log::debug!(
                        target: self.log_target.as_str(),
                        "Received {} raw bytes",
                        data.len()
                    );
                }
                Some(data)
            }
            Err(e) => {
                log::error!(target: self.log_target.as_str(), "Failed to receive raw bytes: {}", e);
                None
            }
        }
    }

    /// Discard unread input and unsent output. No-op if the port is closed.
    pub fn clear_buffers(&mut self) {
        let Some(port) = self.port.as_ref() else {
            return;
        };
        if let Err(e) = port.clear(ClearBuffer::All) {
            log::error!(target: self.log_target.as_str(), "Failed to clear serial buffers: {}", e);
        }
        self.pending.clear();
        log::debug!(target: self.log_target.as_str(), "Serial buffers cleared");
    }
}

impl Transport for SerialTransport {
    fn connect(&mut self) -> bool {
        if self.is_open() {
            log::warn!(
                target: self.log_target.as_str(),
                "Serial port {} already open, ignoring connect()",
                self.config.port
            );
            return true;
        }

        match self.open() {
            Ok(port) => {
                self.port = Some(port);
                self.pending.clear();
                self.connected = true;
                log::info!(
                    target: self.log_target.as_str(),
                    "Opened serial port: {} at {} baud",
                    self.config.port,
                    self.config.baudrate
                );
                true
            }
            Err(e) => {
                log::error!(
                    target: self.log_target.as_str(),
                    "Failed to open serial port {}: {}",
                    self.config.port,
                    e
                );
                self.port = None;
                self.connected = false;
                false
            }
        }
    }

    fn disconnect(&mut self) -> bool {
        if self.port.take().is_some() {
            log::info!(
                target: self.log_target.as_str(),
                "Closed serial port: {}",
                self.config.port
            );
        }
        self.pending.clear();
        self.connected = false;
        true
    }

    fn send_command(&mut self, message: &Message) -> bool {
        if !self.is_open() {
            log::error!(
                target: self.log_target.as_str(),
                "Serial port not open, cannot send command"
            );
            return false;
        }

        let result = message::encode_line(message).and_then(|line| {
            self.write_bytes(&line)?;
            Ok(line.len())
        });
        match result {
            Ok(n) => {
                log::debug!(target: self.log_target.as_str(), "Sent {} bytes: {:?}", n, message);
                true
            }
            Err(e) => {
                log::error!(target: self.log_target.as_str(), "Failed to send command: {}", e);
                false
            }
        }
    }

    fn receive_data(&mut self, timeout: Duration) -> Option<Message> {
        if !self.is_open() {
            log::error!(
                target: self.log_target.as_str(),
                "Serial port not open, cannot receive data"
            );
            return None;
        }

        match self.read_line(timeout) {
            Ok(Some(line)) => match message::decode(&line) {
                Ok(msg) => {
                    log::debug!(target: self.log_target.as_str(), "Received: {:?}", msg);
                    Some(msg)
                }
                Err(e) => {
                    log::error!(
                        target: self.log_target.as_str(),
                        "JSON decode failed: {}, raw line: {:?}",
                        e,
                        String::from_utf8_lossy(&line)
                    );
                    None
                }
            },
            Ok(None) => {
                log::debug!(
                    target: self.log_target.as_str(),
                    "No complete line within {:?} ({} bytes pending)",
                    timeout,
                    self.pending.len()
                );
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

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if self.connected {
            self.disconnect();
        }
    }
}

/// List serial devices currently visible to the process
///
/// Returns an empty list (and logs why) if enumeration fails.
pub fn list_available_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            log::error!("Failed to list serial ports: {}", e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(config: SerialConfig) -> Result<LineSettings> {
        LineSettings::from_config(&config)
    }

    #[test]
    fn test_default_settings_are_8n1() {
        let s = settings(SerialConfig::new("/dev/ttyUSB0", 115200)).unwrap();
        assert_eq!(s.data_bits, DataBits::Eight);
        assert_eq!(s.parity, Parity::None);
        assert_eq!(s.stop_bits, StopBits::One);
        assert_eq!(s.timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_settings_accept_supported_values() {
        let s = settings(
            SerialConfig::new("COM3", 9600)
                .with_bytesize(7)
                .with_parity("e")
                .with_stopbits(2.0)
                .with_timeout(Duration::from_millis(250)),
        )
        .unwrap();
        assert_eq!(s.data_bits, DataBits::Seven);
        assert_eq!(s.parity, Parity::Even);
        assert_eq!(s.stop_bits, StopBits::Two);
        assert_eq!(s.timeout, Duration::from_millis(250));

        for bytesize in [5, 6] {
            assert!(settings(SerialConfig::new("COM3", 9600).with_bytesize(bytesize)).is_ok());
        }
        assert!(settings(SerialConfig::new("COM3", 9600).with_parity("O")).is_ok());
    }

    #[test]
    fn test_settings_reject_invalid_values() {
        let base = || SerialConfig::new("/dev/ttyUSB0", 115200);
        assert!(matches!(
            settings(base().with_bytesize(9)),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            settings(base().with_parity("X")),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            settings(base().with_stopbits(3.0)),
            Err(Error::InvalidParameter(_))
        ));
        assert!(settings(SerialConfig::new("/dev/ttyUSB0", 0)).is_err());
        assert!(settings(SerialConfig::new("", 115200)).is_err());

        let mut negative = base();
        negative.timeout = -1.0;
        assert!(settings(negative).is_err());

        for timeout in [1e20, f64::NAN, f64::INFINITY] {
            let mut config = base();
            config.timeout = timeout;
            assert!(matches!(settings(config), Err(Error::InvalidParameter(_))));
        }
    }

    #[test]
    fn test_settings_report_unsupported_values() {
        let base = || SerialConfig::new("/dev/ttyUSB0", 115200);
        assert!(matches!(
            settings(base().with_parity("M")),
            Err(Error::NotSupported(_))
        ));
        assert!(matches!(
            settings(base().with_parity("S")),
            Err(Error::NotSupported(_))
        ));
        assert!(matches!(
            settings(base().with_stopbits(1.5)),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn test_closed_port_operations_fail_safe() {
        let mut transport =
            SerialTransport::new(SerialConfig::new("/dev/ttyUSB0", 115200)).unwrap();
        assert!(!transport.check_connection());
        assert!(!transport.send_raw_bytes(&[1, 2, 3]));
        assert!(transport.receive_raw_bytes(3, Duration::from_millis(10)).is_none());
        assert!(transport.receive_data(Duration::from_millis(10)).is_none());
        transport.clear_buffers();
        assert!(transport.disconnect());
        assert!(transport.disconnect());
    }

    #[test]
    fn test_connect_missing_device_fails() {
        let config = SerialConfig::new("/dev/teleop-io-does-not-exist", 115200);
        let mut transport = SerialTransport::new(config).unwrap();
        assert!(!transport.connect());
        assert!(!transport.check_connection());
    }

    #[test]
    fn test_list_available_ports_never_fails() {
        // Content depends on the host; the call itself must not panic
        let _ports = list_available_ports();
    }

    #[cfg(unix)]
    mod loopback {
        use super::*;
        use serialport::TTYPort;

        const PORT_TIMEOUT: Duration = Duration::from_millis(500);

        fn open_pair() -> (TTYPort, SerialTransport) {
            let (mut master, slave) = TTYPort::pair().expect("failed to create pty pair");
            let path = slave.name().expect("pty slave has no name");
            drop(slave);
            master.set_timeout(Duration::from_secs(2)).unwrap();

            let config = SerialConfig::new(path, 115200).with_timeout(PORT_TIMEOUT);
            let mut transport = SerialTransport::new(config).unwrap();
            assert!(transport.connect(), "failed to open pty slave");
            (master, transport)
        }

        fn port_timeout(transport: &SerialTransport) -> Duration {
            transport.port.as_ref().unwrap().timeout()
        }

        #[test]
        fn test_port_timeout_restored_after_receive() {
            let (mut master, mut transport) = open_pair();
            assert_eq!(port_timeout(&transport), PORT_TIMEOUT);

            master.write_all(b"{\"seq\":1}\n").unwrap();
            assert!(transport.receive_data(Duration::from_secs(2)).is_some());
            assert_eq!(port_timeout(&transport), PORT_TIMEOUT);

            assert!(transport.receive_data(Duration::from_millis(50)).is_none());
            assert_eq!(port_timeout(&transport), PORT_TIMEOUT);

            master.write_all(&[0x10, 0x20]).unwrap();
            let data = transport.receive_raw_bytes(8, Duration::from_millis(200));
            assert_eq!(data, Some(vec![0x10, 0x20]));
            assert_eq!(port_timeout(&transport), PORT_TIMEOUT);

            assert!(transport.receive_raw_bytes(8, Duration::from_millis(50)).is_none());
            assert_eq!(port_timeout(&transport), PORT_TIMEOUT);
        }

        #[test]
        fn test_unbounded_timeouts_return_waiting_data() {
            let (mut master, mut transport) = open_pair();

            master.write_all(b"{\"type\":\"stop\"}\n").unwrap();
            let msg = transport.receive_data(Duration::MAX).unwrap();
            assert_eq!(msg["type"], "stop");
            assert_eq!(port_timeout(&transport), PORT_TIMEOUT);

            master.write_all(&[0x01, 0x02, 0x03]).unwrap();
            let data = transport.receive_raw_bytes(3, Duration::from_secs(u64::MAX));
            assert_eq!(data, Some(vec![0x01, 0x02, 0x03]));
            assert_eq!(port_timeout(&transport), PORT_TIMEOUT);
        }

        #[test]
        fn test_unterminated_input_is_bounded() {
            let (mut master, mut transport) = open_pair();

            let noise = [b'x'; 4000];
            for _ in 0..25 {
                master.write_all(&noise).unwrap();
                assert!(transport.receive_data(Duration::from_millis(20)).is_none());
                assert!(transport.pending.len() <= MAX_LINE_LENGTH);
            }

            // The tail of the noise is dropped as one bad line
            master.write_all(b"\n{\"ok\":true}\n").unwrap();
            let msg = (0..3).find_map(|_| transport.receive_data(Duration::from_secs(1)));
            assert_eq!(msg.unwrap()["ok"], true);
        }
    }
}
