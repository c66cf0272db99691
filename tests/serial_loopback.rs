//! Serial transport scenarios over a pseudo-terminal pair.
//!
//! The transport opens the slave side by path; the test drives the master
//! side as the "robot".

#![cfg(unix)]

use serde_json::json;
use serialport::{SerialPort, TTYPort};
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use teleop_io::{Message, SerialConfig, SerialTransport, Transport};

/// Open a pty pair and a connected transport on its slave side
fn loopback() -> (TTYPort, SerialTransport) {
    let (mut master, slave) = TTYPort::pair().expect("failed to create pty pair");
    let path = slave.name().expect("pty slave has no name");
    drop(slave);

    master
        .set_timeout(Duration::from_secs(2))
        .expect("failed to set master timeout");

    let config = SerialConfig::new(path, 115200).with_timeout(Duration::from_millis(500));
    let mut transport = SerialTransport::new(config).unwrap();
    assert!(transport.connect(), "failed to open pty slave");
    (master, transport)
}

fn msg(value: serde_json::Value) -> Message {
    value.as_object().cloned().unwrap()
}

fn read_line(master: &mut TTYPort) -> Vec<u8> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    while !line.ends_with(b"\n") {
        master.read_exact(&mut byte).expect("timed out reading from transport");
        line.push(byte[0]);
    }
    line
}

#[test]
fn test_raw_bytes_echo() {
    let (mut master, mut transport) = loopback();

    let payload = [0x01, 0x02, 0x03, 0x04, 0x05];
    assert!(transport.send_raw_bytes(&payload));

    let mut echoed = [0u8; 5];
    master.read_exact(&mut echoed).unwrap();
    assert_eq!(echoed, payload);
    master.write_all(&echoed).unwrap();

    let received = transport.receive_raw_bytes(5, Duration::from_secs(1));
    assert_eq!(received.as_deref(), Some(&payload[..]));
}

#[test]
fn test_json_line_then_timeout() {
    let (mut master, mut transport) = loopback();

    master.write_all(b"{\"speed\":100}\n").unwrap();
    assert_eq!(
        transport.receive_data(Duration::from_secs(1)),
        Some(msg(json!({"speed": 100})))
    );

    let start = Instant::now();
    assert_eq!(transport.receive_data(Duration::from_millis(300)), None);
    assert!(start.elapsed() >= Duration::from_millis(250));
    assert!(transport.check_connection());
}

#[test]
fn test_send_command_writes_one_line() {
    let (mut master, mut transport) = loopback();

    let command = msg(json!({"type": "move", "speed": 100, "direction": "forward"}));
    assert!(transport.send_command(&command));

    let line = read_line(&mut master);
    assert_eq!(line.iter().filter(|&&b| b == b'\n').count(), 1);
    assert_eq!(teleop_io::message::decode(&line).unwrap(), command);
}

#[test]
fn test_back_to_back_lines_are_kept() {
    let (mut master, mut transport) = loopback();

    master.write_all(b"{\"seq\":1}\n{\"seq\":2}\n").unwrap();
    assert_eq!(
        transport.receive_data(Duration::from_secs(1)),
        Some(msg(json!({"seq": 1})))
    );
    assert_eq!(
        transport.receive_data(Duration::from_secs(1)),
        Some(msg(json!({"seq": 2})))
    );
}

#[test]
fn test_malformed_line_is_skipped() {
    let (mut master, mut transport) = loopback();

    master.write_all(b"{\"speed\":\n{\"speed\":5}\n").unwrap();
    assert_eq!(transport.receive_data(Duration::from_secs(1)), None);
    assert_eq!(
        transport.receive_data(Duration::from_secs(1)),
        Some(msg(json!({"speed": 5})))
    );
}

#[test]
fn test_partial_line_completes_on_next_call() {
    let (mut master, mut transport) = loopback();

    master.write_all(b"{\"type\":").unwrap();
    assert_eq!(transport.receive_data(Duration::from_millis(200)), None);

    master.write_all(b"\"stop\"}\n").unwrap();
    assert_eq!(
        transport.receive_data(Duration::from_secs(1)),
        Some(msg(json!({"type": "stop"})))
    );
}

#[test]
fn test_short_raw_read_returns_available_bytes() {
    let (mut master, mut transport) = loopback();

    master.write_all(&[0xaa, 0xbb]).unwrap();
    let received = transport.receive_raw_bytes(4, Duration::from_millis(300));
    assert_eq!(received, Some(vec![0xaa, 0xbb]));

    assert_eq!(transport.receive_raw_bytes(4, Duration::from_millis(100)), None);
}

#[test]
fn test_clear_buffers_discards_unread_input() {
    let (mut master, mut transport) = loopback();

    master.write_all(b"{\"stale\":true}\n").unwrap();
    std::thread::sleep(Duration::from_millis(100));
    transport.clear_buffers();

    assert_eq!(transport.receive_data(Duration::from_millis(200)), None);
}

#[test]
fn test_disconnect_closes_port() {
    let (_master, mut transport) = loopback();

    assert!(transport.check_connection());
    assert!(transport.disconnect());
    assert!(!transport.check_connection());
    assert!(transport.disconnect());
    assert!(!transport.send_raw_bytes(&[0x01]));
}
