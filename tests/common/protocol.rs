//! Line based protocol used by the integration tests
//!
//! Device to host:
//!
//! - `V <server_id> <hex>` raw value of an entry
//! - `A <server_id> ok` / `A <server_id> err <message>` write acknowledgement
//!
//! Host to device:
//!
//! - `W <server_id> <hex>` write
//! - `S <server_id> 1|0` start or stop sending an entry

use watchlink_rs::error::Result;
use watchlink_rs::sync::{DeviceEvent, DeviceProtocol};

#[derive(Debug, Default)]
pub struct LineProtocol {
    pending: String,
}

impl LineProtocol {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn from_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

/// Device side frame carrying a value
pub fn value_frame(server_id: &str, bytes: &[u8]) -> Vec<u8> {
    format!("V {} {}\n", server_id, to_hex(bytes)).into_bytes()
}

/// Device side write acknowledgement
pub fn ack_frame(server_id: &str, ok: bool) -> Vec<u8> {
    if ok {
        format!("A {} ok\n", server_id).into_bytes()
    } else {
        format!("A {} err rejected\n", server_id).into_bytes()
    }
}

/// Host side write frame as `(server_id, payload)`
pub fn parse_write(frame: &[u8]) -> Option<(String, Vec<u8>)> {
    let text = std::str::from_utf8(frame).ok()?.trim_end();
    let mut parts = text.split(' ');
    if parts.next()? != "W" {
        return None;
    }
    let server_id = parts.next()?.to_string();
    let payload = from_hex(parts.next()?)?;
    Some((server_id, payload))
}

impl DeviceProtocol for LineProtocol {
    fn decode(&mut self, bytes: &[u8]) -> Vec<DeviceEvent> {
        self.pending.push_str(&String::from_utf8_lossy(bytes));
        let mut events = Vec::new();
        let mut values = Vec::new();
        while let Some(end) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=end).collect();
            let parts: Vec<&str> = line.trim_end().splitn(4, ' ').collect();
            match parts.as_slice() {
                ["V", id, hex] => {
                    if let Some(raw) = from_hex(hex) {
                        values.push((id.to_string(), raw));
                    }
                }
                ["A", id, "ok"] => {
                    if !values.is_empty() {
                        events.push(DeviceEvent::Values(std::mem::take(&mut values)));
                    }
                    events.push(DeviceEvent::WriteCompleted {
                        server_id: id.to_string(),
                        success: true,
                        message: None,
                    });
                }
                ["A", id, "err", rest @ ..] => {
                    if !values.is_empty() {
                        events.push(DeviceEvent::Values(std::mem::take(&mut values)));
                    }
                    events.push(DeviceEvent::WriteCompleted {
                        server_id: id.to_string(),
                        success: false,
                        message: Some(rest.join(" ")),
                    });
                }
                _ => {}
            }
        }
        if !values.is_empty() {
            events.push(DeviceEvent::Values(values));
        }
        events
    }

    fn encode_write(&mut self, server_id: &str, payload: &[u8]) -> Result<Vec<u8>> {
        Ok(format!("W {} {}\n", server_id, to_hex(payload)).into_bytes())
    }

    fn encode_subscription(&mut self, server_id: &str, watched: bool) -> Option<Vec<u8>> {
        Some(format!("S {} {}\n", server_id, u8::from(watched)).into_bytes())
    }

    fn reset(&mut self) {
        self.pending.clear();
    }
}
