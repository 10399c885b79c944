//! Serial port link

use super::{DeviceLink, LinkParams, LinkStats, ParamReader};
use crate::error::{Result, WatchError};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::time::Duration;

/// Upper bound on one non-blocking read
const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    One,
    OnePointFive,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Even,
    Odd,
    Mark,
    Space,
}

/// Validated serial parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    pub portname: String,
    pub baudrate: u32,
    pub stopbits: StopBits,
    pub databits: DataBits,
    pub parity: Parity,
}

impl SerialConfig {
    /// Parse `portname`, `baudrate`, and the optional `stopbits` (1, 1.5, 2),
    /// `databits` (5 to 8) and `parity` (none, even, odd, mark, space)
    pub fn from_params(params: &LinkParams) -> Result<Self> {
        let mut reader = ParamReader::new(params);
        let portname = reader.required_str("portname");
        let baudrate = reader.integer("baudrate", 1..=u32::MAX as u64, true);

        let stopbits = match reader.number("stopbits") {
            None if reader.get("stopbits").is_none() => Some(StopBits::One),
            Some(v) if v == 1.0 => Some(StopBits::One),
            Some(v) if v == 1.5 => Some(StopBits::OnePointFive),
            Some(v) if v == 2.0 => Some(StopBits::Two),
            Some(v) => {
                reader.problem(format!("stopbits must be 1, 1.5 or 2, got {}", v));
                None
            }
            None => None,
        };

        let databits = match reader.integer("databits", 5..=8, false) {
            Some(5) => Some(DataBits::Five),
            Some(6) => Some(DataBits::Six),
            Some(7) => Some(DataBits::Seven),
            Some(8) => Some(DataBits::Eight),
            _ if reader.get("databits").is_none() => Some(DataBits::Eight),
            _ => None,
        };

        let parity = match reader.optional_str("parity").as_deref().map(str::to_ascii_lowercase) {
            None if reader.get("parity").is_none() => Some(Parity::None),
            None => None,
            Some(p) => match p.as_str() {
                "none" => Some(Parity::None),
                "even" => Some(Parity::Even),
                "odd" => Some(Parity::Odd),
                "mark" => Some(Parity::Mark),
                "space" => Some(Parity::Space),
                other => {
                    reader.problem(format!(
                        "parity must be one of none, even, odd, mark, space, got {}",
                        other
                    ));
                    None
                }
            },
        };

        let config = match (portname, baudrate, stopbits, databits, parity) {
            (Some(portname), Some(baudrate), Some(stopbits), Some(databits), Some(parity)) => {
                Some(SerialConfig {
                    portname,
                    baudrate: baudrate as u32,
                    stopbits,
                    databits,
                    parity,
                })
            }
            _ => None,
        };
        reader.finish("serial", config)
    }
}

/// Names of the serial ports present on this machine
pub fn list_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            tracing::warn!("Failed to enumerate serial ports: {}", e);
            Vec::new()
        }
    }
}

pub struct SerialLink {
    config: SerialConfig,
    port: Option<Box<dyn serialport::SerialPort>>,
    stats: LinkStats,
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink")
            .field("config", &self.config)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl SerialLink {
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            port: None,
            stats: LinkStats::default(),
        }
    }

    pub fn validate_config(params: &LinkParams) -> Result<()> {
        SerialConfig::from_params(params).map(|_| ())
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    fn open_port(&self) -> Result<Box<dyn serialport::SerialPort>> {
        let stop_bits = match self.config.stopbits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
            StopBits::OnePointFive => {
                return Err(WatchError::LinkIo(
                    "1.5 stop bits are not supported by the serial backend".into(),
                ))
            }
        };
        let parity = match self.config.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Mark | Parity::Space => {
                return Err(WatchError::LinkIo(format!(
                    "{:?} parity is not supported by the serial backend",
                    self.config.parity
                )))
            }
        };
        let data_bits = match self.config.databits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        };

        let port = serialport::new(&self.config.portname, self.config.baudrate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(10))
            .open()?;
        Ok(port)
    }

    fn degrade(&mut self, what: &str, err: impl std::fmt::Display) {
        tracing::error!("Serial {} on {} failed: {}", what, self.config.portname, err);
        self.stats.io_errors += 1;
        self.port = None;
    }
}

impl DeviceLink for SerialLink {
    fn kind(&self) -> &'static str {
        "serial"
    }

    fn initialize(&mut self) -> Result<()> {
        self.destroy();
        tracing::info!(
            "Opening serial port {} at {} baud",
            self.config.portname,
            self.config.baudrate
        );
        let port = self.open_port()?;
        self.port = Some(port);
        Ok(())
    }

    fn destroy(&mut self) {
        if self.port.take().is_some() {
            tracing::info!("Closed serial port {}", self.config.portname);
        }
    }

    fn read(&mut self) -> Option<Vec<u8>> {
        let port = self.port.as_mut()?;
        let available = match port.bytes_to_read() {
            Ok(n) => n as usize,
            Err(e) => {
                self.degrade("poll", e);
                return None;
            }
        };
        if available == 0 {
            return None;
        }
        let mut buffer = vec![0u8; available.min(READ_CHUNK)];
        match port.read(&mut buffer) {
            Ok(0) => None,
            Ok(n) => {
                buffer.truncate(n);
                self.stats.bytes_read += n as u64;
                Some(buffer)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => None,
            Err(e) => {
                self.degrade("read", e);
                None
            }
        }
    }

    fn write(&mut self, data: &[u8]) {
        let Some(port) = self.port.as_mut() else {
            return;
        };
        match port.write_all(data).and_then(|_| port.flush()) {
            Ok(()) => self.stats.bytes_written += data.len() as u64,
            Err(e) => self.degrade("write", e),
        }
    }

    fn operational(&self) -> bool {
        self.port.is_some()
    }

    fn stats(&self) -> LinkStats {
        self.stats
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: serde_json::Value) -> LinkParams {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config =
            SerialConfig::from_params(&params(json!({"portname": "/dev/ttyUSB0", "baudrate": 115200})))
                .unwrap();
        assert_eq!(config.stopbits, StopBits::One);
        assert_eq!(config.databits, DataBits::Eight);
        assert_eq!(config.parity, Parity::None);
    }

    #[test]
    fn test_full_config() {
        let config = SerialConfig::from_params(&params(json!({
            "portname": "COM3",
            "baudrate": "9600",
            "stopbits": "1.5",
            "databits": 7,
            "parity": "Mark",
        })))
        .unwrap();
        assert_eq!(config.baudrate, 9600);
        assert_eq!(config.stopbits, StopBits::OnePointFive);
        assert_eq!(config.databits, DataBits::Seven);
        assert_eq!(config.parity, Parity::Mark);
    }

    #[test]
    fn test_every_problem_reported() {
        let err = SerialLink::validate_config(&params(json!({
            "baudrate": 0,
            "stopbits": 3,
            "databits": 9,
            "parity": "sometimes",
        })))
        .unwrap_err();
        match err {
            WatchError::InvalidLinkConfig { link, problems } => {
                assert_eq!(link, "serial");
                assert_eq!(problems.len(), 5, "{:?}", problems);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unopened_link_is_inert() {
        let config =
            SerialConfig::from_params(&params(json!({"portname": "/dev/null-port", "baudrate": 9600})))
                .unwrap();
        let mut link = SerialLink::new(config);
        assert!(!link.operational());
        assert!(link.read().is_none());
        link.write(b"abc");
        assert_eq!(link.stats(), LinkStats::default());
    }
}
