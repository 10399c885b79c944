//! RTT link over a debug probe
//!
//! Bytes travel through the target's RTT up channel 0 (device to host) and
//! down channel 0 (host to device). The link is operational only when the
//! probe is open, the target is attached and the RTT control block was found.

use super::{DeviceLink, LinkParams, LinkStats, ParamReader};
use crate::error::{Result, WatchError};
use probe_rs::probe::list::Lister;
use probe_rs::rtt::Rtt;
use probe_rs::{Permissions, Session};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

const READ_CHUNK: usize = 1024;
const DEFAULT_SPEED_KHZ: u32 = 4000;
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Debug interface between probe and target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RttInterface {
    Swd,
    Jtag,
}

impl RttInterface {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "swd" => Some(RttInterface::Swd),
            "jtag" => Some(RttInterface::Jtag),
            _ => None,
        }
    }

    fn wire_protocol(self) -> probe_rs::probe::WireProtocol {
        match self {
            RttInterface::Swd => probe_rs::probe::WireProtocol::Swd,
            RttInterface::Jtag => probe_rs::probe::WireProtocol::Jtag,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RttConfig {
    /// probe-rs target name, e.g. `STM32F407VGTx`
    pub target_device: String,
    pub interface: RttInterface,
    pub write_timeout: Duration,
    /// `VID:PID` or a serial number fragment. First probe if absent.
    pub probe: Option<String>,
    pub speed_khz: u32,
}

impl RttConfig {
    /// Parse `target_device`, `interface` and the optional `write_timeout`
    /// (seconds), `probe` and `speed_khz`
    pub fn from_params(params: &LinkParams) -> Result<Self> {
        let mut reader = ParamReader::new(params);
        let target_device = reader.required_str("target_device");
        let interface = match reader.required_str("interface") {
            Some(name) => {
                let parsed = RttInterface::from_name(&name);
                if parsed.is_none() {
                    reader.problem(format!("interface must be swd or jtag, got {}", name));
                }
                parsed
            }
            None => None,
        };
        let write_timeout = match reader.number("write_timeout") {
            Some(secs) if secs > 0.0 => match Duration::try_from_secs_f64(secs) {
                Ok(timeout) => Some(timeout),
                Err(_) => {
                    reader.problem(format!("write_timeout out of range, got {}", secs));
                    None
                }
            },
            Some(secs) => {
                reader.problem(format!("write_timeout must be positive, got {}", secs));
                None
            }
            None if reader.get("write_timeout").is_none() => Some(DEFAULT_WRITE_TIMEOUT),
            None => None,
        };
        let probe = reader.optional_str("probe");
        let speed_khz = reader
            .integer("speed_khz", 1..=100_000, false)
            .map(|v| v as u32)
            .unwrap_or(DEFAULT_SPEED_KHZ);

        let config = match (target_device, interface, write_timeout) {
            (Some(target_device), Some(interface), Some(write_timeout)) => Some(RttConfig {
                target_device,
                interface,
                write_timeout,
                probe,
                speed_khz,
            }),
            _ => None,
        };
        reader.finish("rtt", config)
    }
}

pub struct RttLink {
    config: RttConfig,
    session: Option<Session>,
    rtt: Option<Rtt>,
    initialized: bool,
    stats: LinkStats,
}

impl std::fmt::Debug for RttLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RttLink")
            .field("config", &self.config)
            .field("attached", &self.session.is_some())
            .field("rtt", &self.rtt.is_some())
            .field("initialized", &self.initialized)
            .finish()
    }
}

impl RttLink {
    pub fn new(config: RttConfig) -> Self {
        Self {
            config,
            session: None,
            rtt: None,
            initialized: false,
            stats: LinkStats::default(),
        }
    }

    pub fn validate_config(params: &LinkParams) -> Result<()> {
        RttConfig::from_params(params).map(|_| ())
    }

    pub fn config(&self) -> &RttConfig {
        &self.config
    }

    fn open_probe(&self) -> Result<probe_rs::probe::Probe> {
        let probes = Lister::new().list_all();
        let selected = match &self.config.probe {
            Some(selector) => {
                let selector = selector.to_lowercase();
                probes.into_iter().find(|p| {
                    format!("{:04x}:{:04x}", p.vendor_id, p.product_id) == selector
                        || p.serial_number
                            .as_ref()
                            .is_some_and(|s| s.to_lowercase().contains(&selector))
                })
            }
            None => probes.into_iter().next(),
        };
        let info = selected.ok_or_else(|| WatchError::LinkIo("no matching debug probe".into()))?;
        Ok(info.open()?)
    }

    fn attach(&self) -> Result<(Session, Rtt)> {
        let mut probe = self.open_probe()?;
        if let Err(e) = probe.set_speed(self.config.speed_khz) {
            tracing::warn!("Failed to set probe speed: {}", e);
        }
        probe.select_protocol(self.config.interface.wire_protocol())?;
        let mut session = probe.attach(self.config.target_device.as_str(), Permissions::default())?;
        let rtt = {
            let mut core = session.core(0)?;
            Rtt::attach(&mut core)
                .map_err(|e| WatchError::LinkIo(format!("RTT control block not found: {}", e)))?
        };
        Ok((session, rtt))
    }

    fn degrade(&mut self, what: &str, err: impl std::fmt::Display) {
        tracing::error!("RTT {} on {} failed: {}", what, self.config.target_device, err);
        self.stats.io_errors += 1;
        self.rtt = None;
        self.session = None;
        self.initialized = false;
    }
}

impl DeviceLink for RttLink {
    fn kind(&self) -> &'static str {
        "rtt"
    }

    fn initialize(&mut self) -> Result<()> {
        self.destroy();
        tracing::info!(
            "Attaching RTT link to {} over {:?}",
            self.config.target_device,
            self.config.interface
        );
        let (session, rtt) = self.attach()?;
        self.session = Some(session);
        self.rtt = Some(rtt);
        self.initialized = true;
        Ok(())
    }

    fn destroy(&mut self) {
        self.initialized = false;
        self.rtt = None;
        if self.session.take().is_some() {
            tracing::info!("Detached RTT link from {}", self.config.target_device);
        }
    }

    fn read(&mut self) -> Option<Vec<u8>> {
        if !self.operational() {
            return None;
        }
        let (session, rtt) = (self.session.as_mut()?, self.rtt.as_mut()?);
        let mut buffer = vec![0u8; READ_CHUNK];
        let result = session.core(0).map_err(|e| e.to_string()).and_then(|mut core| {
            match rtt.up_channel(0) {
                Some(channel) => channel.read(&mut core, &mut buffer).map_err(|e| e.to_string()),
                None => Err("target has no RTT up channel".to_string()),
            }
        });
        match result {
            Ok(0) => None,
            Ok(n) => {
                buffer.truncate(n);
                self.stats.bytes_read += n as u64;
                Some(buffer)
            }
            Err(e) => {
                self.degrade("read", e);
                None
            }
        }
    }

    fn write(&mut self, data: &[u8]) {
        if !self.operational() {
            return;
        }
        let timeout = self.config.write_timeout;
        let (Some(session), Some(rtt)) = (self.session.as_mut(), self.rtt.as_mut()) else {
            return;
        };
        let result = session.core(0).map_err(|e| e.to_string()).and_then(|mut core| {
            let channel = rtt
                .down_channel(0)
                .ok_or_else(|| "target has no RTT down channel".to_string())?;
            let deadline = Instant::now().checked_add(timeout);
            let mut written = 0;
            while written < data.len() && deadline.map_or(true, |d| Instant::now() < d) {
                written += channel
                    .write(&mut core, &data[written..])
                    .map_err(|e| e.to_string())?;
            }
            Ok(written)
        });
        match result {
            Ok(n) => {
                self.stats.bytes_written += n as u64;
                if n < data.len() {
                    tracing::warn!(
                        "RTT write timed out, dropped {} of {} bytes",
                        data.len() - n,
                        data.len()
                    );
                }
            }
            Err(e) => self.degrade("write", e),
        }
    }

    fn operational(&self) -> bool {
        self.initialized && self.session.is_some() && self.rtt.is_some()
    }

    fn stats(&self) -> LinkStats {
        self.stats
    }
}

impl Drop for RttLink {
    fn drop(&mut self) {
        self.destroy();
    }
}
