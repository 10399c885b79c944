//! Device links
//!
//! A [`DeviceLink`] moves raw bytes between the host and the device. Every
//! transport follows the same failure policy: an I/O error never escapes
//! `read()` or `write()`. The link closes its resource, counts the error and
//! reports `operational() == false` until `initialize()` succeeds again.
//!
//! # Transports
//!
//! | kind     | type           | required params               | optional params (default)                                   |
//! |----------|----------------|-------------------------------|-------------------------------------------------------------|
//! | `serial` | [`SerialLink`] | `portname`, `baudrate`        | `stopbits` (1), `databits` (8), `parity` (`none`)           |
//! | `udp`    | [`UdpLink`]    | `host`, `port`                |                                                             |
//! | `rtt`    | [`RttLink`]    | `target_device`, `interface`  | `write_timeout` (1 s), `speed_khz` (4000), `probe` (first)  |
//! | `dummy`  | [`DummyLink`]  |                               | `loopback` (false)                                          |
//!
//! An optional parameter that is present must still be valid: a bad
//! `parity` is a problem, a missing one is the default.
//!
//! Links are built through [`create_link`], which looks the kind up in a
//! static constructor table.

pub mod dummy;
pub mod rtt;
pub mod serial;
pub mod udp;

pub use dummy::{DummyLink, DummyLinkHandle};
pub use rtt::{RttConfig, RttInterface, RttLink};
pub use serial::{DataBits, Parity, SerialConfig, SerialLink, StopBits};
pub use udp::{UdpConfig, UdpLink};

use crate::error::{Result, WatchError};
use serde_json::{Map, Value as JsonValue};

/// Flat key/value parameters of a link
pub type LinkParams = Map<String, JsonValue>;

/// Traffic counters kept by every link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// I/O errors that degraded the link
    pub io_errors: u64,
}

/// Byte transport to a device
///
/// Owned by the I/O thread. Implementations must be `Send` so the link can
/// be moved into that thread.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceLink: Send {
    /// Transport name as used by [`create_link`]
    fn kind(&self) -> &'static str;

    /// Open the underlying resource. Calling it on an operational link
    /// reopens it.
    fn initialize(&mut self) -> Result<()>;

    /// Close the underlying resource. Safe to call at any time.
    fn destroy(&mut self);

    /// Non-blocking read of whatever is available
    fn read(&mut self) -> Option<Vec<u8>>;

    /// Best-effort write. Becomes a no-op once the link degraded.
    fn write(&mut self, data: &[u8]);

    fn operational(&self) -> bool;

    /// Periodic housekeeping
    fn process(&mut self) {}

    fn stats(&self) -> LinkStats;
}

/// Collects parameter problems so every one of them can be reported at once
pub(crate) struct ParamReader<'a> {
    params: &'a LinkParams,
    problems: Vec<String>,
}

impl<'a> ParamReader<'a> {
    pub(crate) fn new(params: &'a LinkParams) -> Self {
        Self {
            params,
            problems: Vec::new(),
        }
    }

    pub(crate) fn problem(&mut self, message: impl Into<String>) {
        self.problems.push(message.into());
    }

    pub(crate) fn get(&self, key: &str) -> Option<&'a JsonValue> {
        self.params.get(key).filter(|v| !v.is_null())
    }

    pub(crate) fn required_str(&mut self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(JsonValue::String(s)) if !s.trim().is_empty() => Some(s.clone()),
            Some(JsonValue::String(_)) => {
                self.problem(format!("{} must not be empty", key));
                None
            }
            Some(other) => {
                self.problem(format!("{} must be a string, got {}", key, other));
                None
            }
            None => {
                self.problem(format!("missing {}", key));
                None
            }
        }
    }

    pub(crate) fn optional_str(&mut self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(JsonValue::String(s)) => Some(s.clone()),
            Some(other) => {
                self.problem(format!("{} must be a string, got {}", key, other));
                None
            }
            None => None,
        }
    }

    /// Integer in `range`, accepting a JSON number or a numeric string
    pub(crate) fn integer(
        &mut self,
        key: &str,
        range: std::ops::RangeInclusive<u64>,
        required: bool,
    ) -> Option<u64> {
        let raw = self.get(key);
        let parsed = match raw {
            Some(JsonValue::Number(n)) => n.as_u64(),
            Some(JsonValue::String(s)) => s.trim().parse::<u64>().ok(),
            Some(_) => None,
            None => {
                if required {
                    self.problem(format!("missing {}", key));
                }
                return None;
            }
        };
        match parsed {
            Some(v) if range.contains(&v) => Some(v),
            _ => {
                self.problem(format!(
                    "{} must be an integer in {}..={}, got {}",
                    key,
                    range.start(),
                    range.end(),
                    raw.map(|v| v.to_string()).unwrap_or_default()
                ));
                None
            }
        }
    }

    /// Finite number, accepting a JSON number or a numeric string
    pub(crate) fn number(&mut self, key: &str) -> Option<f64> {
        let raw = self.get(key)?;
        let parsed = match raw {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        match parsed {
            Some(v) if v.is_finite() => Some(v),
            _ => {
                self.problem(format!("{} must be a number, got {}", key, raw));
                None
            }
        }
    }

    pub(crate) fn boolean(&mut self, key: &str) -> Option<bool> {
        match self.get(key)? {
            JsonValue::Bool(b) => Some(*b),
            other => {
                self.problem(format!("{} must be a boolean, got {}", key, other));
                None
            }
        }
    }

    /// Fail with every collected problem, or hand back `value`
    pub(crate) fn finish<T>(self, link: &str, value: Option<T>) -> Result<T> {
        match value {
            Some(value) if self.problems.is_empty() => Ok(value),
            _ => {
                let mut problems = self.problems;
                if problems.is_empty() {
                    problems.push("incomplete configuration".to_string());
                }
                Err(WatchError::InvalidLinkConfig {
                    link: link.to_string(),
                    problems,
                })
            }
        }
    }
}

type Constructor = fn(&LinkParams) -> Result<Box<dyn DeviceLink>>;
type Validator = fn(&LinkParams) -> Result<()>;

struct LinkEntry {
    kind: &'static str,
    construct: Constructor,
    validate: Validator,
}

fn build_serial(params: &LinkParams) -> Result<Box<dyn DeviceLink>> {
    Ok(Box::new(SerialLink::new(SerialConfig::from_params(params)?)))
}

fn build_udp(params: &LinkParams) -> Result<Box<dyn DeviceLink>> {
    Ok(Box::new(UdpLink::new(UdpConfig::from_params(params)?)?))
}

fn build_rtt(params: &LinkParams) -> Result<Box<dyn DeviceLink>> {
    Ok(Box::new(RttLink::new(RttConfig::from_params(params)?)))
}

fn build_dummy(params: &LinkParams) -> Result<Box<dyn DeviceLink>> {
    Ok(Box::new(DummyLink::from_params(params)?))
}

const LINK_TYPES: &[LinkEntry] = &[
    LinkEntry {
        kind: "serial",
        construct: build_serial,
        validate: SerialLink::validate_config,
    },
    LinkEntry {
        kind: "udp",
        construct: build_udp,
        validate: UdpLink::validate_config,
    },
    LinkEntry {
        kind: "rtt",
        construct: build_rtt,
        validate: RttLink::validate_config,
    },
    LinkEntry {
        kind: "dummy",
        construct: build_dummy,
        validate: DummyLink::validate_config,
    },
];

fn lookup(kind: &str) -> Result<&'static LinkEntry> {
    LINK_TYPES
        .iter()
        .find(|entry| entry.kind == kind)
        .ok_or_else(|| WatchError::UnknownLink(kind.to_string()))
}

/// Names accepted by [`create_link`]
pub fn available_link_types() -> Vec<&'static str> {
    LINK_TYPES.iter().map(|entry| entry.kind).collect()
}

/// Check a link configuration without building the link
pub fn validate_link_config(kind: &str, params: &LinkParams) -> Result<()> {
    (lookup(kind)?.validate)(params)
}

/// Build a link from its kind and parameters. The link is not initialized.
pub fn create_link(kind: &str, params: &LinkParams) -> Result<Box<dyn DeviceLink>> {
    let entry = lookup(kind)?;
    let link = (entry.construct)(params)?;
    tracing::info!("Created {} link", kind);
    Ok(link)
}
