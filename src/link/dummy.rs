//! In-memory link
//!
//! Useful for tests and dry runs. Bytes pushed through a [`DummyLinkHandle`]
//! come out of `read()`, and bytes passed to `write()` can be collected
//! from the handle. With `loopback` enabled, writes are also fed back to
//! `read()`.

use super::{DeviceLink, LinkParams, LinkStats, ParamReader};
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Default)]
struct DummyChannel {
    to_host: VecDeque<Vec<u8>>,
    from_host: Vec<Vec<u8>>,
    broken: bool,
}

/// Device side of a [`DummyLink`]
#[derive(Debug, Clone, Default)]
pub struct DummyLinkHandle {
    channel: Arc<Mutex<DummyChannel>>,
}

impl DummyLinkHandle {
    /// Queue bytes for the host to read
    pub fn inject(&self, data: impl Into<Vec<u8>>) {
        self.channel.lock().to_host.push_back(data.into());
    }

    /// Drain everything the host wrote so far
    pub fn take_written(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.channel.lock().from_host)
    }

    /// Make the next I/O fail as if the connection dropped
    pub fn set_broken(&self, broken: bool) {
        self.channel.lock().broken = broken;
    }
}

#[derive(Debug)]
pub struct DummyLink {
    handle: DummyLinkHandle,
    loopback: bool,
    open: bool,
    stats: LinkStats,
}

impl Default for DummyLink {
    fn default() -> Self {
        Self::new(false)
    }
}

impl DummyLink {
    pub fn new(loopback: bool) -> Self {
        Self {
            handle: DummyLinkHandle::default(),
            loopback,
            open: false,
            stats: LinkStats::default(),
        }
    }

    /// Accepts an optional `loopback` boolean
    pub fn from_params(params: &LinkParams) -> Result<Self> {
        let mut reader = ParamReader::new(params);
        let loopback = reader.boolean("loopback").unwrap_or(false);
        reader.finish("dummy", Some(Self::new(loopback)))
    }

    pub fn validate_config(params: &LinkParams) -> Result<()> {
        Self::from_params(params).map(|_| ())
    }

    pub fn handle(&self) -> DummyLinkHandle {
        self.handle.clone()
    }

    fn degrade(&mut self) {
        tracing::error!("Dummy link broken");
        self.stats.io_errors += 1;
        self.open = false;
    }
}

impl DeviceLink for DummyLink {
    fn kind(&self) -> &'static str {
        "dummy"
    }

    fn initialize(&mut self) -> Result<()> {
        self.handle.channel.lock().broken = false;
        self.open = true;
        Ok(())
    }

    fn destroy(&mut self) {
        self.open = false;
    }

    fn read(&mut self) -> Option<Vec<u8>> {
        if !self.open {
            return None;
        }
        let mut channel = self.handle.channel.lock();
        if channel.broken {
            drop(channel);
            self.degrade();
            return None;
        }
        let mut data = Vec::new();
        while let Some(chunk) = channel.to_host.pop_front() {
            data.extend_from_slice(&chunk);
        }
        drop(channel);
        if data.is_empty() {
            return None;
        }
        self.stats.bytes_read += data.len() as u64;
        Some(data)
    }

    fn write(&mut self, data: &[u8]) {
        if !self.open {
            return;
        }
        let mut channel = self.handle.channel.lock();
        if channel.broken {
            drop(channel);
            self.degrade();
            return;
        }
        channel.from_host.push(data.to_vec());
        if self.loopback {
            channel.to_host.push_back(data.to_vec());
        }
        drop(channel);
        self.stats.bytes_written += data.len() as u64;
    }

    fn operational(&self) -> bool {
        self.open
    }

    fn stats(&self) -> LinkStats {
        self.stats
    }
}
