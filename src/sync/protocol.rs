//! Protocol seam between raw link bytes and the value pipeline
//!
//! Framing, checksums and the server wire format live outside this crate.
//! A [`DeviceProtocol`] implementation turns incoming bytes into
//! [`DeviceEvent`]s and wraps outgoing writes into frames.

use crate::error::Result;
use crate::types::ServerId;

/// Something the device reported
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Raw memory bytes for a set of watchables, in device order
    Values(Vec<(ServerId, Vec<u8>)>),
    /// The device answered the in-flight write for `server_id`
    WriteCompleted {
        server_id: ServerId,
        success: bool,
        message: Option<String>,
    },
}

/// Framing layer used by the sync worker
#[cfg_attr(test, mockall::automock)]
pub trait DeviceProtocol: Send {
    /// Feed bytes read from the link. Partial frames are kept for the next call.
    fn decode(&mut self, bytes: &[u8]) -> Vec<DeviceEvent>;

    /// Frame a write of `payload` to the device entry `server_id`
    fn encode_write(&mut self, server_id: &str, payload: &[u8]) -> Result<Vec<u8>>;

    /// Frame asking the device to start or stop sending `server_id`, if the
    /// protocol needs one
    fn encode_subscription(&mut self, server_id: &str, watched: bool) -> Option<Vec<u8>>;

    /// Drop any partial state, called after the link was reinitialized
    fn reset(&mut self) {}
}
