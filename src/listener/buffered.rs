//! Listener that hands updates back to the caller through a channel

use super::{Listener, ListenerUpdate};
use crate::error::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};

/// Forwards every update, one by one, to a channel read by the caller
pub struct BufferedReaderListener {
    tx: Sender<ListenerUpdate>,
}

impl BufferedReaderListener {
    pub fn new() -> (Self, Receiver<ListenerUpdate>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl Listener for BufferedReaderListener {
    fn receive(&mut self, updates: &[ListenerUpdate]) -> Result<()> {
        for update in updates {
            // Reader gone: nothing left to deliver to
            if self.tx.send(update.clone()).is_err() {
                break;
            }
        }
        Ok(())
    }
}
