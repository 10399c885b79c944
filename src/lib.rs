//! # watchlink-rs: watchable value synchronization core
//!
//! Keeps a host-side view of values living in an embedded device's memory
//! and lets several consumers observe and modify them concurrently.
//!
//! ## Architecture
//!
//! - **Link**: byte transports to the device (serial, UDP, RTT through
//!   probe-rs, and an in-memory dummy), built from a flat parameter map
//! - **Codec**: raw memory bytes to typed values and back, with bitfields
//! - **Alias**: user-facing names over variables or RPVs with a linear
//!   transform and a valid range
//! - **Registry**: one tree of watchables per type, watcher subscriptions
//!   and the fan-out of value updates
//! - **Write**: request lifecycle and per-entry ordering of writes
//! - **Listener**: consumers running on their own thread behind a bounded
//!   queue
//! - **Sync**: the I/O loop tying link, decoding, broadcast and writes
//!   together
//!
//! Threads talk through crossbeam channels. The registry is the only shared
//! mutable state and never calls out while holding its lock.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use watchlink_rs::{
//!     config::CoreConfig,
//!     link,
//!     listener::{BaseListener, BufferedReaderListener},
//!     registry::WatchableRegistry,
//!     sync::{SyncWorker, ValuePipeline},
//! };
//!
//! let config = CoreConfig::load_or_default("watchlink.toml");
//! let registry = Arc::new(WatchableRegistry::new());
//! let pipeline = build_pipeline()?;
//! pipeline.populate_registry(&registry)?;
//!
//! let link = link::create_link(&config.link.kind, &config.link.params)?;
//! let (worker, sync) = SyncWorker::new(&config, link, protocol, pipeline, registry.clone());
//! let io_thread = worker.spawn()?;
//!
//! let (reader, updates) = BufferedReaderListener::new();
//! let mut listener = BaseListener::new("ui", reader, registry, config.listener.clone());
//! listener.subscribe(["var:/motor/speed"])?;
//! listener.start()?;
//!
//! for update in updates.iter() {
//!     println!("{} = {}", update.fqn, update.value);
//! }
//! ```

pub mod alias;
pub mod codec;
pub mod config;
pub mod error;
pub mod link;
pub mod listener;
pub mod registry;
pub mod sync;
pub mod types;
pub mod write;

// Re-export commonly used types
pub use alias::{AliasDefinition, OutOfRangePolicy};
pub use config::CoreConfig;
pub use error::{Result, ResultExt, WatchError};
pub use link::{create_link, DeviceLink};
pub use listener::{BaseListener, Listener, ListenerUpdate};
pub use registry::{Fqn, WatchableRegistry};
pub use sync::{SyncHandle, SyncWorker, ValuePipeline};
pub use types::{
    Endianness, Value, ValueUpdate, Variable, VariableType, WatchableConfiguration,
    WatchableType,
};
pub use write::{WriteRequest, WriteStatus};
