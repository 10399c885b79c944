//! Device synchronization
//!
//! Everything that runs on the I/O thread lives here:
//!
//! - [`ValuePipeline`] - server id bindings and value conversion
//! - [`DeviceProtocol`] - seam to the framing layer
//! - [`SyncWorker`] - the I/O loop owning the link and the write dispatcher
//! - [`SyncHandle`] - what other threads use to request writes or stop it
//!
//! # Example
//!
//! ```ignore
//! use watchlink_rs::{config::CoreConfig, link, registry::WatchableRegistry};
//! use watchlink_rs::sync::{SyncWorker, ValuePipeline};
//! use std::sync::Arc;
//!
//! let config = CoreConfig::load("core.toml")?;
//! let link = link::create_link(&config.link.kind, &config.link.params)?;
//! let registry = Arc::new(WatchableRegistry::new());
//! let pipeline = ValuePipeline::new();
//! pipeline.populate_registry(&registry)?;
//!
//! let (worker, handle) = SyncWorker::new(&config, link, protocol, pipeline, registry);
//! let thread = worker.spawn()?;
//! handle.write("var-12", 3.0)?.wait_for_completion(Duration::from_secs(1))?;
//! handle.shutdown();
//! thread.join().ok();
//! ```

pub mod pipeline;
pub mod protocol;
pub mod worker;

pub use pipeline::{Binding, ValuePipeline};
pub use protocol::{DeviceEvent, DeviceProtocol};
pub use worker::{SyncCommand, SyncHandle, SyncStats, SyncWorker, RECONNECT_INTERVAL};
