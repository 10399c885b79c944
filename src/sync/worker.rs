//! Sync worker thread
//!
//! The worker is the only owner of the device link. Each loop iteration it:
//!
//! - drains the command queue (writes, subscription changes, shutdown)
//! - gives the link its housekeeping call and reopens it when degraded
//! - reads bytes, decodes them into values and broadcasts them through the
//!   registry
//! - resolves writes the device acknowledged, publishes the written value
//!   and dispatches the next ones
//! - fails writes the device never answered
//!
//! When a loop iteration had nothing to do the worker sleeps for
//! `sync.idle_sleep_us`.
//!
//! # Subscriptions
//!
//! The registry reports the first and last watcher of an entry, and every
//! cleared tree, through its global callbacks. Each report makes the worker
//! rebuild its map of device entries from the registry's watched set (an
//! alias maps to its target) and send only the differences, so the device is
//! asked to start sending an entry once and to stop once. A lost or
//! reordered report is corrected by the next one. All active subscriptions
//! are sent again after the link reconnects.

use super::pipeline::ValuePipeline;
use super::protocol::{DeviceEvent, DeviceProtocol};
use crate::config::CoreConfig;
use crate::error::{Result, WatchError};
use crate::link::DeviceLink;
use crate::registry::{WatchEdge, WatchableRegistry};
use crate::types::{ServerId, WatchableType};
use crate::write::{WriteDispatcher, WriteRequest};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Minimum time between two attempts to reopen a degraded link
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Reads performed per loop iteration before yielding to commands
const MAX_READS_PER_STEP: usize = 64;

/// Command sent to the sync worker
#[derive(Debug, Clone)]
pub enum SyncCommand {
    /// Queue a write
    Write(Arc<WriteRequest>),
    /// Queue several writes in order
    WriteBatch(Vec<Arc<WriteRequest>>),
    /// An entry got its first watcher (`watched`) or lost its last one
    Subscription { server_id: ServerId, watched: bool },
    /// Subscriptions were dropped without edges, rebuild from the registry
    Resync,
    /// Stop the worker loop
    Shutdown,
}

/// Worker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub updates_broadcast: u64,
    pub writes_dispatched: u64,
    pub writes_failed: u64,
    pub reconnects: u64,
}

/// Cloneable handle used by other threads to talk to the worker
#[derive(Debug, Clone)]
pub struct SyncHandle {
    command_tx: Sender<SyncCommand>,
    running: Arc<AtomicBool>,
    dropped_subscriptions: Arc<AtomicU64>,
}

impl SyncHandle {
    fn send(&self, command: SyncCommand) -> bool {
        self.running.load(Ordering::SeqCst) && self.command_tx.send(command).is_ok()
    }

    /// Request a write. The returned request resolves once the device
    /// answered, or fails if it cannot be delivered.
    pub fn write(&self, server_id: impl Into<ServerId>, value: f64) -> Result<Arc<WriteRequest>> {
        let request = WriteRequest::new(server_id, value);
        if self.send(SyncCommand::Write(Arc::clone(&request))) {
            Ok(request)
        } else {
            request.mark_failed("sync worker is not running");
            Err(WatchError::OperationFailure(
                "sync worker is not running".into(),
            ))
        }
    }

    /// Request several writes. Writes to the same entry complete in the
    /// order given.
    pub fn batch_write<I, S>(&self, items: I) -> Result<Vec<Arc<WriteRequest>>>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<ServerId>,
    {
        let requests: Vec<Arc<WriteRequest>> = items
            .into_iter()
            .map(|(server_id, value)| WriteRequest::new(server_id, value))
            .collect();
        if self.send(SyncCommand::WriteBatch(requests.clone())) {
            Ok(requests)
        } else {
            for request in &requests {
                request.mark_failed("sync worker is not running");
            }
            Err(WatchError::OperationFailure(
                "sync worker is not running".into(),
            ))
        }
    }

    /// Ask the worker to stop. Pending writes are failed.
    pub fn shutdown(&self) {
        let _ = self.command_tx.try_send(SyncCommand::Shutdown);
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Subscription changes lost because the command queue was full
    pub fn dropped_subscriptions(&self) -> u64 {
        self.dropped_subscriptions.load(Ordering::Relaxed)
    }
}

pub struct SyncWorker {
    config: CoreConfig,
    command_rx: Receiver<SyncCommand>,
    running: Arc<AtomicBool>,
    link: Box<dyn DeviceLink>,
    protocol: Box<dyn DeviceProtocol>,
    pipeline: ValuePipeline,
    registry: Arc<WatchableRegistry>,
    dispatcher: WriteDispatcher,
    /// Device key to number of watched server ids mapped onto it
    device_watch: HashMap<ServerId, usize>,
    /// Bytes of the in-flight write per device key, published once acknowledged
    written: HashMap<ServerId, (ServerId, Vec<u8>)>,
    last_reconnect: Option<Instant>,
    stats: SyncStats,
}

impl SyncWorker {
    /// Create a worker and its handle
    ///
    /// Installs the registry's global watch and clear callbacks so that
    /// subscription changes reach the worker. Entries already watched are picked up.
    pub fn new(
        config: &CoreConfig,
        link: Box<dyn DeviceLink>,
        protocol: Box<dyn DeviceProtocol>,
        pipeline: ValuePipeline,
        registry: Arc<WatchableRegistry>,
    ) -> (Self, SyncHandle) {
        let (command_tx, command_rx) = bounded(256);
        let running = Arc::new(AtomicBool::new(true));
        let dropped_subscriptions = Arc::new(AtomicU64::new(0));

        let edge_sender = |watched: bool| {
            let tx = command_tx.clone();
            let dropped = Arc::clone(&dropped_subscriptions);
            Arc::new(move |edge: &WatchEdge| {
                let command = SyncCommand::Subscription {
                    server_id: edge.configuration.server_id.clone(),
                    watched,
                };
                if tx.try_send(command).is_err() {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Sync queue full, subscription change for {} lost", edge.fqn);
                }
            })
        };
        registry.register_global_watch_callback(edge_sender(true), edge_sender(false));
        let tx = command_tx.clone();
        let dropped = Arc::clone(&dropped_subscriptions);
        registry.register_global_clear_callback(Arc::new(move |watchable_type: WatchableType| {
            if tx.try_send(SyncCommand::Resync).is_err() {
                dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Sync queue full, resync after {} clear lost", watchable_type);
            }
        }));

        let mut worker = Self {
            config: config.clone(),
            command_rx,
            running: Arc::clone(&running),
            link,
            protocol,
            pipeline,
            registry,
            dispatcher: WriteDispatcher::new(),
            device_watch: HashMap::new(),
            written: HashMap::new(),
            last_reconnect: None,
            stats: SyncStats::default(),
        };
        worker.reconcile_subscriptions();

        let handle = SyncHandle {
            command_tx,
            running,
            dropped_subscriptions,
        };
        (worker, handle)
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    pub fn link(&self) -> &dyn DeviceLink {
        self.link.as_ref()
    }

    pub fn pipeline(&self) -> &ValuePipeline {
        &self.pipeline
    }

    /// Device keys the device is currently asked to send
    pub fn subscribed_keys(&self) -> Vec<ServerId> {
        let mut keys: Vec<ServerId> = self.device_watch.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Run the worker on its own thread
    pub fn spawn(mut self) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("watchlink-sync".into())
            .spawn(move || self.run())
            .map_err(WatchError::Io)
    }

    /// Run the worker loop until shutdown
    pub fn run(&mut self) {
        tracing::info!("Sync worker started on {} link", self.link.kind());
        let idle = self.config.sync.idle_sleep();

        while self.running.load(Ordering::SeqCst) {
            let commands = self.process_commands();
            let busy = self.step();
            if commands == 0 && !busy {
                std::thread::sleep(idle);
            }
        }

        // Writes queued before shutdown still need an outcome
        self.process_commands();
        let failed = self.dispatcher.fail_all("sync worker stopped");
        self.stats.writes_failed += failed as u64;
        self.link.destroy();
        tracing::info!("Sync worker stopped ({} pending writes failed)", failed);
    }

    /// Handle every queued command, returns how many there were
    pub fn process_commands(&mut self) -> usize {
        let mut count = 0;
        loop {
            match self.command_rx.try_recv() {
                Ok(command) => {
                    count += 1;
                    self.handle_command(command);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
        count
    }

    fn handle_command(&mut self, command: SyncCommand) {
        match command {
            SyncCommand::Write(request) => self.queue_write(request),
            SyncCommand::WriteBatch(requests) => {
                for request in requests {
                    self.queue_write(request);
                }
            }
            SyncCommand::Subscription { server_id, watched } => {
                tracing::trace!("Watch edge {} for {}", watched, server_id);
                self.reconcile_subscriptions();
            }
            SyncCommand::Resync => self.reconcile_subscriptions(),
            SyncCommand::Shutdown => {
                self.running.store(false, Ordering::SeqCst);
            }
        }
    }

    fn queue_write(&mut self, request: Arc<WriteRequest>) {
        match self.pipeline.device_key(request.server_id()) {
            Ok(key) => {
                tracing::debug!(
                    "Queued write #{} of {} to {}",
                    request.id(),
                    request.value(),
                    request.server_id()
                );
                self.dispatcher.submit_to(key, request);
            }
            Err(e) => {
                tracing::warn!("Rejected write to {}: {}", request.server_id(), e);
                request.mark_failed(e.to_string());
                self.stats.writes_failed += 1;
            }
        }
    }

    /// Bring device subscriptions in line with the registry's watched set
    fn reconcile_subscriptions(&mut self) {
        let mut wanted: HashMap<ServerId, usize> = HashMap::new();
        for server_id in self.registry.watched_server_ids() {
            match self.pipeline.device_key(&server_id) {
                Ok(key) => *wanted.entry(key).or_insert(0) += 1,
                Err(_) => tracing::debug!("Watched {} has no device binding", server_id),
            }
        }
        let mut released: Vec<ServerId> = self
            .device_watch
            .keys()
            .filter(|key| !wanted.contains_key(*key))
            .cloned()
            .collect();
        let mut requested: Vec<ServerId> = wanted
            .keys()
            .filter(|key| !self.device_watch.contains_key(*key))
            .cloned()
            .collect();
        released.sort();
        requested.sort();
        self.device_watch = wanted;
        for key in released {
            self.send_subscription(&key, false);
        }
        for key in requested {
            self.send_subscription(&key, true);
        }
    }

    fn send_subscription(&mut self, key: &str, watched: bool) {
        if !self.link.operational() {
            return;
        }
        if let Some(frame) = self.protocol.encode_subscription(key, watched) {
            tracing::debug!("Device subscription {} for {}", watched, key);
            self.link.write(&frame);
        }
    }

    /// Reopen the link if it degraded, at most once per
    /// [`RECONNECT_INTERVAL`]. Returns whether the link is usable.
    fn ensure_link(&mut self) -> bool {
        if self.link.operational() {
            return true;
        }
        if self
            .last_reconnect
            .is_some_and(|at| at.elapsed() < RECONNECT_INTERVAL)
        {
            return false;
        }
        self.last_reconnect = Some(Instant::now());
        match self.link.initialize() {
            Ok(()) => {
                self.stats.reconnects += 1;
                self.protocol.reset();
                tracing::info!("{} link initialized", self.link.kind());
                let keys = self.subscribed_keys();
                for key in keys {
                    self.send_subscription(&key, true);
                }
                self.link.operational()
            }
            Err(e) => {
                tracing::warn!("Cannot initialize {} link: {}", self.link.kind(), e);
                false
            }
        }
    }

    /// One pass of link I/O. Returns whether anything happened.
    pub fn step(&mut self) -> bool {
        let mut busy = false;
        self.link.process();

        if self.ensure_link() {
            for _ in 0..MAX_READS_PER_STEP {
                let Some(bytes) = self.link.read() else {
                    break;
                };
                busy = true;
                let events = self.protocol.decode(&bytes);
                self.handle_events(events);
            }
            busy |= self.dispatch_writes();
        }

        let expired = self.dispatcher.expire_stale(self.config.write.timeout());
        self.stats.writes_failed += expired as u64;
        busy || expired > 0
    }

    fn publish(&mut self, values: &[(ServerId, Vec<u8>)]) {
        let updates = self.pipeline.process(values);
        tracing::trace!("Broadcasting {} updates", updates.len());
        for chunk in updates.chunks(self.config.sync.max_batch.max(1)) {
            self.registry.broadcast_value_updates(chunk);
        }
        self.stats.updates_broadcast += updates.len() as u64;
    }

    fn handle_events(&mut self, events: Vec<DeviceEvent>) {
        for event in events {
            match event {
                DeviceEvent::Values(values) => self.publish(&values),
                DeviceEvent::WriteCompleted {
                    server_id,
                    success,
                    message,
                } => {
                    let written = self.written.remove(&server_id);
                    let outcome = if success {
                        Ok(())
                    } else {
                        self.stats.writes_failed += 1;
                        Err(message.unwrap_or_else(|| "device rejected the write".into()))
                    };
                    let Some(request) = self.dispatcher.complete(&server_id, outcome) else {
                        continue;
                    };
                    tracing::debug!(
                        "Write #{} to {} resolved as {:?}",
                        request.id(),
                        request.server_id(),
                        request.status()
                    );
                    // The device now holds what was written
                    if let (true, Some(value)) = (success, written) {
                        self.publish(std::slice::from_ref(&value));
                    }
                }
            }
        }
    }

    fn dispatch_writes(&mut self) -> bool {
        let ready = self.dispatcher.take_ready();
        if ready.is_empty() {
            return false;
        }
        let policy = self.config.write.out_of_range;
        for (key, request) in ready {
            let encoded = self
                .pipeline
                .encode_write(request.server_id(), request.value(), policy)
                .and_then(|(target, payload)| {
                    let frame = self.protocol.encode_write(&target, &payload)?;
                    Ok((target, payload, frame))
                });
            match encoded {
                Ok((target, payload, frame)) => {
                    self.link.write(&frame);
                    self.written.insert(key, (target, payload));
                    self.stats.writes_dispatched += 1;
                }
                Err(e) => {
                    tracing::warn!("Write #{} to {} failed: {}", request.id(), request.server_id(), e);
                    self.stats.writes_failed += 1;
                    self.dispatcher.complete(&key, Err(e.to_string()));
                }
            }
        }
        true
    }
}
