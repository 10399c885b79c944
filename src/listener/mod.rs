//! Listeners
//!
//! A listener consumes value updates on its own thread so that the
//! registry broadcast never waits on slow consumers such as file writers.
//!
//! # Lifecycle
//!
//! 1. [`BaseListener::subscribe`] the watchables of interest (only while stopped)
//! 2. [`BaseListener::start`] registers a watcher on the registry, spawns the
//!    consumer thread and waits for [`Listener::setup`] to finish
//! 3. batches flow through a bounded queue into [`Listener::receive`]
//! 4. [`BaseListener::stop`] unregisters the watcher, stops the thread and
//!    waits a bounded time for [`Listener::teardown`]
//!
//! `teardown` runs exactly once per `start`, whether or not `setup` succeeded.
//!
//! # Back-pressure
//!
//! The registry callback never blocks. When the queue is full the batch is
//! dropped and [`ListenerStats::dropped_batches`] goes up.

pub mod buffered;
pub mod csv_file;

pub use buffered::BufferedReaderListener;
pub use csv_file::CsvFileListener;

use crate::config::ListenerConfig;
use crate::error::{Result, WatchError};
use crate::registry::{Fqn, RegistryNode, WatchableRegistry, WatcherCallback};
use crate::types::{ServerId, Value, ValueUpdate};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How often the consumer wakes up to check for a stop request
const CONSUMER_POLL: Duration = Duration::from_millis(20);

/// A value update as seen by a listener
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerUpdate {
    pub fqn: Fqn,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
}

/// Consumer side of a listener
pub trait Listener: Send + 'static {
    /// Runs on the consumer thread before any batch
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    fn receive(&mut self, updates: &[ListenerUpdate]) -> Result<()>;

    /// Runs once on the consumer thread when it exits
    fn teardown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Counters shared between the producer callback, the consumer and the owner
#[derive(Debug, Default)]
pub struct ListenerStats {
    dropped: AtomicU64,
    received_batches: AtomicU64,
    received_updates: AtomicU64,
    error: AtomicBool,
}

impl ListenerStats {
    /// Batches dropped because the queue was full. Never decreases.
    pub fn dropped_batches(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn received_batches(&self) -> u64 {
        self.received_batches.load(Ordering::Relaxed)
    }

    pub fn received_updates(&self) -> u64 {
        self.received_updates.load(Ordering::Relaxed)
    }

    /// True once setup, receive or teardown returned an error
    pub fn had_error(&self) -> bool {
        self.error.load(Ordering::Relaxed)
    }

    fn flag_error(&self) {
        self.error.store(true, Ordering::Relaxed);
    }
}

struct Running<L> {
    watcher_id: String,
    running: Arc<AtomicBool>,
    done_rx: Receiver<L>,
    handle: JoinHandle<()>,
}

enum State<L> {
    Stopped(L),
    Running(Running<L>),
    /// The consumer thread did not exit in time and was left behind
    Abandoned,
}

/// Runs a [`Listener`] on its own thread, fed by the registry
pub struct BaseListener<L: Listener> {
    name: String,
    registry: Arc<WatchableRegistry>,
    config: ListenerConfig,
    subscriptions: BTreeMap<Fqn, ServerId>,
    stats: Arc<ListenerStats>,
    state: State<L>,
}

impl<L: Listener> BaseListener<L> {
    pub fn new(
        name: impl Into<String>,
        listener: L,
        registry: Arc<WatchableRegistry>,
        config: ListenerConfig,
    ) -> Self {
        Self {
            name: name.into(),
            registry,
            config,
            subscriptions: BTreeMap::new(),
            stats: Arc::new(ListenerStats::default()),
            state: State::Stopped(listener),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Shared handle on the counters, usable after the listener is gone
    pub fn stats_handle(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running(_))
    }

    /// Watchables currently subscribed, in name order
    pub fn subscriptions(&self) -> Vec<Fqn> {
        self.subscriptions.keys().cloned().collect()
    }

    /// Access the wrapped listener while stopped
    pub fn listener(&self) -> Option<&L> {
        match &self.state {
            State::Stopped(listener) => Some(listener),
            _ => None,
        }
    }

    fn ensure_stopped(&self, action: &str) -> Result<()> {
        match self.state {
            State::Stopped(_) => Ok(()),
            State::Running(_) => Err(WatchError::ListenerState(format!(
                "cannot {} while {} is running",
                action, self.name
            ))),
            State::Abandoned => Err(WatchError::ListenerState(format!(
                "{} was abandoned and cannot be reused",
                self.name
            ))),
        }
    }

    /// Add watchables by fully qualified name. Each one must be a leaf.
    pub fn subscribe<I, S>(&mut self, fqns: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.ensure_stopped("subscribe")?;
        let mut resolved = Vec::new();
        for fqn in fqns {
            let fqn = Fqn::parse(fqn.as_ref())?;
            match self.registry.read(fqn.watchable_type(), fqn.path())? {
                RegistryNode::Watchable(config) => resolved.push((fqn, config.server_id.clone())),
                RegistryNode::Folder(_) => return Err(WatchError::NotAWatchable(fqn.to_string())),
            }
        }
        self.subscriptions.extend(resolved);
        Ok(())
    }

    pub fn unsubscribe<I, S>(&mut self, fqns: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.ensure_stopped("unsubscribe")?;
        for fqn in fqns {
            let fqn = Fqn::parse(fqn.as_ref())?;
            self.subscriptions.remove(&fqn);
        }
        Ok(())
    }

    pub fn unsubscribe_all(&mut self) -> Result<()> {
        self.ensure_stopped("unsubscribe")?;
        self.subscriptions.clear();
        Ok(())
    }

    fn make_callback(&self, tx: Sender<Vec<ListenerUpdate>>) -> WatcherCallback {
        let names: Arc<HashMap<ServerId, Fqn>> = Arc::new(
            self.subscriptions
                .iter()
                .map(|(fqn, server_id)| (server_id.clone(), fqn.clone()))
                .collect(),
        );
        let stats = Arc::clone(&self.stats);
        Arc::new(move |updates: &[ValueUpdate]| {
            let batch: Vec<ListenerUpdate> = updates
                .iter()
                .filter_map(|u| {
                    names.get(&u.server_id).map(|fqn| ListenerUpdate {
                        fqn: fqn.clone(),
                        value: u.value,
                        timestamp: u.timestamp,
                    })
                })
                .collect();
            if batch.is_empty() {
                return;
            }
            match tx.try_send(batch) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        })
    }

    /// Start the consumer and wait for its setup
    ///
    /// A failing or slow setup aborts the start: the watcher is removed, the
    /// consumer runs teardown and exits, and an error is returned.
    pub fn start(&mut self) -> Result<()> {
        self.ensure_stopped("start")?;
        let State::Stopped(listener) = std::mem::replace(&mut self.state, State::Abandoned) else {
            return Err(WatchError::ListenerState(format!("{} is not stopped", self.name)));
        };

        let (tx, rx) = bounded::<Vec<ListenerUpdate>>(self.config.queue_size.max(1));
        let (setup_tx, setup_rx) = bounded::<std::result::Result<(), String>>(1);
        let (done_tx, done_rx) = bounded::<L>(1);
        let running = Arc::new(AtomicBool::new(true));

        let thread_running = Arc::clone(&running);
        let thread_stats = Arc::clone(&self.stats);
        let thread_name = self.name.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("listener-{}", self.name))
            .spawn(move || {
                consume(
                    &thread_name,
                    listener,
                    rx,
                    setup_tx,
                    thread_running,
                    thread_stats,
                    done_tx,
                )
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                // the listener moved into the failed closure and is gone
                return Err(WatchError::ListenerSetup(format!(
                    "cannot spawn consumer thread: {}",
                    e
                )));
            }
        };

        let start_timeout = Duration::from_millis(self.config.start_timeout_ms);
        let setup_error = match setup_rx.recv_timeout(start_timeout) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(format!("setup did not finish within {:?}", start_timeout)),
        };
        let running_state = Running {
            watcher_id: WatchableRegistry::new_watcher_id(&format!("listener-{}", self.name)),
            running,
            done_rx,
            handle,
        };

        if let Some(reason) = setup_error {
            tracing::error!("Listener {} failed to start: {}", self.name, reason);
            self.stats.flag_error();
            self.shutdown(running_state, false);
            return Err(WatchError::ListenerSetup(reason));
        }

        let watcher_id = running_state.watcher_id.clone();
        self.state = State::Running(running_state);
        if let Err(e) = self.attach(&watcher_id, tx) {
            self.stop()?;
            return Err(e);
        }
        tracing::info!(
            "Listener {} started with {} subscriptions",
            self.name,
            self.subscriptions.len()
        );
        Ok(())
    }

    fn attach(&self, watcher_id: &str, tx: Sender<Vec<ListenerUpdate>>) -> Result<()> {
        self.registry
            .register_watcher(watcher_id, self.make_callback(tx), false)?;
        for fqn in self.subscriptions.keys() {
            self.registry
                .watch(watcher_id, fqn.watchable_type(), fqn.path())?;
        }
        Ok(())
    }

    /// Stop the consumer. Returns once teardown ran or the stop timeout
    /// expired, in which case the thread is abandoned.
    pub fn stop(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Abandoned) {
            State::Running(running) => {
                if let Err(e) = self.registry.unregister_watcher(&running.watcher_id) {
                    tracing::debug!("Listener {} watcher already gone: {}", self.name, e);
                }
                self.shutdown(running, true);
                Ok(())
            }
            other => {
                self.state = other;
                Ok(())
            }
        }
    }

    /// Signal the consumer and wait for it to hand the listener back
    fn shutdown(&mut self, running: Running<L>, log: bool) {
        running.running.store(false, Ordering::SeqCst);
        let stop_timeout = Duration::from_millis(self.config.stop_timeout_ms);
        match running.done_rx.recv_timeout(stop_timeout) {
            Ok(listener) => {
                if running.handle.join().is_err() {
                    tracing::error!("Listener {} thread panicked", self.name);
                }
                self.state = State::Stopped(listener);
                if log {
                    tracing::info!("Listener {} stopped", self.name);
                }
            }
            Err(_) => {
                tracing::error!(
                    "Listener {} did not stop within {:?}, abandoning its thread",
                    self.name,
                    stop_timeout
                );
                self.stats.flag_error();
                self.state = State::Abandoned;
            }
        }
    }
}

impl<L: Listener> Drop for BaseListener<L> {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

fn consume<L: Listener>(
    name: &str,
    mut listener: L,
    rx: Receiver<Vec<ListenerUpdate>>,
    setup_tx: Sender<std::result::Result<(), String>>,
    running: Arc<AtomicBool>,
    stats: Arc<ListenerStats>,
    done_tx: Sender<L>,
) {
    let setup = listener.setup().map_err(|e| e.to_string());
    let ready = setup.is_ok();
    let _ = setup_tx.send(setup);

    if ready {
        while running.load(Ordering::SeqCst) {
            match rx.recv_timeout(CONSUMER_POLL) {
                Ok(batch) => {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    stats.received_batches.fetch_add(1, Ordering::Relaxed);
                    stats
                        .received_updates
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    if let Err(e) = listener.receive(&batch) {
                        tracing::error!("Listener {} failed to process a batch: {}", name, e);
                        stats.flag_error();
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    if let Err(e) = listener.teardown() {
        tracing::error!("Listener {} teardown failed: {}", name, e);
        stats.flag_error();
    }
    let _ = done_tx.send(listener);
}
