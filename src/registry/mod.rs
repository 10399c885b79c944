//! Watchable registry
//!
//! The registry is the single source of truth for what can be watched. It
//! keeps one tree per [`WatchableType`], a set of watchers with their
//! subscriptions, and fans out value updates to those watchers.
//!
//! # Locking
//!
//! All tree and watcher mutations happen under one `parking_lot::Mutex`.
//! Callbacks are never invoked with that lock held: the registry copies what
//! it needs, drops the guard and then calls out. A callback may therefore call
//! back into the registry (for example to watch another entry).
//!
//! # Edge callbacks
//!
//! A global watch callback fires when a leaf goes from 0 to 1 watchers and a
//! global unwatch callback fires when it goes back to 0. Additional watchers
//! on an already watched leaf do not fire anything.
//!
//! Clearing a tree drops subscriptions without unwatch edges. A global clear
//! callback reports which tree was emptied so that anyone mirroring the
//! watched set can rebuild it from [`WatchableRegistry::watched_server_ids`].

pub mod fqn;
pub mod tree;

pub use fqn::Fqn;
pub use tree::{NodeContent, RegistryEntry};

use crate::error::{Result, WatchError};
use crate::types::{next_unique_id, ServerId, ValueUpdate, WatchableConfiguration, WatchableType};
use fqn::split_path;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tree::{TreeFolder, TreeNode};

/// Callback receiving the subset of a broadcast a watcher subscribes to
pub type WatcherCallback = Arc<dyn Fn(&[ValueUpdate]) + Send + Sync>;

/// Callback fired on a watch/unwatch edge
pub type WatchEdgeCallback = Arc<dyn Fn(&WatchEdge) + Send + Sync>;

/// Callback fired after a tree was emptied
pub type ClearCallback = Arc<dyn Fn(WatchableType) + Send + Sync>;

/// Details passed to the global watch/unwatch callbacks
#[derive(Debug, Clone)]
pub struct WatchEdge {
    /// Watcher whose call caused the transition
    pub watcher_id: String,
    pub fqn: Fqn,
    pub configuration: Arc<WatchableConfiguration>,
}

/// Result of [`WatchableRegistry::read`]
#[derive(Debug, Clone)]
pub enum RegistryNode {
    Folder(NodeContent),
    Watchable(Arc<WatchableConfiguration>),
}

impl RegistryNode {
    pub fn as_watchable(&self) -> Option<&Arc<WatchableConfiguration>> {
        match self {
            RegistryNode::Watchable(config) => Some(config),
            RegistryNode::Folder(_) => None,
        }
    }

    pub fn as_folder(&self) -> Option<&NodeContent> {
        match self {
            RegistryNode::Folder(content) => Some(content),
            RegistryNode::Watchable(_) => None,
        }
    }
}

struct Watcher {
    callback: WatcherCallback,
    /// Subscribed server ids and the leaf each one points at
    subscriptions: HashMap<ServerId, Fqn>,
}

#[derive(Default)]
struct RegistryInner {
    trees: [TreeFolder; 3],
    counts: [usize; 3],
    change_counters: [u64; 3],
    watchers: HashMap<String, Watcher>,
    server_index: HashMap<ServerId, Fqn>,
    watch_callback: Option<WatchEdgeCallback>,
    unwatch_callback: Option<WatchEdgeCallback>,
    clear_callback: Option<ClearCallback>,
}

impl RegistryInner {
    fn tree(&self, watchable_type: WatchableType) -> &TreeFolder {
        &self.trees[watchable_type.index()]
    }

    fn tree_mut(&mut self, watchable_type: WatchableType) -> &mut TreeFolder {
        &mut self.trees[watchable_type.index()]
    }

    /// Resolve a leaf for watch/unwatch
    fn resolve_leaf(&self, fqn: &Fqn) -> Result<Arc<WatchableConfiguration>> {
        match self.tree(fqn.watchable_type()).lookup(&fqn.segments()) {
            Some(TreeNode::Leaf(entry)) => Ok(Arc::clone(&entry.configuration)),
            Some(TreeNode::Folder(_)) => Err(WatchError::NotAWatchable(fqn.to_string())),
            None => Err(WatchError::NodeNotFound(fqn.to_string())),
        }
    }

    /// Drop one subscription and adjust the leaf count. Returns the edge to
    /// report if the leaf has no watcher left.
    fn release(&mut self, watcher_id: &str, server_id: &str) -> Option<WatchEdge> {
        let fqn = self
            .watchers
            .get_mut(watcher_id)?
            .subscriptions
            .remove(server_id)?;
        let entry = self
            .tree_mut(fqn.watchable_type())
            .leaf_mut(&fqn.segments())?;
        entry.watcher_count = entry.watcher_count.saturating_sub(1);
        if entry.watcher_count > 0 {
            return None;
        }
        let configuration = Arc::clone(&entry.configuration);
        Some(WatchEdge {
            watcher_id: watcher_id.to_string(),
            fqn,
            configuration,
        })
    }

    fn release_all(&mut self, watcher_id: &str) -> Vec<WatchEdge> {
        let server_ids: Vec<ServerId> = match self.watchers.get(watcher_id) {
            Some(watcher) => watcher.subscriptions.keys().cloned().collect(),
            None => return Vec::new(),
        };
        server_ids
            .iter()
            .filter_map(|server_id| self.release(watcher_id, server_id))
            .collect()
    }

    fn clear_type(&mut self, watchable_type: WatchableType) -> bool {
        let idx = watchable_type.index();
        let had_data = !self.trees[idx].is_empty();
        self.trees[idx] = TreeFolder::new();
        self.counts[idx] = 0;
        self.server_index
            .retain(|_, fqn| fqn.watchable_type() != watchable_type);
        for watcher in self.watchers.values_mut() {
            watcher
                .subscriptions
                .retain(|_, fqn| fqn.watchable_type() != watchable_type);
        }
        had_data
    }
}

fn fire(callback: Option<WatchEdgeCallback>, edges: &[WatchEdge]) {
    if let Some(callback) = callback {
        for edge in edges {
            callback(edge);
        }
    }
}

/// Thread-safe tree of watchables with watcher fan-out
///
/// Share it behind an `Arc`; every method takes `&self`.
pub struct WatchableRegistry {
    inner: Mutex<RegistryInner>,
}

impl Default for WatchableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WatchableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("WatchableRegistry")
            .field("counts", &inner.counts)
            .field("watchers", &inner.watchers.len())
            .finish()
    }
}

impl WatchableRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Generate a watcher id that is unique for this process
    pub fn new_watcher_id(prefix: &str) -> String {
        format!("{}-{}", prefix, next_unique_id())
    }

    // ---------------------------------------------------------------------
    // Content
    // ---------------------------------------------------------------------

    /// Insert a single leaf
    pub fn add(
        &self,
        path: &str,
        watchable_type: WatchableType,
        config: WatchableConfiguration,
    ) -> Result<()> {
        let mut content = HashMap::new();
        content.insert(watchable_type, vec![(path.to_string(), config)]);
        self.add_content(content)
    }

    /// Insert many leaves at once
    ///
    /// The whole batch is checked before anything is inserted, so a failure
    /// leaves the registry unchanged. Each touched type's change counter is
    /// bumped once.
    pub fn add_content(
        &self,
        content: HashMap<WatchableType, Vec<(String, WatchableConfiguration)>>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();

        let mut seen_paths: HashSet<Fqn> = HashSet::new();
        let mut seen_ids: HashSet<&str> = HashSet::new();
        for (watchable_type, entries) in &content {
            for (path, config) in entries {
                let fqn = Fqn::make(*watchable_type, path);
                if fqn.segments().is_empty() {
                    return Err(WatchError::BadPath(format!(
                        "cannot add a watchable at the root ({})",
                        fqn
                    )));
                }
                if inner.tree(*watchable_type).contains_leaf(&fqn.segments())
                    || !seen_paths.insert(fqn.clone())
                {
                    return Err(WatchError::DuplicateEntry(fqn.to_string()));
                }
                if inner.server_index.contains_key(&config.server_id)
                    || !seen_ids.insert(config.server_id.as_str())
                {
                    return Err(WatchError::DuplicateEntry(format!(
                        "server id {} already in use",
                        config.server_id
                    )));
                }
            }
        }

        for (watchable_type, entries) in content {
            if entries.is_empty() {
                continue;
            }
            let idx = watchable_type.index();
            let added = entries.len();
            for (path, config) in entries {
                let fqn = Fqn::make(watchable_type, &path);
                inner
                    .server_index
                    .insert(config.server_id.clone(), fqn.clone());
                inner
                    .tree_mut(watchable_type)
                    .insert(&fqn.segments(), Arc::new(config));
            }
            inner.counts[idx] += added;
            inner.change_counters[idx] = inner.change_counters[idx].wrapping_add(1);
            tracing::debug!("Registry: added {} {} entries", added, watchable_type);
        }
        Ok(())
    }

    /// Read a folder listing or a leaf configuration
    pub fn read(&self, watchable_type: WatchableType, path: &str) -> Result<RegistryNode> {
        let inner = self.inner.lock();
        let segments = split_path(path);
        match inner.tree(watchable_type).lookup(&segments) {
            Some(TreeNode::Leaf(entry)) => {
                Ok(RegistryNode::Watchable(Arc::clone(&entry.configuration)))
            }
            Some(TreeNode::Folder(folder)) => Ok(RegistryNode::Folder(folder.content())),
            None => Err(WatchError::NodeNotFound(
                Fqn::make(watchable_type, path).to_string(),
            )),
        }
    }

    /// [`read`](Self::read) addressed by a fully qualified name string
    pub fn read_fqn(&self, fqn: &str) -> Result<RegistryNode> {
        let fqn = Fqn::parse(fqn)?;
        self.read(fqn.watchable_type(), fqn.path())
    }

    /// Configuration of a leaf, if present
    pub fn get_watchable(
        &self,
        watchable_type: WatchableType,
        path: &str,
    ) -> Option<Arc<WatchableConfiguration>> {
        let inner = self.inner.lock();
        inner
            .tree(watchable_type)
            .leaf(&split_path(path))
            .map(|entry| Arc::clone(&entry.configuration))
    }

    /// Name of the leaf carrying a server id
    pub fn get_fqn(&self, server_id: &str) -> Option<Fqn> {
        self.inner.lock().server_index.get(server_id).cloned()
    }

    /// Snapshot of every leaf of a type with its path
    pub fn get_all_entries(
        &self,
        watchable_type: WatchableType,
    ) -> Vec<(String, Arc<WatchableConfiguration>)> {
        let inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.counts[watchable_type.index()]);
        inner.tree(watchable_type).for_each_leaf(&mut |path, entry| {
            out.push((path.to_string(), Arc::clone(&entry.configuration)));
        });
        out
    }

    pub fn has_data(&self, watchable_type: WatchableType) -> bool {
        self.inner.lock().counts[watchable_type.index()] > 0
    }

    pub fn get_watchable_count(&self, watchable_type: WatchableType) -> usize {
        self.inner.lock().counts[watchable_type.index()]
    }

    /// Per-type counters bumped by every successful add
    pub fn get_change_counters(&self) -> HashMap<WatchableType, u64> {
        let inner = self.inner.lock();
        WatchableType::ALL
            .iter()
            .map(|t| (*t, inner.change_counters[t.index()]))
            .collect()
    }

    /// Empty every tree. Returns true if anything was removed.
    pub fn clear(&self) -> bool {
        let (cleared, callback) = {
            let mut inner = self.inner.lock();
            let cleared: Vec<WatchableType> = WatchableType::ALL
                .into_iter()
                .filter(|t| inner.clear_type(*t))
                .collect();
            (cleared, inner.clear_callback.clone())
        };
        if !cleared.is_empty() {
            tracing::info!("Registry cleared");
        }
        if let Some(callback) = callback {
            for watchable_type in &cleared {
                callback(*watchable_type);
            }
        }
        !cleared.is_empty()
    }

    /// Empty one tree and drop every subscription into it
    ///
    /// No unwatch callbacks fire: the entries no longer exist. The clear
    /// callback fires instead when anything was removed.
    pub fn clear_by_type(&self, watchable_type: WatchableType) -> bool {
        let (removed, callback) = {
            let mut inner = self.inner.lock();
            let removed = inner.clear_type(watchable_type);
            (removed, inner.clear_callback.clone())
        };
        if removed {
            tracing::info!("Registry: cleared {} entries", watchable_type);
            if let Some(callback) = callback {
                callback(watchable_type);
            }
        }
        removed
    }

    // ---------------------------------------------------------------------
    // Watchers
    // ---------------------------------------------------------------------

    /// Install the callbacks fired on 0->1 and 1->0 watcher transitions
    pub fn register_global_watch_callback(
        &self,
        on_watch: WatchEdgeCallback,
        on_unwatch: WatchEdgeCallback,
    ) {
        let mut inner = self.inner.lock();
        inner.watch_callback = Some(on_watch);
        inner.unwatch_callback = Some(on_unwatch);
    }

    /// Install the callback fired after `clear`/`clear_by_type` emptied a tree
    pub fn register_global_clear_callback(&self, on_clear: ClearCallback) {
        self.inner.lock().clear_callback = Some(on_clear);
    }

    /// Register a watcher
    ///
    /// With `override_existing`, an existing watcher with the same id keeps
    /// its subscriptions but gets the new callback.
    pub fn register_watcher(
        &self,
        watcher_id: &str,
        callback: WatcherCallback,
        override_existing: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.watchers.get_mut(watcher_id) {
            Some(_) if !override_existing => {
                Err(WatchError::DuplicateWatcher(watcher_id.to_string()))
            }
            Some(existing) => {
                existing.callback = callback;
                Ok(())
            }
            None => {
                inner.watchers.insert(
                    watcher_id.to_string(),
                    Watcher {
                        callback,
                        subscriptions: HashMap::new(),
                    },
                );
                tracing::debug!("Registered watcher {}", watcher_id);
                Ok(())
            }
        }
    }

    /// Remove a watcher and all of its subscriptions
    pub fn unregister_watcher(&self, watcher_id: &str) -> Result<()> {
        let (edges, callback) = {
            let mut inner = self.inner.lock();
            if !inner.watchers.contains_key(watcher_id) {
                return Err(WatchError::WatcherNotFound(watcher_id.to_string()));
            }
            let edges = inner.release_all(watcher_id);
            inner.watchers.remove(watcher_id);
            (edges, inner.unwatch_callback.clone())
        };
        tracing::debug!("Unregistered watcher {}", watcher_id);
        fire(callback, &edges);
        Ok(())
    }

    pub fn registered_watcher_count(&self) -> usize {
        self.inner.lock().watchers.len()
    }

    /// Subscribe a watcher to a leaf. Watching twice is a no-op.
    pub fn watch(&self, watcher_id: &str, watchable_type: WatchableType, path: &str) -> Result<()> {
        let fqn = Fqn::make(watchable_type, path);
        let (edge, callback) = {
            let mut inner = self.inner.lock();
            if !inner.watchers.contains_key(watcher_id) {
                return Err(WatchError::WatcherNotFound(watcher_id.to_string()));
            }
            let configuration = inner.resolve_leaf(&fqn)?;
            let server_id = configuration.server_id.clone();

            let Some(watcher) = inner.watchers.get_mut(watcher_id) else {
                return Err(WatchError::WatcherNotFound(watcher_id.to_string()));
            };
            if watcher.subscriptions.contains_key(&server_id) {
                return Ok(());
            }
            watcher.subscriptions.insert(server_id, fqn.clone());

            let Some(entry) = inner.tree_mut(watchable_type).leaf_mut(&fqn.segments()) else {
                return Err(WatchError::NodeNotFound(fqn.to_string()));
            };
            entry.watcher_count += 1;
            if entry.watcher_count != 1 {
                return Ok(());
            }
            let edge = WatchEdge {
                watcher_id: watcher_id.to_string(),
                fqn,
                configuration,
            };
            (edge, inner.watch_callback.clone())
        };
        tracing::debug!("First watcher on {}", edge.fqn);
        fire(callback, std::slice::from_ref(&edge));
        Ok(())
    }

    /// [`watch`](Self::watch) addressed by a fully qualified name string
    pub fn watch_fqn(&self, watcher_id: &str, fqn: &str) -> Result<()> {
        let fqn = Fqn::parse(fqn)?;
        self.watch(watcher_id, fqn.watchable_type(), fqn.path())
    }

    /// Unsubscribe a watcher from a leaf. Unwatching something not watched
    /// is a no-op.
    pub fn unwatch(&self, watcher_id: &str, watchable_type: WatchableType, path: &str) -> Result<()> {
        let fqn = Fqn::make(watchable_type, path);
        let (edge, callback) = {
            let mut inner = self.inner.lock();
            if !inner.watchers.contains_key(watcher_id) {
                return Err(WatchError::WatcherNotFound(watcher_id.to_string()));
            }
            let configuration = inner.resolve_leaf(&fqn)?;
            let edge = inner.release(watcher_id, &configuration.server_id);
            (edge, inner.unwatch_callback.clone())
        };
        if let Some(edge) = edge {
            tracing::debug!("Last watcher left {}", edge.fqn);
            fire(callback, std::slice::from_ref(&edge));
        }
        Ok(())
    }

    pub fn unwatch_fqn(&self, watcher_id: &str, fqn: &str) -> Result<()> {
        let fqn = Fqn::parse(fqn)?;
        self.unwatch(watcher_id, fqn.watchable_type(), fqn.path())
    }

    /// Drop every subscription of a watcher, keeping it registered
    pub fn unwatch_all(&self, watcher_id: &str) -> Result<()> {
        let (edges, callback) = {
            let mut inner = self.inner.lock();
            if !inner.watchers.contains_key(watcher_id) {
                return Err(WatchError::WatcherNotFound(watcher_id.to_string()));
            }
            (inner.release_all(watcher_id), inner.unwatch_callback.clone())
        };
        fire(callback, &edges);
        Ok(())
    }

    /// Number of distinct watchers on a leaf
    pub fn watcher_count(&self, watchable_type: WatchableType, path: &str) -> Result<usize> {
        let fqn = Fqn::make(watchable_type, path);
        let inner = self.inner.lock();
        match inner.tree(watchable_type).lookup(&fqn.segments()) {
            Some(TreeNode::Leaf(entry)) => Ok(entry.watcher_count),
            Some(TreeNode::Folder(_)) => Err(WatchError::NotAWatchable(fqn.to_string())),
            None => Err(WatchError::NodeNotFound(fqn.to_string())),
        }
    }

    /// Ids of the watchers subscribed to a leaf, sorted
    pub fn get_watchers_of(&self, watchable_type: WatchableType, path: &str) -> Result<Vec<String>> {
        let fqn = Fqn::make(watchable_type, path);
        let inner = self.inner.lock();
        let configuration = inner.resolve_leaf(&fqn)?;
        let mut ids: Vec<String> = inner
            .watchers
            .iter()
            .filter(|(_, w)| w.subscriptions.contains_key(&configuration.server_id))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Number of leaves, across all types, with at least one watcher
    pub fn watched_entries_count(&self) -> usize {
        let inner = self.inner.lock();
        let mut count = 0;
        for tree in &inner.trees {
            tree.for_each_leaf(&mut |_, entry| {
                if entry.watcher_count > 0 {
                    count += 1;
                }
            });
        }
        count
    }

    /// Server ids with at least one watcher
    pub fn watched_server_ids(&self) -> HashSet<ServerId> {
        let inner = self.inner.lock();
        inner
            .watchers
            .values()
            .flat_map(|w| w.subscriptions.keys().cloned())
            .collect()
    }

    // ---------------------------------------------------------------------
    // Broadcast
    // ---------------------------------------------------------------------

    /// Hand each watcher the part of `updates` it subscribes to
    ///
    /// Order within a batch is preserved. Watchers with nothing to receive are
    /// not called.
    pub fn broadcast_value_updates(&self, updates: &[ValueUpdate]) {
        if updates.is_empty() {
            return;
        }
        let deliveries: Vec<(WatcherCallback, Vec<ValueUpdate>)> = {
            let inner = self.inner.lock();
            inner
                .watchers
                .values()
                .filter_map(|watcher| {
                    let filtered: Vec<ValueUpdate> = updates
                        .iter()
                        .filter(|u| watcher.subscriptions.contains_key(&u.server_id))
                        .cloned()
                        .collect();
                    if filtered.is_empty() {
                        None
                    } else {
                        Some((Arc::clone(&watcher.callback), filtered))
                    }
                })
                .collect()
        };
        for (callback, batch) in deliveries {
            callback(&batch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Value, VariableType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn var_cfg(id: &str) -> WatchableConfiguration {
        WatchableConfiguration::new(WatchableType::Variable, VariableType::Float32, id)
    }

    fn noop() -> WatcherCallback {
        Arc::new(|_: &[ValueUpdate]| {})
    }

    #[test]
    fn test_add_then_read_returns_same_object() {
        let registry = WatchableRegistry::new();
        registry
            .add("/a/b/c", WatchableType::Variable, var_cfg("v1"))
            .unwrap();
        let first = registry.read(WatchableType::Variable, "a/b/c").unwrap();
        let second = registry.read_fqn("var:/a/b//c/").unwrap();
        assert!(Arc::ptr_eq(
            first.as_watchable().unwrap(),
            second.as_watchable().unwrap()
        ));
    }

    #[test]
    fn test_add_duplicate_and_cross_type() {
        let registry = WatchableRegistry::new();
        registry
            .add("/a/x", WatchableType::Variable, var_cfg("v1"))
            .unwrap();
        let err = registry
            .add("/a/x", WatchableType::Variable, var_cfg("v2"))
            .unwrap_err();
        assert!(matches!(err, WatchError::DuplicateEntry(_)));

        let alias = WatchableConfiguration::new(WatchableType::Alias, VariableType::Float32, "a1");
        registry.add("/a/x", WatchableType::Alias, alias).unwrap();
        assert_eq!(registry.get_watchable_count(WatchableType::Variable), 1);
        assert_eq!(registry.get_watchable_count(WatchableType::Alias), 1);
    }

    #[test]
    fn test_add_root_is_bad_path() {
        let registry = WatchableRegistry::new();
        assert!(matches!(
            registry.add("/", WatchableType::Variable, var_cfg("v1")),
            Err(WatchError::BadPath(_))
        ));
        assert!(matches!(
            registry.add("", WatchableType::Variable, var_cfg("v1")),
            Err(WatchError::BadPath(_))
        ));
    }

    #[test]
    fn test_read_folder_lists_immediate_children() {
        let registry = WatchableRegistry::new();
        registry
            .add("/a/b/c", WatchableType::Variable, var_cfg("v1"))
            .unwrap();
        registry
            .add("/a/d", WatchableType::Variable, var_cfg("v2"))
            .unwrap();
        let node = registry.read(WatchableType::Variable, "/a").unwrap();
        let content = node.as_folder().unwrap();
        assert_eq!(content.subtree, vec!["b".to_string()]);
        assert_eq!(content.watchables.len(), 1);
        assert!(content.watchables.contains_key("d"));

        assert!(matches!(
            registry.read(WatchableType::Variable, "/a/zz"),
            Err(WatchError::NodeNotFound(_))
        ));
        assert!(matches!(
            registry.read(WatchableType::Alias, "/a"),
            Err(WatchError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_add_content_bumps_counter_once_per_type() {
        let registry = WatchableRegistry::new();
        let mut content = HashMap::new();
        content.insert(
            WatchableType::Variable,
            vec![
                ("/a".to_string(), var_cfg("v1")),
                ("/b".to_string(), var_cfg("v2")),
                ("/c".to_string(), var_cfg("v3")),
            ],
        );
        registry.add_content(content).unwrap();
        let counters = registry.get_change_counters();
        assert_eq!(counters[&WatchableType::Variable], 1);
        assert_eq!(counters[&WatchableType::Alias], 0);
        assert_eq!(registry.get_watchable_count(WatchableType::Variable), 3);
    }

    #[test]
    fn test_add_content_is_all_or_nothing() {
        let registry = WatchableRegistry::new();
        registry
            .add("/b", WatchableType::Variable, var_cfg("v0"))
            .unwrap();
        let mut content = HashMap::new();
        content.insert(
            WatchableType::Variable,
            vec![
                ("/a".to_string(), var_cfg("v1")),
                ("/b".to_string(), var_cfg("v2")),
            ],
        );
        assert!(registry.add_content(content).is_err());
        assert_eq!(registry.get_watchable_count(WatchableType::Variable), 1);
        assert!(registry.get_watchable(WatchableType::Variable, "/a").is_none());
    }

    #[test]
    fn test_duplicate_watcher() {
        let registry = WatchableRegistry::new();
        registry.register_watcher("w", noop(), false).unwrap();
        assert!(matches!(
            registry.register_watcher("w", noop(), false),
            Err(WatchError::DuplicateWatcher(_))
        ));
        registry.register_watcher("w", noop(), true).unwrap();
        assert_eq!(registry.registered_watcher_count(), 1);
    }

    #[test]
    fn test_watch_folder_and_missing() {
        let registry = WatchableRegistry::new();
        registry
            .add("/a/b", WatchableType::Variable, var_cfg("v1"))
            .unwrap();
        registry.register_watcher("w", noop(), false).unwrap();
        assert!(matches!(
            registry.watch("w", WatchableType::Variable, "/a"),
            Err(WatchError::NotAWatchable(_))
        ));
        assert!(matches!(
            registry.watch("w", WatchableType::Variable, "/nope"),
            Err(WatchError::NodeNotFound(_))
        ));
        assert!(matches!(
            registry.watch("ghost", WatchableType::Variable, "/a/b"),
            Err(WatchError::WatcherNotFound(_))
        ));
    }

    #[test]
    fn test_edge_callbacks_fire_once() {
        let registry = WatchableRegistry::new();
        registry
            .add("/a/b", WatchableType::Variable, var_cfg("v1"))
            .unwrap();
        let watched = Arc::new(AtomicUsize::new(0));
        let unwatched = Arc::new(AtomicUsize::new(0));
        let (w, u) = (Arc::clone(&watched), Arc::clone(&unwatched));
        registry.register_global_watch_callback(
            Arc::new(move |_: &WatchEdge| {
                w.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(move |_: &WatchEdge| {
                u.fetch_add(1, Ordering::SeqCst);
            }),
        );

        for i in 0..5 {
            let id = format!("w{}", i);
            registry.register_watcher(&id, noop(), false).unwrap();
            registry.watch(&id, WatchableType::Variable, "/a/b").unwrap();
            // watching twice changes nothing
            registry.watch(&id, WatchableType::Variable, "/a/b").unwrap();
        }
        assert_eq!(registry.watcher_count(WatchableType::Variable, "/a/b").unwrap(), 5);
        assert_eq!(watched.load(Ordering::SeqCst), 1);

        for i in 0..5 {
            registry
                .unwatch(&format!("w{}", i), WatchableType::Variable, "/a/b")
                .unwrap();
        }
        assert_eq!(registry.watcher_count(WatchableType::Variable, "/a/b").unwrap(), 0);
        assert_eq!(unwatched.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_may_reenter_registry() {
        let registry = Arc::new(WatchableRegistry::new());
        registry
            .add("/a", WatchableType::Variable, var_cfg("v1"))
            .unwrap();
        registry
            .add("/b", WatchableType::Variable, var_cfg("v2"))
            .unwrap();
        registry.register_watcher("w", noop(), false).unwrap();
        let reentrant = Arc::clone(&registry);
        registry.register_global_watch_callback(
            Arc::new(move |edge: &WatchEdge| {
                if edge.fqn.path() == "/a" {
                    reentrant
                        .watch("w", WatchableType::Variable, "/b")
                        .unwrap();
                }
            }),
            Arc::new(|_: &WatchEdge| {}),
        );
        registry.watch("w", WatchableType::Variable, "/a").unwrap();
        assert_eq!(registry.watcher_count(WatchableType::Variable, "/b").unwrap(), 1);
    }

    #[test]
    fn test_broadcast_filters_per_watcher() {
        let registry = WatchableRegistry::new();
        for (path, id) in [("/a", "A"), ("/b", "B"), ("/c", "C")] {
            registry.add(path, WatchableType::Variable, var_cfg(id)).unwrap();
        }
        let received = Arc::new(Mutex::new(Vec::<Vec<ValueUpdate>>::new()));
        let sink = Arc::clone(&received);
        registry
            .register_watcher(
                "w",
                Arc::new(move |batch: &[ValueUpdate]| sink.lock().push(batch.to_vec())),
                false,
            )
            .unwrap();
        registry.watch("w", WatchableType::Variable, "/a").unwrap();
        registry.watch("w", WatchableType::Variable, "/b").unwrap();

        registry.broadcast_value_updates(&[
            ValueUpdate::new("A", Value::Float(1.0)),
            ValueUpdate::new("C", Value::Float(3.0)),
        ]);
        registry.broadcast_value_updates(&[ValueUpdate::new("C", Value::Float(4.0))]);

        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].len(), 1);
        assert_eq!(received[0][0].server_id, "A");
    }

    #[test]
    fn test_clear_by_type_keeps_other_types() {
        let registry = WatchableRegistry::new();
        registry.add("/v", WatchableType::Variable, var_cfg("v1")).unwrap();
        let alias = WatchableConfiguration::new(WatchableType::Alias, VariableType::Float32, "a1");
        registry.add("/al", WatchableType::Alias, alias).unwrap();
        registry.register_watcher("w", noop(), false).unwrap();
        registry.watch("w", WatchableType::Variable, "/v").unwrap();
        registry.watch("w", WatchableType::Alias, "/al").unwrap();

        assert!(registry.clear_by_type(WatchableType::Variable));
        assert!(!registry.clear_by_type(WatchableType::Variable));
        assert!(!registry.has_data(WatchableType::Variable));
        assert!(registry.has_data(WatchableType::Alias));
        assert_eq!(registry.get_watchers_of(WatchableType::Alias, "/al").unwrap(), vec!["w"]);
        assert_eq!(registry.watched_server_ids().len(), 1);

        assert!(registry.clear());
        assert!(!registry.clear());
    }

    #[test]
    fn test_clear_callback_reports_emptied_trees() {
        let registry = Arc::new(WatchableRegistry::new());
        registry.add("/v", WatchableType::Variable, var_cfg("v1")).unwrap();
        let alias = WatchableConfiguration::new(WatchableType::Alias, VariableType::Float32, "a1");
        registry.add("/al", WatchableType::Alias, alias).unwrap();

        let cleared: Arc<parking_lot::Mutex<Vec<(WatchableType, usize)>>> = Arc::default();
        let log = Arc::clone(&cleared);
        let reg = Arc::clone(&registry);
        registry.register_global_clear_callback(Arc::new(move |t: WatchableType| {
            // Runs without the registry lock held
            log.lock().push((t, reg.watched_server_ids().len()));
        }));
        registry.register_watcher("w", noop(), false).unwrap();
        registry.watch("w", WatchableType::Variable, "/v").unwrap();

        assert!(registry.clear_by_type(WatchableType::Variable));
        assert!(!registry.clear_by_type(WatchableType::Variable));
        assert!(registry.clear());
        assert_eq!(
            *cleared.lock(),
            vec![(WatchableType::Variable, 0), (WatchableType::Alias, 0)]
        );
    }

    #[test]
    fn test_unregister_fires_unwatch_edges() {
        let registry = WatchableRegistry::new();
        registry.add("/a", WatchableType::Variable, var_cfg("v1")).unwrap();
        registry.add("/b", WatchableType::Variable, var_cfg("v2")).unwrap();
        let unwatched = Arc::new(AtomicUsize::new(0));
        let u = Arc::clone(&unwatched);
        registry.register_global_watch_callback(
            Arc::new(|_: &WatchEdge| {}),
            Arc::new(move |_: &WatchEdge| {
                u.fetch_add(1, Ordering::SeqCst);
            }),
        );
        registry.register_watcher("w1", noop(), false).unwrap();
        registry.register_watcher("w2", noop(), false).unwrap();
        registry.watch("w1", WatchableType::Variable, "/a").unwrap();
        registry.watch("w1", WatchableType::Variable, "/b").unwrap();
        registry.watch("w2", WatchableType::Variable, "/b").unwrap();
        assert_eq!(registry.watched_entries_count(), 2);

        registry.unregister_watcher("w1").unwrap();
        assert_eq!(unwatched.load(Ordering::SeqCst), 1);
        assert_eq!(registry.watched_entries_count(), 1);
        assert!(matches!(
            registry.unregister_watcher("w1"),
            Err(WatchError::WatcherNotFound(_))
        ));

        registry.unwatch_all("w2").unwrap();
        assert_eq!(unwatched.load(Ordering::SeqCst), 2);
        assert_eq!(registry.watched_entries_count(), 0);
    }

    #[test]
    fn test_get_all_entries_and_fqn() {
        let registry = WatchableRegistry::new();
        registry.add("/x/y", WatchableType::Variable, var_cfg("v1")).unwrap();
        registry.add("/z", WatchableType::Variable, var_cfg("v2")).unwrap();
        let entries = registry.get_all_entries(WatchableType::Variable);
        assert_eq!(entries.len(), 2);
        assert_eq!(registry.get_fqn("v1").unwrap().to_string(), "var:/x/y");
        assert!(registry.get_fqn("nope").is_none());
    }
}
