//! Per-type watchable tree
//!
//! Folders keep leaves and sub-folders in separate maps, so a leaf and a
//! folder may share a name. Lookups try the leaf first.

use crate::types::WatchableConfiguration;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A leaf of the tree
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub configuration: Arc<WatchableConfiguration>,
    /// Number of distinct watchers subscribed to this leaf
    pub watcher_count: usize,
}

impl RegistryEntry {
    fn new(configuration: Arc<WatchableConfiguration>) -> Self {
        Self {
            configuration,
            watcher_count: 0,
        }
    }
}

/// Immediate children of a folder, used for lazy browsing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeContent {
    /// Names of the immediate sub-folders
    pub subtree: Vec<String>,
    /// Immediate leaves by name
    pub watchables: BTreeMap<String, Arc<WatchableConfiguration>>,
}

/// Borrowed view of a node found by [`TreeFolder::lookup`]
pub enum TreeNode<'a> {
    Folder(&'a TreeFolder),
    Leaf(&'a RegistryEntry),
}

#[derive(Debug, Clone, Default)]
pub struct TreeFolder {
    subtree: BTreeMap<String, TreeFolder>,
    leaves: BTreeMap<String, RegistryEntry>,
}

impl TreeFolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.subtree.is_empty() && self.leaves.is_empty()
    }

    fn folder(&self, segments: &[&str]) -> Option<&TreeFolder> {
        let mut node = self;
        for segment in segments {
            node = node.subtree.get(*segment)?;
        }
        Some(node)
    }

    fn folder_mut(&mut self, segments: &[&str]) -> Option<&mut TreeFolder> {
        let mut node = self;
        for segment in segments {
            node = node.subtree.get_mut(*segment)?;
        }
        Some(node)
    }

    /// Resolve a path. An empty segment list is the root folder.
    pub fn lookup(&self, segments: &[&str]) -> Option<TreeNode<'_>> {
        let Some((name, parents)) = segments.split_last() else {
            return Some(TreeNode::Folder(self));
        };
        let parent = self.folder(parents)?;
        if let Some(entry) = parent.leaves.get(*name) {
            return Some(TreeNode::Leaf(entry));
        }
        parent.subtree.get(*name).map(TreeNode::Folder)
    }

    pub fn leaf(&self, segments: &[&str]) -> Option<&RegistryEntry> {
        let (name, parents) = segments.split_last()?;
        self.folder(parents)?.leaves.get(*name)
    }

    pub fn leaf_mut(&mut self, segments: &[&str]) -> Option<&mut RegistryEntry> {
        let (name, parents) = segments.split_last()?;
        self.folder_mut(parents)?.leaves.get_mut(*name)
    }

    pub fn contains_leaf(&self, segments: &[&str]) -> bool {
        self.leaf(segments).is_some()
    }

    /// Insert a leaf, creating folders on the way. Returns false if a leaf
    /// already exists there; the tree is left untouched in that case.
    pub fn insert(&mut self, segments: &[&str], configuration: Arc<WatchableConfiguration>) -> bool {
        let Some((name, parents)) = segments.split_last() else {
            return false;
        };
        if self.contains_leaf(segments) {
            return false;
        }
        let mut node = self;
        for segment in parents {
            node = node.subtree.entry((*segment).to_string()).or_default();
        }
        node.leaves
            .insert((*name).to_string(), RegistryEntry::new(configuration));
        true
    }

    pub fn content(&self) -> NodeContent {
        NodeContent {
            subtree: self.subtree.keys().cloned().collect(),
            watchables: self
                .leaves
                .iter()
                .map(|(name, entry)| (name.clone(), Arc::clone(&entry.configuration)))
                .collect(),
        }
    }

    /// Visit every leaf depth-first with its full path
    pub fn for_each_leaf<F>(&self, f: &mut F)
    where
        F: FnMut(&str, &RegistryEntry),
    {
        self.walk(&mut String::new(), f);
    }

    fn walk<F>(&self, prefix: &mut String, f: &mut F)
    where
        F: FnMut(&str, &RegistryEntry),
    {
        let base = prefix.len();
        for (name, entry) in &self.leaves {
            prefix.push('/');
            prefix.push_str(name);
            f(prefix, entry);
            prefix.truncate(base);
        }
        for (name, folder) in &self.subtree {
            prefix.push('/');
            prefix.push_str(name);
            folder.walk(prefix, f);
            prefix.truncate(base);
        }
    }
}
