// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Metadata (node) cache with TTL and hierarchical invalidation.
//!
//! Every miss is a PROPFIND round-trip, so entries are cached aggressively
//! and invalidated precisely: mutations drop the path, its parent, and —
//! for structural changes — whole subtrees. Both trailing-slash and bare
//! variants of each key are dropped because servers disagree on directory
//! path normalisation.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::types::FileStat;

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

#[derive(Clone, Debug)]
pub struct NodeEntry {
    pub stat: Option<FileStat>,
    pub is_dir: bool,
    /// `None` means "listing not cached"; `Some(vec![])` is a cached empty
    /// directory.
    pub children: Option<Vec<FileStat>>,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub struct NodeCache {
    entries: DashMap<String, NodeEntry>,
    ttl: Duration,
    max_entries: usize,
}

impl NodeCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries,
        }
    }

    pub fn entry_for(&self, stat: FileStat) -> NodeEntry {
        NodeEntry {
            is_dir: stat.is_dir,
            stat: Some(stat),
            children: None,
            expires_at: Instant::now() + self.ttl,
        }
    }

    /// Returns the entry if present and not expired; an expired entry is
    /// dropped and reported as a miss.
    pub fn get(&self, path: &str) -> Option<NodeEntry> {
        if let Some(entry) = self.entries.get(path) {
            if Instant::now() < entry.expires_at {
                return Some(entry.clone());
            }
        } else {
            return None;
        }
        self.entries.remove(path);
        None
    }

    /// Stores `entry`, re-stamping its expiry. TTL is refreshed only here
    /// (and in `set_children`), never on read.
    pub fn set(&self, path: &str, mut entry: NodeEntry) {
        entry.expires_at = Instant::now() + self.ttl;
        self.evict_if_full();
        self.entries.insert(path.to_string(), entry);
    }

    /// Returns the child listing only when present, unexpired, and
    /// actually cached.
    pub fn get_children(&self, path: &str) -> Option<Vec<FileStat>> {
        let expired = match self.entries.get(path) {
            None => return None,
            Some(entry) => {
                if Instant::now() < entry.expires_at {
                    return entry.children.clone();
                }
                true
            }
        };
        if expired {
            self.entries.remove(path);
        }
        None
    }

    /// Upserts the child listing, marking the node a directory.
    pub fn set_children(&self, path: &str, children: Vec<FileStat>) {
        let expires_at = Instant::now() + self.ttl;
        match self.entries.get_mut(path) {
            Some(mut entry) => {
                entry.children = Some(children);
                entry.is_dir = true;
                entry.expires_at = expires_at;
            }
            None => {
                self.evict_if_full();
                self.entries.insert(
                    path.to_string(),
                    NodeEntry {
                        stat: None,
                        is_dir: true,
                        children: Some(children),
                        expires_at,
                    },
                );
            }
        }
    }

    /// Drops `path` and its parent, in both trailing-slash and bare forms.
    pub fn invalidate(&self, path: &str) {
        if path.is_empty() {
            return;
        }

        self.remove_both_forms(path);

        let parent = parent_of(path);
        if parent != path {
            self.remove_both_forms(&parent);
        }
    }

    /// Drops every key that starts with `prefix`.
    pub fn invalidate_tree(&self, prefix: &str) {
        self.entries.retain(|k, _| !k.starts_with(prefix));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_both_forms(&self, path: &str) {
        self.entries.remove(path);
        if let Some(stripped) = path.strip_suffix('/') {
            if !stripped.is_empty() {
                self.entries.remove(stripped);
            }
        } else {
            self.entries.remove(&format!("{path}/"));
        }
    }

    /// `max_entries` is a target bound, not a hard limit: expired entries
    /// go first, then one arbitrary entry makes room.
    fn evict_if_full(&self) {
        if self.max_entries == 0 || self.entries.len() < self.max_entries {
            return;
        }
        let now = Instant::now();
        self.entries.retain(|_, e| now < e.expires_at);
        if self.entries.len() >= self.max_entries {
            if let Some(victim) = self.entries.iter().next().map(|e| e.key().clone()) {
                self.entries.remove(&victim);
            }
        }
    }
}

impl Default for NodeCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)
    }
}

/// Lexical parent of a slash-separated path ("/a/b" -> "/a", "/a" -> "/").
pub fn parent_of(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    match trimmed.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
        None => "/".to_string(),
    }
}
