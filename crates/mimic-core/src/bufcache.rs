// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Shared buffer cache keyed by remote path.
//!
//! The cache owns the per-path `FileBuffer` instances; handles reference
//! them through `Arc`. Lifetime is governed by handle counting and by the
//! remote client deleting entries on remove/rename — the cache itself has
//! no TTL.

use std::sync::Arc;

use dashmap::DashMap;

use crate::buffer::FileBuffer;

#[derive(Debug, Default)]
pub struct BufferCache {
    entries: DashMap<String, Arc<FileBuffer>>,
}

impl BufferCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Arc<FileBuffer>> {
        self.entries.get(path).map(|e| Arc::clone(e.value()))
    }

    /// Returns the buffer for `path`, creating it if missing. Racy-safe:
    /// when two callers race, the loser's fresh buffer is discarded and
    /// both see the winner's.
    pub fn get_or_create(&self, path: &str) -> Arc<FileBuffer> {
        Arc::clone(
            self.entries
                .entry(path.to_string())
                .or_insert_with(|| Arc::new(FileBuffer::new()))
                .value(),
        )
    }

    pub fn set(&self, path: &str, buffer: Arc<FileBuffer>) {
        self.entries.insert(path.to_string(), buffer);
    }

    pub fn delete(&self, path: &str) {
        self.entries.remove(path);
    }

    /// Drops the entry only while no handle references it and no dirty
    /// data is pending. The predicate runs under the entry lock, so a
    /// racing open that has already re-acquired the buffer keeps it.
    pub fn remove_if_idle(&self, path: &str) {
        self.entries
            .remove_if(path, |_, buf| buf.handle_count() == 0 && !buf.is_dirty());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
