// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Open-file handle table.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;

use crate::bufcache::BufferCache;
use crate::buffer::FileBuffer;
use crate::flags::OpenFlags;
use crate::types::FileStat;

/// Per-open state. Multiple handles on the same path share one buffer.
#[derive(Debug)]
pub struct FileHandle {
    path: String,
    flags: OpenFlags,
    stat: Mutex<FileStat>,
    remote_size: AtomicI64,
    buffer: Arc<FileBuffer>,
}

impl FileHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn stat(&self) -> FileStat {
        self.stat.lock().unwrap().clone()
    }

    pub fn set_stat(&self, stat: FileStat) {
        *self.stat.lock().unwrap() = stat;
    }

    /// Grows the cached size to `size` if it is larger; buffered writes
    /// must be visible through getattr before they are flushed.
    pub fn extend_size(&self, size: i64) {
        let mut stat = self.stat.lock().unwrap();
        if size > stat.size {
            stat.size = size;
        }
    }

    pub fn remote_size(&self) -> i64 {
        self.remote_size.load(Ordering::SeqCst)
    }

    pub fn set_remote_size(&self, size: i64) {
        self.remote_size.store(size, Ordering::SeqCst);
    }

    pub fn buffer(&self) -> &Arc<FileBuffer> {
        &self.buffer
    }
}

/// Handle-id → per-open state, ids monotonically increasing from 1.
#[derive(Debug, Default)]
pub struct HandleTable {
    next: AtomicU64,
    handles: DashMap<u64, Arc<FileHandle>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a handle, wiring it to the path's shared buffer from the
    /// cache. The buffer's handle count is incremented before the table
    /// insert so a concurrent release of another handle cannot reap it.
    pub fn new_handle(
        &self,
        buffers: &BufferCache,
        path: &str,
        stat: FileStat,
        flags: OpenFlags,
    ) -> u64 {
        let buffer = buffers.get_or_create(path);
        buffer.inc_handle();

        let id = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        let size = stat.size;
        self.handles.insert(
            id,
            Arc::new(FileHandle {
                path: path.to_string(),
                flags,
                stat: Mutex::new(stat),
                remote_size: AtomicI64::new(size),
                buffer,
            }),
        );
        id
    }

    pub fn get(&self, id: u64) -> Option<Arc<FileHandle>> {
        self.handles.get(&id).map(|h| Arc::clone(h.value()))
    }

    /// Drops the handle and decrements the shared buffer's count. When the
    /// last handle goes away and no dirty data remains, the buffer-cache
    /// entry is reclaimed.
    pub fn release(&self, id: u64, buffers: &BufferCache) {
        if let Some((_, handle)) = self.handles.remove(&id) {
            if handle.buffer.dec_handle() == 0 {
                buffers.remove_if_idle(&handle.path);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_one_and_increase() {
        let table = HandleTable::new();
        let buffers = BufferCache::new();
        let a = table.new_handle(&buffers, "/f", FileStat::new_file("f"), OpenFlags(0));
        let b = table.new_handle(&buffers, "/f", FileStat::new_file("f"), OpenFlags(0));
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn handles_share_the_path_buffer() {
        let table = HandleTable::new();
        let buffers = BufferCache::new();
        let a = table.new_handle(&buffers, "/f", FileStat::new_file("f"), OpenFlags(0));
        let b = table.new_handle(&buffers, "/f", FileStat::new_file("f"), OpenFlags(0));

        let ha = table.get(a).unwrap();
        let hb = table.get(b).unwrap();
        assert!(Arc::ptr_eq(ha.buffer(), hb.buffer()));
        assert_eq!(ha.buffer().handle_count(), 2);
    }

    #[test]
    fn release_reaps_clean_buffers_only() {
        let table = HandleTable::new();
        let buffers = BufferCache::new();
        let a = table.new_handle(&buffers, "/f", FileStat::new_file("f"), OpenFlags(0));
        let b = table.new_handle(&buffers, "/f", FileStat::new_file("f"), OpenFlags(0));

        table.release(a, &buffers);
        assert!(buffers.get("/f").is_some(), "buffer still referenced");

        table.get(b).unwrap().buffer().write_at(0, b"dirty").unwrap();
        table.release(b, &buffers);
        assert!(
            buffers.get("/f").is_some(),
            "dirty buffer must survive release"
        );
    }

    #[test]
    fn release_drops_clean_unreferenced_buffer() {
        let table = HandleTable::new();
        let buffers = BufferCache::new();
        let a = table.new_handle(&buffers, "/f", FileStat::new_file("f"), OpenFlags(0));
        table.release(a, &buffers);
        assert!(buffers.get("/f").is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn extend_size_is_monotonic() {
        let table = HandleTable::new();
        let buffers = BufferCache::new();
        let id = table.new_handle(&buffers, "/f", FileStat::new_file("f"), OpenFlags(0));
        let h = table.get(id).unwrap();
        h.extend_size(100);
        assert_eq!(h.stat().size, 100);
        h.extend_size(50);
        assert_eq!(h.stat().size, 100);
    }
}
