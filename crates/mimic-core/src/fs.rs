// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The POSIX-emulation engine.
//!
//! Every kernel-facing operation is synthesized here from the coarse
//! remote interface: reads go through the shared per-path buffer with
//! page-aligned readahead, writes accumulate in that buffer and only reach
//! the remote on flush/release, metadata flows through the node cache
//! inside the remote client. All methods are path-based; the platform
//! adapter owns inode bookkeeping and errno conversion.

use std::io::Read;
use std::sync::Arc;

use percent_encoding::percent_decode_str;
use tracing::{debug, warn};

use crate::bufcache::BufferCache;
use crate::error::{FsError, FsResult};
use crate::flags::OpenFlags;
use crate::handle::HandleTable;
use crate::locking::{CancelToken, LockInfo, LockKind, LockManager};
use crate::readahead::{merge_remote_and_buffer, page_aligned_range};
use crate::remote::RemoteClient;
use crate::types::{FileStat, FsStats};

fn bad_handle() -> FsError {
    FsError::Io(std::io::Error::other("invalid file handle"))
}

/// URL-unescapes, flips backslashes, and lexically cleans a kernel path.
/// The result is absolute with no trailing slash (except the root).
pub fn normalize_path(path: &str) -> FsResult<String> {
    let decoded = percent_decode_str(path)
        .decode_utf8()
        .map_err(|_| FsError::InvalidArgument)?;
    let slashed = decoded.replace('\\', "/");

    let mut parts: Vec<&str> = Vec::new();
    for seg in slashed.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Ok("/".to_string());
    }
    Ok(format!("/{}", parts.join("/")))
}

/// The filesystem core wired between the kernel bridge and the remote.
pub struct DavFs {
    client: Arc<dyn RemoteClient>,
    buffers: Arc<BufferCache>,
    handles: HandleTable,
    locks: LockManager,
}

impl DavFs {
    /// `buffers` is shared with the remote client, which drops entries on
    /// remove/rename.
    pub fn new(client: Arc<dyn RemoteClient>, buffers: Arc<BufferCache>) -> Self {
        Self {
            client,
            buffers,
            handles: HandleTable::new(),
            locks: LockManager::new(),
        }
    }

    pub fn open_handle_count(&self) -> usize {
        self.handles.len()
    }

    // --- metadata ---

    pub fn getattr(&self, path: &str, fh: Option<u64>) -> FsResult<FileStat> {
        let norm = normalize_path(path)?;
        if norm == "/" {
            return Ok(FileStat::root());
        }

        if let Some(handle) = fh.and_then(|id| self.handles.get(id)) {
            let mut stat = handle.stat();
            let buffer = handle.buffer();
            stat.size = stat.size.max(buffer.base() + buffer.size());
            debug!(target: "mimic::fs", path = %norm, fh, size = stat.size, "getattr from handle");
            return Ok(stat);
        }

        let mut stat = self.client.stat(&norm)?;
        // a resident buffer may have grown the file past the remote's idea
        if let Some(buffer) = self.buffers.get(&norm) {
            if buffer.is_dirty() {
                stat.size = stat.size.max(buffer.base() + buffer.size());
            }
        }
        Ok(stat)
    }

    pub fn statfs(&self) -> FsStats {
        FsStats::default()
    }

    // --- open/create/release ---

    pub fn open(&self, path: &str, flags: OpenFlags) -> FsResult<u64> {
        let norm = normalize_path(path)?;

        let mut stat = match self.client.stat(&norm) {
            Ok(stat) => {
                if flags.exclusive() {
                    return Err(FsError::AlreadyExists);
                }
                if stat.is_dir && flags.write_allowed() {
                    return Err(FsError::IsADirectory);
                }
                stat
            }
            Err(FsError::NotFound) if flags.create() => {
                self.client.create(&norm)?;
                self.client
                    .stat(&norm)
                    .unwrap_or_else(|_| FileStat::new_file(basename(&norm)))
            }
            Err(e) => return Err(e),
        };

        if flags.truncate() && flags.write_allowed() && stat.size > 0 {
            self.client.truncate(&norm, 0)?;
            stat.size = 0;
            if let Some(buffer) = self.buffers.get(&norm) {
                buffer.clear();
            }
        }

        let fh = self.handles.new_handle(&self.buffers, &norm, stat, flags);
        debug!(target: "mimic::fs", path = %norm, fh, flags = flags.0, "open");
        Ok(fh)
    }

    pub fn create(&self, path: &str, flags: OpenFlags) -> FsResult<u64> {
        let norm = normalize_path(path)?;
        self.client.create(&norm)?;

        // refresh the real stat when the server answers; otherwise
        // synthesize an empty file until the cache catches up
        let stat = self
            .client
            .stat(&norm)
            .unwrap_or_else(|_| FileStat::new_file(basename(&norm)));

        let fh = self.handles.new_handle(&self.buffers, &norm, stat, flags);
        debug!(target: "mimic::fs", path = %norm, fh, flags = flags.0, "create");
        Ok(fh)
    }

    /// Flushes dirty data, then drops the handle. The flush outcome is the
    /// caller's result so a failed upload reaches the closing process.
    pub fn release(&self, fh: u64) -> FsResult<()> {
        let result = self.flush(fh);
        self.handles.release(fh, &self.buffers);
        result
    }

    // --- data path ---

    pub fn read(&self, fh: u64, offset: i64, size: usize) -> FsResult<Vec<u8>> {
        let handle = self.handles.get(fh).ok_or_else(bad_handle)?;
        if !handle.flags().read_allowed() {
            return Err(FsError::Forbidden);
        }

        let req_len = size as i64;
        if req_len == 0 {
            return Ok(Vec::new());
        }

        let buffer = handle.buffer();

        // full buffer hit: serve straight from the image
        if buffer.covers(offset, req_len) {
            let base = buffer.base();
            debug!(target: "mimic::fs", path = handle.path(), fh, offset, len = req_len, "read hit");
            return buffer.read_at(offset - base, req_len);
        }

        let remote_size = handle.remote_size();
        let snapshot = buffer.copy_snapshot();

        if !buffer.is_dirty() && offset >= remote_size {
            return Ok(Vec::new()); // EOF
        }

        let (page_start, fetch_len) = page_aligned_range(offset, req_len, remote_size);
        let remote_bytes = if fetch_len > 0 {
            let mut body = self.client.read_range(handle.path(), page_start, fetch_len)?;
            let mut bytes = Vec::with_capacity(fetch_len as usize);
            body.read_to_end(&mut bytes)?;
            buffer.write_remote_at(page_start, &bytes)?;
            bytes
        } else {
            Vec::new()
        };
        debug!(
            target: "mimic::fs",
            path = handle.path(),
            fh,
            offset,
            len = req_len,
            window_start = page_start,
            window_len = remote_bytes.len(),
            "read miss"
        );

        Ok(merge_remote_and_buffer(
            &remote_bytes,
            page_start,
            &snapshot,
            offset,
            req_len,
        ))
    }

    pub fn write(&self, fh: u64, offset: i64, data: &[u8]) -> FsResult<usize> {
        let handle = self.handles.get(fh).ok_or_else(bad_handle)?;
        if !handle.flags().write_allowed() {
            return Err(FsError::Forbidden);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let len = data.len() as i64;
        let buffer = handle.buffer();
        let remote_size = handle.remote_size();

        // a write that only partially covers its pages would make those
        // pages authoritative with stale holes; preheat them from remote
        let end = offset + len;
        let fully_covering =
            offset % crate::page::PAGE_SIZE == 0 && (end % crate::page::PAGE_SIZE == 0 || end >= remote_size);
        if !fully_covering && offset < remote_size && !buffer.covers(offset, len) {
            let (page_start, fetch_len) = page_aligned_range(offset, len, remote_size);
            if fetch_len > 0 {
                let mut body = self.client.read_range(handle.path(), page_start, fetch_len)?;
                let mut bytes = Vec::with_capacity(fetch_len as usize);
                body.read_to_end(&mut bytes)?;
                buffer.write_remote_at(page_start, &bytes)?;
            }
        }

        buffer.write_at(offset, data)?;
        handle.extend_size(end);
        debug!(target: "mimic::fs", path = handle.path(), fh, offset, len, "buffered write");
        Ok(data.len())
    }

    /// Uploads the buffer if it carries dirty data. No-op for read-only
    /// handles and unknown handles (the kernel flushes liberally).
    pub fn flush(&self, fh: u64) -> FsResult<()> {
        let Some(handle) = self.handles.get(fh) else {
            return Ok(());
        };
        if !handle.flags().write_allowed() {
            return Ok(());
        }
        let buffer = handle.buffer();
        if !buffer.is_dirty() {
            return Ok(());
        }

        let snapshot = buffer.copy_snapshot();
        debug!(
            target: "mimic::fs",
            path = handle.path(),
            fh,
            base = snapshot.base,
            len = snapshot.data.len(),
            "flush"
        );

        match self.client.write_offset(handle.path(), &snapshot.data, snapshot.base) {
            Ok(()) => {}
            Err(FsError::NotFound) if handle.flags().create() => {
                // the object vanished under us; rebuild it with a zero
                // prefix up to the buffer base
                let end = snapshot.base as usize + snapshot.data.len();
                let mut full = vec![0u8; end];
                full[snapshot.base as usize..].copy_from_slice(&snapshot.data);
                self.client.write(handle.path(), &full)?;
            }
            Err(FsError::Forbidden) => return Err(FsError::Forbidden),
            Err(e) => {
                warn!(target: "mimic::fs", path = handle.path(), fh, error = %e, "flush failed");
                return Err(FsError::Io(std::io::Error::other(e.to_string())));
            }
        }

        let new_size = snapshot.base + snapshot.data.len() as i64;
        buffer.clear();
        handle.set_remote_size(new_size.max(handle.remote_size()));
        handle.extend_size(new_size);
        Ok(())
    }

    // --- namespace operations ---

    pub fn truncate(&self, path: &str, size: i64, fh: Option<u64>) -> FsResult<()> {
        let norm = normalize_path(path)?;
        if let Some(handle) = fh.and_then(|id| self.handles.get(id)) {
            if !handle.flags().write_allowed() {
                return Err(FsError::Forbidden);
            }
        }

        self.client.truncate(&norm, size)?;

        if let Some(buffer) = self.buffers.get(&norm) {
            if !buffer.is_dirty() {
                buffer.clear();
            }
        }
        if let Some(handle) = fh.and_then(|id| self.handles.get(id)) {
            let mut stat = handle.stat();
            stat.size = size;
            handle.set_stat(stat);
            handle.set_remote_size(size);
        }
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> FsResult<()> {
        let norm = normalize_path(path)?;
        self.client.remove(&norm)
    }

    pub fn mkdir(&self, path: &str) -> FsResult<()> {
        let norm = normalize_path(path)?;
        self.client.mkdir(&norm)
    }

    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        let norm = normalize_path(path)?;
        self.client.rmdir(&norm)
    }

    pub fn rename(&self, old: &str, new: &str) -> FsResult<()> {
        let old = normalize_path(old)?;
        let new = normalize_path(new)?;
        self.client.rename(&old, &new)
    }

    // --- directories ---

    pub fn opendir(&self, path: &str) -> FsResult<u64> {
        let norm = normalize_path(path)?;
        let stat = if norm == "/" {
            FileStat::root()
        } else {
            let stat = self.client.stat(&norm)?;
            if !stat.is_dir {
                return Err(FsError::NotADirectory);
            }
            stat
        };
        Ok(self.handles.new_handle(&self.buffers, &norm, stat, OpenFlags(0)))
    }

    pub fn read_dir(&self, path: &str) -> FsResult<Vec<FileStat>> {
        let norm = normalize_path(path)?;
        self.client.read_dir(&norm)
    }

    /// Directory handles carry no dirty data; just drop the entry.
    pub fn releasedir(&self, fh: u64) {
        self.handles.release(fh, &self.buffers);
    }

    // --- advisory range locks ---

    pub fn lock(&self, path: &str, owner: &[u8], start: i64, end: i64, kind: LockKind) -> FsResult<()> {
        let norm = normalize_path(path)?;
        self.locks.try_acquire(&norm, owner, start, end, kind)
    }

    pub fn lock_wait(
        &self,
        cancel: &CancelToken,
        path: &str,
        owner: &[u8],
        start: i64,
        end: i64,
        kind: LockKind,
    ) -> FsResult<()> {
        let norm = normalize_path(path)?;
        self.locks.acquire_wait(cancel, &norm, owner, start, end, kind)
    }

    pub fn unlock(&self, path: &str, owner: &[u8], start: i64, end: i64) -> FsResult<()> {
        let norm = normalize_path(path)?;
        self.locks.release(&norm, owner, start, end)
    }

    pub fn lock_query(&self, path: &str, start: i64, end: i64) -> FsResult<Option<LockInfo>> {
        let norm = normalize_path(path)?;
        Ok(self.locks.query(&norm, start, end))
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(any(test, feature = "testing"))]
pub mod memory_remote;

#[cfg(test)]
mod tests {
    use super::*;
    use super::memory_remote::MemoryRemote;
    use crate::remote::MockRemoteClient;
    use libc::{O_APPEND, O_CREAT, O_EXCL, O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY};
    use std::io::Cursor;
    use std::thread;
    use std::time::Duration;

    fn flags(bits: i32) -> OpenFlags {
        OpenFlags(bits as u32)
    }

    fn engine_with(remote: MemoryRemote) -> DavFs {
        DavFs::new(Arc::new(remote), Arc::new(BufferCache::new()))
    }

    #[test]
    fn normalize_path_cases() {
        assert_eq!(normalize_path("/a/b").unwrap(), "/a/b");
        assert_eq!(normalize_path("").unwrap(), "/");
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert_eq!(normalize_path("a//b/").unwrap(), "/a/b");
        assert_eq!(normalize_path(r"\a\b").unwrap(), "/a/b");
        assert_eq!(normalize_path("/a/./b/../c").unwrap(), "/a/c");
        assert_eq!(normalize_path("/with%20space").unwrap(), "/with space");
    }

    #[test]
    fn getattr_root_is_synthetic() {
        let engine = engine_with(MemoryRemote::new());
        let stat = engine.getattr("/", None).unwrap();
        assert!(stat.is_dir);
        assert_eq!(stat.size, 0);
    }

    #[test]
    fn getattr_reflects_buffered_growth() {
        let remote = MemoryRemote::new();
        remote.insert_file("/f", b"1234");
        let engine = engine_with(remote);

        let fh = engine.open("/f", flags(O_RDWR)).unwrap();
        engine.write(fh, 4, b"5678").unwrap();
        let stat = engine.getattr("/f", Some(fh)).unwrap();
        assert_eq!(stat.size, 8);
    }

    #[test]
    fn open_missing_without_create_fails() {
        let engine = engine_with(MemoryRemote::new());
        assert!(matches!(
            engine.open("/missing", flags(O_RDONLY)),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn open_create_makes_remote_file() {
        let remote = MemoryRemote::new();
        let engine = DavFs::new(Arc::new(remote.clone()), Arc::new(BufferCache::new()));
        let fh = engine.open("/new", flags(O_WRONLY | O_CREAT)).unwrap();
        assert!(fh > 0);
        assert_eq!(remote.file_content("/new"), Some(Vec::new()));
    }

    #[test]
    fn open_exclusive_on_existing_fails() {
        let remote = MemoryRemote::new();
        remote.insert_file("/f", b"x");
        let engine = engine_with(remote);
        assert!(matches!(
            engine.open("/f", flags(O_WRONLY | O_CREAT | O_EXCL)),
            Err(FsError::AlreadyExists)
        ));
    }

    #[test]
    fn open_directory_for_write_fails() {
        let remote = MemoryRemote::new();
        remote.insert_dir("/d");
        let engine = engine_with(remote);
        assert!(matches!(
            engine.open("/d", flags(O_RDWR)),
            Err(FsError::IsADirectory)
        ));
    }

    #[test]
    fn read_denied_on_write_only_handle() {
        let remote = MemoryRemote::new();
        remote.insert_file("/f", b"BASE");
        let engine = engine_with(remote);
        let fh = engine.open("/f", flags(O_WRONLY)).unwrap();
        assert!(matches!(engine.read(fh, 0, 4), Err(FsError::Forbidden)));
    }

    #[test]
    fn write_denied_on_read_only_handle() {
        let remote = MemoryRemote::new();
        remote.insert_file("/f", b"BASE");
        let engine = engine_with(remote);
        let fh = engine.open("/f", flags(O_RDONLY)).unwrap();
        assert!(matches!(
            engine.write(fh, 0, b"X"),
            Err(FsError::Forbidden)
        ));
    }

    #[test]
    fn write_only_create_trunc_then_write() {
        let remote = MemoryRemote::new();
        remote.insert_file("/f", b"BASE");
        let engine = DavFs::new(Arc::new(remote.clone()), Arc::new(BufferCache::new()));

        let fh = engine.open("/f", flags(O_WRONLY | O_CREAT | O_TRUNC)).unwrap();
        engine.write(fh, 0, b"WO").unwrap();
        engine.release(fh).unwrap();
        assert_eq!(remote.file_content("/f"), Some(b"WO".to_vec()));
    }

    #[test]
    fn append_create_extends_content() {
        let remote = MemoryRemote::new();
        remote.insert_file("/f", b"BASE");
        let engine = DavFs::new(Arc::new(remote.clone()), Arc::new(BufferCache::new()));

        let fh = engine.open("/f", flags(O_WRONLY | O_APPEND | O_CREAT)).unwrap();
        let size = engine.getattr("/f", Some(fh)).unwrap().size;
        engine.write(fh, size, b"A").unwrap();
        engine.release(fh).unwrap();
        assert_eq!(remote.file_content("/f"), Some(b"BASEA".to_vec()));
    }

    #[test]
    fn truncate_open_shrinks_to_single_write() {
        let remote = MemoryRemote::new();
        remote.insert_file("/f", b"BASE");
        let engine = DavFs::new(Arc::new(remote.clone()), Arc::new(BufferCache::new()));

        let fh = engine.open("/f", flags(O_RDWR | O_TRUNC)).unwrap();
        engine.write(fh, 0, b"T").unwrap();
        engine.release(fh).unwrap();
        assert_eq!(remote.file_content("/f"), Some(b"T".to_vec()));
    }

    #[test]
    fn read_serves_remote_content() {
        let remote = MemoryRemote::new();
        remote.insert_file("/f", b"0123456789");
        let engine = engine_with(remote);
        let fh = engine.open("/f", flags(O_RDONLY)).unwrap();
        assert_eq!(engine.read(fh, 0, 10).unwrap(), b"0123456789");
        assert_eq!(engine.read(fh, 4, 3).unwrap(), b"456");
    }

    #[test]
    fn read_past_eof_is_empty() {
        let remote = MemoryRemote::new();
        remote.insert_file("/f", b"short");
        let engine = engine_with(remote);
        let fh = engine.open("/f", flags(O_RDONLY)).unwrap();
        assert!(engine.read(fh, 100, 10).unwrap().is_empty());
        assert!(engine.read(fh, 0, 0).unwrap().is_empty());
    }

    #[test]
    fn read_clamps_at_eof() {
        let remote = MemoryRemote::new();
        remote.insert_file("/f", b"abc");
        let engine = engine_with(remote);
        let fh = engine.open("/f", flags(O_RDONLY)).unwrap();
        assert_eq!(engine.read(fh, 1, 100).unwrap(), b"bc");
    }

    #[test]
    fn second_read_hits_the_buffer() {
        let remote = MemoryRemote::new();
        remote.insert_file("/f", b"0123456789");
        let engine = DavFs::new(Arc::new(remote.clone()), Arc::new(BufferCache::new()));
        let fh = engine.open("/f", flags(O_RDONLY)).unwrap();

        assert_eq!(engine.read(fh, 0, 4).unwrap(), b"0123");
        let fetches = remote.range_fetches();
        assert_eq!(engine.read(fh, 4, 4).unwrap(), b"4567");
        // readahead covered the whole small file; no second round-trip
        assert_eq!(remote.range_fetches(), fetches);
    }

    #[test]
    fn read_merges_dirty_overlay_with_remote() {
        let remote = MemoryRemote::new();
        remote.insert_file("/f", vec![b'r'; 10000].as_slice());
        let engine = engine_with(remote);
        let fh = engine.open("/f", flags(O_RDWR)).unwrap();

        // page-covering write: no preheat, the buffer holds only page 1
        engine.write(fh, 4096, &vec![b'L'; 4096]).unwrap();

        // the window [0, 8192) misses page 0, so remote bytes are fetched
        // and merged under the dirty page
        let out = engine.read(fh, 0, 8192).unwrap();
        assert_eq!(out.len(), 8192);
        assert!(out[..4096].iter().all(|&b| b == b'r'));
        assert!(out[4096..].iter().all(|&b| b == b'L'));
    }

    #[test]
    fn partial_page_write_preheats_and_flushes_merged() {
        let remote = MemoryRemote::new();
        remote.insert_file("/f", b"0123456789");
        let engine = DavFs::new(Arc::new(remote.clone()), Arc::new(BufferCache::new()));

        let fh = engine.open("/f", flags(O_RDWR)).unwrap();
        engine.write(fh, 2, b"AB").unwrap();
        engine.flush(fh).unwrap();
        assert_eq!(remote.file_content("/f"), Some(b"01AB456789".to_vec()));
    }

    #[test]
    fn flush_is_noop_without_dirty_data() {
        let remote = MemoryRemote::new();
        remote.insert_file("/f", b"data");
        let engine = DavFs::new(Arc::new(remote.clone()), Arc::new(BufferCache::new()));
        let fh = engine.open("/f", flags(O_RDWR)).unwrap();
        engine.read(fh, 0, 4).unwrap();
        let puts = remote.put_count();
        engine.flush(fh).unwrap();
        assert_eq!(remote.put_count(), puts);
    }

    #[test]
    fn flush_missing_object_with_create_writes_zero_prefix() {
        let remote = MemoryRemote::new();
        let engine = DavFs::new(Arc::new(remote.clone()), Arc::new(BufferCache::new()));

        let fh = engine.open("/f", flags(O_WRONLY | O_CREAT)).unwrap();
        remote.remove_file("/f"); // racing delete under our feet
        engine.write(fh, 4, b"data").unwrap();
        engine.flush(fh).unwrap();

        let mut expect = vec![0u8; 4];
        expect.extend_from_slice(b"data");
        assert_eq!(remote.file_content("/f"), Some(expect));
    }

    #[test]
    fn flush_propagates_forbidden() {
        let mut mock = MockRemoteClient::new();
        mock.expect_stat().returning(|_| Ok(FileStat::new_file("f")));
        mock.expect_write_offset().returning(|_, _, _| Err(FsError::Forbidden));
        let engine = DavFs::new(Arc::new(mock), Arc::new(BufferCache::new()));

        let fh = engine.open("/f", flags(O_WRONLY)).unwrap();
        engine.write(fh, 0, b"x").unwrap();
        assert!(matches!(engine.flush(fh), Err(FsError::Forbidden)));
    }

    #[test]
    fn flush_wraps_other_errors_as_io() {
        let mut mock = MockRemoteClient::new();
        mock.expect_stat().returning(|_| Ok(FileStat::new_file("f")));
        mock.expect_write_offset()
            .returning(|_, _, _| Err(FsError::RangeNotSatisfiable));
        let engine = DavFs::new(Arc::new(mock), Arc::new(BufferCache::new()));

        let fh = engine.open("/f", flags(O_WRONLY)).unwrap();
        engine.write(fh, 0, b"x").unwrap();
        assert!(matches!(engine.flush(fh), Err(FsError::Io(_))));
    }

    #[test]
    fn release_reports_flush_result_and_drops_handle() {
        let remote = MemoryRemote::new();
        remote.insert_file("/f", b"");
        let engine = DavFs::new(Arc::new(remote.clone()), Arc::new(BufferCache::new()));

        let fh = engine.open("/f", flags(O_RDWR)).unwrap();
        engine.write(fh, 0, b"bits").unwrap();
        engine.release(fh).unwrap();
        assert_eq!(remote.file_content("/f"), Some(b"bits".to_vec()));
        assert_eq!(engine.open_handle_count(), 0);
        assert!(matches!(engine.read(fh, 0, 1), Err(FsError::Io(_))));
    }

    #[test]
    fn truncate_round_trip() {
        let remote = MemoryRemote::new();
        remote.insert_file("/f", b"0123456789");
        let engine = DavFs::new(Arc::new(remote.clone()), Arc::new(BufferCache::new()));

        engine.truncate("/f", 4, None).unwrap();
        assert_eq!(remote.file_content("/f"), Some(b"0123".to_vec()));

        engine.truncate("/f", 10, None).unwrap();
        let content = remote.file_content("/f").unwrap();
        assert_eq!(content.len(), 10);
        assert_eq!(&content[..4], b"0123");
        assert!(content[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn truncate_requires_writable_handle() {
        let remote = MemoryRemote::new();
        remote.insert_file("/f", b"0123");
        let engine = engine_with(remote);
        let fh = engine.open("/f", flags(O_RDONLY)).unwrap();
        assert!(matches!(
            engine.truncate("/f", 1, Some(fh)),
            Err(FsError::Forbidden)
        ));
    }

    #[test]
    fn directory_operations_pass_through() {
        let remote = MemoryRemote::new();
        remote.insert_dir("/d");
        remote.insert_file("/d/a", b"1");
        remote.insert_file("/d/b", b"22");
        let engine = DavFs::new(Arc::new(remote.clone()), Arc::new(BufferCache::new()));

        let dh = engine.opendir("/d").unwrap();
        let mut names: Vec<String> =
            engine.read_dir("/d").unwrap().into_iter().map(|s| s.name).collect();
        names.sort();
        assert_eq!(names, ["a", "b"]);
        engine.releasedir(dh);

        engine.mkdir("/d/sub").unwrap();
        assert!(remote.dir_exists("/d/sub"));
        engine.rmdir("/d/sub").unwrap();
        assert!(!remote.dir_exists("/d/sub"));

        engine.unlink("/d/a").unwrap();
        assert_eq!(remote.file_content("/d/a"), None);

        engine.rename("/d/b", "/d/c").unwrap();
        assert_eq!(remote.file_content("/d/c"), Some(b"22".to_vec()));
    }

    #[test]
    fn opendir_on_file_fails() {
        let remote = MemoryRemote::new();
        remote.insert_file("/f", b"x");
        let engine = engine_with(remote);
        assert!(matches!(engine.opendir("/f"), Err(FsError::NotADirectory)));
    }

    #[test]
    fn statfs_is_synthesized() {
        let engine = engine_with(MemoryRemote::new());
        let stats = engine.statfs();
        assert_eq!(stats.block_size, 4096);
        assert_eq!(stats.blocks, 1024 * 1024);
        assert_eq!(stats.blocks_free, 512 * 1024);
        assert_eq!(stats.name_max, 255);
    }

    #[test]
    fn range_locks_route_through_engine() {
        let engine = engine_with(MemoryRemote::new());
        engine.lock("/f", b"a", 0, 10, LockKind::Exclusive).unwrap();
        assert!(matches!(
            engine.lock("/f", b"b", 5, 6, LockKind::Shared),
            Err(FsError::WouldBlock)
        ));
        let info = engine.lock_query("/f", 0, 1).unwrap().expect("lock present");
        assert_eq!(info.owner, b"a");
        engine.unlock("/f", b"a", 0, 10).unwrap();
        assert!(engine.lock_query("/f", 0, 1).unwrap().is_none());
    }

    #[test]
    fn concurrent_append_and_tailing_read() {
        let remote = MemoryRemote::new();
        remote.insert_file("/log", b"");
        let engine = Arc::new(DavFs::new(
            Arc::new(remote.clone()),
            Arc::new(BufferCache::new()),
        ));

        let lines: Vec<Vec<u8>> =
            (0..5).map(|i| format!("line number {i}\n").into_bytes()).collect();
        let total: usize = lines.iter().map(|l| l.len()).sum();

        let writer_engine = Arc::clone(&engine);
        let writer_lines = lines.clone();
        let writer = thread::spawn(move || {
            let fh = writer_engine.open("/log", flags(O_WRONLY | O_APPEND)).unwrap();
            for line in writer_lines {
                let size = writer_engine.getattr("/log", Some(fh)).unwrap().size;
                writer_engine.write(fh, size, &line).unwrap();
                writer_engine.flush(fh).unwrap();
                thread::sleep(Duration::from_millis(100));
            }
            writer_engine.release(fh).unwrap();
        });

        let reader_engine = Arc::clone(&engine);
        let reader = thread::spawn(move || {
            let mut seen: Vec<u8> = Vec::new();
            let mut pos: i64 = 0;
            while seen.len() < total {
                let size = reader_engine.getattr("/log", None).unwrap().size;
                if size > pos {
                    let fh = reader_engine.open("/log", flags(O_RDONLY)).unwrap();
                    let chunk = reader_engine.read(fh, pos, (size - pos) as usize).unwrap();
                    reader_engine.release(fh).unwrap();
                    pos += chunk.len() as i64;
                    seen.extend_from_slice(&chunk);
                }
                thread::sleep(Duration::from_millis(20));
            }
            seen
        });

        writer.join().unwrap();
        let seen = reader.join().unwrap();
        assert_eq!(seen.len(), total);
        assert_eq!(seen.split(|&b| b == b'\n').filter(|l| !l.is_empty()).count(), 5);
        assert_eq!(seen, lines.concat());
    }

    #[test]
    fn read_streams_work_via_cursor() {
        // guards the Box<dyn Read + Send> seam shape
        let mut mock = MockRemoteClient::new();
        mock.expect_stat().returning(|_| {
            Ok(FileStat {
                size: 5,
                ..FileStat::new_file("f")
            })
        });
        mock.expect_read_range().returning(|_, _, _| {
            Ok(Box::new(Cursor::new(b"hello".to_vec())) as Box<dyn Read + Send>)
        });
        let engine = DavFs::new(Arc::new(mock), Arc::new(BufferCache::new()));
        let fh = engine.open("/f", flags(O_RDONLY)).unwrap();
        assert_eq!(engine.read(fh, 0, 5).unwrap(), b"hello");
    }
}
