// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Caching remote-client facade over the WebDAV transport.
//!
//! Sits between the engine and the wire: metadata flows through the node
//! cache, content writes go through `commit` (whole-object PUT with a
//! streaming threshold), and `write_offset` probes the server's
//! non-standard ranged PUT once, remembering the answer for the rest of
//! the process.

use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicI8, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use mimic_core::bufcache::BufferCache;
use mimic_core::error::{FsError, FsResult};
use mimic_core::node_cache::{parent_of, NodeCache};
use mimic_core::remote::RemoteClient;
use mimic_core::types::FileStat;

use crate::wire::{HttpTransport, Transport};
use crate::xml::{parse_multistatus, to_file_stat};

/// Bodies above this go through the streaming PUT path.
pub const STREAM_THRESHOLD: usize = 4 * 1024 * 1024;

const STATUS_MULTISTATUS: u16 = 207;

/// Tri-state capability memo for the non-standard ranged PUT.
const PARTIAL_PUT_UNKNOWN: i8 = 0;
const PARTIAL_PUT_YES: i8 = 1;
const PARTIAL_PUT_NO: i8 = -1;

pub struct DavClient {
    transport: Box<dyn Transport>,
    cache: NodeCache,
    buffers: Arc<BufferCache>,
    partial_put: AtomicI8,
}

/// Strips the trailing slash unless the path is the root.
fn file_path(path: &str) -> &str {
    if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    }
}

fn dir_path(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

fn is_2xx(status: u16) -> bool {
    (200..300).contains(&status)
}

impl DavClient {
    pub fn new(
        transport: Box<dyn Transport>,
        ttl: Duration,
        max_entries: usize,
        buffers: Arc<BufferCache>,
    ) -> Self {
        Self {
            transport,
            cache: NodeCache::new(ttl, max_entries),
            buffers,
            partial_put: AtomicI8::new(PARTIAL_PUT_UNKNOWN),
        }
    }

    /// Builds the production client over HTTP basic auth.
    pub fn connect(
        server: &str,
        username: &str,
        password: &str,
        ttl: Duration,
        max_entries: usize,
        buffers: Arc<BufferCache>,
    ) -> FsResult<Self> {
        let transport = HttpTransport::new(server, username, password)?;
        Ok(Self::new(Box::new(transport), ttl, max_entries, buffers))
    }

    /// PROPFIND Depth:0 with the directory retry: some servers answer
    /// 200/301 for a collection queried without its trailing slash.
    fn stat_fresh(&self, path: &str) -> FsResult<FileStat> {
        let (status, body) = self.transport.propfind(path, 0)?;
        let (status, body, from_dir_retry) = match status {
            STATUS_MULTISTATUS => (status, body, false),
            200 | 301 if !path.ends_with('/') => {
                let retry = dir_path(path);
                let (s, b) = self.transport.propfind(&retry, 0)?;
                (s, b, true)
            }
            404 => return Err(FsError::NotFound),
            other => {
                return Err(FsError::classify(&format!(
                    "PROPFIND {path}: status {other}"
                )))
            }
        };
        if status != STATUS_MULTISTATUS {
            if status == 404 {
                return Err(FsError::NotFound);
            }
            return Err(FsError::classify(&format!(
                "PROPFIND {path}: status {status}"
            )));
        }

        let responses = parse_multistatus(&body)?;
        let first = responses.first().ok_or(FsError::NotFound)?;
        let mut stat = to_file_stat(first);
        if from_dir_retry {
            stat.is_dir = true;
        }
        Ok(stat)
    }

    fn commit(&self, path: &str, data: &[u8]) -> FsResult<()> {
        let path = file_path(path);
        let result = if data.len() > STREAM_THRESHOLD {
            self.transport.put_stream(path, data.to_vec())
        } else {
            self.transport.put(path, data)
        };
        if result.is_ok() {
            self.cache.invalidate(path);
        }
        result
    }

    /// Whole-object download, tolerating a trailing slash on the path.
    fn fetch(&self, path: &str) -> FsResult<Vec<u8>> {
        let path = file_path(path);
        match self.transport.get_stream(path) {
            Ok(mut stream) => {
                let mut data = Vec::new();
                stream.read_to_end(&mut data)?;
                Ok(data)
            }
            Err(FsError::Io(_)) => self.transport.get(path),
            Err(e) => Err(e),
        }
    }

    fn try_partial_put(&self, path: &str, data: &[u8], offset: i64) -> FsResult<bool> {
        if self.partial_put.load(Ordering::Relaxed) == PARTIAL_PUT_NO {
            return Ok(false);
        }
        let status = self.transport.put_range(path, data, offset)?;
        if is_2xx(status) {
            self.partial_put.store(PARTIAL_PUT_YES, Ordering::Relaxed);
            return Ok(true);
        }
        // remember the rejection; probing every operation would
        // round-trip forever against servers that never support it
        debug!(target: "mimic::webdav", path, status, "ranged PUT rejected, disabling");
        self.partial_put.store(PARTIAL_PUT_NO, Ordering::Relaxed);
        Ok(false)
    }
}

impl RemoteClient for DavClient {
    fn stat(&self, path: &str) -> FsResult<FileStat> {
        if let Some(entry) = self.cache.get(path) {
            if let Some(stat) = entry.stat {
                return Ok(stat);
            }
        }

        let stat = self.stat_fresh(path)?;
        self.cache.set(path, self.cache.entry_for(stat.clone()));
        Ok(stat)
    }

    fn read_dir(&self, path: &str) -> FsResult<Vec<FileStat>> {
        if let Some(children) = self.cache.get_children(path) {
            return Ok(children);
        }

        let query = dir_path(path);
        let (status, body) = self.transport.propfind(&query, 1)?;
        match status {
            STATUS_MULTISTATUS => {}
            404 => return Err(FsError::NotFound),
            other => {
                return Err(FsError::classify(&format!(
                    "PROPFIND {query}: status {other}"
                )))
            }
        }

        let children: Vec<FileStat> = parse_multistatus(&body)?
            .iter()
            .skip(1) // first response is the collection itself
            .map(to_file_stat)
            .collect();

        self.cache.set_children(path, children.clone());
        Ok(children)
    }

    fn read(&self, path: &str) -> FsResult<Vec<u8>> {
        self.fetch(path)
    }

    fn read_stream(&self, path: &str) -> FsResult<Box<dyn Read + Send>> {
        self.transport.get_stream(file_path(path))
    }

    fn read_range(&self, path: &str, offset: i64, len: i64) -> FsResult<Box<dyn Read + Send>> {
        self.transport.get_range(file_path(path), offset, len)
    }

    fn write(&self, path: &str, data: &[u8]) -> FsResult<()> {
        self.commit(path, data)
    }

    fn write_offset(&self, path: &str, data: &[u8], offset: i64) -> FsResult<()> {
        let path = file_path(path);
        if self.try_partial_put(path, data, offset)? {
            self.cache.invalidate(path);
            return Ok(());
        }

        // fall back to read-modify-write of the whole object
        let existing = match self.fetch(path) {
            Ok(existing) => existing,
            Err(FsError::NotFound) if offset == 0 => Vec::new(),
            Err(e) => return Err(e),
        };

        let end = offset as usize + data.len();
        let mut merged = existing;
        if end > merged.len() {
            merged.resize(end, 0);
        }
        merged[offset as usize..end].copy_from_slice(data);
        self.commit(path, &merged)
    }

    fn create(&self, path: &str) -> FsResult<()> {
        if path.ends_with('/') {
            return Err(FsError::InvalidArgument);
        }
        self.commit(path, &[])?;
        self.cache.invalidate_tree(&parent_of(path));
        Ok(())
    }

    fn remove(&self, path: &str) -> FsResult<()> {
        self.transport.delete(file_path(path))?;
        self.cache.invalidate_tree(&parent_of(path));
        self.cache.invalidate(path);
        self.buffers.delete(path);
        Ok(())
    }

    fn truncate(&self, path: &str, size: i64) -> FsResult<()> {
        let current = match self.stat_fresh(path) {
            Ok(stat) => Some(stat.size),
            Err(FsError::NotFound) => None,
            Err(e) => return Err(e),
        };

        match current {
            Some(len) if len == size => Ok(()),
            Some(len) => {
                let mut data = self.fetch(path)?;
                if size < len {
                    data.truncate(size as usize);
                } else {
                    data.resize(size as usize, 0);
                }
                self.commit(path, &data)
            }
            None if size == 0 => self.create(path),
            None => Err(FsError::NotFound),
        }
    }

    fn mkdir(&self, path: &str) -> FsResult<()> {
        self.transport.mkcol(&dir_path(path))?;
        self.cache.invalidate_tree(&parent_of(path));
        self.cache.invalidate(path);
        Ok(())
    }

    fn rmdir(&self, path: &str) -> FsResult<()> {
        self.transport.delete(&dir_path(path))?;
        self.cache.invalidate_tree(&parent_of(path));
        self.cache.invalidate_tree(path);
        Ok(())
    }

    fn rename(&self, old: &str, new: &str) -> FsResult<()> {
        let status = self.transport.move_to(file_path(old), file_path(new))?;
        if !is_2xx(status) {
            // MOVE unsupported or refused; copy then delete
            warn!(target: "mimic::webdav", old, new, status, "MOVE rejected, copying");
            let data = self.fetch(old)?;
            self.commit(new, &data)?;
            self.transport.delete(file_path(old))?;
        }

        self.cache.invalidate_tree(old);
        self.cache.invalidate_tree(new);
        self.cache.invalidate(old);
        self.cache.invalidate(new);
        self.buffers.delete(old);
        self.buffers.delete(new);
        Ok(())
    }
}
