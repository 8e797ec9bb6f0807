// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory `RemoteClient` double for engine tests.
//!
//! Behaves like a small WebDAV server would through the facade: whole
//! files keyed by path, directories as a path set, `write_offset` with
//! overlay semantics, truncate with shrink/zero-extend. Counters expose
//! how often the engine actually hit the "network".

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::error::{FsError, FsResult};
use crate::remote::RemoteClient;
use crate::types::FileStat;

#[derive(Default)]
struct Inner {
    files: Mutex<HashMap<String, Vec<u8>>>,
    dirs: Mutex<HashSet<String>>,
    range_fetches: AtomicUsize,
    puts: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Inner>,
}

fn file_stat(name: &str, size: i64, is_dir: bool) -> FileStat {
    let now = SystemTime::now();
    FileStat {
        name: name.to_string(),
        is_dir,
        size,
        mtime: now,
        created: now,
        etag: String::new(),
        content_type: String::new(),
    }
}

fn base_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

fn parent(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/",
        Some(idx) => &trimmed[..idx],
        None => "/",
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_file(&self, path: &str, content: &[u8]) {
        self.inner.files.lock().unwrap().insert(path.to_string(), content.to_vec());
    }

    pub fn insert_dir(&self, path: &str) {
        self.inner.dirs.lock().unwrap().insert(path.to_string());
    }

    pub fn file_content(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.files.lock().unwrap().get(path).cloned()
    }

    pub fn remove_file(&self, path: &str) {
        self.inner.files.lock().unwrap().remove(path);
    }

    pub fn dir_exists(&self, path: &str) -> bool {
        self.inner.dirs.lock().unwrap().contains(path)
    }

    pub fn range_fetches(&self) -> usize {
        self.inner.range_fetches.load(Ordering::SeqCst)
    }

    pub fn put_count(&self) -> usize {
        self.inner.puts.load(Ordering::SeqCst)
    }
}

impl RemoteClient for MemoryRemote {
    fn stat(&self, path: &str) -> FsResult<FileStat> {
        if path == "/" {
            return Ok(file_stat("/", 0, true));
        }
        if let Some(content) = self.inner.files.lock().unwrap().get(path) {
            return Ok(file_stat(base_name(path), content.len() as i64, false));
        }
        if self.inner.dirs.lock().unwrap().contains(path) {
            return Ok(file_stat(base_name(path), 0, true));
        }
        Err(FsError::NotFound)
    }

    fn read_dir(&self, path: &str) -> FsResult<Vec<FileStat>> {
        let mut out = Vec::new();
        for (p, content) in self.inner.files.lock().unwrap().iter() {
            if parent(p) == path {
                out.push(file_stat(base_name(p), content.len() as i64, false));
            }
        }
        for d in self.inner.dirs.lock().unwrap().iter() {
            if parent(d) == path {
                out.push(file_stat(base_name(d), 0, true));
            }
        }
        Ok(out)
    }

    fn read(&self, path: &str) -> FsResult<Vec<u8>> {
        self.inner
            .files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or(FsError::NotFound)
    }

    fn read_stream(&self, path: &str) -> FsResult<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.read(path)?)))
    }

    fn read_range(&self, path: &str, offset: i64, len: i64) -> FsResult<Box<dyn Read + Send>> {
        self.inner.range_fetches.fetch_add(1, Ordering::SeqCst);
        let content = self.read(path)?;
        let start = (offset.max(0) as usize).min(content.len());
        let end = ((offset + len).max(0) as usize).min(content.len());
        Ok(Box::new(Cursor::new(content[start..end].to_vec())))
    }

    fn write(&self, path: &str, data: &[u8]) -> FsResult<()> {
        self.inner.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.files.lock().unwrap().insert(path.to_string(), data.to_vec());
        Ok(())
    }

    fn write_offset(&self, path: &str, data: &[u8], offset: i64) -> FsResult<()> {
        let mut files = self.inner.files.lock().unwrap();
        let Some(existing) = files.get(path).cloned() else {
            if offset == 0 {
                self.inner.puts.fetch_add(1, Ordering::SeqCst);
                files.insert(path.to_string(), data.to_vec());
                return Ok(());
            }
            return Err(FsError::NotFound);
        };

        let offset = offset as usize;
        let mut merged = existing;
        if offset + data.len() > merged.len() {
            merged.resize(offset + data.len(), 0);
        }
        merged[offset..offset + data.len()].copy_from_slice(data);
        self.inner.puts.fetch_add(1, Ordering::SeqCst);
        files.insert(path.to_string(), merged);
        Ok(())
    }

    fn create(&self, path: &str) -> FsResult<()> {
        if path.ends_with('/') {
            return Err(FsError::InvalidArgument);
        }
        self.write(path, &[])
    }

    fn remove(&self, path: &str) -> FsResult<()> {
        self.inner
            .files
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or(FsError::NotFound)
    }

    fn truncate(&self, path: &str, size: i64) -> FsResult<()> {
        let mut files = self.inner.files.lock().unwrap();
        match files.get_mut(path) {
            Some(content) => {
                content.resize(size as usize, 0);
                Ok(())
            }
            None if size == 0 => {
                files.insert(path.to_string(), Vec::new());
                Ok(())
            }
            None => Err(FsError::NotFound),
        }
    }

    fn mkdir(&self, path: &str) -> FsResult<()> {
        let mut dirs = self.inner.dirs.lock().unwrap();
        if !dirs.insert(path.to_string()) {
            return Err(FsError::AlreadyExists);
        }
        Ok(())
    }

    fn rmdir(&self, path: &str) -> FsResult<()> {
        let removed = self.inner.dirs.lock().unwrap().remove(path);
        if !removed {
            return Err(FsError::NotFound);
        }
        let prefix = format!("{path}/");
        self.inner.files.lock().unwrap().retain(|p, _| !p.starts_with(&prefix));
        self.inner.dirs.lock().unwrap().retain(|p| !p.starts_with(&prefix));
        Ok(())
    }

    fn rename(&self, old: &str, new: &str) -> FsResult<()> {
        let mut files = self.inner.files.lock().unwrap();
        if let Some(content) = files.remove(old) {
            files.insert(new.to_string(), content);
            return Ok(());
        }
        drop(files);

        let mut dirs = self.inner.dirs.lock().unwrap();
        if !dirs.remove(old) {
            return Err(FsError::NotFound);
        }
        dirs.insert(new.to_string());
        let old_prefix = format!("{old}/");
        let new_prefix = format!("{new}/");
        drop(dirs);

        let mut files = self.inner.files.lock().unwrap();
        let moved: Vec<(String, Vec<u8>)> = files
            .iter()
            .filter(|(p, _)| p.starts_with(&old_prefix))
            .map(|(p, c)| (p.replacen(&old_prefix, &new_prefix, 1), c.clone()))
            .collect();
        files.retain(|p, _| !p.starts_with(&old_prefix));
        files.extend(moved);
        Ok(())
    }
}
