// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! FUSE adapter: maps kernel operations to engine calls.
//!
//! The engine is path-based; this layer owns the inode↔path bookkeeping,
//! FileAttr synthesis and errno conversion. Callbacks that the mount does
//! not support (xattrs, symlinks, links, mknod) are left to fuser's
//! default ENOSYS replies.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyLock, ReplyOpen, ReplyStatfs, ReplyWrite,
    Request, TimeOrNow, FUSE_ROOT_ID,
};
use libc::{c_int, EACCES, EAGAIN, EEXIST, EINTR, EINVAL, EIO, EISDIR, ENOENT, ENOTDIR};
use tracing::{debug, error, warn};

use mimic_core::error::FsError;
use mimic_core::fs::DavFs;
use mimic_core::locking::{CancelToken, LockKind};
use mimic_core::types::FileStat;
use mimic_core::OpenFlags;

const BLOCK_SIZE: u32 = 4096;

pub fn errno_from_fs_error(err: &FsError) -> c_int {
    match err {
        FsError::NotFound => ENOENT,
        FsError::Forbidden => EACCES,
        FsError::AlreadyExists => EEXIST,
        FsError::NotADirectory => ENOTDIR,
        FsError::IsADirectory => EISDIR,
        FsError::InvalidArgument => EINVAL,
        FsError::WouldBlock => EAGAIN,
        FsError::NotOwner => EINVAL,
        FsError::Cancelled => EINTR,
        _ => EIO,
    }
}

/// FUSE-facing filesystem over the mimic engine.
pub struct MimicFuse {
    fs: Arc<DavFs>,
    attr_ttl: Duration,
    uid: u32,
    gid: u32,
    /// inode -> engine path
    inodes: HashMap<u64, String>,
    /// engine path -> inode
    paths: HashMap<String, u64>,
    next_inode: u64,
}

impl MimicFuse {
    pub fn new(fs: Arc<DavFs>, attr_ttl: Duration) -> Self {
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };

        let mut inodes = HashMap::new();
        let mut paths = HashMap::new();
        inodes.insert(FUSE_ROOT_ID, "/".to_string());
        paths.insert("/".to_string(), FUSE_ROOT_ID);

        Self {
            fs,
            attr_ttl,
            uid,
            gid,
            inodes,
            paths,
            next_inode: FUSE_ROOT_ID + 1,
        }
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.inodes.get(&ino).cloned()
    }

    fn ensure_inode(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.paths.get(path) {
            return ino;
        }
        let ino = self.next_inode;
        self.next_inode += 1;
        self.inodes.insert(ino, path.to_string());
        self.paths.insert(path.to_string(), ino);
        ino
    }

    /// Drops the mapping of `path` and everything under it. The kernel
    /// re-looks paths up on demand, so forgetting aggressively is safe.
    fn forget_path(&mut self, path: &str) {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let doomed: Vec<(String, u64)> = self
            .paths
            .iter()
            .filter(|(p, _)| p.as_str() == path || p.starts_with(&prefix))
            .map(|(p, &i)| (p.clone(), i))
            .collect();
        for (p, ino) in doomed {
            self.paths.remove(&p);
            self.inodes.remove(&ino);
        }
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, c_int> {
        let parent_path = self.path_of(parent).ok_or(ENOENT)?;
        let name = name.to_str().ok_or(EINVAL)?;
        if parent_path == "/" {
            Ok(format!("/{name}"))
        } else {
            Ok(format!("{parent_path}/{name}"))
        }
    }

    fn stat_to_attr(&self, stat: &FileStat, ino: u64) -> FileAttr {
        let kind = if stat.is_dir {
            FileType::Directory
        } else {
            FileType::RegularFile
        };
        let perm = if ino == FUSE_ROOT_ID {
            0o777
        } else if stat.is_dir {
            0o755
        } else {
            0o644
        };

        FileAttr {
            ino,
            size: stat.size.max(0) as u64,
            blocks: (stat.size.max(0) as u64).div_ceil(512),
            atime: stat.mtime,
            mtime: stat.mtime,
            ctime: stat.mtime,
            crtime: stat.created,
            kind,
            perm,
            nlink: if stat.is_dir { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn lock_kind(typ: i32) -> Option<LockKind> {
        if typ == libc::F_RDLCK {
            Some(LockKind::Shared)
        } else if typ == libc::F_WRLCK {
            Some(LockKind::Exclusive)
        } else {
            None
        }
    }
}

impl Filesystem for MimicFuse {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> Result<(), c_int> {
        debug!(target: "mimic::fuse", "kernel session initialized");
        Ok(())
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        match self.fs.getattr(&path, None) {
            Ok(stat) => {
                let ino = self.ensure_inode(&path);
                let attr = self.stat_to_attr(&stat, ino);
                reply.entry(&self.attr_ttl, &attr, 0);
            }
            Err(FsError::NotFound) => reply.error(ENOENT),
            Err(err) => {
                warn!(target: "mimic::fuse", path = %path, error = %err, "lookup failed");
                reply.error(errno_from_fs_error(&err));
            }
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ENOENT);
            return;
        };

        match self.fs.getattr(&path, fh) {
            Ok(stat) => {
                let attr = self.stat_to_attr(&stat, ino);
                reply.attr(&self.attr_ttl, &attr);
            }
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ENOENT);
            return;
        };

        // size drives truncate; time/mode/owner updates are accepted and
        // dropped since the remote cannot store them
        if let Some(size) = size {
            if let Err(err) = self.fs.truncate(&path, size as i64, fh) {
                reply.error(errno_from_fs_error(&err));
                return;
            }
        }

        match self.fs.getattr(&path, fh) {
            Ok(stat) => {
                let attr = self.stat_to_attr(&stat, ino);
                reply.attr(&self.attr_ttl, &attr);
            }
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ENOENT);
            return;
        };

        match self.fs.open(&path, OpenFlags::from(flags)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        match self.fs.create(&path, OpenFlags::from(flags)) {
            Ok(fh) => {
                let ino = self.ensure_inode(&path);
                match self.fs.getattr(&path, Some(fh)) {
                    Ok(stat) => {
                        let attr = self.stat_to_attr(&stat, ino);
                        reply.created(&self.attr_ttl, &attr, 0, fh, 0);
                    }
                    Err(err) => reply.error(errno_from_fs_error(&err)),
                }
            }
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.fs.read(fh, offset, size as usize) {
            Ok(data) => reply.data(&data),
            Err(err) => {
                error!(target: "mimic::fuse", ino, fh, offset, error = %err, "read failed");
                reply.error(errno_from_fs_error(&err));
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.fs.write(fh, offset, data) {
            Ok(written) => reply.written(written as u32),
            Err(err) => {
                error!(target: "mimic::fuse", ino, fh, offset, error = %err, "write failed");
                reply.error(errno_from_fs_error(&err));
            }
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.fs.flush(fh) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.fs.flush(fh) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.fs.release(fh) {
            Ok(()) => reply.ok(),
            Err(err) => {
                // dirty data that failed to upload surfaces here, once
                error!(target: "mimic::fuse", fh, error = %err, "release flush failed");
                reply.error(errno_from_fs_error(&err));
            }
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.fs.opendir(&path) {
            Ok(fh) => reply.opened(fh, 0),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ENOENT);
            return;
        };

        let children = match self.fs.read_dir(&path) {
            Ok(children) => children,
            Err(err) => {
                reply.error(errno_from_fs_error(&err));
                return;
            }
        };

        // entries: ".", "..", then the listing; `offset` resumes iteration
        let mut index = offset;
        loop {
            let full = match index {
                0 => reply.add(ino, 1, FileType::Directory, "."),
                1 => reply.add(FUSE_ROOT_ID, 2, FileType::Directory, ".."),
                n => {
                    let Some(child) = children.get(n as usize - 2) else {
                        break;
                    };
                    let child_path = if path == "/" {
                        format!("/{}", child.name)
                    } else {
                        format!("{path}/{}", child.name)
                    };
                    let child_ino = self.ensure_inode(&child_path);
                    let kind = if child.is_dir {
                        FileType::Directory
                    } else {
                        FileType::RegularFile
                    };
                    reply.add(child_ino, n + 1, kind, child.name.as_str())
                }
            };
            if full {
                break;
            }
            index += 1;
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.fs.releasedir(fh);
        reply.ok();
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        if let Err(err) = self.fs.mkdir(&path) {
            reply.error(errno_from_fs_error(&err));
            return;
        }
        let ino = self.ensure_inode(&path);
        let stat = self.fs.getattr(&path, None).unwrap_or_else(|_| {
            let mut synthetic = FileStat::root();
            synthetic.name = path.clone();
            synthetic
        });
        let attr = self.stat_to_attr(&stat, ino);
        reply.entry(&self.attr_ttl, &attr, 0);
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.fs.rmdir(&path) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        match self.fs.unlink(&path) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (old, new) = match (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) {
            (Ok(old), Ok(new)) => (old, new),
            (Err(errno), _) | (_, Err(errno)) => {
                reply.error(errno);
                return;
            }
        };

        match self.fs.rename(&old, &new) {
            Ok(()) => {
                self.forget_path(&old);
                self.forget_path(&new);
                reply.ok();
            }
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        let stats = self.fs.statfs();
        reply.statfs(
            stats.blocks,
            stats.blocks_free,
            stats.blocks_avail,
            stats.files,
            stats.files_free,
            stats.block_size,
            stats.name_max,
            stats.block_size,
        );
    }

    fn access(&mut self, _req: &Request, ino: u64, _mask: i32, reply: ReplyEmpty) {
        if self.inodes.contains_key(&ino) {
            reply.ok();
        } else {
            reply.error(ENOENT);
        }
    }

    fn getlk(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        _pid: u32,
        reply: ReplyLock,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ENOENT);
            return;
        };

        match self.fs.lock_query(&path, start as i64, end as i64) {
            Ok(Some(info)) => {
                // shared against shared is not a conflict
                if info.kind == LockKind::Shared && typ == libc::F_RDLCK {
                    reply.locked(start, end, libc::F_UNLCK, 0);
                    return;
                }
                let held = match info.kind {
                    LockKind::Shared => libc::F_RDLCK,
                    LockKind::Exclusive => libc::F_WRLCK,
                };
                reply.locked(info.start as u64, info.end.max(0) as u64, held, info.pid as u32);
            }
            Ok(None) => reply.locked(start, end, libc::F_UNLCK, 0),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }

    fn setlk(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        _pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ENOENT);
            return;
        };
        let owner = lock_owner.to_be_bytes();

        if typ == libc::F_UNLCK {
            match self.fs.unlock(&path, &owner, start as i64, end as i64) {
                // unlocking a range that was never locked is not an error
                // at the POSIX surface
                Ok(()) | Err(FsError::NotOwner) => reply.ok(),
                Err(err) => reply.error(errno_from_fs_error(&err)),
            }
            return;
        }

        let Some(kind) = Self::lock_kind(typ) else {
            reply.error(EINVAL);
            return;
        };

        let result = if sleep {
            let cancel = CancelToken::new();
            self.fs.lock_wait(&cancel, &path, &owner, start as i64, end as i64, kind)
        } else {
            self.fs.lock(&path, &owner, start as i64, end as i64, kind)
        };
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_from_fs_error(&err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mimic_core::bufcache::BufferCache;
    use mimic_core::fs::memory_remote::MemoryRemote;

    fn adapter() -> MimicFuse {
        let fs = Arc::new(DavFs::new(
            Arc::new(MemoryRemote::new()),
            Arc::new(BufferCache::new()),
        ));
        MimicFuse::new(fs, Duration::from_secs(1))
    }

    #[test]
    fn errno_mapping_covers_taxonomy() {
        assert_eq!(errno_from_fs_error(&FsError::NotFound), ENOENT);
        assert_eq!(errno_from_fs_error(&FsError::Forbidden), EACCES);
        assert_eq!(errno_from_fs_error(&FsError::AlreadyExists), EEXIST);
        assert_eq!(errno_from_fs_error(&FsError::NotADirectory), ENOTDIR);
        assert_eq!(errno_from_fs_error(&FsError::IsADirectory), EISDIR);
        assert_eq!(errno_from_fs_error(&FsError::WouldBlock), EAGAIN);
        assert_eq!(errno_from_fs_error(&FsError::Cancelled), EINTR);
        assert_eq!(
            errno_from_fs_error(&FsError::Io(std::io::Error::other("x"))),
            EIO
        );
        assert_eq!(errno_from_fs_error(&FsError::RangeNotSatisfiable), EIO);
    }

    #[test]
    fn inode_allocation_is_stable() {
        let mut fuse = adapter();
        let a = fuse.ensure_inode("/a");
        let b = fuse.ensure_inode("/b");
        assert_ne!(a, b);
        assert!(a > FUSE_ROOT_ID);
        assert_eq!(fuse.ensure_inode("/a"), a);
        assert_eq!(fuse.path_of(a).as_deref(), Some("/a"));
        assert_eq!(fuse.path_of(FUSE_ROOT_ID).as_deref(), Some("/"));
    }

    #[test]
    fn forget_path_drops_subtree() {
        let mut fuse = adapter();
        let d = fuse.ensure_inode("/d");
        let child = fuse.ensure_inode("/d/x");
        let other = fuse.ensure_inode("/dx");

        fuse.forget_path("/d");
        assert!(fuse.path_of(d).is_none());
        assert!(fuse.path_of(child).is_none());
        // "/dx" shares the string prefix but not the tree
        assert_eq!(fuse.path_of(other).as_deref(), Some("/dx"));
    }

    #[test]
    fn child_paths_join_at_root() {
        let fuse = adapter();
        assert_eq!(
            fuse.child_path(FUSE_ROOT_ID, OsStr::new("f")).unwrap(),
            "/f"
        );
        assert!(fuse.child_path(999, OsStr::new("f")).is_err());
    }

    #[test]
    fn attr_synthesis() {
        let fuse = adapter();
        let mut stat = FileStat::new_file("f");
        stat.size = 5000;
        let attr = fuse.stat_to_attr(&stat, 42);
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.size, 5000);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o644);
        assert_eq!(attr.nlink, 1);
        assert_eq!(attr.blksize, BLOCK_SIZE);

        let root = fuse.stat_to_attr(&FileStat::root(), FUSE_ROOT_ID);
        assert_eq!(root.kind, FileType::Directory);
        assert_eq!(root.perm, 0o777);
        assert_eq!(root.nlink, 2);
    }

    #[test]
    fn lock_kind_conversion() {
        assert_eq!(MimicFuse::lock_kind(libc::F_RDLCK), Some(LockKind::Shared));
        assert_eq!(
            MimicFuse::lock_kind(libc::F_WRLCK),
            Some(LockKind::Exclusive)
        );
        assert_eq!(MimicFuse::lock_kind(libc::F_UNLCK), None);
    }
}
