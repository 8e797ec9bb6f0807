// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end engine scenarios.
//!
//! These mirror what a shell user does against the mounted tree — create,
//! append, rename, truncate, large streaming writes — driving the full
//! engine against the in-memory remote.

use std::sync::Arc;

use libc::{O_APPEND, O_CREAT, O_EXCL, O_RDONLY, O_TRUNC, O_WRONLY};

use crate::bufcache::BufferCache;
use crate::error::FsError;
use crate::flags::OpenFlags;
use crate::fs::memory_remote::MemoryRemote;
use crate::fs::DavFs;

fn flags(bits: i32) -> OpenFlags {
    OpenFlags(bits as u32)
}

fn engine(remote: &MemoryRemote) -> DavFs {
    DavFs::new(Arc::new(remote.clone()), Arc::new(BufferCache::new()))
}

fn write_file(fs: &DavFs, path: &str, content: &[u8]) {
    let fh = fs.open(path, flags(O_WRONLY | O_CREAT | O_TRUNC)).unwrap();
    fs.write(fh, 0, content).unwrap();
    fs.release(fh).unwrap();
}

fn read_file(fs: &DavFs, path: &str) -> Vec<u8> {
    let fh = fs.open(path, flags(O_RDONLY)).unwrap();
    let size = fs.getattr(path, Some(fh)).unwrap().size;
    let data = fs.read(fh, 0, size as usize).unwrap();
    fs.release(fh).unwrap();
    data
}

#[test]
fn file_ops_create_append_mkdir_rename_remove() {
    let remote = MemoryRemote::new();
    let fs = engine(&remote);

    write_file(&fs, "/basic.txt", b"hello world\n");

    // append through a fresh handle
    let fh = fs.open("/basic.txt", flags(O_WRONLY | O_APPEND)).unwrap();
    let size = fs.getattr("/basic.txt", Some(fh)).unwrap().size;
    fs.write(fh, size, b"append-line\n").unwrap();
    fs.release(fh).unwrap();

    let stat = fs.getattr("/basic.txt", None).unwrap();
    assert_eq!(stat.size, 24);
    assert!(!stat.is_dir);

    fs.mkdir("/test_dir").unwrap();
    assert!(remote.dir_exists("/test_dir"));

    // move into the directory, then rename out
    fs.rename("/basic.txt", "/test_dir/basic.txt").unwrap();
    assert!(matches!(
        fs.getattr("/basic.txt", None),
        Err(FsError::NotFound)
    ));
    fs.rename("/test_dir/basic.txt", "/basic.renamed").unwrap();

    assert_eq!(read_file(&fs, "/basic.renamed"), b"hello world\nappend-line\n");

    fs.unlink("/basic.renamed").unwrap();
    fs.rmdir("/test_dir").unwrap();
    assert!(matches!(
        fs.getattr("/basic.renamed", None),
        Err(FsError::NotFound)
    ));
    assert!(!remote.dir_exists("/test_dir"));
}

#[test]
fn large_write_lands_in_one_upload() {
    let remote = MemoryRemote::new();
    let fs = engine(&remote);

    let chunk = vec![0u8; 1024 * 1024];
    let fh = fs.open("/largefile", flags(O_WRONLY | O_CREAT)).unwrap();
    for i in 0..10i64 {
        fs.write(fh, i * chunk.len() as i64, &chunk).unwrap();
    }
    let puts_before_close = remote.put_count();
    fs.release(fh).unwrap();

    // all ten megabytes were buffered locally and left in a single PUT
    assert_eq!(remote.put_count(), puts_before_close + 1);

    let stat = fs.getattr("/largefile", None).unwrap();
    assert_eq!(stat.size, 10 * 1024 * 1024);
    assert_eq!(
        remote.file_content("/largefile").unwrap().len(),
        10 * 1024 * 1024
    );
}

#[test]
fn truncate_down_and_up_via_engine() {
    let remote = MemoryRemote::new();
    let fs = engine(&remote);

    write_file(&fs, "/tfile.down", b"0123456789");
    write_file(&fs, "/tfile.up", b"0123456789");

    fs.truncate("/tfile.down", 4, None).unwrap();
    assert_eq!(read_file(&fs, "/tfile.down"), b"0123");

    fs.truncate("/tfile.up", 16, None).unwrap();
    let up = read_file(&fs, "/tfile.up");
    assert_eq!(up.len(), 16);
    assert_eq!(&up[..10], b"0123456789");
    assert!(up[10..].iter().all(|&b| b == 0));
}

#[test]
fn open_flag_matrix() {
    let remote = MemoryRemote::new();
    let fs = engine(&remote);

    for name in ["/flags.O_RDONLY", "/flags.O_WRONLY", "/flags.append"] {
        write_file(&fs, name, b"BASE");
    }
    write_file(&fs, "/flags.trunc", b"HELLO WORLD");

    // O_RDONLY: writes fail, reads succeed
    {
        let fh = fs.open("/flags.O_RDONLY", flags(O_RDONLY)).unwrap();
        assert!(matches!(fs.write(fh, 0, b"X"), Err(FsError::Forbidden)));
        assert_eq!(fs.read(fh, 0, 4).unwrap(), b"BASE");
        fs.release(fh).unwrap();
    }

    // O_WRONLY: reads fail, write lands
    {
        let fh = fs.open("/flags.O_WRONLY", flags(O_WRONLY | O_CREAT)).unwrap();
        assert!(matches!(fs.read(fh, 0, 8), Err(FsError::Forbidden)));
        assert_eq!(fs.write(fh, 0, b"WO").unwrap(), 2);
        fs.release(fh).unwrap();
        let content = remote.file_content("/flags.O_WRONLY").unwrap();
        assert_eq!(&content[..2], b"WO");
    }

    // O_APPEND: content grows at the end
    {
        let fh = fs.open("/flags.append", flags(O_WRONLY | O_APPEND | O_CREAT)).unwrap();
        let size = fs.getattr("/flags.append", Some(fh)).unwrap().size;
        assert_eq!(fs.write(fh, size, b"A").unwrap(), 1);
        fs.release(fh).unwrap();
        assert_eq!(read_file(&fs, "/flags.append"), b"BASEA");
    }

    // O_TRUNC: previous content is gone
    {
        let fh = fs.open("/flags.trunc", flags(O_WRONLY | O_TRUNC)).unwrap();
        assert_eq!(fs.write(fh, 0, b"T").unwrap(), 1);
        fs.release(fh).unwrap();
        assert_eq!(read_file(&fs, "/flags.trunc"), b"T");
    }

    // O_CREAT: missing file comes into being
    {
        let fh = fs.open("/flags.create", flags(O_CREAT | O_WRONLY)).unwrap();
        assert_eq!(fs.write(fh, 0, b"C").unwrap(), 1);
        fs.release(fh).unwrap();
        assert_eq!(read_file(&fs, "/flags.create"), b"C");
    }

    // O_EXCL: creating over an existing file refuses
    assert!(matches!(
        fs.open("/flags.create", flags(O_CREAT | O_EXCL | O_WRONLY)),
        Err(FsError::AlreadyExists)
    ));
}

#[test]
fn two_handles_share_buffered_state() {
    let remote = MemoryRemote::new();
    remote.insert_file("/shared", b"0000000000");
    let fs = engine(&remote);

    let writer = fs.open("/shared", flags(O_WRONLY)).unwrap();
    let reader = fs.open("/shared", flags(O_RDONLY)).unwrap();

    fs.write(writer, 0, b"XX").unwrap();
    // the unflushed write is visible through the other handle
    assert_eq!(&fs.read(reader, 0, 10).unwrap()[..2], b"XX");

    fs.release(writer).unwrap();
    fs.release(reader).unwrap();
    assert_eq!(&remote.file_content("/shared").unwrap()[..2], b"XX");
}
