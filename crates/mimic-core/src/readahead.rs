// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Read-ahead window calculation and dirty-overlay merging.

use crate::buffer::BufferSnapshot;
use crate::page::PAGE_SIZE;

/// Minimum bytes fetched on a read miss, to amortize network latency.
pub const READAHEAD_MIN: i64 = 64 * 1024;

/// Page-aligned fetch window for a read of `len` bytes at `offset`.
/// Returns `(page_start, fetch_len)` with `page_start ≤ offset`,
/// `page_start % 4096 == 0`, `fetch_len` covering the request rounded up
/// to pages and at least `READAHEAD_MIN`, clamped so the window never
/// reads past `remote_size`.
pub fn page_aligned_range(offset: i64, len: i64, remote_size: i64) -> (i64, i64) {
    let page_start = offset - (offset % PAGE_SIZE);
    let pages = (len + (offset - page_start) + PAGE_SIZE - 1) / PAGE_SIZE;
    let mut fetch_len = (pages * PAGE_SIZE).max(READAHEAD_MIN);

    if page_start + fetch_len > remote_size {
        fetch_len = (remote_size - page_start).max(0);
    }

    (page_start, fetch_len)
}

/// Merges a remote slice (bytes starting at `remote_start`) with a buffer
/// snapshot into the requested window `[req_start, req_start + req_len)`.
/// The result starts from the remote bytes and is overlaid with buffer
/// bytes wherever the buffer's page mask is set (buffer wins). Length is
/// at most `req_len` and may be shorter at EOF.
pub fn merge_remote_and_buffer(
    remote: &[u8],
    remote_start: i64,
    buf: &BufferSnapshot,
    req_start: i64,
    req_len: i64,
) -> Vec<u8> {
    let req_end = req_start + req_len;

    let remote_end = remote_start + remote.len() as i64;
    let buf_start = buf.base;
    let buf_end = buf.base + buf.data.len() as i64;

    let max_end = buf_end.max(remote_end).max(req_start).min(req_end);
    if max_end <= req_start {
        return Vec::new();
    }

    let mut out = vec![0u8; (max_end - req_start) as usize];

    if !remote.is_empty() {
        let start = remote_start.max(req_start);
        let end = remote_end.min(req_end);
        if end > start {
            let dst = (start - req_start) as usize;
            let src = (start - remote_start) as usize;
            let n = (end - start) as usize;
            out[dst..dst + n].copy_from_slice(&remote[src..src + n]);
        }
    }

    if !buf.data.is_empty() {
        let start = buf_start.max(req_start);
        let end = buf_end.min(req_end);
        let mut abs = start;
        while abs < end {
            // overlay page by page; only pages the buffer knows win
            let page_end = (abs - (abs % PAGE_SIZE) + PAGE_SIZE).min(end);
            if buf.present.is_set(abs - buf_start) {
                let dst = (abs - req_start) as usize;
                let src = (abs - buf_start) as usize;
                let n = (page_end - abs) as usize;
                out[dst..dst + n].copy_from_slice(&buf.data[src..src + n]);
            }
            abs = page_end;
        }
    }

    out
}
