// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the mimic core

use std::io;

/// Core filesystem error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("already exists")]
    AlreadyExists,
    #[error("range not satisfiable")]
    RangeNotSatisfiable,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("lock would block")]
    WouldBlock,
    #[error("not lock owner")]
    NotOwner,
    #[error("cancelled")]
    Cancelled,
    #[error("read/write out of bounds")]
    OutOfBounds,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    /// Classify an opaque transport error message into one of the abstract
    /// kinds. Servers and HTTP stacks disagree on error shapes, so the
    /// match is on status-code substrings; anything unrecognised is `Io`.
    pub fn classify(msg: &str) -> FsError {
        let lower = msg.to_ascii_lowercase();
        if lower.contains("404") || lower.contains("not found") {
            FsError::NotFound
        } else if lower.contains("403") || lower.contains("forbidden") {
            FsError::Forbidden
        } else if lower.contains("416") || lower.contains("range not satisfiable") {
            FsError::RangeNotSatisfiable
        } else {
            FsError::Io(io::Error::other(msg.to_string()))
        }
    }

}
