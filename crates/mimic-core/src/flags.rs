// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Open-flag predicates over the kernel's raw flag word.

use libc::{O_ACCMODE, O_APPEND, O_CREAT, O_EXCL, O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY};

/// Raw open(2) flags as the kernel bridge delivers them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    fn accmode(self) -> i32 {
        self.0 as i32 & O_ACCMODE
    }

    pub fn read_allowed(self) -> bool {
        matches!(self.accmode(), m if m == O_RDONLY || m == O_RDWR)
    }

    pub fn write_allowed(self) -> bool {
        matches!(self.accmode(), m if m == O_WRONLY || m == O_RDWR)
    }

    pub fn append(self) -> bool {
        self.0 as i32 & O_APPEND != 0
    }

    pub fn create(self) -> bool {
        self.0 as i32 & O_CREAT != 0
    }

    pub fn truncate(self) -> bool {
        self.0 as i32 & O_TRUNC != 0
    }

    pub fn exclusive(self) -> bool {
        self.0 as i32 & O_EXCL != 0
    }
}

impl From<i32> for OpenFlags {
    fn from(flags: i32) -> Self {
        OpenFlags(flags as u32)
    }
}
