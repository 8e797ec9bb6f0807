// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! mimic-webdav — WebDAV transport and the caching remote-client facade.
//!
//! [`DavClient`] implements `mimic_core::RemoteClient` over plain WebDAV:
//! PROPFIND-backed metadata through the node cache, ranged GETs for the
//! engine's readahead, and whole-object PUTs (with an opportunistic
//! non-standard ranged PUT) for write-back.

pub mod client;
pub mod wire;
pub mod xml;

pub use client::{DavClient, STREAM_THRESHOLD};
pub use wire::{HttpTransport, Transport};
pub use xml::{parse_multistatus, to_file_stat, DavResponse};
