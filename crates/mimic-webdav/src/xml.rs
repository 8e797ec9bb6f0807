// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! PROPFIND multistatus parsing.
//!
//! Servers prefix DAV: elements freely (`D:`, `lp1:`, none at all), so
//! elements are matched by local name only. Property values are collected
//! as raw strings first and converted to `FileStat` afterwards, tolerating
//! absent or malformed properties the way clients in the wild must.

use std::time::SystemTime;

use chrono::DateTime;
use mimic_core::error::{FsError, FsResult};
use mimic_core::types::FileStat;

/// One `<response>` element of a multistatus document.
#[derive(Clone, Debug, Default)]
pub struct DavResponse {
    pub href: String,
    pub is_collection: bool,
    pub creation_date: String,
    pub last_modified: String,
    pub etag: String,
    pub content_type: String,
    pub content_length: i64,
    pub status: String,
}

/// Parses a multistatus body into its per-resource responses. The root
/// element must have local name `multistatus`.
pub fn parse_multistatus(body: &str) -> FsResult<Vec<DavResponse>> {
    let doc = roxmltree::Document::parse(body)
        .map_err(|e| FsError::Io(std::io::Error::other(format!("propfind xml: {e}"))))?;

    let root = doc.root_element();
    if root.tag_name().name() != "multistatus" {
        return Err(FsError::Io(std::io::Error::other(format!(
            "unexpected propfind root element: {}",
            root.tag_name().name()
        ))));
    }

    let mut out = Vec::new();
    for response in root.children().filter(|n| n.tag_name().name() == "response") {
        let mut item = DavResponse::default();
        for child in response.children() {
            match child.tag_name().name() {
                "href" => item.href = text_of(&child),
                "propstat" => {
                    for ps_child in child.children() {
                        match ps_child.tag_name().name() {
                            "status" => item.status = text_of(&ps_child),
                            "prop" => fill_props(&ps_child, &mut item),
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
        out.push(item);
    }
    Ok(out)
}

fn fill_props(prop: &roxmltree::Node, item: &mut DavResponse) {
    for p in prop.children() {
        match p.tag_name().name() {
            "resourcetype" => {
                item.is_collection =
                    p.children().any(|c| c.tag_name().name() == "collection");
            }
            "creationdate" => item.creation_date = text_of(&p),
            "getlastmodified" => item.last_modified = text_of(&p),
            "getetag" => item.etag = text_of(&p),
            "getcontenttype" => item.content_type = text_of(&p),
            "getcontentlength" => {
                item.content_length = text_of(&p).trim().parse().unwrap_or(0);
            }
            _ => {}
        }
    }
}

fn text_of(node: &roxmltree::Node) -> String {
    node.text().unwrap_or_default().trim().to_string()
}

/// Converts a response into the engine's stat record. `creationdate` is
/// RFC 3339, `getlastmodified` RFC 1123; unparseable timestamps collapse
/// to the epoch rather than failing the whole stat.
pub fn to_file_stat(response: &DavResponse) -> FileStat {
    let created = DateTime::parse_from_rfc3339(&response.creation_date)
        .map(SystemTime::from)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mtime = DateTime::parse_from_rfc2822(&response.last_modified)
        .map(SystemTime::from)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    FileStat {
        name: href_basename(&response.href),
        is_dir: response.is_collection,
        size: response.content_length,
        mtime,
        created,
        etag: response.etag.clone(),
        content_type: response.content_type.clone(),
    }
}

/// Last path segment of an href, with any trailing slash ignored.
pub fn href_basename(href: &str) -> String {
    let trimmed = href.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    trimmed.rsplit('/').next().unwrap_or(trimmed).to_string()
}
