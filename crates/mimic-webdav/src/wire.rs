// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Raw WebDAV HTTP transport.
//!
//! A thin seam over the HTTP verbs the facade composes. Every method is
//! blocking — the kernel bridge dispatches callbacks on its own threads
//! and the core never holds a lock across a call into this module.

use std::io::{Cursor, Read};

use reqwest::blocking::{Body, Client};
use reqwest::{Method, StatusCode};
use tracing::debug;
use url::Url;

use mimic_core::error::{FsError, FsResult};

pub const DEPTH_HEADER: &str = "Depth";
pub const DESTINATION_HEADER: &str = "Destination";
pub const OVERWRITE_HEADER: &str = "Overwrite";

/// HTTP operations the DavClient facade composes. `propfind`, `put_range`
/// and `move_to` surface the status code because the caller's fallback
/// logic branches on it; the rest map errors themselves.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    fn propfind(&self, path: &str, depth: u32) -> FsResult<(u16, String)>;
    fn get(&self, path: &str) -> FsResult<Vec<u8>>;
    fn get_stream(&self, path: &str) -> FsResult<Box<dyn Read + Send>>;
    fn get_range(&self, path: &str, offset: i64, len: i64) -> FsResult<Box<dyn Read + Send>>;
    fn put(&self, path: &str, data: &[u8]) -> FsResult<()>;
    /// Streaming PUT for large bodies.
    fn put_stream(&self, path: &str, data: Vec<u8>) -> FsResult<()>;
    /// Non-standard ranged PUT (`Content-Range: bytes start-end/*`).
    /// Returns the response status; servers are free to reject it.
    fn put_range(&self, path: &str, data: &[u8], offset: i64) -> FsResult<u16>;
    fn delete(&self, path: &str) -> FsResult<()>;
    fn mkcol(&self, path: &str) -> FsResult<()>;
    /// MOVE with a path-only Destination header. Returns the status.
    fn move_to(&self, from: &str, to: &str) -> FsResult<u16>;
}

/// Production transport over reqwest with HTTP Basic auth.
pub struct HttpTransport {
    http: Client,
    base: Url,
    username: String,
    password: String,
}

fn method(name: &str) -> Method {
    Method::from_bytes(name.as_bytes()).expect("static method name")
}

fn transport_err(e: reqwest::Error) -> FsError {
    FsError::Io(std::io::Error::other(e.to_string()))
}

/// Maps a definitive HTTP error status onto the core taxonomy.
fn status_error(status: StatusCode, method: &str, path: &str) -> FsError {
    match status.as_u16() {
        403 => FsError::Forbidden,
        404 => FsError::NotFound,
        416 => FsError::RangeNotSatisfiable,
        423 => FsError::Forbidden,
        code => FsError::Io(std::io::Error::other(format!(
            "{method} {path}: unexpected status {code}"
        ))),
    }
}

impl HttpTransport {
    pub fn new(server: &str, username: &str, password: &str) -> FsResult<Self> {
        let base = Url::parse(server).map_err(|_| FsError::InvalidArgument)?;
        let http = Client::builder()
            .user_agent("mimic/0.3")
            .build()
            .map_err(transport_err)?;
        Ok(Self {
            http,
            base,
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    fn url_for(&self, path: &str) -> String {
        let base = self.base.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    /// Path component the server sees for `path`; used for the path-only
    /// MOVE Destination so reverse proxies don't trip on host mismatches.
    fn server_path(&self, path: &str) -> String {
        let base_path = self.base.path().trim_end_matches('/');
        format!("{base_path}/{}", path.trim_start_matches('/'))
    }

    fn request(&self, m: Method, path: &str) -> reqwest::blocking::RequestBuilder {
        self.http
            .request(m, self.url_for(path))
            .basic_auth(&self.username, Some(&self.password))
    }
}

impl Transport for HttpTransport {
    fn propfind(&self, path: &str, depth: u32) -> FsResult<(u16, String)> {
        let resp = self
            .request(method("PROPFIND"), path)
            .header(DEPTH_HEADER, depth.to_string())
            .send()
            .map_err(transport_err)?;
        let status = resp.status().as_u16();
        let body = resp.text().map_err(transport_err)?;
        debug!(target: "mimic::webdav", path, depth, status, "PROPFIND");
        Ok((status, body))
    }

    fn get(&self, path: &str) -> FsResult<Vec<u8>> {
        let resp = self.request(Method::GET, path).send().map_err(transport_err)?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), "GET", path));
        }
        let bytes = resp.bytes().map_err(transport_err)?;
        Ok(bytes.to_vec())
    }

    fn get_stream(&self, path: &str) -> FsResult<Box<dyn Read + Send>> {
        let resp = self.request(Method::GET, path).send().map_err(transport_err)?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), "GET", path));
        }
        Ok(Box::new(resp))
    }

    fn get_range(&self, path: &str, offset: i64, len: i64) -> FsResult<Box<dyn Read + Send>> {
        let end = offset + len - 1;
        let resp = self
            .request(Method::GET, path)
            .header(reqwest::header::RANGE, format!("bytes={offset}-{end}"))
            .send()
            .map_err(transport_err)?;
        debug!(target: "mimic::webdav", path, offset, len, status = resp.status().as_u16(), "GET range");

        match resp.status().as_u16() {
            206 => Ok(Box::new(resp)),
            200 => {
                // server ignored the Range header; slice the full body
                let body = resp.bytes().map_err(transport_err)?;
                let start = (offset.max(0) as usize).min(body.len());
                let stop = ((offset + len).max(0) as usize).min(body.len());
                Ok(Box::new(Cursor::new(body[start..stop].to_vec())))
            }
            _ => Err(status_error(resp.status(), "GET", path)),
        }
    }

    fn put(&self, path: &str, data: &[u8]) -> FsResult<()> {
        let resp = self
            .request(Method::PUT, path)
            .body(data.to_vec())
            .send()
            .map_err(transport_err)?;
        debug!(target: "mimic::webdav", path, len = data.len(), status = resp.status().as_u16(), "PUT");
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), "PUT", path));
        }
        Ok(())
    }

    fn put_stream(&self, path: &str, data: Vec<u8>) -> FsResult<()> {
        let len = data.len();
        let resp = self
            .request(Method::PUT, path)
            .body(Body::sized(Cursor::new(data), len as u64))
            .send()
            .map_err(transport_err)?;
        debug!(target: "mimic::webdav", path, len, status = resp.status().as_u16(), "PUT stream");
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), "PUT", path));
        }
        Ok(())
    }

    fn put_range(&self, path: &str, data: &[u8], offset: i64) -> FsResult<u16> {
        let end = offset + data.len() as i64 - 1;
        let resp = self
            .request(Method::PUT, path)
            .header(
                reqwest::header::CONTENT_RANGE,
                format!("bytes {offset}-{end}/*"),
            )
            .body(data.to_vec())
            .send()
            .map_err(transport_err)?;
        debug!(target: "mimic::webdav", path, offset, len = data.len(), status = resp.status().as_u16(), "PUT range");
        Ok(resp.status().as_u16())
    }

    fn delete(&self, path: &str) -> FsResult<()> {
        let resp = self.request(Method::DELETE, path).send().map_err(transport_err)?;
        debug!(target: "mimic::webdav", path, status = resp.status().as_u16(), "DELETE");
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), "DELETE", path));
        }
        Ok(())
    }

    fn mkcol(&self, path: &str) -> FsResult<()> {
        let resp = self.request(method("MKCOL"), path).send().map_err(transport_err)?;
        debug!(target: "mimic::webdav", path, status = resp.status().as_u16(), "MKCOL");
        match resp.status().as_u16() {
            200 | 201 => Ok(()),
            405 => Err(FsError::AlreadyExists),
            _ => Err(status_error(resp.status(), "MKCOL", path)),
        }
    }

    fn move_to(&self, from: &str, to: &str) -> FsResult<u16> {
        let resp = self
            .request(method("MOVE"), from)
            .header(DESTINATION_HEADER, self.server_path(to))
            .header(OVERWRITE_HEADER, "T")
            .send()
            .map_err(transport_err)?;
        debug!(target: "mimic::webdav", from, to, status = resp.status().as_u16(), "MOVE");
        Ok(resp.status().as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_building_joins_cleanly() {
        let t = HttpTransport::new("http://host:8080/dav/", "u", "p").unwrap();
        assert_eq!(t.url_for("/a/b"), "http://host:8080/dav/a/b");
        assert_eq!(t.url_for("a/b"), "http://host:8080/dav/a/b");
        assert_eq!(t.url_for("/"), "http://host:8080/dav/");
    }

    #[test]
    fn destination_is_path_only() {
        let t = HttpTransport::new("http://host:8080/dav", "u", "p").unwrap();
        assert_eq!(t.server_path("/x/y"), "/dav/x/y");

        let root = HttpTransport::new("http://host/", "u", "p").unwrap();
        assert_eq!(root.server_path("/x"), "/x");
    }

    #[test]
    fn invalid_server_url_is_rejected() {
        assert!(matches!(
            HttpTransport::new("not a url", "u", "p"),
            Err(FsError::InvalidArgument)
        ));
    }

    #[test]
    fn status_errors_map_to_taxonomy() {
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, "GET", "/x"),
            FsError::NotFound
        ));
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, "GET", "/x"),
            FsError::Forbidden
        ));
        assert!(matches!(
            status_error(StatusCode::RANGE_NOT_SATISFIABLE, "GET", "/x"),
            FsError::RangeNotSatisfiable
        ));
        assert!(matches!(
            status_error(StatusCode::LOCKED, "PUT", "/x"),
            FsError::Forbidden
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, "GET", "/x"),
            FsError::Io(_)
        ));
    }
}
