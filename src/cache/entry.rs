use std::collections::HashSet;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

/// Flat cost charged for the status line when sizing an entry.
const STATUS_COST: u64 = 2;

/// A captured upstream response. Immutable once constructed; the byte size
/// is computed exactly once here and trusted by the store afterwards.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    size: u64,
}

impl CacheEntry {
    /// Builds an entry from a captured upstream response. Hop-by-hop headers
    /// (and any header named as a `Connection` token) are stripped here, so
    /// a replayed entry never carries connection metadata from the original
    /// exchange.
    pub fn from_upstream(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Self {
        let headers = persistable_headers(headers);
        let mut size = STATUS_COST + body.len() as u64;
        for (name, value) in headers.iter() {
            size += name.as_str().len() as u64 + value.as_bytes().len() as u64;
        }
        Self {
            status,
            headers,
            body,
            size,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Precomputed byte cost: body length plus header names and values plus
    /// a small constant for the status line.
    pub fn size(&self) -> u64 {
        self.size
    }
}

fn is_hop_by_hop(lower_name: &str) -> bool {
    lower_name.starts_with("proxy-")
        || matches!(
            lower_name,
            "connection" | "keep-alive" | "te" | "trailer" | "transfer-encoding" | "upgrade"
        )
}

/// Copies the response headers minus hop-by-hop headers and minus any header
/// the upstream named in a `Connection` token.
fn persistable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut connection_tokens = HashSet::new();
    for value in headers.get_all(http::header::CONNECTION) {
        if let Ok(text) = value.to_str() {
            for token in text.split(',') {
                let token = token.trim();
                if !token.is_empty() {
                    connection_tokens.insert(token.to_ascii_lowercase());
                }
            }
        }
    }

    let mut persisted = HeaderMap::new();
    for (name, value) in headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop(&lower) || connection_tokens.contains(&lower) {
            continue;
        }
        persisted.append(name.clone(), value.clone());
    }
    persisted
}
