use std::collections::HashSet;

use http::HeaderMap;

fn is_hop_by_hop(lower_name: &str) -> bool {
    lower_name.starts_with("proxy-")
        || matches!(
            lower_name,
            "connection" | "keep-alive" | "te" | "trailer" | "transfer-encoding" | "upgrade"
        )
}

/// Builds the header block forwarded to the upstream API: the client's
/// headers minus hop-by-hop headers, minus any header named in a
/// `Connection` token, and minus `Host` and body-framing headers, which the
/// upstream client re-derives for its own connection.
pub(crate) fn forwardable_request_headers(headers: &HeaderMap) -> HeaderMap {
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

    let mut forwarded = HeaderMap::new();
    for (name, value) in headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop(&lower)
            || connection_tokens.contains(&lower)
            || matches!(lower.as_str(), "host" | "content-length")
        {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn header_map(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                http::header::HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }
        map
    }

    #[test]
    fn forwards_ordinary_headers() {
        let headers = header_map(&[("accept", "application/json"), ("x-request-id", "abc")]);
        let forwarded = forwardable_request_headers(&headers);
        assert_eq!(forwarded.len(), 2);
    }

    #[test]
    fn strips_host_and_framing_headers() {
        let headers = header_map(&[
            ("host", "cache.local"),
            ("content-length", "10"),
            ("transfer-encoding", "chunked"),
            ("accept", "*/*"),
        ]);
        let forwarded = forwardable_request_headers(&headers);
        assert_eq!(forwarded.len(), 1);
        assert!(forwarded.contains_key("accept"));
    }

    #[test]
    fn strips_hop_by_hop_and_connection_tokens() {
        let headers = header_map(&[
            ("connection", "keep-alive, x-tracking"),
            ("keep-alive", "timeout=5"),
            ("x-tracking", "1"),
            ("te", "trailers"),
            ("upgrade", "h2c"),
            ("proxy-authorization", "Basic xyz"),
            ("authorization", "Bearer token"),
        ]);
        let forwarded = forwardable_request_headers(&headers);
        assert_eq!(forwarded.len(), 1);
        assert!(forwarded.contains_key("authorization"));
    }
}
