use http::Method;

/// Canonical cache key for a request: `METHOD:PATH`, with `?QUERY` appended
/// only when the request carried a non-empty query string.
///
/// The query participates in the key so that `/posts?page=1` and
/// `/posts?page=2` are distinct entries; identical logical requests always
/// derive identical keys.
pub fn cache_key(method: &Method, path: &str, query: Option<&str>) -> String {
    match query {
        Some(query) if !query.is_empty() => format!("{method}:{path}?{query}"),
        _ => format!("{method}:{path}"),
    }
}
