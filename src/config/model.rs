use std::fmt;

/// The closed set of HTTP methods routes may be configured for. Keeping this
/// a tagged enum (rather than stringly-typed map keys) lets route building
/// iterate the set statically and makes unknown methods unrepresentable past
/// configuration ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Trace,
    Connect,
    Options,
}

impl Method {
    pub const ALL: [Method; 9] = [
        Method::Get,
        Method::Head,
        Method::Post,
        Method::Put,
        Method::Delete,
        Method::Patch,
        Method::Trace,
        Method::Connect,
        Method::Options,
    ];

    /// Parses a configured method key, case-insensitively. Returns `None`
    /// for anything outside the closed set.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "GET" => Some(Method::Get),
            "HEAD" => Some(Method::Head),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            "PATCH" => Some(Method::Patch),
            "TRACE" => Some(Method::Trace),
            "CONNECT" => Some(Method::Connect),
            "OPTIONS" => Some(Method::Options),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
        }
    }

    /// Only GET and HEAD responses may be cached.
    pub fn is_cacheable(self) -> bool {
        matches!(self, Method::Get | Method::Head)
    }

    pub fn from_http(method: &http::Method) -> Option<Self> {
        Self::parse(method.as_str())
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
