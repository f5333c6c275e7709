use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{HeaderMap, Method, header::HeaderName};
use tokio::io::{AsyncRead, BufReader};

use super::body::BodyPlan;
use super::line::{read_line_with_timeout, trim_line};

/// A parsed HTTP/1.1 request head.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: Method,
    /// Origin-form target exactly as received: `/path` or `/path?query`.
    pub target: String,
    /// Every received header, hop-by-hop included; forwarding filters later.
    pub headers: HeaderMap,
    pub content_length: Option<usize>,
    pub chunked: bool,
    pub connection_close: bool,
}

impl RequestHead {
    /// Splits the target into path and optional query string.
    pub fn path_and_query(&self) -> (&str, Option<&str>) {
        match self.target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (&self.target, None),
        }
    }

    pub fn body_plan(&self) -> BodyPlan {
        if self.chunked {
            BodyPlan::Chunked
        } else {
            match self.content_length {
                Some(0) | None => BodyPlan::Empty,
                Some(len) => BodyPlan::Fixed(len),
            }
        }
    }
}

/// Reads one request head off a keep-alive connection. `Ok(None)` means the
/// client went away (or stayed idle past `idle_timeout`) between requests,
/// which simply ends the connection.
pub(crate) async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    idle_timeout: Duration,
    header_timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let mut request_line = String::new();
    let read = match tokio::time::timeout(
        idle_timeout,
        read_line_with_timeout(reader, &mut request_line, header_timeout, peer, max_header_bytes),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => return Ok(None),
    };
    if read == 0 {
        return Ok(None);
    }

    let request_line = trim_line(&request_line);
    let mut tokens = request_line.split_whitespace();
    let (Some(method_token), Some(target), Some(version), None) =
        (tokens.next(), tokens.next(), tokens.next(), tokens.next())
    else {
        bail!("request line {request_line:?} is not '<method> <target> <version>'");
    };
    if version != "HTTP/1.1" {
        bail!("{peer} sent protocol version {version:?}; only HTTP/1.1 is served");
    }
    ensure!(
        target.starts_with('/'),
        "request target must be in origin form, got '{target}'"
    );

    let method = Method::from_bytes(method_token.as_bytes())
        .map_err(|_| anyhow!("unrecognized method {method_token:?}"))?;

    let mut headers = HeaderMap::new();
    let mut connection_tokens: HashSet<String> = HashSet::new();
    let mut content_length = None;
    let mut chunked = false;
    let mut total_bytes = read;
    let mut line = String::new();

    loop {
        let remaining = max_header_bytes
            .checked_sub(total_bytes)
            .filter(|remaining| *remaining > 0)
            .ok_or_else(|| anyhow!("request headers from {peer} exceed configured limit"))?;
        let read = read_line_with_timeout(reader, &mut line, header_timeout, peer, remaining).await?;
        if read == 0 {
            bail!("connection closed during headers from {peer}");
        }
        total_bytes += read;

        let trimmed = trim_line(&line);
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator from {peer}"))?;
        let name = name.trim();
        let value = value.trim();
        ensure!(!name.is_empty(), "header name must not be empty");

        if name.eq_ignore_ascii_case("content-length") {
            ensure!(
                content_length.is_none(),
                "multiple Content-Length headers are not supported"
            );
            let parsed: usize = value
                .parse()
                .with_context(|| format!("invalid Content-Length value '{value}'"))?;
            content_length = Some(parsed);
        }
        if name.eq_ignore_ascii_case("transfer-encoding")
            && value.to_ascii_lowercase().contains("chunked")
        {
            chunked = true;
        }
        if name.eq_ignore_ascii_case("connection") {
            for token in value.split(',') {
                let token = token.trim();
                if !token.is_empty() {
                    connection_tokens.insert(token.to_ascii_lowercase());
                }
            }
        }

        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| anyhow!("invalid header name '{name}' from {peer}"))?;
        let header_value = http::HeaderValue::from_str(value)
            .map_err(|_| anyhow!("invalid value for header '{name}' from {peer}"))?;
        headers.append(header_name, header_value);
    }

    if chunked && content_length.is_some() {
        bail!("request must not include both Transfer-Encoding and Content-Length");
    }

    Ok(Some(RequestHead {
        method,
        target: target.to_string(),
        headers,
        content_length,
        chunked,
        connection_close: connection_tokens.contains("close"),
    }))
}
