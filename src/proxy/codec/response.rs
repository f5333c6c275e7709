use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use http::{HeaderMap, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use super::body::BodyPlan;
use super::line::{read_line_with_timeout, trim_line};

/// A parsed HTTP/1.1 response head from the upstream API.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_length: Option<usize>,
    pub chunked: bool,
    pub connection_close: bool,
}

impl ResponseHead {
    /// Framing of the response body, given the request method it answers.
    pub fn body_plan(&self, request_method: &http::Method) -> BodyPlan {
        if request_method == http::Method::HEAD {
            return BodyPlan::Empty;
        }
        match self.status.as_u16() {
            100..=199 | 204 | 304 => return BodyPlan::Empty,
            _ => {}
        }
        if self.chunked {
            BodyPlan::Chunked
        } else {
            match self.content_length {
                Some(0) => BodyPlan::Empty,
                Some(len) => BodyPlan::Fixed(len),
                None => BodyPlan::UntilClose,
            }
        }
    }
}

/// Reads and validates an upstream response head.
pub(crate) async fn read_response_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    let mut status_line = String::new();
    let read = read_line_with_timeout(reader, &mut status_line, timeout_dur, peer, max_header_bytes)
        .await?;
    if read == 0 {
        bail!("upstream closed connection before sending a status line");
    }
    let mut total_bytes = read;

    let status = parse_status_line(trim_line(&status_line))?;

    let mut headers = HeaderMap::new();
    let mut content_length = None;
    let mut chunked = false;
    let mut connection_close = false;
    let mut line = String::new();

    loop {
        let remaining = max_header_bytes
            .checked_sub(total_bytes)
            .filter(|remaining| *remaining > 0)
            .ok_or_else(|| anyhow!("upstream response headers exceed configured limit"))?;
        let read = read_line_with_timeout(reader, &mut line, timeout_dur, peer, remaining).await?;
        if read == 0 {
            bail!("upstream closed connection during headers");
        }
        total_bytes += read;

        let trimmed = trim_line(&line);
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("upstream header missing ':' separator"))?;
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("content-length") {
            if content_length.is_some() {
                bail!("multiple Content-Length headers from upstream are not supported");
            }
            let parsed: usize = value
                .parse()
                .with_context(|| format!("invalid upstream Content-Length value '{value}'"))?;
            content_length = Some(parsed);
        }
        if name.eq_ignore_ascii_case("transfer-encoding")
            && value.to_ascii_lowercase().contains("chunked")
        {
            chunked = true;
        }
        if name.eq_ignore_ascii_case("connection")
            && value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("close"))
        {
            connection_close = true;
        }

        if let (Ok(header_name), Ok(header_value)) = (
            http::header::HeaderName::from_bytes(name.as_bytes()),
            http::HeaderValue::from_str(value),
        ) {
            headers.append(header_name, header_value);
        }
    }

    if chunked && content_length.is_some() {
        bail!("upstream response must not include both Transfer-Encoding and Content-Length");
    }

    Ok(ResponseHead {
        status,
        headers,
        content_length,
        chunked,
        connection_close,
    })
}

fn parse_status_line(line: &str) -> Result<StatusCode> {
    let mut parts = line.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing HTTP version"))?;
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("upstream status line missing status code"))?;

    match version {
        "HTTP/1.1" => {}
        other => bail!("unsupported upstream HTTP version '{other}'"),
    }

    let status_code: u16 = status
        .parse()
        .with_context(|| format!("invalid upstream status code '{status}'"))?;
    StatusCode::from_u16(status_code)
        .map_err(|_| anyhow!("unsupported upstream status code '{status_code}'"))
}

fn is_hop_by_hop(lower_name: &str) -> bool {
    lower_name.starts_with("proxy-")
        || matches!(
            lower_name,
            "connection" | "keep-alive" | "te" | "trailer" | "transfer-encoding" | "upgrade"
        )
}

/// Serializes a materialized response for the downstream client, stripping
/// hop-by-hop headers (and `Connection`-named tokens) and re-deriving body
/// framing as a plain `Content-Length`. Returns the count of body bytes
/// written.
pub(crate) async fn write_response<S>(
    stream: &mut S,
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
    x_cache: Option<&str>,
    head_only: bool,
    close: bool,
) -> Result<u64>
where
    S: AsyncWrite + Unpin,
{
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

    let reason = status.canonical_reason().unwrap_or("");
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", status.as_u16(), reason).as_bytes());

    let has_body = !head_only && !matches!(status.as_u16(), 100..=199 | 204 | 304);

    for (name, value) in headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop(&lower) || connection_tokens.contains(&lower) {
            continue;
        }
        if lower == "content-length" && has_body {
            // Re-derived below from the materialized body.
            continue;
        }
        buffer.extend_from_slice(name.as_str().as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    if has_body {
        buffer.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    if let Some(x_cache) = x_cache {
        buffer.extend_from_slice(b"X-Cache: ");
        buffer.extend_from_slice(x_cache.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }
    if close {
        buffer.extend_from_slice(b"Connection: close\r\n");
    }
    buffer.extend_from_slice(b"\r\n");

    stream.write_all(&buffer).await?;
    let mut body_bytes = 0u64;
    if has_body {
        stream.write_all(body).await?;
        body_bytes = body.len() as u64;
    }
    stream.flush().await?;
    Ok(body_bytes)
}

/// Writes a minimal plain-text error response.
pub(crate) async fn write_error<S>(stream: &mut S, status: StatusCode, message: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    write_response(stream, status, &headers, message.as_bytes(), None, false, true).await?;
    Ok(())
}
