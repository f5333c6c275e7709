use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use http::StatusCode;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::proxy::codec::{read_line_with_timeout, trim_line};

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_REQUEST_LINE: usize = 1024;
const MAX_HEADER_LINE: usize = 8 * 1024;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_total", "Total requests by cache disposition");
    let vec = IntCounterVec::new(opts, &["cache"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_total");
    vec
});

static REQUEST_STATUS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("request_status_total", "Total requests by status class");
    let vec = IntCounterVec::new(opts, &["status_class"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register request_status_total");
    vec
});

static REQUEST_METHOD_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("request_method_total", "Total requests by method");
    let vec = IntCounterVec::new(opts, &["method"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register request_method_total");
    vec
});

static CACHE_EVICTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_evictions_total", "Entries evicted to fit the budget")
        .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_evictions_total");
    counter
});

static CACHE_BUSTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_busted_total", "Entries evicted by bust patterns")
        .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_busted_total");
    counter
});

static CACHE_STORE_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_store_errors_total", "Failed cache insertions")
        .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_store_errors_total");
    counter
});

static UPSTREAM_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("upstream_errors_total", "Failed upstream exchanges")
        .expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register upstream_errors_total");
    counter
});

static CACHE_USED: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("cache_used", "Capacity units currently in use")
        .expect("create gauge");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("register cache_used");
    gauge
});

fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

pub fn record_request(cache: &str, method: &str, status: StatusCode) {
    REQUESTS_TOTAL.with_label_values(&[cache]).inc();
    REQUEST_STATUS_TOTAL
        .with_label_values(&[status_class(status.as_u16())])
        .inc();
    REQUEST_METHOD_TOTAL.with_label_values(&[method]).inc();
}

pub fn record_evictions(count: u64) {
    if count > 0 {
        CACHE_EVICTIONS_TOTAL.inc_by(count);
    }
}

pub fn record_busted(count: u64) {
    if count > 0 {
        CACHE_BUSTED_TOTAL.inc_by(count);
    }
}

pub fn record_store_error() {
    CACHE_STORE_ERRORS_TOTAL.inc();
}

pub fn record_upstream_error() {
    UPSTREAM_ERRORS_TOTAL.inc();
}

pub fn set_cache_used(used: u64) {
    CACHE_USED.set(used as i64);
}

pub fn gather() -> Vec<u8> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("encode metrics");
    buffer
}

/// Serves the registry in Prometheus text format on `/metrics`.
pub async fn serve(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    loop {
        let (stream, _) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream).await {
                tracing::debug!(error = %err, "metrics handler error");
            }
        });
    }
}

async fn handle_connection(stream: tokio::net::TcpStream) -> Result<()> {
    let peer = stream.peer_addr()?;
    handle_stream(stream, peer).await
}

async fn handle_stream<S>(stream: S, peer: SocketAddr) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    let read =
        read_line_with_timeout(&mut reader, &mut request_line, READ_TIMEOUT, peer, MAX_REQUEST_LINE)
            .await?;
    if read == 0 {
        return Ok(());
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default();

    // Drain the request headers under the same limits before answering.
    let mut header_line = String::new();
    loop {
        let read =
            read_line_with_timeout(&mut reader, &mut header_line, READ_TIMEOUT, peer, MAX_HEADER_LINE)
                .await?;
        if read == 0 || trim_line(&header_line).is_empty() {
            break;
        }
    }

    let stream = reader.get_mut();
    if method != "GET" || path != "/metrics" {
        stream
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await?;
        return Ok(());
    }

    let body = gather();
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&body).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn peer() -> SocketAddr {
        "127.0.0.1:9100".parse().unwrap()
    }

    #[tokio::test]
    async fn serves_the_registry_on_the_metrics_path() {
        let (mut client, server) = tokio::io::duplex(16 * 1024);
        let task = tokio::spawn(handle_stream(server, peer()));

        client
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: metrics\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        task.await.unwrap().unwrap();

        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
        assert!(text.contains("Content-Type: text/plain"));
    }

    #[tokio::test]
    async fn unknown_paths_get_a_404() {
        let (mut client, server) = tokio::io::duplex(4 * 1024);
        let task = tokio::spawn(handle_stream(server, peer()));

        client
            .write_all(b"GET /other HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        task.await.unwrap().unwrap();

        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"), "got: {text}");
    }

    #[tokio::test]
    async fn rejects_oversized_request_lines() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(handle_stream(server, peer()));

        let mut line = vec![b'a'; MAX_REQUEST_LINE + 16];
        line.extend_from_slice(b"\r\n");
        client.write_all(&line).await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("byte limit"), "got: {err}");
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_on_a_silent_client() {
        let (mut client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(handle_stream(server, peer()));

        client.write_all(b"GET /met").await.unwrap();
        tokio::task::yield_now().await;
        tokio::time::advance(READ_TIMEOUT + Duration::from_secs(1)).await;

        let err = task.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("timed out"), "got: {err}");
    }
}

