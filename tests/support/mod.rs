#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use cachefront::cli::Cli;
use cachefront::proxy::{AppContext, listener};
use cachefront::settings::Settings;

/// Minimal HTTP upstream that counts requests and answers from a responder
/// closure keyed on method and target.
pub struct MockUpstream {
    pub addr: SocketAddr,
    requests: Arc<AtomicUsize>,
}

impl MockUpstream {
    pub async fn start<F>(responder: F) -> Result<Self>
    where
        F: Fn(&str, &str) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        let responder = Arc::new(responder);

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let counter = counter.clone();
                let responder = responder.clone();
                tokio::spawn(async move {
                    let Ok(Some((method, target))) = read_upstream_request(&mut socket).await
                    else {
                        return;
                    };
                    counter.fetch_add(1, Ordering::SeqCst);
                    let (status, body) = responder(&method, &target);
                    let head = format!(
                        "HTTP/1.1 {status} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        reason(status),
                        body.len()
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(body.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Ok(Self { addr, requests })
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

async fn read_upstream_request(socket: &mut TcpStream) -> Result<Option<(String, String)>> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        let read = socket.read(&mut buf).await?;
        if read == 0 {
            return Ok(None);
        }
        data.extend_from_slice(&buf[..read]);
        if let Some(pos) = data.windows(4).position(|window| window == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let request_line = head.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    // Drain any declared request body so keep-alive framing stays intact.
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let mut remaining = content_length.saturating_sub(data.len() - header_end);
    while remaining > 0 {
        let read = socket.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        remaining = remaining.saturating_sub(read);
    }

    Ok(Some((method, target)))
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "",
    }
}

/// A running proxy instance bound to an ephemeral port, plus its context so
/// tests can inspect the store directly.
pub struct Harness {
    pub addr: SocketAddr,
    pub app: AppContext,
}

/// Spawns the proxy configured from command line flags, the same path the
/// binary takes. `--api-url` should point at a [`MockUpstream`].
pub async fn spawn_proxy(args: &[&str]) -> Result<Harness> {
    let mut full = vec!["cachefront"];
    full.extend_from_slice(args);
    let cli = Cli::parse_from(full);
    let settings = Settings::load(&cli)?;
    let app = cachefront::build_app(settings)?;

    let bind = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let addr = bind.local_addr()?;
    let serve_app = app.clone();
    tokio::spawn(async move {
        let _ = listener::serve(bind, serve_app).await;
    });

    Ok(Harness { addr, app })
}

#[derive(Debug)]
pub struct ClientResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl ClientResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

pub async fn send_request(addr: SocketAddr, method: &str, target: &str) -> Result<ClientResponse> {
    send_request_with_body(addr, method, target, "").await
}

pub async fn send_request_with_body(
    addr: SocketAddr,
    method: &str,
    target: &str,
    body: &str,
) -> Result<ClientResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    let request = format!(
        "{method} {target} HTTP/1.1\r\nHost: cachefront.test\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;
    parse_response(&raw)
}

fn parse_response(raw: &[u8]) -> Result<ClientResponse> {
    let header_end = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .ok_or_else(|| anyhow!("response has no header terminator"))?;
    let head = std::str::from_utf8(&raw[..header_end]).context("response head is not UTF-8")?;
    let body = String::from_utf8_lossy(&raw[header_end + 4..]).to_string();

    let mut lines = head.lines();
    let status_line = lines.next().ok_or_else(|| anyhow!("missing status line"))?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("missing status code"))?
        .parse()
        .context("invalid status code")?;

    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Ok(ClientResponse {
        status,
        headers,
        body,
    })
}
