use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use rustls::{ClientConfig, RootCertStore, crypto::ring};
use rustls_native_certs as native_certs;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::codec::{read_body, read_response_head};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

/// The parsed upstream base URL: where requests are proxied to.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// `Host` header value, keeping any explicit port from the URL.
    pub authority: String,
    /// Path prefix from the URL with trailing slashes trimmed; may be empty.
    pub base_path: String,
}

impl UpstreamTarget {
    pub fn parse(url: &str) -> Result<Self> {
        let uri: Uri = url
            .parse()
            .with_context(|| format!("invalid apiUrl '{url}'"))?;
        let scheme = match uri.scheme_str() {
            Some("http") => Scheme::Http,
            Some("https") => Scheme::Https,
            Some(other) => bail!("apiUrl scheme '{other}' is not supported (http or https)"),
            None => bail!("apiUrl '{url}' must include a scheme"),
        };
        let host = uri
            .host()
            .ok_or_else(|| anyhow!("apiUrl '{url}' must include a host"))?
            .to_string();
        let port = uri.port_u16().unwrap_or(match scheme {
            Scheme::Http => 80,
            Scheme::Https => 443,
        });
        let authority = uri
            .authority()
            .map(|authority| authority.as_str().to_string())
            .unwrap_or_else(|| host.clone());
        let base_path = uri.path().trim_end_matches('/').to_string();
        Ok(Self {
            scheme,
            host,
            port,
            authority,
            base_path,
        })
    }
}

/// A captured upstream response, fully materialized.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Connects, sends, and captures one exchange with the upstream API per
/// request. Connections are not pooled; each exchange closes its own socket.
pub struct UpstreamClient {
    target: UpstreamTarget,
    tls: Option<TlsConnector>,
    connect_timeout: Duration,
    response_timeout: Duration,
    max_header_size: usize,
    max_body_size: usize,
}

impl UpstreamClient {
    pub fn new(
        target: UpstreamTarget,
        connect_timeout: Duration,
        response_timeout: Duration,
        max_header_size: usize,
        max_body_size: usize,
    ) -> Result<Self> {
        let tls = match target.scheme {
            Scheme::Http => None,
            Scheme::Https => Some(TlsConnector::from(Arc::new(build_tls_client_config()?))),
        };
        Ok(Self {
            target,
            tls,
            connect_timeout,
            response_timeout,
            max_header_size,
            max_body_size,
        })
    }

    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    /// Forwards a request and materializes the response. `headers` must
    /// already be filtered for forwarding; framing and `Host` are re-derived
    /// here.
    pub async fn fetch(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<UpstreamResponse> {
        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect((self.target.host.as_str(), self.target.port)),
        )
        .await
        .map_err(|_| {
            anyhow!(
                "connection to {}:{} timed out",
                self.target.host,
                self.target.port
            )
        })?
        .with_context(|| {
            format!(
                "failed to connect to upstream {}:{}",
                self.target.host, self.target.port
            )
        })?;
        let peer = stream.peer_addr().context("upstream peer address")?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %err, "could not enable TCP_NODELAY for the upstream");
        }

        match &self.tls {
            Some(connector) => {
                let server_name = rustls::pki_types::ServerName::try_from(self.target.host.clone())
                    .with_context(|| format!("invalid TLS server name '{}'", self.target.host))?;
                let tls_stream = timeout(self.connect_timeout, connector.connect(server_name, stream))
                    .await
                    .map_err(|_| anyhow!("TLS handshake with {} timed out", self.target.host))?
                    .with_context(|| format!("TLS handshake with {} failed", self.target.host))?;
                self.exchange(tls_stream, peer, method, path, query, headers, body)
                    .await
            }
            None => {
                self.exchange(stream, peer, method, path, query, headers, body)
                    .await
            }
        }
    }

    async fn exchange<S>(
        &self,
        mut stream: S,
        peer: std::net::SocketAddr,
        method: &Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<UpstreamResponse>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut target = format!("{}{}", self.target.base_path, path);
        if target.is_empty() {
            target.push('/');
        }
        if let Some(query) = query
            && !query.is_empty()
        {
            target.push('?');
            target.push_str(query);
        }

        let mut buffer = Vec::with_capacity(256);
        buffer.extend_from_slice(
            format!("{method} {target} HTTP/1.1\r\nHost: {}\r\n", self.target.authority).as_bytes(),
        );
        for (name, value) in headers.iter() {
            buffer.extend_from_slice(name.as_str().as_bytes());
            buffer.extend_from_slice(b": ");
            buffer.extend_from_slice(value.as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }
        buffer.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        buffer.extend_from_slice(b"Connection: close\r\n\r\n");

        stream
            .write_all(&buffer)
            .await
            .with_context(|| format!("failed to send request to {peer}"))?;
        if !body.is_empty() {
            stream
                .write_all(body)
                .await
                .with_context(|| format!("failed to send request body to {peer}"))?;
        }
        stream
            .flush()
            .await
            .with_context(|| format!("failed to flush request to {peer}"))?;

        let mut reader = BufReader::new(stream);
        let head =
            read_response_head(&mut reader, self.response_timeout, peer, self.max_header_size)
                .await?;
        let plan = head.body_plan(method);
        let body = read_body(
            &mut reader,
            plan,
            self.max_body_size,
            self.response_timeout,
            peer,
        )
        .await?;

        Ok(UpstreamResponse {
            status: head.status,
            headers: head.headers,
            body,
        })
    }
}

fn build_tls_client_config() -> Result<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    match native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = root_store.add_parsable_certificates(certs);
            if ignored > 0 {
                warn!(ignored, "ignored {ignored} invalid system trust anchors");
            }
            ensure!(
                added > 0,
                "no trust anchors loaded from system locations; https upstreams cannot be verified"
            );
        }
        Err(err) => {
            bail!("failed to load system trust anchors: {err}");
        }
    }

    let provider = ring::default_provider();
    let builder = ClientConfig::builder_with_provider(provider.into())
        .with_safe_default_protocol_versions()?;
    let mut config = builder
        .with_root_certificates(Arc::new(root_store))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}
