use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use http::StatusCode;
use time::OffsetDateTime;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

/// Installs the global subscriber. Logs go to the terminal unless a log file
/// path is given, in which case they are appended there without ANSI colors.
pub fn init_logger(format: LogFormat, log_file: Option<&Path>) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let writer = Mutex::new(file);
            match format {
                LogFormat::Json => fmt::fmt()
                    .with_env_filter(filter)
                    .json()
                    .with_current_span(false)
                    .with_span_list(false)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_writer(writer)
                    .try_init()
                    .map_err(|err| anyhow!(err))?,
                LogFormat::Text => fmt::fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_ansi(false)
                    .compact()
                    .with_writer(writer)
                    .try_init()
                    .map_err(|err| anyhow!(err))?,
            }
        }
        None => match format {
            LogFormat::Json => fmt::fmt()
                .with_env_filter(filter)
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .try_init()
                .map_err(|err| anyhow!(err))?,
            LogFormat::Text => fmt::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .compact()
                .try_init()
                .map_err(|err| anyhow!(err))?,
        },
    }

    Ok(())
}

/// How the cache participated in a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDisposition {
    /// Served from the store without touching the upstream.
    Hit,
    /// Fetched upstream on a cacheable route.
    Miss,
    /// Proxied without cache participation.
    Bypass,
}

impl CacheDisposition {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheDisposition::Hit => "HIT",
            CacheDisposition::Miss => "MISS",
            CacheDisposition::Bypass => "BYPASS",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccessLogEvent {
    pub client_ip: std::net::IpAddr,
    pub client_port: u16,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub cache: CacheDisposition,
    pub busted: u64,
    pub bytes_out: u64,
    pub elapsed_ms: u128,
}

#[derive(Debug)]
pub struct AccessLogBuilder {
    event: AccessLogEvent,
}

impl AccessLogBuilder {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            event: AccessLogEvent {
                client_ip: peer.ip(),
                client_port: peer.port(),
                method: String::new(),
                path: String::new(),
                status: 0,
                cache: CacheDisposition::Bypass,
                busted: 0,
                bytes_out: 0,
                elapsed_ms: 0,
            },
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.event.method = method.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.event.path = path.into();
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.event.status = status.as_u16();
        self
    }

    pub fn cache(mut self, cache: CacheDisposition) -> Self {
        self.event.cache = cache;
        self
    }

    pub fn busted(mut self, busted: u64) -> Self {
        self.event.busted = busted;
        self
    }

    pub fn bytes_out(mut self, bytes: u64) -> Self {
        self.event.bytes_out = bytes;
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.event.elapsed_ms = elapsed.as_millis();
        self
    }

    pub fn log(self) {
        log_access(self.event);
    }
}

pub fn log_access(event: AccessLogEvent) {
    let AccessLogEvent {
        client_ip,
        client_port,
        method,
        path,
        status,
        cache,
        busted,
        bytes_out,
        elapsed_ms,
    } = event;

    let now = OffsetDateTime::now_utc();
    let (year, month, day) = now.to_calendar_date();
    let (hour, minute, second) = now.to_hms();
    let millisecond = now.millisecond();
    let month_number: u8 = month.into();
    let ts = format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millisecond:03}Z",
        month = month_number
    );

    tracing::info!(
        target = "access_log",
        ts,
        client_ip = %client_ip,
        client_port,
        method,
        path,
        status,
        cache = cache.as_str(),
        busted,
        bytes_out,
        elapsed_ms,
    );

    crate::metrics::record_request(
        cache.as_str(),
        &method,
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    );
}
