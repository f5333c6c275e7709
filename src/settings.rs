use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cache::CapacityMode;
use crate::cli::{Cli, LogFormat, parse_bust_arg};
use crate::config::RouteRules;
use crate::proxy::upstream::UpstreamTarget;

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

fn default_client_timeout() -> u64 {
    30
}

fn default_upstream_connect_timeout() -> u64 {
    5
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_max_header_size() -> usize {
    32 * 1024
}

fn default_max_body_size() -> usize {
    64 * 1024 * 1024
}

/// Resolved cache budget: either an entry count or a byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheBudget {
    pub capacity: u64,
    pub mode: CapacityMode,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub capacity: u64,
    #[serde(default, alias = "capacity_unit")]
    pub capacity_unit: String,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, alias = "api_url")]
    pub api_url: String,
    #[serde(default, alias = "log_file_path")]
    pub log_file_path: Option<PathBuf>,
    #[serde(default = "default_log_format", alias = "log_format")]
    pub log_format: LogFormat,
    #[serde(default, alias = "metrics_port")]
    pub metrics_port: Option<u16>,
    /// Seconds to wait for a client to deliver its request.
    #[serde(default = "default_client_timeout", alias = "client_timeout")]
    pub client_timeout: u64,
    /// Seconds to wait for a TCP connection to the upstream API.
    #[serde(
        default = "default_upstream_connect_timeout",
        alias = "upstream_connect_timeout"
    )]
    pub upstream_connect_timeout: u64,
    /// Seconds to wait for the upstream API's full response.
    #[serde(default = "default_upstream_timeout", alias = "upstream_timeout")]
    pub upstream_timeout: u64,
    #[serde(default = "default_max_header_size", alias = "max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_body_size", alias = "max_body_size")]
    pub max_body_size: usize,
    /// Raw method -> route templates to memoize; validated into
    /// [`RouteRules`] before use.
    #[serde(default)]
    pub cache: HashMap<String, Vec<String>>,
    /// Raw method -> route template -> bust patterns.
    #[serde(default)]
    pub bust: HashMap<String, HashMap<String, Vec<String>>>,
}

impl Settings {
    /// Loads settings from the JSON config file (if any), `CACHEFRONT__*`
    /// environment variables, and finally the command line, which overwrites
    /// both. The result is normalized and validated.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = resolve_config_path(cli) {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("CACHEFRONT")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_cli(cli)?;
        settings.normalize();
        settings.validate()?;
        Ok(settings)
    }

    /// Overlays command line flags; any flag that was given wins over the
    /// file and environment values.
    fn apply_cli(&mut self, cli: &Cli) -> Result<()> {
        if let Some(capacity) = cli.capacity {
            self.capacity = capacity;
        }
        if let Some(unit) = &cli.capacity_unit {
            self.capacity_unit = unit.clone();
        }
        if let Some(hostname) = &cli.hostname {
            self.hostname = hostname.clone();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(api_url) = &cli.api_url {
            self.api_url = api_url.clone();
        }
        if let Some(path) = &cli.log_file_path {
            self.log_file_path = Some(path.clone());
        }
        if let Some(format) = cli.log_format {
            self.log_format = format;
        }
        if let Some(port) = cli.metrics_port {
            self.metrics_port = Some(port);
        }
        if !cli.cache_get.is_empty() {
            self.cache.insert("GET".to_string(), cli.cache_get.clone());
        }
        if !cli.cache_head.is_empty() {
            self.cache
                .insert("HEAD".to_string(), cli.cache_head.clone());
        }
        for (method, raw) in cli.bust_args() {
            let rule = parse_bust_arg(method, raw)?;
            self.bust
                .entry(method.as_str().to_string())
                .or_default()
                .insert(rule.route, rule.patterns);
        }
        Ok(())
    }

    fn normalize(&mut self) {
        let trimmed = self.api_url.trim_end_matches('/');
        if trimmed.len() != self.api_url.len() {
            self.api_url = trimmed.to_string();
        }
    }

    fn validate(&self) -> Result<()> {
        self.cache_budget()?;
        ensure!(!self.api_url.is_empty(), "apiUrl is required");
        UpstreamTarget::parse(&self.api_url)?;
        ensure!(self.max_header_size > 0, "maxHeaderSize must be positive");
        ensure!(self.max_body_size > 0, "maxBodySize must be positive");
        Ok(())
    }

    /// Resolves `capacity` and `capacityUnit` into a concrete budget. An
    /// empty unit selects entry counting; `b`, `kb`, `mb`, `gb` and `tb`
    /// (case-insensitive, powers of 1024) select a byte budget.
    pub fn cache_budget(&self) -> Result<CacheBudget> {
        ensure!(self.capacity > 0, "capacity must be a positive number");
        let unit = self.capacity_unit.trim().to_ascii_lowercase();
        if unit.is_empty() {
            return Ok(CacheBudget {
                capacity: self.capacity,
                mode: CapacityMode::Entries,
            });
        }
        let exponent = match unit.as_str() {
            "b" => 0u32,
            "kb" => 1,
            "mb" => 2,
            "gb" => 3,
            "tb" => 4,
            other => bail!("unknown capacity unit '{other}' (expected b, kb, mb, gb or tb)"),
        };
        let capacity = self
            .capacity
            .checked_mul(1024u64.pow(exponent))
            .ok_or_else(|| anyhow::anyhow!("capacity in {unit} overflows the byte budget"))?;
        Ok(CacheBudget {
            capacity,
            mode: CapacityMode::Bytes,
        })
    }

    /// Validates the raw cache/bust maps into route rules, dropping invalid
    /// methods along the way.
    pub fn route_rules(&self) -> Result<RouteRules> {
        RouteRules::from_maps(&self.cache, &self.bust)
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn resolve_config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = &cli.config {
        return Some(path.clone());
    }
    let default = Path::new("cachefront.json");
    if default.exists() {
        return Some(default.to_path_buf());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    fn cli(args: &[&str]) -> Cli {
        let mut full = vec!["cachefront"];
        full.extend_from_slice(args);
        Cli::parse_from(full)
    }

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".json")
            .tempfile()
            .expect("create temp config");
        file.write_all(json.as_bytes()).expect("write temp config");
        file
    }

    const FULL_CONFIG: &str = r#"{
        "capacity": 555,
        "capacityUnit": "mb",
        "hostname": "localhost",
        "port": 8080,
        "apiUrl": "https://jsonplaceholder.typicode.com/",
        "cache": {
            "GET": ["/posts", "/posts/:id"],
            "HEAD": ["/posts"]
        },
        "bust": {
            "POST": { "/posts": ["^GET:/posts$"] },
            "PUT": { "/posts": ["^GET:/posts$", "^HEAD:/posts$"] }
        }
    }"#;

    #[test]
    fn loads_every_prop_from_the_config_file() {
        let file = write_config(FULL_CONFIG);
        let settings =
            Settings::load(&cli(&["--config", file.path().to_str().unwrap()])).unwrap();

        assert_eq!(settings.capacity, 555);
        assert_eq!(settings.capacity_unit, "mb");
        assert_eq!(settings.hostname, "localhost");
        assert_eq!(settings.port, 8080);
        assert_eq!(settings.api_url, "https://jsonplaceholder.typicode.com");
        assert_eq!(settings.cache["GET"], vec!["/posts", "/posts/:id"]);
        assert_eq!(settings.bust["PUT"]["/posts"].len(), 2);

        let budget = settings.cache_budget().unwrap();
        assert_eq!(budget.mode, CapacityMode::Bytes);
        assert_eq!(budget.capacity, 555 * 1024 * 1024);
    }

    #[test]
    fn flags_overwrite_the_config_file() {
        let file = write_config(FULL_CONFIG);
        let settings = Settings::load(&cli(&[
            "--config",
            file.path().to_str().unwrap(),
            "--api-url",
            "https://test.com",
            "--capacity",
            "10",
            "--capacity-unit",
            "",
        ]))
        .unwrap();
        assert_eq!(settings.api_url, "https://test.com");
        let budget = settings.cache_budget().unwrap();
        assert_eq!(budget, CacheBudget { capacity: 10, mode: CapacityMode::Entries });
    }

    #[test]
    fn flags_alone_are_enough() {
        let settings = Settings::load(&cli(&[
            "--capacity",
            "100",
            "--api-url",
            "http://127.0.0.1:9000",
            "--cache:GET",
            "/posts",
            "--bust:POST",
            "/posts=>^GET:/posts$",
        ]))
        .unwrap();
        assert_eq!(settings.cache["GET"], vec!["/posts"]);
        assert_eq!(settings.bust["POST"]["/posts"], vec!["^GET:/posts$"]);
        let rules = settings.route_rules().unwrap();
        assert_eq!(rules.cache_route_count(), 1);
        assert_eq!(rules.bust_route_count(), 1);
    }

    #[test]
    fn capacity_unit_is_case_insensitive() {
        let settings = Settings::load(&cli(&[
            "--capacity",
            "2",
            "--capacity-unit",
            "KB",
            "--api-url",
            "http://127.0.0.1:9000",
        ]))
        .unwrap();
        let budget = settings.cache_budget().unwrap();
        assert_eq!(budget, CacheBudget { capacity: 2048, mode: CapacityMode::Bytes });
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = Settings::load(&cli(&[
            "--capacity",
            "0",
            "--api-url",
            "http://127.0.0.1:9000",
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("capacity must be a positive number"));
    }

    #[test]
    fn unknown_capacity_unit_is_rejected() {
        let err = Settings::load(&cli(&[
            "--capacity",
            "5",
            "--capacity-unit",
            "pb",
            "--api-url",
            "http://127.0.0.1:9000",
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("unknown capacity unit 'pb'"));
    }

    #[test]
    fn missing_api_url_is_rejected() {
        let err = Settings::load(&cli(&["--capacity", "5"])).unwrap_err();
        assert!(err.to_string().contains("apiUrl is required"));
    }

    #[test]
    fn trailing_slashes_are_trimmed_from_api_url() {
        let settings = Settings::load(&cli(&[
            "--capacity",
            "5",
            "--api-url",
            "http://127.0.0.1:9000/base/",
        ]))
        .unwrap();
        assert_eq!(settings.api_url, "http://127.0.0.1:9000/base");
    }

    #[test]
    fn malformed_bust_flag_is_rejected() {
        let err = Settings::load(&cli(&[
            "--capacity",
            "5",
            "--api-url",
            "http://127.0.0.1:9000",
            "--bust:POST",
            "/posts",
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("invalid POST bust argument"));
    }
}
