use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::config::Method;

/// Separates the route from its pattern list in `--bust:*` values.
pub const ROUTE_SEPARATOR: &str = "=>";
/// Separates multiple patterns in `--bust:*` values.
pub const PATTERN_SEPARATOR: &str = "||";

#[derive(Debug, Clone, Parser)]
#[command(
    name = "cachefront",
    version,
    about = "LRU caching reverse proxy that memoizes REST API responses and \
             busts entries when configured mutating routes fire"
)]
pub struct Cli {
    /// Path to a JSON config file; command line flags overwrite file values.
    #[arg(long, visible_alias = "conf")]
    pub config: Option<PathBuf>,

    /// Number of entries to cache, or the amount of memory when
    /// --capacity-unit is given.
    #[arg(long, visible_alias = "cap")]
    pub capacity: Option<u64>,

    /// Switch to a memory-based capacity: b, kb, mb, gb or tb.
    #[arg(long, visible_alias = "cap-unit", value_name = "UNIT")]
    pub capacity_unit: Option<String>,

    /// Hostname the proxy listens on.
    #[arg(long)]
    pub hostname: Option<String>,

    /// Port the proxy listens on.
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Base URL of the API to cache.
    #[arg(long, visible_alias = "url", value_name = "URL")]
    pub api_url: Option<String>,

    /// File to append logs to instead of the terminal.
    #[arg(long = "logfile", value_name = "PATH")]
    pub log_file_path: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Expose Prometheus metrics on this port.
    #[arg(long, value_name = "PORT")]
    pub metrics_port: Option<u16>,

    /// Paths to cache on GET requests.
    #[arg(long = "cache:GET", value_name = "PATH", value_delimiter = ',')]
    pub cache_get: Vec<String>,

    /// Paths to cache on HEAD requests.
    #[arg(long = "cache:HEAD", value_name = "PATH", value_delimiter = ',')]
    pub cache_head: Vec<String>,

    /// 'ROUTE=>PATTERN||PATTERN...' busted by GET requests to ROUTE.
    #[arg(long = "bust:GET", value_name = "RULE")]
    pub bust_get: Vec<String>,

    /// 'ROUTE=>PATTERN||PATTERN...' busted by HEAD requests to ROUTE.
    #[arg(long = "bust:HEAD", value_name = "RULE")]
    pub bust_head: Vec<String>,

    /// 'ROUTE=>PATTERN||PATTERN...' busted by POST requests to ROUTE.
    #[arg(long = "bust:POST", value_name = "RULE")]
    pub bust_post: Vec<String>,

    /// 'ROUTE=>PATTERN||PATTERN...' busted by PUT requests to ROUTE.
    #[arg(long = "bust:PUT", value_name = "RULE")]
    pub bust_put: Vec<String>,

    /// 'ROUTE=>PATTERN||PATTERN...' busted by DELETE requests to ROUTE.
    #[arg(long = "bust:DELETE", value_name = "RULE")]
    pub bust_delete: Vec<String>,

    /// 'ROUTE=>PATTERN||PATTERN...' busted by PATCH requests to ROUTE.
    #[arg(long = "bust:PATCH", value_name = "RULE")]
    pub bust_patch: Vec<String>,

    /// 'ROUTE=>PATTERN||PATTERN...' busted by TRACE requests to ROUTE.
    #[arg(long = "bust:TRACE", value_name = "RULE")]
    pub bust_trace: Vec<String>,

    /// 'ROUTE=>PATTERN||PATTERN...' busted by CONNECT requests to ROUTE.
    #[arg(long = "bust:CONNECT", value_name = "RULE")]
    pub bust_connect: Vec<String>,

    /// 'ROUTE=>PATTERN||PATTERN...' busted by OPTIONS requests to ROUTE.
    #[arg(long = "bust:OPTIONS", value_name = "RULE")]
    pub bust_options: Vec<String>,
}

impl Cli {
    /// All raw `--bust:*` values paired with their method.
    pub fn bust_args(&self) -> impl Iterator<Item = (Method, &str)> {
        let groups: [(Method, &Vec<String>); 9] = [
            (Method::Get, &self.bust_get),
            (Method::Head, &self.bust_head),
            (Method::Post, &self.bust_post),
            (Method::Put, &self.bust_put),
            (Method::Delete, &self.bust_delete),
            (Method::Patch, &self.bust_patch),
            (Method::Trace, &self.bust_trace),
            (Method::Connect, &self.bust_connect),
            (Method::Options, &self.bust_options),
        ];
        groups
            .into_iter()
            .flat_map(|(method, args)| args.iter().map(move |arg| (method, arg.as_str())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

/// A parsed `--bust:*` value: the route that triggers the bust and the
/// patterns it evicts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BustRule {
    pub route: String,
    pub patterns: Vec<String>,
}

/// Parses a `--bust:*` value of the form `ROUTE=>PATTERN||PATTERN...`.
/// Route and patterns are taken verbatim; there are no escaping rules.
pub fn parse_bust_arg(method: Method, raw: &str) -> Result<BustRule> {
    let Some((route, patterns)) = raw.split_once(ROUTE_SEPARATOR) else {
        bail!(
            "invalid {method} bust argument {raw:?}: expected \
             'ROUTE{ROUTE_SEPARATOR}PATTERN{PATTERN_SEPARATOR}PATTERN...'"
        );
    };
    if route.is_empty() || patterns.is_empty() || patterns.contains(ROUTE_SEPARATOR) {
        bail!(
            "invalid {method} bust argument {raw:?}: expected \
             'ROUTE{ROUTE_SEPARATOR}PATTERN{PATTERN_SEPARATOR}PATTERN...'"
        );
    }

    Ok(BustRule {
        route: route.to_string(),
        patterns: patterns
            .split(PATTERN_SEPARATOR)
            .map(str::to_string)
            .collect(),
    })
}
