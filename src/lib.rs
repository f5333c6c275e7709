pub mod cache;
pub mod cli;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod settings;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::cache::LruStore;
use crate::proxy::AppContext;
use crate::proxy::router::RouteTable;
use crate::proxy::upstream::{UpstreamClient, UpstreamTarget};
use crate::settings::Settings;

/// Builds the shared application context from validated settings: resolves
/// the cache budget, validates route rules, and prepares the upstream
/// client. Fails fast on anything the proxy cannot run with.
pub fn build_app(settings: Settings) -> Result<AppContext> {
    let budget = settings.cache_budget()?;
    let rules = settings.route_rules()?;
    let target = UpstreamTarget::parse(&settings.api_url)?;
    let upstream = UpstreamClient::new(
        target,
        settings.upstream_connect_timeout(),
        settings.upstream_timeout(),
        settings.max_header_size,
        settings.max_body_size,
    )?;

    info!(
        capacity = budget.capacity,
        mode = %budget.mode,
        api_url = %settings.api_url,
        cache_routes = rules.cache_route_count(),
        bust_routes = rules.bust_route_count(),
        "cachefront configured"
    );

    Ok(AppContext::new(
        Arc::new(settings),
        Arc::new(LruStore::new(budget.capacity, budget.mode)),
        Arc::new(RouteTable::build(&rules)),
        Arc::new(upstream),
    ))
}

pub async fn run(settings: Settings) -> Result<()> {
    let app = build_app(settings)?;

    if let Some(port) = app.settings.metrics_port {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        tokio::spawn(async move {
            info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = metrics::serve(addr).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    proxy::run(app).await
}
