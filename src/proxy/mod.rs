pub mod codec;
mod headers;
pub mod listener;
mod pipeline;
pub mod router;
pub mod upstream;

use std::sync::Arc;

use anyhow::Result;

use crate::cache::LruStore;
use crate::settings::Settings;

use router::RouteTable;
use upstream::UpstreamClient;

/// Everything a connection task needs: immutable settings and routes, the
/// shared store, and the upstream client. Cloning is cheap; the store is the
/// only shared mutable state.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub cache: Arc<LruStore>,
    pub routes: Arc<RouteTable>,
    pub upstream: Arc<UpstreamClient>,
}

impl AppContext {
    pub fn new(
        settings: Arc<Settings>,
        cache: Arc<LruStore>,
        routes: Arc<RouteTable>,
        upstream: Arc<UpstreamClient>,
    ) -> Self {
        Self {
            settings,
            cache,
            routes,
            upstream,
        }
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}
