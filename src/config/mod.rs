pub mod model;

use std::collections::{BTreeMap, HashMap};

use anyhow::{Result, ensure};
use tracing::warn;

pub use model::Method;

/// Validated route configuration: which routes to memoize per method, and
/// which routes bust which key patterns per method.
///
/// Built from the raw string-keyed maps of the settings layer. Ingest drops
/// method keys outside the closed [`Method`] set and drops cache routes for
/// non-cacheable methods, warning for each; what remains is keyed by the
/// enum so later stages never touch method strings.
#[derive(Debug, Clone, Default)]
pub struct RouteRules {
    cache: BTreeMap<Method, Vec<String>>,
    bust: BTreeMap<Method, BTreeMap<String, Vec<String>>>,
}

impl RouteRules {
    pub fn from_maps(
        cache: &HashMap<String, Vec<String>>,
        bust: &HashMap<String, HashMap<String, Vec<String>>>,
    ) -> Result<Self> {
        let mut rules = RouteRules::default();

        for (key, routes) in cache {
            let Some(method) = Method::parse(key) else {
                warn!(method = %key, "dropping cache routes for unknown HTTP method");
                continue;
            };
            if !method.is_cacheable() {
                warn!(method = %method, "dropping cache routes: only GET and HEAD are cacheable");
                continue;
            }
            if routes.is_empty() {
                continue;
            }
            rules
                .cache
                .entry(method)
                .or_default()
                .extend(routes.iter().cloned());
        }

        for (key, routes) in bust {
            let Some(method) = Method::parse(key) else {
                warn!(method = %key, "dropping bust routes for unknown HTTP method");
                continue;
            };
            for (route, patterns) in routes {
                if patterns.is_empty() {
                    continue;
                }
                rules
                    .bust
                    .entry(method)
                    .or_default()
                    .insert(route.clone(), patterns.clone());
            }
        }

        ensure!(
            rules.cache.values().any(|routes| !routes.is_empty()),
            "configuration must define at least one cacheable route"
        );

        Ok(rules)
    }

    pub fn cache_routes(&self, method: Method) -> &[String] {
        self.cache
            .get(&method)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn bust_routes(&self, method: Method) -> impl Iterator<Item = (&str, &[String])> {
        self.bust
            .get(&method)
            .into_iter()
            .flat_map(|routes| routes.iter())
            .map(|(route, patterns)| (route.as_str(), patterns.as_slice()))
    }

    /// Total number of configured cacheable routes.
    pub fn cache_route_count(&self) -> usize {
        self.cache.values().map(Vec::len).sum()
    }

    /// Total number of configured busting routes.
    pub fn bust_route_count(&self) -> usize {
        self.bust.values().map(BTreeMap::len).sum()
    }
}
