use std::collections::{BTreeMap, HashMap};

use crate::config::{Method, RouteRules};

/// One configured route for a method: a template like `/posts/:id`, whether
/// hits on it are memoized, and the bust patterns it triggers.
#[derive(Debug, Clone)]
pub struct Route {
    template: String,
    segments: Vec<Segment>,
    cache: bool,
    bust_patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

impl Route {
    fn new(template: &str) -> Self {
        Self {
            template: template.to_string(),
            segments: parse_segments(template),
            cache: false,
            bust_patterns: Vec::new(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn is_cacheable(&self) -> bool {
        self.cache
    }

    pub fn bust_patterns(&self) -> &[String] {
        &self.bust_patterns
    }

    /// Matches a concrete path segment-by-segment; `:name` segments capture
    /// the concrete value. Returns the captured parameters on a match.
    fn match_path(&self, path: &str) -> Option<HashMap<String, String>> {
        let concrete = split_path(path);
        if concrete.len() != self.segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (segment, value) in self.segments.iter().zip(concrete) {
            match segment {
                Segment::Literal(literal) => {
                    if literal != value {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    if value.is_empty() {
                        return None;
                    }
                    params.insert(name.clone(), value.to_string());
                }
            }
        }
        Some(params)
    }
}

fn parse_segments(template: &str) -> Vec<Segment> {
    split_path(template)
        .into_iter()
        .map(|segment| match segment.strip_prefix(':') {
            Some(name) if !name.is_empty() => Segment::Param(name.to_string()),
            _ => Segment::Literal(segment.to_string()),
        })
        .collect()
}

fn split_path(path: &str) -> Vec<&str> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Vec::new();
    }
    trimmed.split('/').collect()
}

/// A matched route plus the path parameters captured from the request.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub route: &'a Route,
    pub params: HashMap<String, String>,
}

/// Per-method route lists, built once from the validated configuration.
/// Busting routes are registered before caching routes, and a template
/// configured for both classes of the same method collapses into a single
/// route whose stages compose (bust first, then the cache pipeline).
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: BTreeMap<Method, Vec<Route>>,
}

impl RouteTable {
    pub fn build(rules: &RouteRules) -> Self {
        let mut table = RouteTable::default();
        for method in Method::ALL {
            let mut routes: Vec<Route> = Vec::new();
            for (template, patterns) in rules.bust_routes(method) {
                let mut route = Route::new(template);
                route.bust_patterns = patterns.to_vec();
                routes.push(route);
            }
            for template in rules.cache_routes(method) {
                if let Some(existing) = routes.iter_mut().find(|route| route.template == *template)
                {
                    existing.cache = true;
                } else {
                    let mut route = Route::new(template);
                    route.cache = true;
                    routes.push(route);
                }
            }
            if !routes.is_empty() {
                table.routes.insert(method, routes);
            }
        }
        table
    }

    /// First configured route matching the request; `None` means the request
    /// is proxied transparently.
    pub fn find(&self, method: Method, path: &str) -> Option<RouteMatch<'_>> {
        self.routes.get(&method)?.iter().find_map(|route| {
            route
                .match_path(path)
                .map(|params| RouteMatch { route, params })
        })
    }
}
