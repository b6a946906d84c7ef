//! # Route Table
//!
//! Maps an inbound path to the route that serves it. Routes are kept in
//! configuration order and the **first** route whose prefix is a string prefix of
//! the path wins. This is deliberately not longest-prefix matching: a short prefix
//! declared early shadows a more specific one declared later, and operators rely
//! on declaration order to express precedence.
//!
//! The table is read on every request and replaced only when the configuration
//! file is reloaded, so the route list sits behind a `parking_lot::RwLock` holding
//! an `Arc<[Arc<Route>]>`: readers clone one `Arc` and release the lock at once.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::RouteDefinition;

/// A configured mapping from a path prefix to a backend target
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Route {
    pub prefix: String,

    /// `service://<name>` or a literal base URL
    pub target: String,

    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    pub retries: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewrite_prefix: Option<String>,
}

impl Route {
    pub fn new(prefix: impl Into<String>, target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            prefix: prefix.into(),
            target: target.into(),
            timeout,
            retries: 0,
            rewrite_prefix: None,
        }
    }

    pub fn with_rewrite_prefix(mut self, rewrite: impl Into<String>) -> Self {
        self.rewrite_prefix = Some(rewrite.into());
        self
    }

    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.prefix)
    }

    /// Path sent downstream: unchanged, unless the route rewrites its prefix
    pub fn forward_path(&self, path: &str) -> String {
        match (&self.rewrite_prefix, path.strip_prefix(self.prefix.as_str())) {
            (Some(rewrite), Some(rest)) => {
                let joined = format!("{}{}", rewrite, rest);
                if joined.is_empty() {
                    "/".to_string()
                } else {
                    joined
                }
            }
            _ => path.to_string(),
        }
    }
}

impl From<&RouteDefinition> for Route {
    fn from(def: &RouteDefinition) -> Self {
        Self {
            prefix: def.prefix.clone(),
            target: def.target.clone(),
            timeout: def.timeout,
            retries: def.retries,
            rewrite_prefix: def.rewrite_prefix.clone().filter(|r| !r.is_empty()),
        }
    }
}

/// Ordered, first-match route table
#[derive(Debug)]
pub struct RouteTable {
    routes: RwLock<Arc<[Arc<Route>]>>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self {
            routes: RwLock::new(Self::freeze(routes)),
        }
    }

    pub fn from_definitions(definitions: &[RouteDefinition]) -> Self {
        Self::new(definitions.iter().map(Route::from).collect())
    }

    fn freeze(routes: Vec<Route>) -> Arc<[Arc<Route>]> {
        routes.into_iter().map(Arc::new).collect()
    }

    /// First route, in declaration order, whose prefix starts `path`
    pub fn match_route(&self, path: &str) -> Option<Arc<Route>> {
        let routes = Arc::clone(&self.routes.read());
        routes.iter().find(|route| route.matches(path)).cloned()
    }

    /// Swap in a new route list; in-flight requests keep the route they matched
    pub fn replace(&self, routes: Vec<Route>) {
        let count = routes.len();
        *self.routes.write() = Self::freeze(routes);
        tracing::info!(routes = count, "Route table replaced");
    }

    pub fn routes(&self) -> Vec<Route> {
        self.routes.read().iter().map(|r| Route::clone(r)).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(prefix: &str, target: &str) -> Route {
        Route::new(prefix, target, Duration::from_secs(5))
    }

    fn blog_table() -> RouteTable {
        RouteTable::new(vec![
            route("/api/user", "service://user-service"),
            route("/api/content", "service://content-service"),
            route("/api/comment", "service://comment-service"),
            route("/api/stat", "service://stat-service"),
            route("/api/admin", "service://admin-service"),
        ])
    }

    #[test]
    fn test_matches_configured_prefix() {
        let table = blog_table();
        let matched = table.match_route("/api/content/articles/7").unwrap();
        assert_eq!(matched.target, "service://content-service");
    }

    #[test]
    fn test_unmatched_paths_return_none() {
        let table = blog_table();
        for path in ["/", "/health", "/api", "/api/", "/apiuser", "/other/api/user"] {
            assert!(table.match_route(path).is_none(), "{} should not match", path);
        }
    }

    #[test]
    fn test_first_match_not_longest_match() {
        let table = RouteTable::new(vec![
            route("/api/a", "service://a"),
            route("/api/ab", "service://ab"),
        ]);

        let matched = table.match_route("/api/ab/x").unwrap();
        assert_eq!(matched.prefix, "/api/a");
        assert_eq!(matched.target, "service://a");
    }

    #[test]
    fn test_empty_table() {
        let table = RouteTable::default();
        assert!(table.is_empty());
        assert!(table.match_route("/api/user").is_none());
    }

    #[test]
    fn test_forward_path_unchanged_without_rewrite() {
        let r = route("/api/user", "service://user-service");
        assert_eq!(r.forward_path("/api/user/info/1"), "/api/user/info/1");
    }

    #[test]
    fn test_forward_path_rewrites_prefix() {
        let r = route("/api/user", "service://user-service").with_rewrite_prefix("/api");
        assert_eq!(r.forward_path("/api/user/info/1"), "/api/info/1");
        assert_eq!(r.forward_path("/api/user"), "/api");

        let r = route("/svc", "http://backend:9000").with_rewrite_prefix("");
        assert_eq!(r.forward_path("/svc"), "/");
    }

    #[test]
    fn test_from_definition_keeps_order_and_fields() {
        let mut user = RouteDefinition::new("/api/user", "service://user-service");
        user.retries = 2;
        user.rewrite_prefix = Some("/api".to_string());
        let stat = RouteDefinition::new("/api/stat", "http://stat:8004");

        let table = RouteTable::from_definitions(&[user, stat]);
        let routes = table.routes();

        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].retries, 2);
        assert_eq!(routes[0].rewrite_prefix.as_deref(), Some("/api"));
        assert_eq!(routes[1].target, "http://stat:8004");
    }

    #[test]
    fn test_replace_swaps_routes() {
        let table = blog_table();
        let held = table.match_route("/api/user/1").unwrap();

        table.replace(vec![route("/api", "http://monolith:8000")]);

        assert_eq!(table.len(), 1);
        assert_eq!(table.match_route("/api/user/1").unwrap().target, "http://monolith:8000");
        assert_eq!(held.target, "service://user-service");
    }
}
