//! Host and path based upstream selection.

use std::collections::HashMap;
use std::sync::Arc;

use url::Url;

use crate::config::ProxyConfig;
use crate::error::{FloodgateError, Result};

/// A named forwarding target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub name: String,
    pub base: Url,
}

/// Where a request goes and under which path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub upstream: Arc<Upstream>,
    /// Route prefix that matched, empty for a default upstream
    pub prefix: String,
    /// Request path with the matched prefix removed
    pub path: String,
}

impl RouteMatch {
    /// Absolute URL to forward to, keeping the query string.
    pub fn target(&self, query: Option<&str>) -> Url {
        let mut url = self.upstream.base.clone();
        let base_path = url.path().trim_end_matches('/');
        let path = format!("{base_path}{}", self.path);
        url.set_path(&path);
        url.set_query(query);
        url
    }

    /// Destination label for traffic counters: upstream name then prefix.
    pub fn dest(&self) -> String {
        format!("{}{}", self.upstream.name, self.prefix)
    }
}

#[derive(Debug, Default)]
struct HostRoutes {
    /// Normalized prefixes, longest first. The root prefix is empty.
    prefixes: Vec<(String, Arc<Upstream>)>,
    default: Option<Arc<Upstream>>,
}

/// Routing table built from the proxy configuration.
#[derive(Debug)]
pub struct Router {
    hosts: HashMap<String, HostRoutes>,
    default: Option<Arc<Upstream>>,
}

impl Router {
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let mut upstreams = HashMap::new();
        for (name, target) in &config.upstreams {
            let base = Url::parse(target)
                .map_err(|e| FloodgateError::Config(format!("upstream `{name}`: {e}")))?;
            upstreams.insert(name.as_str(), Arc::new(Upstream { name: name.clone(), base }));
        }
        let lookup = |name: &str| {
            upstreams
                .get(name)
                .cloned()
                .ok_or_else(|| FloodgateError::Config(format!("unknown upstream `{name}`")))
        };

        let mut hosts = HashMap::new();
        for route in &config.routes {
            let mut table = HostRoutes {
                default: route.default.as_deref().map(lookup).transpose()?,
                ..HostRoutes::default()
            };
            for path in &route.paths {
                table
                    .prefixes
                    .push((normalize_prefix(&path.path), lookup(&path.upstream)?));
            }
            table.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
            hosts.insert(route.host.to_ascii_lowercase(), table);
        }

        Ok(Self {
            hosts,
            default: config.default.as_deref().map(lookup).transpose()?,
        })
    }

    /// Pick the upstream for a request.
    ///
    /// The longest matching path prefix on the request's host wins, then the
    /// host's default, then the global default.
    pub fn route(&self, host: Option<&str>, path: &str) -> Option<RouteMatch> {
        let table = host.and_then(|host| self.hosts.get(&strip_port(host).to_ascii_lowercase()));

        if let Some(table) = table {
            for (prefix, upstream) in &table.prefixes {
                if let Some(rest) = strip_path_prefix(path, prefix) {
                    return Some(RouteMatch {
                        upstream: upstream.clone(),
                        prefix: prefix.clone(),
                        path: if rest.is_empty() { "/".to_string() } else { rest.to_string() },
                    });
                }
            }
            if let Some(upstream) = &table.default {
                return Some(RouteMatch {
                    upstream: upstream.clone(),
                    prefix: String::new(),
                    path: path.to_string(),
                });
            }
        }

        self.default.as_ref().map(|upstream| RouteMatch {
            upstream: upstream.clone(),
            prefix: String::new(),
            path: path.to_string(),
        })
    }
}

fn normalize_prefix(path: &str) -> String {
    path.trim_end_matches('/').to_string()
}

/// `/v1` matches `/v1` and `/v1/users` but not `/v1beta`.
fn strip_path_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

fn strip_port(host: &str) -> &str {
    if let Some(bracketed) = host.strip_prefix('[') {
        // [::1]:8080
        return bracketed.split(']').next().unwrap_or(bracketed);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Router {
        let config: ProxyConfig = serde_yaml::from_str(
            r#"
upstreams:
  api: "http://127.0.0.1:9000"
  users: "http://users.internal/base/"
  web: "http://web.internal"
  fallback: "http://fallback.internal"
routes:
  - host: "api.example.com"
    paths:
      - path: "/v1"
        upstream: api
      - path: "/v1/users/"
        upstream: users
    default: web
  - host: "static.example.com"
    paths:
      - path: "/"
        upstream: web
default: fallback
"#,
        )
        .unwrap();
        Router::from_config(&config).unwrap()
    }

    fn routed(router: &Router, host: Option<&str>, path: &str) -> Option<(String, String)> {
        router
            .route(host, path)
            .map(|m| (m.upstream.name.clone(), m.path))
    }

    #[test]
    fn test_longest_prefix_wins() {
        let router = router();

        assert_eq!(
            routed(&router, Some("api.example.com"), "/v1/users/42"),
            Some(("users".into(), "/42".into()))
        );
        assert_eq!(
            routed(&router, Some("api.example.com"), "/v1/orders"),
            Some(("api".into(), "/orders".into()))
        );
        assert_eq!(
            routed(&router, Some("api.example.com"), "/v1"),
            Some(("api".into(), "/".into()))
        );
    }

    #[test]
    fn test_prefix_respects_segment_boundary() {
        let router = router();
        assert_eq!(
            routed(&router, Some("api.example.com"), "/v1beta/x"),
            Some(("web".into(), "/v1beta/x".into()))
        );
    }

    #[test]
    fn test_host_port_and_case_ignored() {
        let router = router();
        assert_eq!(
            routed(&router, Some("API.example.com:8443"), "/v1/a"),
            Some(("api".into(), "/a".into()))
        );
    }

    #[test]
    fn test_root_path_catches_everything_on_host() {
        let router = router();
        assert_eq!(
            routed(&router, Some("static.example.com"), "/img/logo.png"),
            Some(("web".into(), "/img/logo.png".into()))
        );
    }

    #[test]
    fn test_unknown_host_uses_global_default() {
        let router = router();
        assert_eq!(
            routed(&router, Some("other.example.com"), "/v1/a"),
            Some(("fallback".into(), "/v1/a".into()))
        );
        assert_eq!(
            routed(&router, None, "/"),
            Some(("fallback".into(), "/".into()))
        );
    }

    #[test]
    fn test_no_default_means_no_route() {
        let config: ProxyConfig =
            serde_yaml::from_str("upstreams:\n  api: \"http://127.0.0.1:9000\"\n").unwrap();
        let router = Router::from_config(&config).unwrap();
        assert!(router.route(Some("any"), "/").is_none());
    }

    #[test]
    fn test_target_joins_base_path_and_query() {
        let router = router();
        let matched = router.route(Some("api.example.com"), "/v1/users/42").unwrap();

        let target = matched.target(Some("expand=true"));
        assert_eq!(target.as_str(), "http://users.internal/base/42?expand=true");

        let matched = router.route(Some("api.example.com"), "/v1/x").unwrap();
        assert_eq!(matched.target(None).as_str(), "http://127.0.0.1:9000/x");
    }

    #[test]
    fn test_dest_names_upstream_and_prefix() {
        let router = router();
        let dest = |host, path| router.route(Some(host), path).unwrap().dest();

        assert_eq!(dest("api.example.com", "/v1/users/7"), "users/v1/users");
        assert_eq!(dest("api.example.com", "/v1/x"), "api/v1");
        assert_eq!(dest("api.example.com", "/other"), "web");
        assert_eq!(dest("static.example.com", "/a"), "web");
        assert_eq!(dest("nowhere.example.com", "/a"), "fallback");
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:80"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:8080"), "::1");
        assert_eq!(strip_port("::1"), "::1");
    }
}
