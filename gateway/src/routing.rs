//! Backend registry and prefix-based route table.
//!
//! Both structures are built once at startup from configuration and remain
//! immutable while requests are being served. Resolution is pure: given a
//! path, the table returns the longest matching prefix rule or nothing.

use crate::config::{Config, RewriteConfig};
use std::collections::HashMap;
use url::Url;

/// Fixed mapping from logical service name to base URL
#[derive(Clone, Debug)]
pub struct BackendRegistry {
    backends: HashMap<String, Url>,
}

impl BackendRegistry {
    pub fn new(backends: HashMap<String, Url>) -> Self {
        Self { backends }
    }

    pub fn get(&self, name: &str) -> Option<&Url> {
        self.backends.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Url)> {
        self.backends.iter()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// Path rewrite applied after the prefix matched
#[derive(Clone, Debug, PartialEq)]
pub enum Rewrite {
    /// Drop the matched prefix, keeping only the suffix
    StripPrefix,
    /// Replace the matched prefix with a literal string
    ReplacePrefix(String),
}

#[derive(Clone, Debug)]
pub struct RouteRule {
    pub prefix: String,
    pub backend: String,
    pub rewrite: Rewrite,
}

/// Ordered route table; longest prefix wins
#[derive(Clone, Debug)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    pub fn new(mut rules: Vec<RouteRule>) -> Self {
        rules.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { rules }
    }

    /// Builds the table from config, falling back to the default surface
    /// when no routes are configured.
    pub fn from_config(config: &Config, registry: &BackendRegistry) -> Self {
        if config.routes.is_empty() {
            return Self::defaults(registry);
        }

        let rules = config
            .routes
            .iter()
            .map(|route| RouteRule {
                prefix: route.prefix.clone(),
                backend: route.backend.clone(),
                rewrite: match &route.rewrite {
                    Some(RewriteConfig::Strip) => Rewrite::StripPrefix,
                    Some(RewriteConfig::Replace(with)) => Rewrite::ReplacePrefix(with.clone()),
                    None => Rewrite::ReplacePrefix(route.prefix.clone()),
                },
            })
            .collect();
        Self::new(rules)
    }

    /// Default surface: `/api/<name>` per configured backend, plus the
    /// user-info routes served by the auth backend. The upstream function
    /// apps expose their handlers under the same `/api` prefix, so the
    /// default rewrite keeps the path unchanged.
    pub fn defaults(registry: &BackendRegistry) -> Self {
        let mut rules = Vec::new();
        for name in ["auth", "users", "notifications", "chat", "payments"] {
            if registry.get(name).is_some() {
                let prefix = format!("/api/{name}");
                rules.push(RouteRule {
                    prefix: prefix.clone(),
                    backend: name.to_string(),
                    rewrite: Rewrite::ReplacePrefix(prefix),
                });
            }
        }
        if registry.get("auth").is_some() {
            rules.push(RouteRule {
                prefix: "/api/user-info".to_string(),
                backend: "auth".to_string(),
                rewrite: Rewrite::ReplacePrefix("/api/user-info".to_string()),
            });
        }
        Self::new(rules)
    }

    /// Returns the most specific rule whose prefix matches `path` on a
    /// segment boundary.
    pub fn resolve(&self, path: &str) -> Option<&RouteRule> {
        self.rules
            .iter()
            .find(|rule| prefix_matches(&rule.prefix, path))
    }

    /// Configured prefixes, for the 404 body and the index page
    pub fn prefixes(&self) -> Vec<&str> {
        let mut prefixes: Vec<&str> = self.rules.iter().map(|r| r.prefix.as_str()).collect();
        prefixes.sort_unstable();
        prefixes
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}
