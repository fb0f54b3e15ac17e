//! Path-prefix dispatch to upstream targets.
//!
//! Rules are evaluated in declaration order and the first match wins, so a
//! table must list specific prefixes before general ones. A validated table
//! ends with the `/` catch-all, which makes [`RouteTable::route`] total.

use std::sync::Arc;

use anyhow::Result;

use crate::config::{MatchPolicy, RoutingConfig};
use super::upstream::{UpstreamRegistry, UpstreamTarget};

/// A single prefix rule.
#[derive(Debug, Clone)]
pub struct RouteRule {
    pub path_prefix: String,
    pub target: Arc<UpstreamTarget>,
}

impl RouteRule {
    pub fn new(path_prefix: impl Into<String>, target: Arc<UpstreamTarget>) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            target,
        }
    }

    fn matches(&self, policy: MatchPolicy, path: &str) -> bool {
        match policy {
            MatchPolicy::Raw => path.starts_with(&self.path_prefix),
            MatchPolicy::Segment => segment_prefix_matches(&self.path_prefix, path),
        }
    }
}

/// Ordered rule list shared read-only by every request.
#[derive(Debug, Clone)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
    policy: MatchPolicy,
}

impl RouteTable {
    pub fn new(rules: Vec<RouteRule>, policy: MatchPolicy) -> Self {
        Self { rules, policy }
    }

    pub fn from_config(config: &RoutingConfig, upstreams: &UpstreamRegistry) -> Result<Self> {
        let rules = config
            .routes
            .iter()
            .map(|route| {
                let target = upstreams.get(&route.upstream).ok_or_else(|| {
                    anyhow::anyhow!("Route '{}' references unknown upstream: {}", route.path, route.upstream)
                })?;
                Ok(RouteRule::new(&route.path, target))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(rules, config.match_policy))
    }

    /// Resolve the rule for `path`. Only the path takes part; callers strip
    /// the query beforehand. `None` means the table has no catch-all.
    pub fn route(&self, path: &str) -> Option<&RouteRule> {
        let path = if path.is_empty() { "/" } else { path };
        self.rules.iter().find(|rule| rule.matches(self.policy, path))
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }
}

/// `/api` matches `/api`, `/api/` and `/api/x`, but not `/apikeys`.
/// A prefix that already ends in `/` (including the catch-all) matches by
/// plain prefix.
fn segment_prefix_matches(prefix: &str, path: &str) -> bool {
    if !path.starts_with(prefix) {
        return false;
    }
    if path.len() == prefix.len() || prefix.ends_with('/') {
        return true;
    }
    path.as_bytes()[prefix.len()] == b'/'
}
