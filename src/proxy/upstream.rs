use std::sync::Arc;

use serde::Serialize;

use crate::config::UpstreamConfig;

/// A backend HTTP service requests are forwarded to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpstreamTarget {
    pub name: String,
    /// Base URL exactly as configured.
    #[serde(rename = "url")]
    pub base_url: String,
    pub description: String,
}

impl UpstreamTarget {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            description: description.into(),
        }
    }

    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self::new(&config.name, &config.url, &config.description)
    }

    /// Build `{base_url}{path}{?query}`. The query is appended verbatim so
    /// already-encoded characters survive the hop untouched.
    pub fn url_for(&self, path: &str, query: Option<&str>) -> String {
        let path = if path.is_empty() { "/" } else { path };
        let mut url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}

/// Fixed, ordered set of upstream targets loaded at startup.
#[derive(Debug, Clone, Default)]
pub struct UpstreamRegistry {
    targets: Vec<Arc<UpstreamTarget>>,
}

impl UpstreamRegistry {
    pub fn from_config(upstreams: &[UpstreamConfig]) -> Self {
        Self {
            targets: upstreams
                .iter()
                .map(|u| Arc::new(UpstreamTarget::from_config(u)))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<UpstreamTarget>> {
        self.targets.iter().find(|t| t.name == name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<UpstreamTarget>> {
        self.targets.iter()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
