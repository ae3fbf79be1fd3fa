//! Static resource labels (host, zone, service) attached to every export.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

/// Labels identifying the process that produced the telemetry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Resource {
    labels: BTreeMap<String, String>,
}

impl Resource {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Resource {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            labels: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Supplies the resource labels. Queried once, when the pipeline is built.
pub trait ResourceProvider: Send + Sync {
    fn detect(&self) -> Resource;
}

/// A fixed set of labels.
#[derive(Debug, Clone, Default)]
pub struct StaticResource(pub Resource);

impl ResourceProvider for StaticResource {
    fn detect(&self) -> Resource {
        self.0.clone()
    }
}

/// Reads `key=value,key=value` pairs from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvResource {
    var: String,
}

impl EnvResource {
    pub const DEFAULT_VAR: &'static str = "OTEL_RESOURCE_ATTRIBUTES";

    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    /// Parses the variable's format. Malformed pairs are skipped with a warning.
    pub fn parse(raw: &str) -> Resource {
        raw.split(',')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .filter_map(|pair| match pair.split_once('=') {
                Some((k, v)) if !k.trim().is_empty() => Some((k.trim().to_owned(), v.trim().to_owned())),
                _ => {
                    warn!(pair, "ignoring malformed resource attribute");
                    None
                }
            })
            .collect()
    }
}

impl Default for EnvResource {
    fn default() -> Self {
        Self::new(Self::DEFAULT_VAR)
    }
}

impl ResourceProvider for EnvResource {
    fn detect(&self) -> Resource {
        std::env::var(&self.var)
            .map(|raw| Self::parse(&raw))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pairs() {
        let res = EnvResource::parse("host.name=web-1, cloud.zone = us-east1-b ,,bogus,=x");
        assert_eq!(res.get("host.name"), Some("web-1"));
        assert_eq!(res.get("cloud.zone"), Some("us-east1-b"));
        assert_eq!(res.labels().len(), 2);
    }

    #[test]
    fn test_missing_variable_yields_empty_resource() {
        let provider = EnvResource::new("TELEMETRY_EXPORT_TEST_UNSET_VARIABLE");
        assert!(provider.detect().is_empty());
    }

    #[test]
    fn test_static_resource() {
        let provider = StaticResource(Resource::empty().with_label("service.name", "video"));
        assert_eq!(provider.detect().get("service.name"), Some("video"));
    }
}
