use indexmap::IndexMap;
use serde::Deserialize;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::federation_context::FederationSettings;
use crate::retriever::HttpRetriever;
use crate::schema_source::SchemaSource;
use crate::subscription::WebSocketSubscriptionRetriever;
use crate::GatewayError;

/// When source schemas are fetched again.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IntrospectionFetchingMode {
    /// Load once and keep the result until a source is invalidated.
    #[default]
    CacheUntilInvalidated,
    /// Reload every source before each request.
    FetchBeforeEveryRequest,
}

/// The gateway's YAML configuration file.
#[derive(Deserialize, Debug, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub subscriptions_listen: Option<SocketAddr>,
    #[serde(default)]
    pub introspection_fetching_mode: IntrospectionFetchingMode,
    #[serde(default = "default_retry_schema_load")]
    pub retry_schema_load: bool,
    #[serde(default)]
    pub delegation_timeout_ms: Option<u64>,
    pub sources: IndexMap<String, SourceConfig>,
    /// Directory schema files are resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SourceConfig {
    pub url: String,
    #[serde(default)]
    pub subscription_url: Option<String>,
    /// Static SDL used instead of introspecting `url`.
    #[serde(default)]
    pub schema: Option<SchemaFile>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SchemaFile {
    pub file: PathBuf,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 3000))
}

fn default_retry_schema_load() -> bool {
    true
}

impl GatewayConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;

        let mut config = Self::from_yaml(&contents)?;
        config.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        info!(path = %path.display(), sources = config.sources.len(), "loaded configuration");
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, GatewayError> {
        let config: GatewayConfig = serde_yaml::from_str(contents)
            .map_err(|e| GatewayError::Config(format!("failed to parse configuration: {}", e)))?;
        if config.sources.is_empty() {
            return Err(GatewayError::Config("no sources configured".to_string()));
        }
        Ok(config)
    }

    pub fn delegation_timeout(&self) -> Option<Duration> {
        self.delegation_timeout_ms.map(Duration::from_millis)
    }

    pub fn settings(&self) -> FederationSettings {
        FederationSettings {
            introspection_fetching_mode: self.introspection_fetching_mode,
            retry_schema_load: self.retry_schema_load,
            delegation_timeout: self.delegation_timeout(),
            ..FederationSettings::default()
        }
    }

    /// One schema source per configured entry, in file order.
    pub fn build_sources(&self) -> Result<Vec<SchemaSource>, GatewayError> {
        let client = reqwest::Client::new();

        self.sources
            .iter()
            .map(|(name, config)| -> Result<SchemaSource, GatewayError> {
                let http = Arc::new(HttpRetriever::with_client(client.clone(), &config.url));

                let source = match &config.schema {
                    Some(schema) => {
                        let path = self.base_dir.join(&schema.file);
                        let sdl = fs::read_to_string(&path).map_err(|e| {
                            GatewayError::Config(format!(
                                "failed to read schema of source {} from {}: {}",
                                name,
                                path.display(),
                                e
                            ))
                        })?;
                        SchemaSource::defined(name, sdl, http)
                    }
                    None => SchemaSource::remote(name, http.clone(), http),
                };

                Ok(match &config.subscription_url {
                    Some(url) => source.with_subscriptions(Arc::new(WebSocketSubscriptionRetriever::new(url))),
                    None => source,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema_source::SourceDefinition;
    use pretty_assertions::assert_eq;

    #[test]
    fn applies_defaults() {
        let config = GatewayConfig::from_yaml(
            r#"
            sources:
              accounts:
                url: http://localhost:4001/graphql
            "#,
        )
        .unwrap();

        assert_eq!(config.listen, default_listen());
        assert_eq!(config.subscriptions_listen, None);
        assert_eq!(
            config.introspection_fetching_mode,
            IntrospectionFetchingMode::CacheUntilInvalidated
        );
        assert!(config.retry_schema_load);
        assert_eq!(config.delegation_timeout(), None);
    }

    #[test]
    fn reads_every_option() {
        let config = GatewayConfig::from_yaml(
            r#"
            listen: 127.0.0.1:8080
            subscriptions_listen: 127.0.0.1:8081
            introspection_fetching_mode: fetch_before_every_request
            retry_schema_load: false
            delegation_timeout_ms: 2500
            sources:
              accounts:
                url: http://localhost:4001/graphql
                subscription_url: ws://localhost:4001/graphql
              reviews:
                url: http://localhost:4002/graphql
            "#,
        )
        .unwrap();

        assert_eq!(config.listen.port(), 8080);
        assert_eq!(config.subscriptions_listen.map(|addr| addr.port()), Some(8081));
        assert_eq!(config.delegation_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(config.sources.keys().collect::<Vec<_>>(), vec!["accounts", "reviews"]);

        let settings = config.settings();
        assert_eq!(
            settings.introspection_fetching_mode,
            IntrospectionFetchingMode::FetchBeforeEveryRequest
        );
        assert!(!settings.retry_schema_load);

        let sources = config.build_sources().unwrap();
        assert!(sources[0].supports_subscriptions());
        assert!(!sources[1].supports_subscriptions());
    }

    #[test]
    fn rejects_unknown_modes_and_empty_source_lists() {
        let unknown = GatewayConfig::from_yaml(
            "introspection_fetching_mode: sometimes\nsources:\n  a:\n    url: http://a\n",
        );
        assert!(matches!(unknown, Err(GatewayError::Config(_))));

        let empty = GatewayConfig::from_yaml("sources: {}\n");
        assert!(matches!(empty, Err(GatewayError::Config(_))));
    }

    #[test]
    fn schema_files_resolve_relative_to_the_config() {
        let dir = std::env::temp_dir().join(format!("quilt-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("products.graphql"), "type Query { products: [String] }").unwrap();
        fs::write(
            dir.join("gateway.yaml"),
            "sources:\n  products:\n    url: http://localhost:4003/graphql\n    schema:\n      file: products.graphql\n",
        )
        .unwrap();

        let config = GatewayConfig::from_path(dir.join("gateway.yaml")).unwrap();
        let sources = config.build_sources().unwrap();

        match sources[0].definition() {
            SourceDefinition::Defined(sdl) => assert!(sdl.contains("products")),
            SourceDefinition::Remote(_) => panic!("expected a defined source"),
        }

        fs::remove_dir_all(&dir).unwrap();
    }
}
