use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::introspection::{registry_from_introspection, root_bindings};
use crate::query_transformer::GraphQLQuery;
use crate::subscription::{SubscribePayload, UpstreamPublisher};
use crate::type_registry::TypeRegistry;
use crate::{GatewayError, LocalContext, OperationKind, SourceError};

/// Fetches the raw introspection response of a source.
#[async_trait]
pub trait IntrospectionRetriever: Send + Sync {
    async fn fetch(
        &self,
        source: &str,
        introspection_query: &str,
        local_context: &LocalContext,
    ) -> Result<String, SourceError>;
}

/// Executes one delegated query against a source and returns the raw response body.
#[async_trait]
pub trait QueryRetriever: Send + Sync {
    async fn fetch(
        &self,
        source: &str,
        query: &GraphQLQuery,
        local_context: &LocalContext,
    ) -> Result<String, SourceError>;
}

/// Opens an upstream subscription whose events are pushed into `publisher`.
///
/// Implementations return once the subscription is established and keep
/// feeding the publisher from a background task. They must stop and release
/// the upstream connection when the publisher is closed.
#[async_trait]
pub trait SubscriptionRetriever: Send + Sync {
    async fn subscribe(
        &self,
        source: &str,
        request: &SubscribePayload,
        publisher: Arc<UpstreamPublisher>,
        local_context: &LocalContext,
    ) -> Result<(), SourceError>;
}

/// Where a source's type definitions come from.
#[derive(Clone)]
pub enum SourceDefinition {
    /// Introspected from the live backend.
    Remote(Arc<dyn IntrospectionRetriever>),
    /// Statically supplied SDL.
    Defined(String),
}

#[derive(Clone, Debug)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded(Arc<TypeRegistry>),
    FailedToLoad(String),
}

/// A root field of a source, executed by delegating to that source.
#[derive(Clone)]
pub struct RootBinding {
    pub kind: OperationKind,
    pub field: String,
    pub source: Arc<SchemaSource>,
}

impl fmt::Debug for RootBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootBinding")
            .field("kind", &self.kind)
            .field("field", &self.field)
            .field("source", &self.source.name())
            .finish()
    }
}

/// A loaded source at one point in time: its registry and root bindings.
#[derive(Clone, Debug)]
pub struct SourceSchema {
    pub name: String,
    pub registry: Arc<TypeRegistry>,
    pub bindings: Vec<RootBinding>,
}

/// One backend GraphQL service federated into the combined schema.
pub struct SchemaSource {
    name: String,
    definition: SourceDefinition,
    query_retriever: Arc<dyn QueryRetriever>,
    subscription_retriever: Option<Arc<dyn SubscriptionRetriever>>,
    state: RwLock<LoadState>,
}

impl SchemaSource {
    pub fn remote(
        name: impl Into<String>,
        introspection_retriever: Arc<dyn IntrospectionRetriever>,
        query_retriever: Arc<dyn QueryRetriever>,
    ) -> Self {
        Self::new(
            name.into(),
            SourceDefinition::Remote(introspection_retriever),
            query_retriever,
        )
    }

    pub fn defined(
        name: impl Into<String>,
        sdl: impl Into<String>,
        query_retriever: Arc<dyn QueryRetriever>,
    ) -> Self {
        Self::new(
            name.into(),
            SourceDefinition::Defined(sdl.into()),
            query_retriever,
        )
    }

    fn new(name: String, definition: SourceDefinition, query_retriever: Arc<dyn QueryRetriever>) -> Self {
        SchemaSource {
            name,
            definition,
            query_retriever,
            subscription_retriever: None,
            state: RwLock::new(LoadState::Unloaded),
        }
    }

    pub fn with_subscriptions(mut self, retriever: Arc<dyn SubscriptionRetriever>) -> Self {
        self.subscription_retriever = Some(retriever);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn definition(&self) -> &SourceDefinition {
        &self.definition
    }

    /// Fetches or parses the source's schema and returns the registry it
    /// loaded. Failures are logged and leave the source in
    /// [`LoadState::FailedToLoad`]; they never propagate.
    #[tracing::instrument(skip_all, fields(source = %self.name))]
    pub async fn load_schema(
        &self,
        introspection_query: &str,
        local_context: &LocalContext,
    ) -> Option<Arc<TypeRegistry>> {
        *self.state.write() = LoadState::Loading;

        let result = match &self.definition {
            SourceDefinition::Remote(retriever) => {
                match retriever
                    .fetch(&self.name, introspection_query, local_context)
                    .await
                {
                    Ok(raw) => registry_from_introspection(&raw),
                    Err(error) => Err(GatewayError::from(error)),
                }
            }
            SourceDefinition::Defined(sdl) => TypeRegistry::parse(sdl),
        };

        match result {
            Ok(registry) => {
                info!(types = registry.len(), "schema loaded");
                let registry = Arc::new(registry);
                *self.state.write() = LoadState::Loaded(Arc::clone(&registry));
                Some(registry)
            }
            Err(error) => {
                warn!(%error, "failed to load schema");
                *self.state.write() = LoadState::FailedToLoad(error.to_string());
                None
            }
        }
    }

    pub fn is_schema_loaded(&self) -> bool {
        matches!(*self.state.read(), LoadState::Loaded(_))
    }

    pub fn load_state(&self) -> LoadState {
        self.state.read().clone()
    }

    pub fn invalidate(&self) {
        *self.state.write() = LoadState::Unloaded;
    }

    pub fn registry(&self) -> Option<Arc<TypeRegistry>> {
        match &*self.state.read() {
            LoadState::Loaded(registry) => Some(Arc::clone(registry)),
            _ => None,
        }
    }

    /// The loaded registry together with this source's root bindings.
    pub fn snapshot(self: &Arc<Self>) -> Option<SourceSchema> {
        self.registry().map(|registry| self.schema_of(registry))
    }

    /// Binds `registry`, loaded from this source, to the source.
    pub fn schema_of(self: &Arc<Self>, registry: Arc<TypeRegistry>) -> SourceSchema {
        let bindings = root_bindings(self, &registry);
        SourceSchema {
            name: self.name.clone(),
            registry,
            bindings,
        }
    }

    pub fn root_field_names(&self, kind: OperationKind) -> BTreeSet<String> {
        self.registry()
            .map(|registry| registry.root_field_names(kind))
            .unwrap_or_default()
    }

    pub async fn execute(
        &self,
        query: &GraphQLQuery,
        local_context: &LocalContext,
    ) -> Result<String, SourceError> {
        self.query_retriever
            .fetch(&self.name, query, local_context)
            .await
    }

    pub fn supports_subscriptions(&self) -> bool {
        self.subscription_retriever.is_some()
    }

    pub async fn subscribe(
        &self,
        request: &SubscribePayload,
        publisher: Arc<UpstreamPublisher>,
        local_context: &LocalContext,
    ) -> Result<(), SourceError> {
        match &self.subscription_retriever {
            Some(retriever) => {
                retriever
                    .subscribe(&self.name, request, publisher, local_context)
                    .await
            }
            None => Err(SourceError::SubscriptionsUnsupported(self.name.clone())),
        }
    }
}

impl fmt::Debug for SchemaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaSource")
            .field("name", &self.name)
            .field("state", &*self.state.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingIntrospection {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl IntrospectionRetriever for FailingIntrospection {
        async fn fetch(&self, source: &str, _: &str, _: &LocalContext) -> Result<String, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(SourceError::Transport {
                source_name: source.to_string(),
                message: "connection refused".to_string(),
            })
        }
    }

    struct Unreachable;

    #[async_trait]
    impl QueryRetriever for Unreachable {
        async fn fetch(&self, source: &str, _: &GraphQLQuery, _: &LocalContext) -> Result<String, SourceError> {
            Err(SourceError::Transport {
                source_name: source.to_string(),
                message: "unreachable".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn defined_source_loads_and_invalidates() {
        let source = Arc::new(SchemaSource::defined(
            "greetings",
            "type Query { hello: String }",
            Arc::new(Unreachable),
        ));
        assert!(!source.is_schema_loaded());

        source.load_schema("", &LocalContext::default()).await;
        assert!(source.is_schema_loaded());
        assert_eq!(
            source.root_field_names(OperationKind::Query),
            BTreeSet::from(["hello".to_string()])
        );

        let snapshot = source.snapshot().unwrap();
        assert_eq!(snapshot.bindings.len(), 1);
        assert_eq!(snapshot.bindings[0].field, "hello");

        source.invalidate();
        assert!(!source.is_schema_loaded());
        assert!(source.snapshot().is_none());
    }

    #[tokio::test]
    async fn load_failure_is_recorded_not_raised() {
        let retriever = Arc::new(FailingIntrospection {
            calls: AtomicUsize::new(0),
        });
        let source = SchemaSource::remote("remote", retriever.clone(), Arc::new(Unreachable));

        source.load_schema("{ __schema { types { name } } }", &LocalContext::default()).await;

        assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(source.load_state(), LoadState::FailedToLoad(msg) if msg.contains("connection refused")));
    }

    #[tokio::test]
    async fn sources_without_subscription_retriever_reject_subscriptions() {
        let source = SchemaSource::defined("plain", "type Query { a: Int }", Arc::new(Unreachable));
        let payload = SubscribePayload {
            query: "subscription { a }".to_string(),
            variables: None,
            operation_name: None,
        };
        let error = source
            .subscribe(&payload, Arc::new(UpstreamPublisher::new()), &LocalContext::default())
            .await
            .unwrap_err();
        assert!(matches!(error, SourceError::SubscriptionsUnsupported(name) if name == "plain"));
    }
}
