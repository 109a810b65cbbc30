use async_graphql::{Response, Variables};
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock as AsyncRwLock};
use tracing::{debug, info, instrument, warn};

use crate::config::{GatewayConfig, IntrospectionFetchingMode};
use crate::error::{ExpandSourceErrors, FieldErrorHandler};
use crate::executable_schema::CombinedSchema;
use crate::introspection::INTROSPECTION_QUERY;
use crate::query_transformer::ClientOperation;
use crate::schema_merger::SchemaMerger;
use crate::schema_source::{SchemaSource, SourceSchema};
use crate::subscription::{SubscribePayload, UpstreamPublisher};
use crate::{GatewayError, GraphQLRequest, LocalContext, OperationKind};

/// Policies of one federation context.
#[derive(Clone)]
pub struct FederationSettings {
    pub introspection_fetching_mode: IntrospectionFetchingMode,
    /// Keep reloading while only some sources could be loaded.
    pub retry_schema_load: bool,
    /// Upper bound on each delegated call.
    pub delegation_timeout: Option<Duration>,
    pub introspection_query: Arc<str>,
    pub error_handler: Arc<dyn FieldErrorHandler>,
}

impl Default for FederationSettings {
    fn default() -> Self {
        FederationSettings {
            introspection_fetching_mode: IntrospectionFetchingMode::default(),
            retry_schema_load: true,
            delegation_timeout: None,
            introspection_query: Arc::from(INTROSPECTION_QUERY),
            error_handler: Arc::new(ExpandSourceErrors),
        }
    }
}

impl fmt::Debug for FederationSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FederationSettings")
            .field("introspection_fetching_mode", &self.introspection_fetching_mode)
            .field("retry_schema_load", &self.retry_schema_load)
            .field("delegation_timeout", &self.delegation_timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadStatus {
    AllLoaded,
    NoneLoaded,
    Partial,
}

impl LoadStatus {
    fn of(loaded: usize, total: usize) -> Self {
        if loaded == 0 {
            LoadStatus::NoneLoaded
        } else if loaded == total {
            LoadStatus::AllLoaded
        } else {
            LoadStatus::Partial
        }
    }
}

/// Owns the schema sources and the combined schema built out of them.
pub struct FederationContext {
    settings: FederationSettings,
    sources: RwLock<IndexMap<String, Arc<SchemaSource>>>,
    schema: AsyncRwLock<Option<Arc<CombinedSchema>>>,
    reload_lock: Mutex<()>,
    needs_reload: AtomicBool,
    /// Bumped whenever the set of sources or their schemas goes stale.
    generation: AtomicU64,
}

impl FederationContext {
    pub fn new(settings: FederationSettings) -> Self {
        FederationContext {
            settings,
            sources: RwLock::new(IndexMap::new()),
            schema: AsyncRwLock::new(None),
            reload_lock: Mutex::new(()),
            needs_reload: AtomicBool::new(true),
            generation: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let context = FederationContext::new(config.settings());
        for source in config.build_sources()? {
            context.add_source(source)?;
        }
        Ok(context)
    }

    pub fn settings(&self) -> &FederationSettings {
        &self.settings
    }

    pub fn add_source(&self, source: SchemaSource) -> Result<Arc<SchemaSource>, GatewayError> {
        let mut sources = self.sources.write();
        if sources.contains_key(source.name()) {
            return Err(GatewayError::DuplicateSource(source.name().to_string()));
        }

        let source = Arc::new(source);
        sources.insert(source.name().to_string(), Arc::clone(&source));
        self.mark_stale();
        info!(source = source.name(), "registered schema source");
        Ok(source)
    }

    pub fn remove_source(&self, name: &str) -> Result<Arc<SchemaSource>, GatewayError> {
        let removed = self
            .sources
            .write()
            .shift_remove(name)
            .ok_or_else(|| GatewayError::UnknownSource(name.to_string()))?;
        self.mark_stale();
        Ok(removed)
    }

    pub fn source(&self, name: &str) -> Option<Arc<SchemaSource>> {
        self.sources.read().get(name).cloned()
    }

    pub fn sources(&self) -> Vec<Arc<SchemaSource>> {
        self.sources.read().values().cloned().collect()
    }

    /// Drops the cached schema of one source; the next request reloads it.
    pub fn invalidate(&self, name: &str) -> Result<(), GatewayError> {
        let source = self
            .source(name)
            .ok_or_else(|| GatewayError::UnknownSource(name.to_string()))?;
        source.invalidate();
        self.mark_stale();
        debug!(source = name, "invalidated schema source");
        Ok(())
    }

    pub fn invalidate_all(&self) {
        for source in self.sources() {
            source.invalidate();
        }
        self.mark_stale();
    }

    fn mark_stale(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.needs_reload.store(true, Ordering::SeqCst);
    }

    pub fn load_status(&self) -> LoadStatus {
        let sources = self.sources.read();
        let loaded = sources.values().filter(|s| s.is_schema_loaded()).count();
        LoadStatus::of(loaded, sources.len())
    }

    pub fn needs_reload(&self) -> bool {
        self.needs_reload.load(Ordering::SeqCst)
    }

    /// The current combined schema, reloading sources first when required.
    pub async fn combined_schema(
        &self,
        local_context: &LocalContext,
    ) -> Result<Arc<CombinedSchema>, GatewayError> {
        let refetch =
            self.settings.introspection_fetching_mode == IntrospectionFetchingMode::FetchBeforeEveryRequest;

        if !refetch && !self.needs_reload() {
            if let Some(schema) = self.schema.read().await.clone() {
                return Ok(schema);
            }
        }

        let _reloading = self.reload_lock.lock().await;
        if !refetch && !self.needs_reload() {
            if let Some(schema) = self.schema.read().await.clone() {
                return Ok(schema);
            }
        }
        self.reload(local_context, refetch).await
    }

    /// Loads every source that needs it (all of them when `refetch` is set)
    /// and publishes a schema built from the registries seen by this reload.
    #[instrument(skip(self, local_context))]
    async fn reload(
        &self,
        local_context: &LocalContext,
        refetch: bool,
    ) -> Result<Arc<CombinedSchema>, GatewayError> {
        let generation = self.generation.load(Ordering::SeqCst);
        let sources = self.sources();

        let loads = sources.iter().map(|source| {
            let source = Arc::clone(source);
            let cached = if refetch { None } else { source.registry() };
            let introspection_query = Arc::clone(&self.settings.introspection_query);
            let local_context = local_context.clone();
            tokio::spawn(async move {
                let registry = match cached {
                    Some(registry) => Some(registry),
                    None => source.load_schema(&introspection_query, &local_context).await,
                };
                registry.map(|registry| source.schema_of(registry))
            })
        });

        let mut snapshot: Vec<SourceSchema> = Vec::with_capacity(sources.len());
        for result in join_all(loads).await {
            match result {
                Ok(Some(schema)) => snapshot.push(schema),
                Ok(None) => {}
                Err(error) => warn!(%error, "schema load task failed"),
            }
        }

        let status = LoadStatus::of(snapshot.len(), sources.len());
        if status == LoadStatus::NoneLoaded {
            self.needs_reload.store(true, Ordering::SeqCst);
            return Err(GatewayError::NoSourcesLoaded);
        }

        let merged = SchemaMerger::new().merge(&snapshot)?;
        let combined = Arc::new(CombinedSchema::build(merged, self.settings.delegation_timeout)?);
        *self.schema.write().await = Some(Arc::clone(&combined));

        let needs_reload = match status {
            LoadStatus::AllLoaded => false,
            LoadStatus::NoneLoaded => true,
            LoadStatus::Partial => self.settings.retry_schema_load,
        };
        self.needs_reload.store(needs_reload, Ordering::SeqCst);
        // Sources invalidated while this reload ran stay stale.
        if self.generation.load(Ordering::SeqCst) != generation {
            self.needs_reload.store(true, Ordering::SeqCst);
        }

        if status == LoadStatus::Partial {
            warn!(
                loaded = snapshot.len(),
                total = sources.len(),
                "combined schema built from a subset of the sources"
            );
        } else {
            info!(sources = snapshot.len(), "combined schema rebuilt");
        }
        Ok(combined)
    }

    /// Executes a client request against the combined schema.
    #[instrument(skip_all, fields(operation = request.operation_name.as_deref()))]
    pub async fn stitch(&self, request: GraphQLRequest) -> Result<Response, GatewayError> {
        let schema = self.combined_schema(&request.local_context).await?;

        let mut engine_request = async_graphql::Request::new(request.query.as_str());
        if let Some(variables) = &request.variables {
            engine_request = engine_request.variables(Variables::from_json(variables.clone()));
        }
        if let Some(name) = &request.operation_name {
            engine_request = engine_request.operation_name(name.as_str());
        }
        // Documents that fail to parse are reported by the engine itself.
        match ClientOperation::parse(&request) {
            Ok(operation) => engine_request = engine_request.data(Arc::new(operation)),
            Err(error) => debug!(%error, "client document does not parse"),
        }

        let mut response = schema.executable().execute(engine_request).await;
        let errors = std::mem::take(&mut response.errors);
        response.errors = self.settings.error_handler.handle(errors);
        Ok(response)
    }

    /// Starts a subscription on the single source owning every root field of
    /// the operation. Events are pushed into `publisher`.
    #[instrument(skip_all, fields(operation = request.operation_name.as_deref()))]
    pub async fn subscribe(
        &self,
        request: GraphQLRequest,
        publisher: Arc<UpstreamPublisher>,
    ) -> Result<(), GatewayError> {
        let schema = self.combined_schema(&request.local_context).await?;
        let source = owning_source(&schema, &ClientOperation::parse(&request)?)?;
        info!(source = source.name(), "delegating subscription");

        let GraphQLRequest {
            query,
            variables,
            operation_name,
            local_context,
        } = request;
        let payload = SubscribePayload {
            query,
            variables,
            operation_name,
        };
        source.subscribe(&payload, publisher, &local_context).await?;
        Ok(())
    }

    /// SDL of the combined schema.
    pub async fn schema_sdl(&self) -> Result<String, GatewayError> {
        Ok(self.combined_schema(&LocalContext::default()).await?.sdl())
    }
}

fn owning_source(
    schema: &CombinedSchema,
    operation: &ClientOperation,
) -> Result<Arc<SchemaSource>, GatewayError> {
    if operation.kind()? != OperationKind::Subscription {
        return Err(GatewayError::SubscriptionRouting(
            "the operation is not a subscription".to_string(),
        ));
    }

    let mut owner: Option<&Arc<SchemaSource>> = None;
    for field in operation.root_fields()? {
        if field.name.starts_with("__") {
            continue;
        }
        let source = schema
            .binding(OperationKind::Subscription, &field.name)
            .ok_or_else(|| {
                GatewayError::SubscriptionRouting(format!(
                    "no source provides subscription field {}",
                    field.name
                ))
            })?;
        match owner {
            None => owner = Some(source),
            Some(current) if Arc::ptr_eq(current, source) => {}
            Some(current) => {
                return Err(GatewayError::SubscriptionRouting(format!(
                    "subscription fields span sources {} and {}",
                    current.name(),
                    source.name()
                )));
            }
        }
    }

    owner
        .cloned()
        .ok_or_else(|| GatewayError::SubscriptionRouting("the subscription selects no fields".to_string()))
}

impl fmt::Debug for FederationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FederationContext")
            .field("settings", &self.settings)
            .field("sources", &self.sources.read().keys().collect::<Vec<_>>())
            .field("needs_reload", &self.needs_reload())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_transformer::GraphQLQuery;
    use crate::schema_source::QueryRetriever;
    use crate::SourceError;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl QueryRetriever for Echo {
        async fn fetch(&self, _: &str, query: &GraphQLQuery, _: &LocalContext) -> Result<String, SourceError> {
            let mut data = serde_json::Map::new();
            data.insert(query.field_name().to_string(), query.field_name().into());
            Ok(serde_json::json!({ "data": data }).to_string())
        }
    }

    fn defined(name: &str, sdl: &str) -> SchemaSource {
        SchemaSource::defined(name, sdl, Arc::new(Echo))
    }

    #[test]
    fn source_names_are_unique() {
        let context = FederationContext::new(FederationSettings::default());
        context.add_source(defined("a", "type Query { a: String }")).unwrap();

        let error = context.add_source(defined("a", "type Query { b: String }")).unwrap_err();
        assert!(matches!(error, GatewayError::DuplicateSource(name) if name == "a"));

        assert!(context.remove_source("a").is_ok());
        assert!(matches!(context.remove_source("a"), Err(GatewayError::UnknownSource(_))));
    }

    #[tokio::test]
    async fn subscriptions_route_to_the_single_owner() {
        let context = FederationContext::new(FederationSettings::default());
        context
            .add_source(defined("a", "type Query { a: String } type Subscription { ticks: Int }"))
            .unwrap();
        context
            .add_source(defined("b", "type Query { b: String } type Subscription { tocks: Int }"))
            .unwrap();
        let schema = context.combined_schema(&LocalContext::default()).await.unwrap();

        let parse = |query: &str| ClientOperation::parse(&GraphQLRequest::new(query)).unwrap();

        let owner = owning_source(&schema, &parse("subscription { tocks }")).unwrap();
        assert_eq!(owner.name(), "b");

        let spanning = owning_source(&schema, &parse("subscription { ticks tocks }"));
        assert!(matches!(spanning, Err(GatewayError::SubscriptionRouting(_))));

        let query = owning_source(&schema, &parse("{ a }"));
        assert!(matches!(query, Err(GatewayError::SubscriptionRouting(_))));
    }

    #[tokio::test]
    async fn stitches_defined_sources() {
        let context = FederationContext::new(FederationSettings::default());
        context.add_source(defined("a", "type Query { a: String }")).unwrap();
        context.add_source(defined("b", "type Query { b: String }")).unwrap();

        let response = context.stitch(GraphQLRequest::new("{ a b }")).await.unwrap();

        assert!(response.errors.is_empty());
        assert_eq!(
            response.data.into_json().unwrap(),
            serde_json::json!({"a": "a", "b": "b"})
        );
        assert_eq!(context.load_status(), LoadStatus::AllLoaded);
        assert!(!context.needs_reload());
    }
}
