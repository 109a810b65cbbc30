pub mod config;
pub mod error;
pub mod executable_schema;
pub mod federation_context;
pub mod introspection;
pub mod query_transformer;
pub mod retriever;
pub mod schema_merger;
pub mod schema_source;
pub mod server;
pub mod subscription;
pub mod type_registry;

pub use config::{GatewayConfig, IntrospectionFetchingMode};
pub use error::{GatewayError, SourceError, SourceFetchError, TransformError};
pub use federation_context::{FederationContext, FederationSettings, LoadStatus};
pub use query_transformer::{ClientOperation, GraphQLQuery, QueryTransformer};
pub use retriever::{HttpRetriever, InProcessRetriever};
pub use schema_source::{
    IntrospectionRetriever, QueryRetriever, SchemaSource, SubscriptionRetriever,
};
pub use subscription::{SubscriptionSession, UpstreamPublisher};
pub use type_registry::TypeRegistry;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// The three kinds of root operation a schema can expose.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub const ALL: [OperationKind; 3] = [
        OperationKind::Query,
        OperationKind::Mutation,
        OperationKind::Subscription,
    ];

    pub fn keyword(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Per-request data threaded through to the retrievers without interpretation,
/// typically the caller's auth headers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalContext {
    pub headers: HashMap<String, String>,
}

impl LocalContext {
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Option<Value>,
    #[serde(default, rename = "operationName")]
    pub operation_name: Option<String>,
    #[serde(skip)]
    pub local_context: LocalContext,
}

impl GraphQLRequest {
    pub fn new(query: impl Into<String>) -> Self {
        GraphQLRequest {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    pub fn local_context(mut self, local_context: LocalContext) -> Self {
        self.local_context = local_context;
        self
    }

    /// Variables as a JSON object, treating anything else as "no variables".
    pub fn variables_map(&self) -> serde_json::Map<String, Value> {
        match &self.variables {
            Some(Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        }
    }
}
