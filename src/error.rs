use async_graphql::{ErrorExtensionValues, ServerError};
use serde_json::Value;
use thiserror::Error;

use crate::OperationKind;

/// Errors that abort a gateway operation as a whole.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("a schema source named {0} is already registered")]
    DuplicateSource(String),

    #[error("no schema source named {0}")]
    UnknownSource(String),

    #[error(
        "source {source_name} declares {kind} root type {incoming}, but the combined schema already uses {existing}"
    )]
    MergeConflict {
        kind: OperationKind,
        existing: String,
        incoming: String,
        source_name: String,
    },

    #[error("no schema source could be loaded")]
    NoSourcesLoaded,

    #[error("failed to build the combined schema: {0}")]
    SchemaBuild(String),

    #[error("failed to parse document: {0}")]
    Parse(String),

    #[error("invalid introspection response: {0}")]
    Introspection(String),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("cannot route subscription: {0}")]
    SubscriptionRouting(String),
}

/// Transport-level failures talking to a single source.
#[derive(Debug, Error, Clone)]
pub enum SourceError {
    #[error("request to source {source_name} failed: {message}")]
    Transport {
        source_name: String,
        message: String,
    },

    #[error("source {source_name} returned a malformed response: {message}")]
    MalformedResponse {
        source_name: String,
        message: String,
    },

    #[error("source {0} timed out")]
    Timeout(String),

    #[error("source {0} does not support subscriptions")]
    SubscriptionsUnsupported(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransformError {
    #[error("the request contains no operation")]
    NoOperation,

    #[error("the request contains several operations but no operation name")]
    AmbiguousOperation,

    #[error("unknown operation named {0}")]
    OperationNotFound(String),

    #[error("{0} operations cannot be delegated field by field")]
    UnsupportedOperation(crate::OperationKind),

    #[error("field {0} is not selected by the operation")]
    FieldNotFound(String),

    #[error("unknown fragment {0}")]
    UnknownFragment(String),
}

/// A source answered a delegated query with GraphQL errors. The backend error
/// objects are kept verbatim so they can be re-attached at the field's path.
#[derive(Debug, Error, Clone)]
#[error("{}", summary(.errors))]
pub struct SourceFetchError {
    pub source_name: String,
    pub errors: Vec<Value>,
}

fn summary(errors: &[Value]) -> String {
    let messages: Vec<&str> = errors
        .iter()
        .filter_map(|error| error.get("message").and_then(Value::as_str))
        .collect();
    if messages.is_empty() {
        "source returned an error".to_string()
    } else {
        messages.join("; ")
    }
}

impl SourceFetchError {
    /// One path-scoped error per backend error, positioned where `at` was raised.
    pub fn to_server_errors(&self, at: &ServerError) -> Vec<ServerError> {
        if self.errors.is_empty() {
            return vec![at.clone()];
        }

        self.errors
            .iter()
            .map(|error| {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("source returned an error");

                let mut extensions = ErrorExtensionValues::default();
                if let Some(Value::Object(backend)) = error.get("extensions") {
                    for (key, value) in backend {
                        let value = async_graphql::Value::from_json(value.clone())
                            .unwrap_or(async_graphql::Value::Null);
                        extensions.set(key, value);
                    }
                }
                extensions.set("source", self.source_name.as_str());

                let mut server_error = ServerError::new(message, None);
                server_error.locations = at.locations.clone();
                server_error.path = at.path.clone();
                server_error.extensions = Some(extensions);
                server_error
            })
            .collect()
    }
}

/// Hook applied to the execution errors of every stitched response.
pub trait FieldErrorHandler: Send + Sync {
    fn handle(&self, errors: Vec<ServerError>) -> Vec<ServerError>;
}

/// Replaces each failed delegation with the backend's own errors at the field path.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExpandSourceErrors;

impl FieldErrorHandler for ExpandSourceErrors {
    fn handle(&self, errors: Vec<ServerError>) -> Vec<ServerError> {
        errors
            .into_iter()
            .flat_map(|error| {
                let expanded = error
                    .source::<SourceFetchError>()
                    .map(|fetch_error| fetch_error.to_server_errors(&error));
                expanded.unwrap_or_else(|| vec![error])
            })
            .collect()
    }
}

/// Leaves execution errors exactly as the engine produced them.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeepErrors;

impl FieldErrorHandler for KeepErrors {
    fn handle(&self, errors: Vec<ServerError>) -> Vec<ServerError> {
        errors
    }
}
