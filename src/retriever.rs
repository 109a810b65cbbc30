use async_graphql::{ObjectType, Request, Schema, SubscriptionType, Variables};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::query_transformer::GraphQLQuery;
use crate::schema_source::{IntrospectionRetriever, QueryRetriever, SubscriptionRetriever};
use crate::subscription::{SubscribePayload, UpstreamPublisher};
use crate::{LocalContext, SourceError};

/// Talks to a source over HTTP POST with a JSON `{query, variables}` body.
#[derive(Clone, Debug)]
pub struct HttpRetriever {
    client: reqwest::Client,
    url: String,
}

impl HttpRetriever {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        HttpRetriever {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post(
        &self,
        source: &str,
        body: &Value,
        local_context: &LocalContext,
    ) -> Result<String, SourceError> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(body);
        for (name, value) in &local_context.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| SourceError::Transport {
            source_name: source.to_string(),
            message: format!("failed to send request to {}: {}", self.url, e),
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| SourceError::Transport {
            source_name: source.to_string(),
            message: format!("failed to read response from {}: {}", self.url, e),
        })?;
        if !status.is_success() {
            // GraphQL servers commonly answer errors with a 4xx and a normal body.
            debug!(%source, %status, "source answered with a non-success status");
        }
        Ok(text)
    }
}

#[async_trait]
impl IntrospectionRetriever for HttpRetriever {
    async fn fetch(
        &self,
        source: &str,
        introspection_query: &str,
        local_context: &LocalContext,
    ) -> Result<String, SourceError> {
        let body = json!({ "query": introspection_query });
        self.post(source, &body, local_context).await
    }
}

#[async_trait]
impl QueryRetriever for HttpRetriever {
    async fn fetch(
        &self,
        source: &str,
        query: &GraphQLQuery,
        local_context: &LocalContext,
    ) -> Result<String, SourceError> {
        debug!(%source, query = query.query(), "delegating query");
        self.post(source, &query.to_request_body(), local_context)
            .await
    }
}

/// Serves a source from an `async_graphql::Schema` living in the same process.
///
/// The local context is not forwarded; in-process schemas carry their own data.
pub struct InProcessRetriever<Q, M, S> {
    schema: Schema<Q, M, S>,
}

impl<Q, M, S> InProcessRetriever<Q, M, S>
where
    Q: ObjectType + 'static,
    M: ObjectType + 'static,
    S: SubscriptionType + 'static,
{
    pub fn new(schema: Schema<Q, M, S>) -> Self {
        InProcessRetriever { schema }
    }

    /// Shared handle usable as every retriever of a source.
    pub fn shared(schema: Schema<Q, M, S>) -> Arc<Self> {
        Arc::new(Self::new(schema))
    }

    fn request(query: &str, variables: Option<Value>, operation_name: Option<&str>) -> Request {
        let mut request = Request::new(query);
        if let Some(variables) = variables {
            request = request.variables(Variables::from_json(variables));
        }
        if let Some(name) = operation_name {
            request = request.operation_name(name);
        }
        request
    }

    async fn run(&self, source: &str, request: Request) -> Result<String, SourceError> {
        let response = self.schema.execute(request).await;
        serde_json::to_string(&response).map_err(|e| SourceError::MalformedResponse {
            source_name: source.to_string(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl<Q, M, S> IntrospectionRetriever for InProcessRetriever<Q, M, S>
where
    Q: ObjectType + 'static,
    M: ObjectType + 'static,
    S: SubscriptionType + 'static,
{
    async fn fetch(
        &self,
        source: &str,
        introspection_query: &str,
        _local_context: &LocalContext,
    ) -> Result<String, SourceError> {
        self.run(source, Self::request(introspection_query, None, None))
            .await
    }
}

#[async_trait]
impl<Q, M, S> QueryRetriever for InProcessRetriever<Q, M, S>
where
    Q: ObjectType + 'static,
    M: ObjectType + 'static,
    S: SubscriptionType + 'static,
{
    async fn fetch(
        &self,
        source: &str,
        query: &GraphQLQuery,
        _local_context: &LocalContext,
    ) -> Result<String, SourceError> {
        let variables = Value::Object(query.variables().clone());
        self.run(source, Self::request(query.query(), Some(variables), None))
            .await
    }
}

#[async_trait]
impl<Q, M, S> SubscriptionRetriever for InProcessRetriever<Q, M, S>
where
    Q: ObjectType + 'static,
    M: ObjectType + 'static,
    S: SubscriptionType + 'static,
{
    async fn subscribe(
        &self,
        source: &str,
        request: &SubscribePayload,
        publisher: Arc<UpstreamPublisher>,
        _local_context: &LocalContext,
    ) -> Result<(), SourceError> {
        let request = Self::request(
            &request.query,
            request.variables.clone(),
            request.operation_name.as_deref(),
        );
        let mut responses = Box::pin(self.schema.execute_stream(request));
        let source = source.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = publisher.closed() => break,
                    response = responses.next() => {
                        let Some(response) = response else { break };
                        if !response.errors.is_empty() {
                            let errors = serde_json::to_value(&response.errors)
                                .unwrap_or_else(|_| json!([]));
                            warn!(%source, "in-process subscription failed");
                            publisher.fail(errors);
                            break;
                        }
                        match serde_json::to_value(&response) {
                            Ok(payload) => {
                                publisher.publish(payload);
                            }
                            Err(error) => warn!(%source, %error, "dropping unserializable event"),
                        }
                    }
                }
            }
            publisher.close();
        });

        Ok(())
    }
}
