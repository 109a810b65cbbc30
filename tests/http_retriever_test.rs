use async_graphql::{EmptyMutation, EmptySubscription, Object, Schema};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use pretty_assertions::assert_eq;
use quilt::{
    FederationContext, FederationSettings, GraphQLRequest, HttpRetriever, LocalContext,
    SchemaSource,
};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

struct Inventory;

#[Object]
impl Inventory {
    async fn in_stock(&self, sku: String) -> bool {
        sku.starts_with("A")
    }
}

type InventorySchema = Schema<Inventory, EmptyMutation, EmptySubscription>;

/// Authorization headers seen by the backend, one entry per request.
type SeenHeaders = Arc<Mutex<Vec<Option<String>>>>;

async fn handle(
    req: Request<Incoming>,
    schema: InventorySchema,
    seen: SeenHeaders,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let authorization = req
        .headers()
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    seen.lock().unwrap().push(authorization);

    let body = req.collect().await.unwrap().to_bytes();
    let request: async_graphql::Request = serde_json::from_slice(&body).unwrap();
    let response = schema.execute(request).await;

    Ok(Response::builder()
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(serde_json::to_vec(&response).unwrap())))
        .unwrap())
}

async fn start_backend(seen: SeenHeaders) -> SocketAddr {
    let schema = Schema::new(Inventory, EmptyMutation, EmptySubscription);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let schema = schema.clone();
            let seen = seen.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| handle(req, schema.clone(), seen.clone()));
                let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

#[tokio::test]
async fn introspects_and_delegates_over_http() {
    let seen = SeenHeaders::default();
    let addr = start_backend(seen.clone()).await;

    let http = Arc::new(HttpRetriever::new(format!("http://{addr}/graphql")));
    let context = FederationContext::new(FederationSettings::default());
    context
        .add_source(SchemaSource::remote("inventory", http.clone(), http))
        .unwrap();

    let request = GraphQLRequest::new(r#"query Check($sku: String!) { ok: inStock(sku: $sku) }"#)
        .variables(json!({"sku": "A-100"}))
        .local_context(LocalContext::default().with_header("Authorization", "Bearer secret"));
    let response = context.stitch(request).await.unwrap();

    assert!(response.errors.is_empty(), "{:?}", response.errors);
    assert_eq!(response.data.into_json().unwrap(), json!({"ok": true}));

    // One introspection call and one delegated query, both authenticated.
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|header| header.as_deref() == Some("Bearer secret")));
}

#[tokio::test]
async fn unreachable_sources_leave_the_gateway_without_schema() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let http = Arc::new(HttpRetriever::new(format!("http://{addr}/graphql")));
    let context = FederationContext::new(FederationSettings::default());
    context
        .add_source(SchemaSource::remote("inventory", http.clone(), http))
        .unwrap();

    let error = context
        .stitch(GraphQLRequest::new("{ inStock(sku: \"A\") }"))
        .await
        .unwrap_err();
    assert!(matches!(error, quilt::GatewayError::NoSourcesLoaded));
}
