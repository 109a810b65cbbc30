use bytes::Bytes;
use http::HeaderMap;
use http::header::SEC_WEBSOCKET_PROTOCOL;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HandshakeRequest, Response as HandshakeResponse,
};
use tracing::{debug, info, warn};

use crate::subscription::{GRAPHQL_TRANSPORT_WS_PROTOCOL, serve_websocket};
use crate::{FederationContext, GatewayError, GraphQLRequest, LocalContext};

pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// Headers forwarded from the client to every source.
const FORWARDED_HEADERS: [&str; 3] = ["Authorization", "x-api-key", "x-token"];

// Create a response body from a string
fn full<T: Into<Bytes>>(value: T) -> ResponseBody {
    Full::new(value.into())
        .map_err(|never| match never {})
        .boxed()
}

const GRAPHIQL_HTML: &str = r#"
<!DOCTYPE html>
<html>
<head>
  <title>GraphiQL - Quilt Stitching Gateway</title>
  <link href="https://unpkg.com/graphiql@1.5.0/graphiql.min.css" rel="stylesheet" />
  <style>
    body { margin: 0; padding: 0; height: 100vh; }
    #graphiql { height: 100vh; }
  </style>
</head>
<body>
  <div id="graphiql"></div>

  <script src="https://unpkg.com/react@17.0.2/umd/react.production.min.js"></script>
  <script src="https://unpkg.com/react-dom@17.0.2/umd/react-dom.production.min.js"></script>
  <script src="https://unpkg.com/graphiql@1.5.0/graphiql.min.js"></script>
  <script>
    const token = localStorage.getItem('auth_token') || '';

    function graphQLFetcher(graphQLParams) {
      return fetch('/graphql', {
        method: 'post',
        headers: {
          'Content-Type': 'application/json',
          'Authorization': token ? `Bearer ${token}` : '',
        },
        body: JSON.stringify(graphQLParams),
      }).then(response => response.json());
    }

    ReactDOM.render(
      React.createElement(GraphiQL, { fetcher: graphQLFetcher }),
      document.getElementById('graphiql')
    );
  </script>
</body>
</html>
"#;

pub async fn handle_request(
    req: Request<Incoming>,
    context: Arc<FederationContext>,
) -> Result<Response<ResponseBody>, Infallible> {
    let local_context = extract_auth_headers(req.headers());

    let result = match (req.method(), req.uri().path()) {
        (&Method::POST, "/graphql") => {
            let body_bytes = match req.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => {
                    return Ok(plain(StatusCode::BAD_REQUEST, "Failed to read request body"));
                }
            };

            match serde_json::from_slice::<GraphQLRequest>(&body_bytes) {
                Ok(request) => {
                    let request = request.local_context(local_context);
                    let json = match context.stitch(request).await {
                        Ok(response) => serde_json::to_string(&response),
                        Err(e) => serde_json::to_string(&error_body(&e)),
                    };
                    json_response(json.unwrap_or_default())
                }
                Err(e) => plain(
                    StatusCode::BAD_REQUEST,
                    format!("Invalid JSON request: {}", e),
                ),
            }
        }

        (&Method::GET, "/schema") => match context.schema_sdl().await {
            Ok(sdl) => Response::builder()
                .header("Content-Type", "text/plain; charset=utf-8")
                .header("Access-Control-Allow-Origin", "*")
                .body(full(sdl))
                .unwrap_or_else(|_| internal_server_error()),
            Err(e) => plain(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        },

        (&Method::POST, "/invalidate") => {
            let source = req.uri().query().and_then(source_param);
            match source {
                Some(name) => match context.invalidate(&name) {
                    Ok(()) => plain(StatusCode::ACCEPTED, format!("Invalidated {}", name)),
                    Err(e) => plain(StatusCode::NOT_FOUND, e.to_string()),
                },
                None => {
                    context.invalidate_all();
                    plain(StatusCode::ACCEPTED, "Invalidated all sources")
                }
            }
        }

        (&Method::GET, "/graphiql") => Response::builder()
            .header("Content-Type", "text/html")
            .header("Access-Control-Allow-Origin", "*")
            .body(full(GRAPHIQL_HTML))
            .unwrap_or_else(|_| internal_server_error()),

        (&Method::GET, "/") => Response::builder()
            .status(StatusCode::FOUND)
            .header("Location", "/graphiql")
            .header("Access-Control-Allow-Origin", "*")
            .body(full(""))
            .unwrap_or_else(|_| internal_server_error()),

        (&Method::OPTIONS, _) => Response::builder()
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
            .header(
                "Access-Control-Allow-Headers",
                "Content-Type, Authorization, x-api-key, x-token",
            )
            .body(full(""))
            .unwrap_or_else(|_| internal_server_error()),

        _ => plain(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(result)
}

fn error_body(error: &GatewayError) -> serde_json::Value {
    json!({
        "errors": [{
            "message": error.to_string()
        }]
    })
}

fn json_response(json: String) -> Response<ResponseBody> {
    Response::builder()
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(full(json))
        .unwrap_or_else(|_| internal_server_error())
}

fn plain(status: StatusCode, message: impl Into<Bytes>) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header("Access-Control-Allow-Origin", "*")
        .body(full(message))
        .unwrap_or_else(|_| internal_server_error())
}

// Create a standard internal server error response
fn internal_server_error() -> Response<ResponseBody> {
    let mut response = Response::new(full("Internal Server Error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

#[derive(Deserialize, Default)]
struct InvalidateParams {
    source: Option<String>,
}

fn source_param(query: &str) -> Option<String> {
    serde_urlencoded::from_str::<InvalidateParams>(query)
        .unwrap_or_default()
        .source
        .filter(|value| !value.is_empty())
}

/// Collects the authentication headers forwarded to sources.
pub fn extract_auth_headers(headers: &HeaderMap) -> LocalContext {
    let mut local_context = LocalContext::default();

    for header_name in FORWARDED_HEADERS {
        if let Some(header_value) = headers.get(header_name) {
            if let Ok(value_str) = header_value.to_str() {
                local_context = local_context.with_header(header_name, value_str);
            }
        }
    }

    local_context
}

/// Accepts HTTP connections until the listener fails.
pub async fn serve_http(
    listener: TcpListener,
    context: Arc<FederationContext>,
) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let context = Arc::clone(&context);

        tokio::task::spawn(async move {
            let service = service_fn(move |req| handle_request(req, Arc::clone(&context)));

            match hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                Ok(_) => debug!(%peer, "connection closed"),
                Err(e) => warn!(%peer, error = %e, "error processing connection"),
            }
        });
    }
}

/// Accepts `graphql-transport-ws` connections until the listener fails.
pub async fn serve_subscriptions(
    listener: TcpListener,
    context: Arc<FederationContext>,
) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let context = Arc::clone(&context);

        tokio::task::spawn(async move {
            let mut local_context = LocalContext::default();
            let callback = |request: &HandshakeRequest, mut response: HandshakeResponse| {
                local_context = extract_auth_headers(request.headers());
                if let Ok(protocol) = GRAPHQL_TRANSPORT_WS_PROTOCOL.parse() {
                    response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);
                }
                Ok::<_, ErrorResponse>(response)
            };

            match accept_hdr_async(stream, callback).await {
                Ok(socket) => {
                    debug!(%peer, "subscription client connected");
                    serve_websocket(context, socket, local_context).await;
                    debug!(%peer, "subscription client disconnected");
                }
                Err(e) => warn!(%peer, error = %e, "websocket handshake failed"),
            }
        });
    }
}

/// Binds both listeners and serves until one of them fails.
pub async fn run(
    context: Arc<FederationContext>,
    listen: std::net::SocketAddr,
    subscriptions_listen: Option<std::net::SocketAddr>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!("GraphQL stitching gateway starting on http://{}", listen);
    info!("GraphiQL UI available at http://{}/graphiql", listen);

    let Some(subscriptions_listen) = subscriptions_listen else {
        return serve_http(listener, context).await;
    };

    let subscriptions = TcpListener::bind(subscriptions_listen).await?;
    info!("Subscriptions available at ws://{}", subscriptions_listen);

    tokio::select! {
        result = serve_http(listener, Arc::clone(&context)) => result,
        result = serve_subscriptions(subscriptions, context) => result,
    }
}
