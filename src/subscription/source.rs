use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use http::{HeaderName, HeaderValue, header::SEC_WEBSOCKET_PROTOCOL};
use std::sync::Arc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{Instrument, debug, info_span, warn};

use super::protocol::{GRAPHQL_TRANSPORT_WS_PROTOCOL, Message, SubscribePayload};
use super::publisher::UpstreamPublisher;
use crate::schema_source::SubscriptionRetriever;
use crate::{LocalContext, SourceError};

/// Id used for the single subscription carried by each upstream socket.
const UPSTREAM_SUBSCRIPTION_ID: &str = "1";

/// Opens one `graphql-transport-ws` socket per delegated subscription.
pub struct WebSocketSubscriptionRetriever {
    url: String,
}

impl WebSocketSubscriptionRetriever {
    pub fn new(url: impl Into<String>) -> Self {
        WebSocketSubscriptionRetriever { url: url.into() }
    }
}

#[async_trait]
impl SubscriptionRetriever for WebSocketSubscriptionRetriever {
    async fn subscribe(
        &self,
        source: &str,
        request: &SubscribePayload,
        publisher: Arc<UpstreamPublisher>,
        local_context: &LocalContext,
    ) -> Result<(), SourceError> {
        let transport_error = |message: String| SourceError::Transport {
            source_name: source.to_string(),
            message,
        };

        let mut ws_request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| transport_error(e.to_string()))?;
        let headers = ws_request.headers_mut();
        headers.insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(GRAPHQL_TRANSPORT_WS_PROTOCOL),
        );
        for (name, value) in &local_context.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => debug!(header = %name, "skipping header that is not valid on a websocket request"),
            }
        }

        let (socket, _) = connect_async(ws_request)
            .await
            .map_err(|e| transport_error(e.to_string()))?;

        let request = request.clone();
        let span = info_span!("upstream_subscription", source = %source);
        tokio::spawn(
            async move {
                if let Err(error) = drive_upstream(socket, &request, &publisher).await {
                    warn!(%error, "upstream subscription failed");
                    publisher.fail(serde_json::json!([{ "message": error.to_string() }]));
                }
                publisher.close();
            }
            .instrument(span),
        );

        Ok(())
    }
}

/// Source side of the protocol: init, subscribe on ack, relay `next` frames
/// until either end completes.
pub async fn drive_upstream<S>(
    socket: S,
    request: &SubscribePayload,
    publisher: &UpstreamPublisher,
) -> Result<(), WsError>
where
    S: Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage, Error = WsError> + Unpin,
{
    let (mut sink, mut stream) = socket.split();
    send(&mut sink, &Message::ConnectionInit { payload: None }).await?;

    loop {
        tokio::select! {
            _ = publisher.closed() => {
                debug!("publisher closed, completing upstream subscription");
                let complete = Message::Complete { id: UPSTREAM_SUBSCRIPTION_ID.to_string() };
                let _ = send(&mut sink, &complete).await;
                let _ = sink.close().await;
                return Ok(());
            }
            frame = stream.next() => {
                let text = match frame {
                    None => return Ok(()),
                    Some(Err(error)) => return Err(error),
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) => return Ok(()),
                    Some(Ok(_)) => continue,
                };

                match Message::parse(&text) {
                    Ok(Message::ConnectionAck { .. }) => {
                        let subscribe = Message::Subscribe {
                            id: UPSTREAM_SUBSCRIPTION_ID.to_string(),
                            payload: request.clone(),
                        };
                        send(&mut sink, &subscribe).await?;
                    }
                    Ok(Message::Next { payload, .. }) => {
                        publisher.publish(payload);
                    }
                    Ok(Message::Error { payload, .. }) => {
                        publisher.fail(payload);
                        let _ = sink.close().await;
                        return Ok(());
                    }
                    Ok(Message::Complete { .. }) => {
                        let _ = sink.close().await;
                        return Ok(());
                    }
                    Ok(Message::Ping { payload }) => {
                        send(&mut sink, &Message::Pong { payload }).await?;
                    }
                    Ok(other) => debug!(message = ?other, "ignoring unexpected upstream message"),
                    Err(error) => debug!(%error, "ignoring malformed upstream message"),
                }
            }
        }
    }
}

async fn send<S>(sink: &mut S, message: &Message) -> Result<(), WsError>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    sink.send(WsMessage::Text(message.to_text())).await
}
