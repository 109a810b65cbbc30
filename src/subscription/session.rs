use dashmap::DashMap;
use futures::{SinkExt, Stream, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use super::protocol::{Message, SubscribePayload};
use super::publisher::{UpstreamEvent, UpstreamPublisher};
use crate::{FederationContext, GraphQLRequest, LocalContext};

type Publishers = Arc<DashMap<String, Arc<UpstreamPublisher>>>;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Gateway side of one client connection: maps client subscription ids to
/// the upstream publishers feeding them.
pub struct SubscriptionSession {
    context: Arc<FederationContext>,
    local_context: LocalContext,
    outbound: mpsc::UnboundedSender<Message>,
    publishers: Publishers,
    acknowledged: bool,
}

impl SubscriptionSession {
    pub fn new(
        context: Arc<FederationContext>,
        local_context: LocalContext,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Self {
        SubscriptionSession {
            context,
            local_context,
            outbound,
            publishers: Arc::new(DashMap::new()),
            acknowledged: false,
        }
    }

    pub fn active_subscriptions(&self) -> usize {
        self.publishers.len()
    }

    pub fn publisher(&self, id: &str) -> Option<Arc<UpstreamPublisher>> {
        self.publishers.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Reads client frames until the connection ends, then tears everything down.
    pub async fn run<S>(mut self, mut inbound: S)
    where
        S: Stream<Item = String> + Unpin,
    {
        while let Some(text) = inbound.next().await {
            self.handle_text(&text);
        }
        self.close();
    }

    /// Malformed envelopes are ignored.
    pub fn handle_text(&mut self, text: &str) {
        match Message::parse(text) {
            Ok(message) => self.handle(message),
            Err(error) => debug!(%error, "ignoring malformed subscription message"),
        }
    }

    pub fn handle(&mut self, message: Message) {
        match message {
            Message::ConnectionInit { .. } => {
                self.acknowledged = true;
                self.send(Message::ConnectionAck { payload: None });
            }
            Message::Ping { payload } => self.send(Message::Pong { payload }),
            Message::Subscribe { id, payload } => {
                if !self.acknowledged {
                    debug!(%id, "ignoring subscribe before connection_init");
                    return;
                }
                self.subscribe(id, payload);
            }
            Message::Complete { id } => {
                if let Some((_, publisher)) = self.publishers.remove(&id) {
                    debug!(%id, "client completed subscription");
                    publisher.close();
                }
            }
            other => debug!(message = ?other, "ignoring unexpected client message"),
        }
    }

    fn subscribe(&mut self, id: String, payload: SubscribePayload) {
        if self.publishers.contains_key(&id) {
            warn!(%id, "subscription id already in use");
            return;
        }

        let publisher = Arc::new(UpstreamPublisher::new());
        let events = publisher.listen();
        self.publishers.insert(id.clone(), Arc::clone(&publisher));

        let request = GraphQLRequest {
            query: payload.query,
            variables: payload.variables,
            operation_name: payload.operation_name,
            local_context: self.local_context.clone(),
        };
        let context = Arc::clone(&self.context);
        let publishers = Arc::clone(&self.publishers);
        let outbound = self.outbound.clone();

        tokio::spawn(async move {
            if let Err(error) = context.subscribe(request, Arc::clone(&publisher)).await {
                warn!(%id, %error, "failed to start subscription");
                publisher.close();
                if remove_entry(&publishers, &id, &publisher) {
                    let _ = outbound.send(Message::Error {
                        id,
                        payload: json!([{ "message": error.to_string() }]),
                    });
                }
                return;
            }
            forward(id, publisher, events, publishers, outbound).await;
        });
    }

    fn send(&self, message: Message) {
        if self.outbound.send(message).is_err() {
            debug!("client connection already closed");
        }
    }

    /// Closes every upstream publisher of this connection.
    pub fn close(&self) {
        let ids: Vec<String> = self
            .publishers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            if let Some((_, publisher)) = self.publishers.remove(&id) {
                publisher.close();
            }
        }
    }
}

impl Drop for SubscriptionSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Removes `id` only while it still maps to `publisher`; ids may be reused
/// once their previous subscription is gone.
fn remove_entry(publishers: &Publishers, id: &str, publisher: &Arc<UpstreamPublisher>) -> bool {
    publishers
        .remove_if(id, |_, current| Arc::ptr_eq(current, publisher))
        .is_some()
}

async fn forward<S>(
    id: String,
    publisher: Arc<UpstreamPublisher>,
    mut events: S,
    publishers: Publishers,
    outbound: mpsc::UnboundedSender<Message>,
) where
    S: Stream<Item = UpstreamEvent> + Unpin,
{
    while let Some(event) = events.next().await {
        match event {
            UpstreamEvent::Next(payload) => {
                let next = Message::Next {
                    id: id.clone(),
                    payload,
                };
                if outbound.send(next).is_err() {
                    publisher.close();
                    remove_entry(&publishers, &id, &publisher);
                    return;
                }
            }
            UpstreamEvent::Error(payload) => {
                if remove_entry(&publishers, &id, &publisher) {
                    let _ = outbound.send(Message::Error { id, payload });
                }
                return;
            }
        }
    }

    // A client `complete` removes the entry first, so only upstream
    // completion is echoed back.
    if remove_entry(&publishers, &id, &publisher) {
        let _ = outbound.send(Message::Complete { id });
    }
}

/// Serves one client WebSocket connection until either side closes it.
pub async fn serve_websocket<T>(
    context: Arc<FederationContext>,
    socket: WebSocketStream<T>,
    local_context: LocalContext,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if let Err(error) = sink.send(WsMessage::Text(message.to_text())).await {
                debug!(%error, "failed to write to client socket");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let inbound = Box::pin(text_frames(&mut stream));
    SubscriptionSession::new(context, local_context, outbound)
        .run(inbound)
        .await;

    // Let queued frames and the close handshake go out. Subscribe tasks that
    // are still starting may hold senders, so the wait is bounded.
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        debug!("client socket writer did not finish, aborting it");
        writer.abort();
    }
}

fn text_frames<S>(stream: &mut S) -> impl Stream<Item = String> + '_
where
    S: Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    stream
        .take_while(|frame| {
            let open = matches!(frame, Ok(message) if !message.is_close());
            futures::future::ready(open)
        })
        .filter_map(|frame| {
            let text = match frame {
                Ok(WsMessage::Text(text)) => Some(text),
                _ => None,
            };
            futures::future::ready(text)
        })
}
