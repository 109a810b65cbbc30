//! Subscription delivery: the client-facing session and the upstream sockets
//! that feed it.

pub mod protocol;
pub mod publisher;
pub mod session;
pub mod source;

pub use protocol::{GRAPHQL_TRANSPORT_WS_PROTOCOL, Message, SubscribePayload};
pub use publisher::{UpstreamEvent, UpstreamPublisher};
pub use session::{SubscriptionSession, serve_websocket};
pub use source::WebSocketSubscriptionRetriever;
