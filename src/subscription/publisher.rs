use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// A result payload, usually `{"data": ...}`.
    Next(Value),
    /// The upstream failed; the payload is a list of GraphQL errors.
    Error(Value),
}

/// Multicast stream of events for one upstream subscription.
///
/// Each listener gets every event published after it started listening, in
/// publication order. `close` ends every listener's stream and is idempotent.
#[derive(Debug, Default)]
pub struct UpstreamPublisher {
    listeners: Mutex<Vec<mpsc::UnboundedSender<UpstreamEvent>>>,
    closed: CancellationToken,
}

impl UpstreamPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&self) -> UnboundedReceiverStream<UpstreamEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut listeners = self.listeners.lock();
        if !self.closed.is_cancelled() {
            listeners.push(sender);
        }
        UnboundedReceiverStream::new(receiver)
    }

    /// Returns false once the publisher is closed.
    pub fn publish(&self, payload: Value) -> bool {
        self.send(UpstreamEvent::Next(payload))
    }

    /// Delivers an error to every listener, then closes.
    pub fn fail(&self, errors: Value) {
        self.send(UpstreamEvent::Error(errors));
        self.close();
    }

    fn send(&self, event: UpstreamEvent) -> bool {
        let mut listeners = self.listeners.lock();
        if self.closed.is_cancelled() {
            return false;
        }
        listeners.retain(|listener| listener.send(event.clone()).is_ok());
        true
    }

    pub fn close(&self) {
        let mut listeners = self.listeners.lock();
        self.closed.cancel();
        listeners.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the publisher has been closed from either end.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn every_listener_sees_events_in_order() {
        let publisher = UpstreamPublisher::new();
        let first = publisher.listen();
        let second = publisher.listen();

        for n in 0..3 {
            assert!(publisher.publish(json!(n)));
        }
        publisher.close();

        let expected: Vec<_> = (0..3).map(|n| UpstreamEvent::Next(json!(n))).collect();
        assert_eq!(first.collect::<Vec<_>>().await, expected);
        assert_eq!(second.collect::<Vec<_>>().await, expected);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_publishing() {
        let publisher = UpstreamPublisher::new();
        let events = publisher.listen();

        publisher.close();
        publisher.close();

        assert!(publisher.is_closed());
        assert!(!publisher.publish(json!(1)));
        assert_eq!(events.collect::<Vec<_>>().await, vec![]);
        publisher.closed().await;
    }

    #[tokio::test]
    async fn listening_after_close_yields_an_empty_stream() {
        let publisher = UpstreamPublisher::new();
        publisher.close();
        assert_eq!(publisher.listen().collect::<Vec<_>>().await, vec![]);
        assert_eq!(publisher.listener_count(), 0);
    }

    #[tokio::test]
    async fn fail_delivers_the_error_then_closes() {
        let publisher = UpstreamPublisher::new();
        let events = publisher.listen();

        publisher.fail(json!([{"message": "upstream went away"}]));

        assert_eq!(
            events.collect::<Vec<_>>().await,
            vec![UpstreamEvent::Error(json!([{"message": "upstream went away"}]))]
        );
        assert!(publisher.is_closed());
    }
}
