//! In-process [`Broker`] for tests and local runs.
//!
//! Messages published on a topic matching a registered filter are looped
//! back to [`Broker::messages`] synchronously; retained messages are kept
//! per topic and replayed on subscribe. Every publication is logged so
//! callers can assert on exactly what went out.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::QoS;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::broker::{Broker, InboundMessage, LinkState, fan_out, route_response};
use crate::error::Error;
use crate::pending::PendingTable;
use crate::topic::{TopicScheme, topic_matches, validate_filter};

const MESSAGE_CHANNEL_CAPACITY: usize = 4096;

/// One recorded publish.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
    pub qos: QoS,
}

impl Publication {
    /// Payload decoded as JSON, `Null` when it is not JSON.
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.payload).unwrap_or(Value::Null)
    }

    /// Empty payloads are discovery retractions / retained-clears.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[derive(Default)]
struct State {
    connected: bool,
    session: u64,
    patterns: BTreeSet<String>,
    retained: HashMap<String, Vec<u8>>,
    log: Vec<Publication>,
}

/// Loopback broker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    scheme: TopicScheme,
    pending: Arc<PendingTable>,
    state: Mutex<State>,
    link_tx: watch::Sender<LinkState>,
    message_tx: broadcast::Sender<Arc<InboundMessage>>,
}

impl MemoryBroker {
    /// A connected broker (`Ready { session: 1 }`).
    pub fn new(scheme: TopicScheme) -> Self {
        let (link_tx, _) = watch::channel(LinkState::Ready { session: 1 });
        let (message_tx, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                scheme,
                pending: Arc::new(PendingTable::new()),
                state: Mutex::new(State {
                    connected: true,
                    session: 1,
                    ..State::default()
                }),
                link_tx,
                message_tx,
            }),
        }
    }

    // ── Link control ────────────────────────────────────────────────

    /// Simulate an unexpected drop. Publishes fail until [`reconnect`].
    ///
    /// [`reconnect`]: Self::reconnect
    pub fn disconnect(&self) {
        self.inner.state.lock().connected = false;
        self.inner
            .link_tx
            .send_replace(LinkState::Reconnecting { attempt: 1 });
    }

    /// Simulate a successful reconnect; starts a new session.
    pub fn reconnect(&self) {
        let session = {
            let mut state = self.inner.state.lock();
            state.connected = true;
            state.session += 1;
            state.session
        };
        self.inner.link_tx.send_replace(LinkState::Ready { session });
    }

    /// Forget all retained messages, as a broker restart without
    /// persistence would.
    pub fn drop_retained(&self) {
        self.inner.state.lock().retained.clear();
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub fn publications(&self) -> Vec<Publication> {
        self.inner.state.lock().log.clone()
    }

    pub fn publications_to(&self, topic: &str) -> Vec<Publication> {
        self.inner
            .state
            .lock()
            .log
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    pub fn clear_publications(&self) {
        self.inner.state.lock().log.clear();
    }

    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.inner.state.lock().retained.get(topic).cloned()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.state.lock().patterns.iter().cloned().collect()
    }

    /// Deliver a message as if another client had published it. Works
    /// regardless of link state and is not recorded in the log.
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>, retain: bool) {
        let payload = payload.into();
        if retain {
            self.store_retained(topic, &payload);
        }
        self.deliver(topic, payload, false);
    }

    // ── Internals ───────────────────────────────────────────────────

    fn store_retained(&self, topic: &str, payload: &[u8]) {
        let mut state = self.inner.state.lock();
        if payload.is_empty() {
            state.retained.remove(topic);
        } else {
            state.retained.insert(topic.to_owned(), payload.to_vec());
        }
    }

    fn deliver(&self, topic: &str, payload: Vec<u8>, retain: bool) {
        let subscribed = self
            .inner
            .state
            .lock()
            .patterns
            .iter()
            .any(|p| topic_matches(p, topic));
        if !subscribed {
            return;
        }
        let msg = InboundMessage {
            topic: topic.to_owned(),
            payload,
            retain,
        };
        route_response(&self.inner.pending, &self.inner.scheme, &msg);
        fan_out(&self.inner.message_tx, msg);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn scheme(&self) -> &TopicScheme {
        &self.inner.scheme
    }

    fn pending(&self) -> &Arc<PendingTable> {
        &self.inner.pending
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
        qos: QoS,
    ) -> Result<(), Error> {
        {
            let mut state = self.inner.state.lock();
            if !state.connected {
                return Err(Error::NotConnected);
            }
            state.log.push(Publication {
                topic: topic.to_owned(),
                payload: payload.clone(),
                retain,
                qos,
            });
        }
        if retain {
            self.store_retained(topic, &payload);
        }
        // Live deliveries never carry the retain flag.
        self.deliver(topic, payload, false);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), Error> {
        validate_filter(filter)?;
        let replay: Vec<(String, Vec<u8>)> = {
            let mut state = self.inner.state.lock();
            if !state.patterns.insert(filter.to_owned()) {
                return Ok(());
            }
            state
                .retained
                .iter()
                .filter(|(topic, _)| topic_matches(filter, topic))
                .map(|(topic, payload)| (topic.clone(), payload.clone()))
                .collect()
        };
        for (topic, payload) in replay {
            fan_out(
                &self.inner.message_tx,
                InboundMessage {
                    topic,
                    payload,
                    retain: true,
                },
            );
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), Error> {
        self.inner.state.lock().patterns.remove(filter);
        Ok(())
    }

    fn messages(&self) -> broadcast::Receiver<Arc<InboundMessage>> {
        self.inner.message_tx.subscribe()
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.inner.link_tx.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn broker() -> MemoryBroker {
        MemoryBroker::new(TopicScheme::new("t").unwrap())
    }

    #[tokio::test]
    async fn loops_back_to_matching_subscribers() {
        let broker = broker();
        let mut rx = broker.messages();
        broker.subscribe("a/+").await.unwrap();

        broker
            .publish("a/b", b"1".to_vec(), false, QoS::AtLeastOnce)
            .await
            .unwrap();
        broker
            .publish("c/d", b"2".to_vec(), false, QoS::AtLeastOnce)
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "a/b");
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.publications().len(), 2);
    }

    #[tokio::test]
    async fn retained_messages_replay_on_subscribe() {
        let broker = broker();
        broker
            .publish("s/1", b"x".to_vec(), true, QoS::AtLeastOnce)
            .await
            .unwrap();
        broker
            .publish("s/2", b"y".to_vec(), true, QoS::AtLeastOnce)
            .await
            .unwrap();
        broker
            .publish("s/2", Vec::new(), true, QoS::AtLeastOnce)
            .await
            .unwrap();

        let mut rx = broker.messages();
        broker.subscribe("s/#").await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!((msg.topic.as_str(), msg.retain), ("s/1", true));
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.retained("s/2"), None);
    }

    #[tokio::test]
    async fn publish_fails_while_disconnected() {
        let broker = broker();
        let mut link = broker.link_state();
        broker.disconnect();
        assert!(!link.borrow_and_update().is_connected());

        let err = broker
            .publish("x", Vec::new(), false, QoS::AtLeastOnce)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));

        broker.reconnect();
        assert_eq!(*link.borrow_and_update(), LinkState::Ready { session: 2 });
        assert!(broker.publish("x", Vec::new(), false, QoS::AtLeastOnce).await.is_ok());
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let broker = broker();
        broker.subscribe("a/#").await.unwrap();
        broker.subscribe("a/#").await.unwrap();
        assert_eq!(broker.subscriptions(), vec!["a/#".to_owned()]);
        broker.unsubscribe("a/#").await.unwrap();
        assert!(broker.subscriptions().is_empty());
    }
}
