// ── Broker seam ──
//
// The device runtime only ever talks to `dyn Broker`. `BrokerClient`
// implements it over a live MQTT session, `MemoryBroker` in-process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rumqttc::QoS;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::payload::{CommandPayload, ResponsePayload, Values};
use crate::pending::PendingTable;
use crate::topic::{DeviceId, InstanceId, TopicMatch, TopicScheme};

/// One message delivered on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Connection state observed through [`Broker::link_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    /// Connected; waiting for the broker to acknowledge re-subscriptions.
    Resubscribing,
    /// Subscriptions acknowledged. `session` increments on every
    /// successful (re)connect.
    Ready { session: u64 },
    Reconnecting { attempt: u32 },
    /// Bounded initial connection attempts were exhausted.
    Failed,
    Closed,
}

impl LinkState {
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    /// Whether publishes are accepted right now.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Resubscribing | Self::Ready { .. })
    }

    pub fn session(self) -> Option<u64> {
        match self {
            Self::Ready { session } => Some(session),
            _ => None,
        }
    }
}

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    fn scheme(&self) -> &TopicScheme;

    fn pending(&self) -> &Arc<PendingTable>;

    /// Publish immediately. Fails with [`Error::NotConnected`] while the
    /// link is down; nothing is queued for later.
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
        qos: QoS,
    ) -> Result<(), Error>;

    /// Register a (possibly wildcard) filter. Idempotent; registered
    /// filters are restored after every reconnect.
    async fn subscribe(&self, filter: &str) -> Result<(), Error>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), Error>;

    /// Stream of every message received on a subscribed filter.
    fn messages(&self) -> broadcast::Receiver<Arc<InboundMessage>>;

    fn link_state(&self) -> watch::Receiver<LinkState>;

    /// Publish a command to `(instance, device)` and wait for the matching
    /// response or the deadline, whichever comes first.
    async fn send_command_and_await(
        &self,
        instance: &InstanceId,
        device: &DeviceId,
        values: Values,
        timeout: Duration,
    ) -> Result<ResponsePayload, Error> {
        let scheme = self.scheme();
        let response_topic = scheme.response_topic(instance, device);
        acquire_response_filter(self, &response_topic).await?;

        let result =
            publish_and_await(self, instance, device, &response_topic, values, timeout).await;
        release_response_filter(self, &response_topic).await;
        result
    }
}

async fn publish_and_await<B: Broker + ?Sized>(
    broker: &B,
    instance: &InstanceId,
    device: &DeviceId,
    response_topic: &str,
    values: Values,
    timeout: Duration,
) -> Result<ResponsePayload, Error> {
    let id = uuid::Uuid::new_v4().to_string();
    let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    let command = CommandPayload::new(&id, Utc::now(), values).with_timeout(timeout_ms);
    let body = serde_json::to_vec(&command)?;

    let rx = broker.pending().register(&id, response_topic, timeout)?;
    let command_topic = broker.scheme().command_topic(instance, device);
    if let Err(e) = broker
        .publish(&command_topic, body, false, QoS::AtLeastOnce)
        .await
    {
        broker.pending().cancel(&id);
        return Err(e);
    }
    debug!(%instance, %device, %id, "command sent, awaiting response");

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(Error::ResponseDropped(id)),
        Err(_) => {
            broker.pending().cancel(&id);
            Err(Error::Timeout { id, timeout_ms })
        }
    }
}

// ── Response topic subscriptions ──
//
// Concurrent senders to one device share its response topic. The first
// subscribes, the last unsubscribes, so a long-lived sender does not
// accumulate filters that every reconnect would restore.

async fn acquire_response_filter<B: Broker + ?Sized>(broker: &B, topic: &str) -> Result<(), Error> {
    let mut filters = broker.pending().response_filters().lock().await;
    if !filters.contains_key(topic) {
        broker.subscribe(topic).await?;
    }
    *filters.entry(topic.to_owned()).or_default() += 1;
    Ok(())
}

async fn release_response_filter<B: Broker + ?Sized>(broker: &B, topic: &str) {
    let mut filters = broker.pending().response_filters().lock().await;
    let Some(users) = filters.get_mut(topic) else {
        return;
    };
    *users = users.saturating_sub(1);
    if *users > 0 {
        return;
    }
    filters.remove(topic);
    if let Err(e) = broker.unsubscribe(topic).await {
        debug!(topic, error = %e, "response topic unsubscribe failed");
    }
}

/// Serialize `value` and publish it with QoS 1.
pub async fn publish_json<T: Serialize + ?Sized>(
    broker: &dyn Broker,
    topic: &str,
    value: &T,
    retain: bool,
) -> Result<(), Error> {
    let body = serde_json::to_vec(value)?;
    broker.publish(topic, body, retain, QoS::AtLeastOnce).await
}

/// Hand a message on a response topic to the pending table. Returns
/// `true` when it resolved an outstanding command.
pub(crate) fn route_response(
    pending: &PendingTable,
    scheme: &TopicScheme,
    msg: &InboundMessage,
) -> bool {
    if !matches!(scheme.parse(&msg.topic), TopicMatch::Response { .. }) {
        return false;
    }
    match serde_json::from_slice::<ResponsePayload>(&msg.payload) {
        Ok(response) => pending.resolve(&msg.topic, response),
        Err(e) => {
            warn!(topic = %msg.topic, error = %e, "undecodable command response");
            false
        }
    }
}

/// Forward a message to subscribers; having none is not an error.
pub(crate) fn fan_out(tx: &broadcast::Sender<Arc<InboundMessage>>, msg: InboundMessage) {
    if tx.send(Arc::new(msg)).is_err() {
        trace!("no message subscribers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_state_predicates() {
        assert!(LinkState::Ready { session: 1 }.is_ready());
        assert!(LinkState::Resubscribing.is_connected());
        assert!(!LinkState::Resubscribing.is_ready());
        assert!(!LinkState::Reconnecting { attempt: 2 }.is_connected());
        assert_eq!(LinkState::Ready { session: 4 }.session(), Some(4));
        assert_eq!(LinkState::Closed.session(), None);
    }
}
