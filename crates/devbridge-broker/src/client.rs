//! MQTT implementation of [`Broker`] with auto-reconnect.
//!
//! [`BrokerClient::connect`] registers the last will (retained `offline`
//! on the instance availability topic), spawns the receive loop and the
//! pending-response sweeper, then waits for the first `Ready`.
//!
//! On every (re)connect the loop publishes the retained `online` marker,
//! re-subscribes every registered filter, and reports
//! [`LinkState::Ready`] once the broker acknowledges them. Failures back
//! off exponentially; attempts are unbounded unless a cap is configured,
//! and the cap only applies until the first successful connection.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS, SubscribeFilter,
};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, InboundMessage, LinkState, fan_out, route_response};
use crate::error::Error;
use crate::payload::Availability;
use crate::pending::PendingTable;
use crate::topic::{InstanceId, TopicScheme, validate_filter};

// ── Channel capacities ───────────────────────────────────────────────

const MESSAGE_CHANNEL_CAPACITY: usize = 1024;
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for broker (re)connection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry. Default: 500ms.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Attempts allowed before the first successful connection.
    /// `None` means retry forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

// ── BrokerConfig ─────────────────────────────────────────────────────

/// Everything needed to open a session for one bridge instance.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub keep_alive: Duration,
    pub scheme: TopicScheme,
    /// Instance whose availability topic carries the last will.
    pub instance: InstanceId,
    pub reconnect: ReconnectConfig,
    /// How often expired pending responses are purged.
    pub sweep_interval: Duration,
    /// Capacity of the request queue between the client and its loop.
    pub request_capacity: usize,
    /// Own the instance availability topic (last will plus `online` and
    /// `offline` markers). Off for short-lived command senders.
    pub announce_availability: bool,
}

impl BrokerConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        scheme: TopicScheme,
        instance: InstanceId,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: format!("devbridge-{instance}"),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            scheme,
            instance,
            reconnect: ReconnectConfig::default(),
            sweep_interval: Duration::from_secs(1),
            request_capacity: 256,
            announce_availability: true,
        }
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive.max(MIN_KEEP_ALIVE));
        options.set_clean_session(true);
        if let Some(username) = &self.username {
            let password = self
                .password
                .as_ref()
                .map(|p| p.expose_secret().to_owned())
                .unwrap_or_default();
            options.set_credentials(username, password);
        }
        if self.announce_availability {
            options.set_last_will(LastWill::new(
                self.scheme.availability_topic(&self.instance),
                Availability::Offline.payload(),
                QoS::AtLeastOnce,
                true,
            ));
        }
        options
    }
}

// ── BrokerClient ─────────────────────────────────────────────────────

/// Handle to a live broker session. Cheap to clone.
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: BrokerConfig,
    client: AsyncClient,
    availability_topic: String,
    pending: Arc<PendingTable>,
    patterns: Mutex<BTreeSet<String>>,
    link_tx: watch::Sender<LinkState>,
    message_tx: broadcast::Sender<Arc<InboundMessage>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BrokerClient {
    /// Spawn the session and wait until it is `Ready`.
    ///
    /// Only returns an error when `reconnect.max_attempts` is set and
    /// every attempt failed.
    pub async fn connect(config: BrokerConfig) -> Result<Self, Error> {
        let client = Self::spawn(config);
        client.wait_ready().await?;
        Ok(client)
    }

    /// Spawn the session without waiting for the first connection.
    pub fn spawn(config: BrokerConfig) -> Self {
        let (client, eventloop) = AsyncClient::new(config.mqtt_options(), config.request_capacity);
        let (link_tx, _) = watch::channel(LinkState::Connecting);
        let (message_tx, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);

        let inner = Arc::new(Inner {
            availability_topic: config.scheme.availability_topic(&config.instance),
            config,
            client,
            pending: Arc::new(PendingTable::new()),
            patterns: Mutex::new(BTreeSet::new()),
            link_tx,
            message_tx,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let sweeper = inner
            .pending
            .spawn_sweeper(inner.config.sweep_interval, inner.cancel.child_token());
        let receive = tokio::spawn(receive_loop(Arc::clone(&inner), eventloop));
        inner.tasks.lock().extend([sweeper, receive]);

        Self { inner }
    }

    /// Wait for the link to reach `Ready`.
    pub async fn wait_ready(&self) -> Result<(), Error> {
        let mut rx = self.inner.link_tx.subscribe();
        let state = rx
            .wait_for(|s| matches!(s, LinkState::Ready { .. } | LinkState::Failed | LinkState::Closed))
            .await
            .map_err(|_| Error::Closed)?;
        match *state {
            LinkState::Ready { .. } => Ok(()),
            LinkState::Failed => Err(Error::ConnectAttemptsExhausted {
                host: self.inner.config.host.clone(),
                port: self.inner.config.port,
                attempts: self.inner.config.reconnect.max_attempts.unwrap_or(0),
            }),
            _ => Err(Error::Closed),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> LinkState {
        *self.inner.link_tx.borrow()
    }

    /// Announce `offline`, close the session, and stop background tasks.
    pub async fn disconnect(&self) {
        if self.state().is_connected() {
            if self.inner.config.announce_availability {
                if let Err(e) = self
                    .inner
                    .client
                    .publish(
                        &self.inner.availability_topic,
                        QoS::AtLeastOnce,
                        true,
                        Availability::Offline.payload(),
                    )
                    .await
                {
                    warn!(error = %e, "failed to publish offline marker");
                }
            }
            if let Err(e) = self.inner.client.disconnect().await {
                debug!(error = %e, "disconnect request rejected");
            }
            let mut rx = self.inner.link_tx.subscribe();
            let closed = tokio::time::timeout(
                DISCONNECT_GRACE,
                rx.wait_for(|s| *s == LinkState::Closed),
            )
            .await;
            if closed.is_err() {
                debug!("broker did not confirm disconnect in time");
            }
        }

        self.inner.cancel.cancel();
        self.inner.link_tx.send_replace(LinkState::Closed);
        let handles: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("broker client shut down");
    }
}

#[async_trait]
impl Broker for BrokerClient {
    fn scheme(&self) -> &TopicScheme {
        &self.inner.config.scheme
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
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Closed);
        }
        if !self.state().is_connected() {
            return Err(Error::NotConnected);
        }
        self.inner.client.publish(topic, qos, retain, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), Error> {
        validate_filter(filter)?;
        let added = self.inner.patterns.lock().insert(filter.to_owned());
        // Filters recorded while down go out with the next resubscribe.
        if added && self.state().is_connected() {
            self.inner.client.subscribe(filter, QoS::AtLeastOnce).await?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), Error> {
        let removed = self.inner.patterns.lock().remove(filter);
        if removed && self.state().is_connected() {
            self.inner.client.unsubscribe(filter).await?;
        }
        Ok(())
    }

    fn messages(&self) -> broadcast::Receiver<Arc<InboundMessage>> {
        self.inner.message_tx.subscribe()
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.inner.link_tx.subscribe()
    }
}

// ── Background receive loop ──────────────────────────────────────────

/// Main loop: poll → dispatch → on error, backoff → poll (reconnects).
async fn receive_loop(inner: Arc<Inner>, mut eventloop: EventLoop) {
    let reconnect = inner.config.reconnect.clone();
    let mut attempt: u32 = 0;
    let mut session: u64 = 0;

    loop {
        let event = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                session += 1;
                attempt = 0;
                info!(
                    host = %inner.config.host,
                    port = inner.config.port,
                    session,
                    "connected to broker"
                );
                on_connected(&inner, session);
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                let promoted = inner.link_tx.send_if_modified(|state| {
                    if *state == LinkState::Resubscribing {
                        *state = LinkState::Ready { session };
                        true
                    } else {
                        false
                    }
                });
                if promoted {
                    info!(session, "subscriptions restored, link ready");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let msg = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                    retain: publish.retain,
                };
                route_response(&inner.pending, &inner.config.scheme, &msg);
                fan_out(&inner.message_tx, msg);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                attempt = attempt.saturating_add(1);
                warn!(error = %e, attempt, "broker connection error");
                inner
                    .link_tx
                    .send_replace(LinkState::Reconnecting { attempt });

                if session == 0 {
                    if let Some(max) = reconnect.max_attempts {
                        if attempt >= max {
                            error!(max_attempts = max, "broker connection limit reached, giving up");
                            inner.link_tx.send_replace(LinkState::Failed);
                            return;
                        }
                    }
                }

                let delay = calculate_backoff(attempt - 1, &reconnect);
                debug!(
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    attempt,
                    "waiting before reconnect"
                );
                tokio::select! {
                    biased;
                    () = inner.cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    inner.link_tx.send_replace(LinkState::Closed);
    debug!("broker receive loop exiting");
}

/// Queue the availability marker and resubscriptions. Runs on the loop
/// task, so requests must not await the (bounded) request channel.
fn on_connected(inner: &Inner, session: u64) {
    if inner.config.announce_availability {
        if let Err(e) = inner.client.try_publish(
            &inner.availability_topic,
            QoS::AtLeastOnce,
            true,
            Availability::Online.payload(),
        ) {
            warn!(error = %e, "failed to queue online marker");
        }
    }

    let filters: Vec<SubscribeFilter> = inner
        .patterns
        .lock()
        .iter()
        .map(|p| SubscribeFilter::new(p.clone(), QoS::AtLeastOnce))
        .collect();

    if filters.is_empty() {
        inner.link_tx.send_replace(LinkState::Ready { session });
        return;
    }

    let count = filters.len();
    inner.link_tx.send_replace(LinkState::Resubscribing);
    match inner.client.try_subscribe_many(filters) {
        Ok(()) => debug!(count, "resubscribing"),
        Err(e) => {
            // Nothing will be acknowledged; report ready rather than stall.
            warn!(error = %e, count, "failed to queue resubscriptions");
            inner.link_tx.send_replace(LinkState::Ready { session });
        }
    }
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) * jitter`, jitter in `[0.75, 1.0]`
/// so the configured maximum is never exceeded.
pub(crate) fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(config.max_delay.as_secs_f64());

    // Deterministic jitter seeded from the attempt number.
    let jitter_factor = 1.0 - 0.25 * (f64::from(attempt) * 7.3).sin().abs();
    Duration::from_secs_f64((capped * jitter_factor).max(0.0))
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config() -> BrokerConfig {
        BrokerConfig::new(
            "localhost",
            1883,
            TopicScheme::new("home").unwrap(),
            InstanceId::new("hue").unwrap(),
        )
    }

    #[test]
    fn default_reconnect_config() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!(config.max_attempts.is_none());
    }

    #[test]
    fn backoff_grows_then_caps() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            max_attempts: None,
        };

        let d0 = calculate_backoff(0, &config);
        let d3 = calculate_backoff(3, &config);
        assert!(d0 <= Duration::from_millis(100));
        assert!(d3 > d0, "d3 ({d3:?}) should exceed d0 ({d0:?})");

        for attempt in 0..64 {
            let d = calculate_backoff(attempt, &config);
            assert!(d <= config.max_delay, "attempt {attempt}: {d:?}");
            assert!(d >= Duration::from_millis(75), "attempt {attempt}: {d:?}");
        }
    }

    #[test]
    fn backoff_survives_huge_attempt_counts() {
        let d = calculate_backoff(u32::MAX, &ReconnectConfig::default());
        assert!(d <= Duration::from_secs(30));
    }

    #[test]
    fn default_client_id_names_instance() {
        assert_eq!(config().client_id, "devbridge-hue");
    }

    #[test]
    fn password_is_redacted_in_debug() {
        let mut config = config();
        config.username = Some("bridge".into());
        config.password = Some(SecretString::from("hunter2"));
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[tokio::test]
    async fn publish_before_connect_is_rejected() {
        let mut config = config();
        // Nothing listens here; the loop keeps retrying in the background.
        config.host = "127.0.0.1".into();
        config.port = 1;
        let client = BrokerClient::spawn(config);

        let err = client
            .publish("home/v1/x", b"{}".to_vec(), false, QoS::AtLeastOnce)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));

        // Filters are recorded even while down.
        client.subscribe("home/v1/instances/hue/devices/+/cmd").await.unwrap();
        assert!(client.subscribe("home/#/bad").await.is_err());

        client.disconnect().await;
        assert_eq!(client.state(), LinkState::Closed);
    }

    #[tokio::test]
    async fn bounded_attempts_fail_connect() {
        let mut config = config();
        config.host = "127.0.0.1".into();
        config.port = 1;
        config.reconnect = ReconnectConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_attempts: Some(2),
        };

        let err = BrokerClient::connect(config).await.err().unwrap();
        assert!(matches!(
            err,
            Error::ConnectAttemptsExhausted { attempts: 2, port: 1, .. }
        ));
    }
}
