// ── Device bridge ──
//
// Lifecycle of one connector instance: device actors, the command worker
// pool, the inbound message loop, the parasite resolver, and the polling
// scheduler. `DeviceBridge::start` wires them together and hands back a
// `BridgeHandle` for runtime control.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use devbridge_broker::{
    Broker, CommandPayload, DeviceId, ErrorCode, ErrorObject, InboundMessage, InstanceId,
    LinkState, ResponsePayload, TopicMatch,
};

use crate::actor::{ActorContext, ActorHandle, DeviceEvent};
use crate::config::BridgeConfig;
use crate::discovery::DiscoveryPublisher;
use crate::error::CoreError;
use crate::model::{CapabilityModel, Command, DeviceDescriptor, DeviceState};
use crate::parasite::{ParasiteExtension, TargetStatus};
use crate::provider::CapabilityProvider;
use crate::store::DeviceStore;
use crate::worker::{CommandWorkers, WorkerContext, respond, unknown_device};

const OWNER_STATE_CHANNEL_SIZE: usize = 64;
const POLL_TRIGGER_CHANNEL_SIZE: usize = 8;

// ── DeviceBridge ─────────────────────────────────────────────────────

/// A validated, not yet running bridge.
pub struct DeviceBridge {
    config: BridgeConfig,
    broker: Arc<dyn Broker>,
    provider: Arc<dyn CapabilityProvider>,
}

impl DeviceBridge {
    /// Validate `config`. Nothing is spawned until [`start`](Self::start).
    pub fn new(
        config: BridgeConfig,
        broker: Arc<dyn Broker>,
        provider: Arc<dyn CapabilityProvider>,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        Ok(Self {
            config,
            broker,
            provider,
        })
    }

    /// Spawn every background task, announce discovery, run one poll
    /// cycle, and return the control handle.
    pub async fn start(self) -> Result<BridgeHandle, CoreError> {
        let Self {
            config,
            broker,
            provider,
        } = self;
        let instance = config.instance.clone();
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        let store = Arc::new(DeviceStore::new(config.devices.iter().cloned()));
        let discovery = Arc::new(DiscoveryPublisher::new(
            config.discovery.clone(),
            instance.clone(),
            config.connector_type.clone(),
            Arc::clone(&broker),
        ));
        let parasites = Arc::new(ParasiteExtension::new(
            instance.clone(),
            config.parasites.clone(),
            Arc::clone(&broker),
            Arc::clone(&provider),
        ));

        // ── Device actors ──
        let actor_ctx = Arc::new(ActorContext {
            instance: instance.clone(),
            broker: Arc::clone(&broker),
            store: Arc::clone(&store),
            discovery: Arc::clone(&discovery),
            parasites: Arc::clone(&parasites),
            failure_warn_threshold: config.failure_warn_threshold,
        });
        let actors: HashMap<DeviceId, ActorHandle> = store
            .ids()
            .iter()
            .map(|id| {
                let (actor, task) =
                    ActorHandle::spawn(id.clone(), Arc::clone(&actor_ctx), cancel.child_token());
                handles.push(task);
                (id.clone(), actor)
            })
            .collect();
        let actors = Arc::new(actors);

        // ── Command workers ──
        let worker_ctx = Arc::new(WorkerContext {
            instance: instance.clone(),
            broker: Arc::clone(&broker),
            provider: Arc::clone(&provider),
            store: Arc::clone(&store),
            parasites: Arc::clone(&parasites),
            actors: Arc::clone(&actors),
        });
        let workers = CommandWorkers::spawn(
            config.command_workers,
            config.command_queue,
            &worker_ctx,
            &cancel,
            &mut handles,
        );

        let inner = Arc::new(BridgeInner {
            instance,
            poll_interval: config.poll_interval,
            broker: Arc::clone(&broker),
            provider,
            store,
            parasites: Arc::clone(&parasites),
            actors,
            cancel: cancel.clone(),
            task_handles: Mutex::new(Vec::new()),
            poll_tx: Mutex::new(None),
        });

        // ── Inbound ──
        // Take the receiver before subscribing so retained replays are seen.
        let messages = broker.messages();
        let (owner_tx, owner_rx) = mpsc::channel(OWNER_STATE_CHANNEL_SIZE);
        handles.push(tokio::spawn(parasite_task(
            Arc::clone(&parasites),
            owner_rx,
            cancel.clone(),
        )));
        handles.push(tokio::spawn(intake_task(
            Arc::clone(&inner),
            workers,
            messages,
            owner_tx,
        )));

        broker
            .subscribe(&broker.scheme().command_filter(&inner.instance))
            .await?;
        for topic in parasites.owner_topics() {
            broker.subscribe(&topic).await?;
        }
        parasites.resolve_static().await;
        if !config.parasites.is_empty() {
            handles.push(tokio::spawn(expire_parasites_task(
                Arc::clone(&parasites),
                config.parasite_resolve_timeout,
                cancel.clone(),
            )));
        }

        // ── Startup publication ──
        for actor in inner.actors.values() {
            actor.request(|done| DeviceEvent::Announce { done }).await?;
        }
        poll_cycle(&inner).await;

        // ── Scheduler ──
        let (poll_tx, poll_rx) = mpsc::channel(POLL_TRIGGER_CHANNEL_SIZE);
        *inner.poll_tx.lock().await = Some(poll_tx);
        handles.push(tokio::spawn(poll_task(
            Arc::clone(&inner),
            broker.link_state(),
            poll_rx,
        )));

        *inner.task_handles.lock().await = handles;
        info!(
            instance = %inner.instance,
            devices = inner.store.len(),
            parasites = config.parasites.len(),
            "bridge started"
        );
        Ok(BridgeHandle { inner })
    }
}

// ── BridgeHandle ─────────────────────────────────────────────────────

/// Runtime control of a started bridge. Cheap to clone.
#[derive(Clone)]
pub struct BridgeHandle {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    instance: InstanceId,
    poll_interval: Duration,
    broker: Arc<dyn Broker>,
    provider: Arc<dyn CapabilityProvider>,
    store: Arc<DeviceStore>,
    parasites: Arc<ParasiteExtension>,
    actors: Arc<HashMap<DeviceId, ActorHandle>>,
    cancel: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
    poll_tx: Mutex<Option<mpsc::Sender<oneshot::Sender<()>>>>,
}

impl BridgeHandle {
    pub fn instance(&self) -> &InstanceId {
        &self.inner.instance
    }

    fn actor(&self, device: &DeviceId) -> Result<&ActorHandle, CoreError> {
        if self.inner.cancel.is_cancelled() {
            return Err(CoreError::ShutDown);
        }
        self.inner
            .actors
            .get(device)
            .ok_or_else(|| CoreError::DeviceNotFound {
                device: device.clone(),
            })
    }

    /// Enable or disable a device. Disabling retracts its discovery
    /// entries and stops polling; enabling republishes both.
    pub async fn set_enabled(&self, device: &DeviceId, enabled: bool) -> Result<(), CoreError> {
        self.actor(device)?
            .request(|done| DeviceEvent::SetEnabled { enabled, done })
            .await
    }

    /// Replace a device's capability model and refresh its discovery.
    pub async fn update_capabilities(
        &self,
        device: &DeviceId,
        model: CapabilityModel,
    ) -> Result<(), CoreError> {
        self.actor(device)?
            .request(|done| DeviceEvent::UpdateCapabilities { model, done })
            .await
    }

    pub fn device(&self, device: &DeviceId) -> Option<DeviceDescriptor> {
        self.inner.store.get(device).map(|r| r.descriptor.clone())
    }

    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.inner
            .store
            .snapshot()
            .into_iter()
            .map(|r| r.descriptor.clone())
            .collect()
    }

    pub fn device_state(&self, device: &DeviceId) -> Option<DeviceState> {
        self.inner.store.get(device).and_then(|r| r.state.clone())
    }

    /// Version counter bumped on every device store mutation.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.store.subscribe()
    }

    pub fn parasite_status(&self, device: &DeviceId) -> Option<TargetStatus> {
        self.inner.parasites.status(device)
    }

    /// Run a poll cycle now and wait for every device to publish.
    pub async fn poll_now(&self) -> Result<(), CoreError> {
        let tx = self
            .inner
            .poll_tx
            .lock()
            .await
            .clone()
            .ok_or(CoreError::ShutDown)?;
        let (done, rx) = oneshot::channel();
        tx.send(done).await.map_err(|_| CoreError::ShutDown)?;
        rx.await.map_err(|_| CoreError::ShutDown)
    }

    /// Stop every background task. The broker session is left to the
    /// caller.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.poll_tx.lock().await.take();
        let handles: Vec<JoinHandle<()>> = self.inner.task_handles.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!(instance = %self.inner.instance, "bridge stopped");
    }
}

// ── Background tasks ─────────────────────────────────────────────────

/// Route inbound messages: commands to the worker pool, owner state to
/// the parasite resolver.
async fn intake_task(
    inner: Arc<BridgeInner>,
    workers: CommandWorkers,
    mut messages: broadcast::Receiver<Arc<InboundMessage>>,
    owner_tx: mpsc::Sender<(String, Vec<u8>)>,
) {
    let link = inner.broker.link_state();
    loop {
        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            msg = messages.recv() => match msg {
                Ok(msg) => {
                    let connected = link.borrow().is_connected();
                    handle_inbound(&inner, &workers, &owner_tx, &msg, connected).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "inbound message backlog overflowed");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("intake loop exiting");
}

async fn handle_inbound(
    inner: &BridgeInner,
    workers: &CommandWorkers,
    owner_tx: &mpsc::Sender<(String, Vec<u8>)>,
    msg: &InboundMessage,
    connected: bool,
) {
    match inner.broker.scheme().parse(&msg.topic) {
        TopicMatch::Command { instance, device } if instance == inner.instance => {
            if msg.retain {
                debug!(%device, "ignoring retained command");
                return;
            }
            if !connected {
                debug!(%device, "command intake suspended while disconnected");
                return;
            }
            intake_command(inner, workers, device, &msg.payload).await;
        }
        TopicMatch::State { instance, .. } if instance != inner.instance => {
            if owner_tx
                .send((msg.topic.clone(), msg.payload.clone()))
                .await
                .is_err()
            {
                debug!("parasite resolver gone");
            }
        }
        _ => {}
    }
}

async fn intake_command(
    inner: &BridgeInner,
    workers: &CommandWorkers,
    device: DeviceId,
    payload: &[u8],
) {
    let reject = |id: String, error: ErrorObject| ResponsePayload::failure(id, error);

    let payload: CommandPayload = match serde_json::from_slice(payload) {
        Ok(p) => p,
        Err(e) => {
            match CommandPayload::salvage_id(payload) {
                Some(id) => {
                    let error = ErrorObject::new(ErrorCode::MalformedPayload, e.to_string());
                    respond(&inner.broker, &inner.instance, &device, reject(id, error)).await;
                }
                None => warn!(%device, error = %e, "dropping undecodable command without id"),
            }
            return;
        }
    };

    if !inner.store.contains(&device) {
        let response = reject(payload.id, unknown_device(&device));
        respond(&inner.broker, &inner.instance, &device, response).await;
        return;
    }

    let command = Command::from_payload(device.clone(), payload);
    if let Err(command) = workers.dispatch(command) {
        warn!(%device, id = %command.id, "command queue full");
        let error = ErrorObject::new(ErrorCode::Overloaded, "command queue full").retriable(true);
        respond(&inner.broker, &inner.instance, &device, reject(command.id, error)).await;
    }
}

/// Single consumer for owner state messages, so parasite resolution is
/// never concurrent with itself.
async fn parasite_task(
    parasites: Arc<ParasiteExtension>,
    mut rx: mpsc::Receiver<(String, Vec<u8>)>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            msg = rx.recv() => {
                let Some((topic, payload)) = msg else { break };
                parasites.on_owner_state(&topic, &payload).await;
            }
        }
    }
}

async fn expire_parasites_task(
    parasites: Arc<ParasiteExtension>,
    timeout: Duration,
    cancel: CancellationToken,
) {
    tokio::select! {
        biased;
        () = cancel.cancelled() => {}
        () = tokio::time::sleep(timeout) => parasites.expire_pending(),
    }
}

/// Polling scheduler. Also owns reconnect handling: a new session
/// republishes every enabled device once before ticks resume.
async fn poll_task(
    inner: Arc<BridgeInner>,
    mut link: watch::Receiver<LinkState>,
    mut trigger: mpsc::Receiver<oneshot::Sender<()>>,
) {
    let mut last_session = link.borrow_and_update().session();
    let mut interval = tokio::time::interval(inner.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            () = inner.cancel.cancelled() => break,
            changed = link.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *link.borrow_and_update();
                match state.session() {
                    Some(session) if Some(session) != last_session => {
                        last_session = Some(session);
                        info!(instance = %inner.instance, session, "link ready, republishing");
                        republish_all(&inner).await;
                        interval.reset();
                    }
                    Some(_) => {}
                    None => debug!(?state, "link not ready, polling suspended"),
                }
            }
            request = trigger.recv() => {
                let Some(done) = request else { break };
                poll_cycle(&inner).await;
                let _ = done.send(());
            }
            _ = interval.tick() => {
                if link.borrow().is_ready() {
                    poll_cycle(&inner).await;
                }
            }
        }
    }
    debug!("poll loop exiting");
}

/// Poll every enabled, unblocked device concurrently and wait until each
/// actor has merged and published.
async fn poll_cycle(inner: &BridgeInner) {
    let polls = inner.store.snapshot().into_iter().filter_map(|record| {
        let id = &record.descriptor.id;
        if !record.descriptor.enabled || inner.parasites.is_blocked(id) {
            return None;
        }
        let actor = inner.actors.get(id)?.clone();
        let provider = Arc::clone(&inner.provider);
        let seq = record.applied_seq;
        Some(async move {
            let result = provider.get_state(&record.descriptor).await;
            if let Err(e) = actor
                .request(|done| DeviceEvent::Polled { seq, result, done })
                .await
            {
                debug!(device = %record.descriptor.id, error = %e, "poll result dropped");
            }
        })
    });
    join_all(polls).await;
}

async fn republish_all(inner: &BridgeInner) {
    let requests = inner
        .actors
        .values()
        .map(|actor| actor.request(|done| DeviceEvent::Republish { done }));
    for result in join_all(requests).await {
        if let Err(e) = result {
            debug!(error = %e, "republish skipped");
        }
    }
}
