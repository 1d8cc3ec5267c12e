// ── Device actors ──
//
// One task per device. Poll results, applied commands, reconnect
// republication, enable/disable, and capability changes all arrive here
// as events and are merged and published strictly in arrival order, so
// a device's publications never interleave out of causal order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use devbridge_broker::payload::Values;
use devbridge_broker::{Broker, DeviceId, InstanceId, publish_json};

use crate::discovery::DiscoveryPublisher;
use crate::error::CoreError;
use crate::model::{CapabilityModel, DeviceState};
use crate::parasite::ParasiteExtension;
use crate::provider::ProviderError;
use crate::store::{DeviceRecord, DeviceStore};

const ACTOR_CHANNEL_SIZE: usize = 32;

pub(crate) enum DeviceEvent {
    Polled {
        /// `applied_seq` observed before the provider was read.
        seq: u64,
        result: Result<Values, ProviderError>,
        done: oneshot::Sender<()>,
    },
    Applied {
        issued_at: DateTime<Utc>,
        values: Values,
        /// Receives the device's values after the merge.
        done: oneshot::Sender<Values>,
    },
    /// Startup: publish discovery for enabled devices, retract it for
    /// disabled ones.
    Announce {
        done: oneshot::Sender<()>,
    },
    /// After a reconnect: discovery plus last known state, once.
    Republish {
        done: oneshot::Sender<()>,
    },
    SetEnabled {
        enabled: bool,
        done: oneshot::Sender<()>,
    },
    UpdateCapabilities {
        model: CapabilityModel,
        done: oneshot::Sender<()>,
    },
}

/// Shared by every actor.
pub(crate) struct ActorContext {
    pub instance: InstanceId,
    pub broker: Arc<dyn Broker>,
    pub store: Arc<DeviceStore>,
    pub discovery: Arc<DiscoveryPublisher>,
    pub parasites: Arc<ParasiteExtension>,
    pub failure_warn_threshold: u32,
}

/// Sending side of one device's actor.
#[derive(Clone)]
pub(crate) struct ActorHandle {
    tx: mpsc::Sender<DeviceEvent>,
}

impl ActorHandle {
    pub fn spawn(
        device: DeviceId,
        ctx: Arc<ActorContext>,
        cancel: CancellationToken,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(ACTOR_CHANNEL_SIZE);
        let task = tokio::spawn(device_actor(device, ctx, rx, cancel));
        (Self { tx }, task)
    }

    /// Send an event built around a reply channel and wait for the reply.
    pub async fn request<T>(
        &self,
        event: impl FnOnce(oneshot::Sender<T>) -> DeviceEvent,
    ) -> Result<T, CoreError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(event(done))
            .await
            .map_err(|_| CoreError::ShutDown)?;
        rx.await.map_err(|_| CoreError::ShutDown)
    }
}

async fn device_actor(
    device: DeviceId,
    ctx: Arc<ActorContext>,
    mut rx: mpsc::Receiver<DeviceEvent>,
    cancel: CancellationToken,
) {
    debug!(%device, "device actor started");
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                handle_event(&device, &ctx, event).await;
            }
        }
    }
    debug!(%device, "device actor stopped");
}

async fn handle_event(device: &DeviceId, ctx: &ActorContext, event: DeviceEvent) {
    match event {
        DeviceEvent::Polled { seq, result, done } => {
            on_polled(device, ctx, seq, result).await;
            let _ = done.send(());
        }
        DeviceEvent::Applied {
            issued_at,
            values,
            done,
        } => {
            let merged = on_applied(device, ctx, issued_at, &values).await;
            let _ = done.send(merged);
        }
        DeviceEvent::Announce { done } => {
            if let Some(record) = ctx.store.get(device) {
                if record.descriptor.enabled {
                    ctx.discovery.publish(&record.descriptor).await;
                } else {
                    ctx.discovery.retract(&record.descriptor).await;
                }
            }
            let _ = done.send(());
        }
        DeviceEvent::Republish { done } => {
            if let Some(record) = ctx.store.get(device) {
                if record.descriptor.enabled {
                    ctx.discovery.publish(&record.descriptor).await;
                    publish_state(ctx, &record).await;
                }
            }
            let _ = done.send(());
        }
        DeviceEvent::SetEnabled { enabled, done } => {
            on_set_enabled(device, ctx, enabled).await;
            let _ = done.send(());
        }
        DeviceEvent::UpdateCapabilities { model, done } => {
            on_update_capabilities(device, ctx, model).await;
            let _ = done.send(());
        }
    }
}

// ── Event handlers ───────────────────────────────────────────────────

async fn on_polled(
    device: &DeviceId,
    ctx: &ActorContext,
    seq: u64,
    result: Result<Values, ProviderError>,
) {
    // A command applied while the provider was being read makes the
    // snapshot older than the cache; merging it would roll the command back.
    if ctx.store.get(device).is_some_and(|r| r.applied_seq != seq) {
        debug!(%device, "dropping poll that raced an applied command");
        return;
    }

    let now = Utc::now();
    let updated = ctx.store.update(device, |record| {
        // A poll that raced a disable is dropped.
        if !record.descriptor.enabled {
            return;
        }
        match &result {
            Ok(values) => {
                let readable = record.descriptor.capabilities.retain_readable(values);
                let mut merged = record
                    .state
                    .as_ref()
                    .map(|s| s.values.clone())
                    .unwrap_or_default();
                merged.extend(readable);
                record.state = Some(DeviceState {
                    online: true,
                    values: merged,
                    error: None,
                    last_update: now,
                });
                record.consecutive_failures = 0;
            }
            Err(e) => {
                let values = record
                    .state
                    .as_ref()
                    .map(|s| s.values.clone())
                    .unwrap_or_default();
                record.state = Some(DeviceState {
                    online: false,
                    values,
                    error: Some(e.to_error_object()),
                    last_update: now,
                });
                record.consecutive_failures = record.consecutive_failures.saturating_add(1);
            }
        }
    });

    let Some(record) = updated else { return };
    if !record.descriptor.enabled {
        return;
    }

    if let Err(e) = &result {
        let failures = record.consecutive_failures;
        if failures == ctx.failure_warn_threshold {
            warn!(
                instance = %ctx.instance,
                %device,
                failures,
                error = %e,
                "device keeps failing to poll"
            );
        } else {
            debug!(%device, failures, error = %e, "poll failed");
        }
    }

    publish_state(ctx, &record).await;
}

async fn on_applied(
    device: &DeviceId,
    ctx: &ActorContext,
    issued_at: DateTime<Utc>,
    values: &Values,
) -> Values {
    let now = Utc::now();
    let Some(record) = ctx.store.update(device, |record| {
        record.last_applied_at = Some(record.last_applied_at.map_or(issued_at, |t| t.max(issued_at)));
        record.applied_seq = record.applied_seq.wrapping_add(1);
        let readable = record.descriptor.capabilities.retain_readable(values);
        let state = record.state.get_or_insert_with(|| DeviceState {
            online: true,
            values: Values::new(),
            error: None,
            last_update: now,
        });
        state.values.extend(readable);
        state.online = true;
        state.error = None;
        state.last_update = now;
    }) else {
        return Values::new();
    };

    if record.descriptor.enabled {
        publish_state(ctx, &record).await;
    }
    record
        .state
        .as_ref()
        .map(|s| s.values.clone())
        .unwrap_or_default()
}

async fn on_set_enabled(device: &DeviceId, ctx: &ActorContext, enabled: bool) {
    let Some(before) = ctx.store.get(device) else { return };
    if before.descriptor.enabled == enabled {
        return;
    }
    let Some(record) = ctx.store.update(device, |r| r.descriptor.enabled = enabled) else {
        return;
    };

    if enabled {
        info!(%device, "device enabled");
        ctx.discovery.publish(&record.descriptor).await;
        publish_state(ctx, &record).await;
    } else {
        info!(%device, "device disabled");
        ctx.discovery.retract(&record.descriptor).await;
    }
}

async fn on_update_capabilities(device: &DeviceId, ctx: &ActorContext, model: CapabilityModel) {
    let Some(record) = ctx.store.update(device, |record| {
        if let Some(state) = record.state.as_mut() {
            state.values = model.retain_readable(&state.values);
        }
        record.descriptor.capabilities = model;
    }) else {
        return;
    };

    info!(%device, fields = record.descriptor.capabilities.len(), "capabilities updated");
    if record.descriptor.enabled {
        ctx.discovery.publish(&record.descriptor).await;
        publish_state(ctx, &record).await;
    }
}

// ── Publication ──────────────────────────────────────────────────────

/// Publish the cached state (retained) and any parasitic supplement.
/// Failures leave the cache intact; reconnect republication covers them.
async fn publish_state(ctx: &ActorContext, record: &DeviceRecord) {
    let Some(state) = &record.state else { return };
    let device = &record.descriptor.id;
    let topic = ctx.broker.scheme().state_topic(&ctx.instance, device);

    if let Err(e) = publish_json(ctx.broker.as_ref(), &topic, &state.to_payload(), true).await {
        debug!(%device, topic, error = %e, "state publish failed");
        return;
    }
    ctx.parasites.publish_supplement(device, &state.values).await;
}
