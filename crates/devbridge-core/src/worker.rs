// ── Command workers ──
//
// Fixed pool of workers, each draining its own bounded queue. Commands
// are sharded by device id, so one device's commands are applied
// strictly in arrival order while different devices proceed in
// parallel. A worker finishes a command (including the actor's merge
// and state publish) before it picks up the next one.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use devbridge_broker::{
    Broker, DeviceId, ErrorCode, ErrorObject, InstanceId, ResponsePayload, publish_json,
};

use crate::actor::{ActorHandle, DeviceEvent};
use crate::model::{Command, CommandOutcome, CommandPhase};
use crate::parasite::ParasiteExtension;
use crate::provider::CapabilityProvider;
use crate::store::DeviceStore;

/// Everything a worker needs to take a command from intake to response.
pub(crate) struct WorkerContext {
    pub instance: InstanceId,
    pub broker: Arc<dyn Broker>,
    pub provider: Arc<dyn CapabilityProvider>,
    pub store: Arc<DeviceStore>,
    pub parasites: Arc<ParasiteExtension>,
    pub actors: Arc<HashMap<DeviceId, ActorHandle>>,
}

pub(crate) struct CommandWorkers {
    shards: Vec<mpsc::Sender<Command>>,
}

impl CommandWorkers {
    pub fn spawn(
        count: usize,
        queue: usize,
        ctx: &Arc<WorkerContext>,
        cancel: &CancellationToken,
        handles: &mut Vec<JoinHandle<()>>,
    ) -> Self {
        let shards = (0..count.max(1))
            .map(|index| {
                let (tx, rx) = mpsc::channel(queue.max(1));
                handles.push(tokio::spawn(worker_task(
                    index,
                    Arc::clone(ctx),
                    rx,
                    cancel.clone(),
                )));
                tx
            })
            .collect();
        Self { shards }
    }

    fn shard_for(&self, device: &DeviceId) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        device.hash(&mut hasher);
        let len = u64::try_from(self.shards.len()).unwrap_or(1);
        usize::try_from(hasher.finish() % len).unwrap_or(0)
    }

    /// Queue a command without waiting. A full queue hands the command
    /// back so the caller can answer `overloaded`.
    pub fn dispatch(&self, command: Command) -> Result<(), Command> {
        let shard = self.shard_for(&command.device);
        match self.shards.get(shard) {
            Some(tx) => tx.try_send(command).map_err(|e| match e {
                mpsc::error::TrySendError::Full(c) | mpsc::error::TrySendError::Closed(c) => c,
            }),
            None => Err(command),
        }
    }
}

async fn worker_task(
    index: usize,
    ctx: Arc<WorkerContext>,
    mut rx: mpsc::Receiver<Command>,
    cancel: CancellationToken,
) {
    debug!(worker = index, "command worker started");
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            command = rx.recv() => {
                let Some(command) = command else { break };
                let id = command.id.clone();
                let device = command.device.clone();
                let outcome = process(&ctx, command).await;
                debug!(worker = index, %device, %id, phase = %outcome.phase(), "command finished");
                respond(&ctx.broker, &ctx.instance, &device, outcome.into_response(id)).await;
            }
        }
    }
}

/// Run one command through validation and application.
pub(crate) async fn process(ctx: &WorkerContext, command: Command) -> CommandOutcome {
    let device = &command.device;
    debug!(%device, id = %command.id, phase = %CommandPhase::Received, "command");

    let (Some(record), Some(actor)) = (ctx.store.get(device), ctx.actors.get(device)) else {
        return CommandOutcome::Rejected(unknown_device(device));
    };

    if !record.descriptor.enabled {
        return CommandOutcome::Rejected(ErrorObject::new(
            ErrorCode::DeviceDisabled,
            format!("device {device} is disabled"),
        ));
    }

    if let Some(last) = record.last_applied_at {
        if command.issued_at < last {
            return CommandOutcome::Rejected(ErrorObject::new(
                ErrorCode::StaleCommand,
                format!(
                    "command issued at {} predates last applied command at {}",
                    command.issued_at.to_rfc3339(),
                    last.to_rfc3339()
                ),
            ));
        }
    }

    if let Err(problems) = record.descriptor.capabilities.validate_command(&command.values) {
        let message = problems
            .iter()
            .map(|p| format!("{}: {}", p.field, p.reason))
            .collect::<Vec<_>>()
            .join("; ");
        return CommandOutcome::Rejected(
            ErrorObject::new(ErrorCode::InvalidField, message)
                .with_fields(problems.into_iter().map(|p| p.field).collect()),
        );
    }

    if ctx.parasites.is_blocked(device) {
        return CommandOutcome::Rejected(ErrorObject::new(
            ErrorCode::ProviderError,
            format!("parasite target for {device} is not active"),
        ));
    }
    debug!(%device, id = %command.id, phase = %CommandPhase::Validated, "command");

    let applied = match ctx
        .provider
        .apply_command(&record.descriptor, &command.values)
        .await
    {
        Ok(returned) if returned.is_empty() => command.values,
        Ok(returned) => returned,
        Err(e) => {
            warn!(%device, id = %command.id, error = %e, "provider rejected command");
            return CommandOutcome::Rejected(e.to_error_object());
        }
    };
    debug!(%device, id = %command.id, phase = %CommandPhase::Applied, "command");

    let issued_at = command.issued_at;
    match actor
        .request(|done| DeviceEvent::Applied {
            issued_at,
            values: applied,
            done,
        })
        .await
    {
        Ok(values) => CommandOutcome::Acknowledged { values },
        Err(e) => CommandOutcome::Rejected(
            ErrorObject::new(ErrorCode::ConnectionError, e.to_string()).retriable(true),
        ),
    }
}

pub(crate) fn unknown_device(device: &DeviceId) -> ErrorObject {
    ErrorObject::new(ErrorCode::UnknownDevice, format!("unknown device {device}"))
}

/// Publish a command response (QoS 1, not retained).
pub(crate) async fn respond(
    broker: &Arc<dyn Broker>,
    instance: &InstanceId,
    device: &DeviceId,
    response: ResponsePayload,
) {
    let topic = broker.scheme().response_topic(instance, device);
    if let Err(e) = publish_json(broker.as_ref(), &topic, &response, false).await {
        warn!(%device, id = %response.id, error = %e, "failed to publish command response");
    }
}
