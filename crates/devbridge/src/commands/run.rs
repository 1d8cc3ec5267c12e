//! `devbridge run`: serve the configured devices until interrupted.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use devbridge_broker::BrokerClient;
use devbridge_core::DeviceBridge;

use crate::cli::{GlobalOpts, RunArgs};
use crate::error::CliError;
use crate::output::print_output;
use crate::simulated::{SimulatedProvider, SimulationOptions};

pub async fn handle(args: RunArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let (config, path) = super::load(global)?;
    let runtime = config.to_runtime().map_err(|e| CliError::config(e, &path))?;

    if config.connector_type != "simulated" {
        warn!(
            connector_type = %config.connector_type,
            "connector is not built in, serving simulated devices"
        );
    }
    let provider = Arc::new(SimulatedProvider::new(SimulationOptions {
        fail_every: args.fail_every,
        latency: Duration::from_millis(args.latency_ms),
    }));
    for (entry, descriptor) in config.devices.iter().zip(&runtime.bridge.devices) {
        provider.add_device(descriptor, &entry.initial);
    }

    info!(
        host = %runtime.broker.host,
        port = runtime.broker.port,
        "connecting to broker"
    );
    let client = BrokerClient::connect(runtime.broker).await?;

    let instance = runtime.bridge.instance.clone();
    let devices = runtime.bridge.devices.len();
    let started = match DeviceBridge::new(runtime.bridge, Arc::new(client.clone()), provider) {
        Ok(bridge) => bridge.start().await,
        Err(e) => Err(e),
    };
    let handle = match started {
        Ok(handle) => handle,
        Err(e) => {
            client.disconnect().await;
            return Err(e.into());
        }
    };

    print_output(
        &format!("devbridge: instance {instance} serving {devices} device(s), Ctrl-C to stop"),
        global.quiet,
    );

    let interrupted = tokio::signal::ctrl_c().await;
    info!(%instance, "shutting down");
    handle.shutdown().await;
    client.disconnect().await;
    interrupted?;
    Ok(())
}
