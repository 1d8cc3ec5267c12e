//! `devbridge check`: validate the config and show the resulting topics.

use std::fmt::Write as _;
use std::sync::Arc;

use serde::Serialize;

use devbridge_broker::MemoryBroker;
use devbridge_core::DiscoveryPublisher;

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output::{heading, label, print_output, render_json, should_color};

#[derive(Debug, Serialize)]
struct CheckReport {
    instance: String,
    root: String,
    availability_topic: String,
    command_filter: String,
    devices: Vec<DeviceTopics>,
    parasites: Vec<ParasiteTopics>,
}

#[derive(Debug, Serialize)]
struct DeviceTopics {
    id: String,
    name: String,
    enabled: bool,
    state: String,
    command: String,
    response: String,
    discovery: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ParasiteTopics {
    device: String,
    owner_state: String,
    extension: String,
}

pub fn handle(global: &GlobalOpts) -> Result<(), CliError> {
    let (config, path) = super::load(global)?;
    let config_err = |e| CliError::config(e, &path);
    let bridge = config.bridge_config().map_err(config_err)?;
    let scheme = config.scheme().map_err(config_err)?;
    let instance = &bridge.instance;

    // Discovery entries are pure; an offline loopback broker is enough.
    let discovery = DiscoveryPublisher::new(
        bridge.discovery.clone(),
        instance.clone(),
        bridge.connector_type.clone(),
        Arc::new(MemoryBroker::new(scheme.clone())),
    );

    let mut devices = Vec::with_capacity(bridge.devices.len());
    for device in &bridge.devices {
        let discovery_topics = if discovery.is_enabled() {
            discovery
                .generate(device)?
                .into_iter()
                .map(|entry| entry.topic)
                .collect()
        } else {
            Vec::new()
        };
        devices.push(DeviceTopics {
            id: device.id.to_string(),
            name: device.name.clone(),
            enabled: device.enabled,
            state: scheme.state_topic(instance, &device.id),
            command: scheme.command_topic(instance, &device.id),
            response: scheme.response_topic(instance, &device.id),
            discovery: discovery_topics,
        });
    }

    let parasites = bridge
        .parasites
        .iter()
        .map(|target| ParasiteTopics {
            device: target.device.to_string(),
            owner_state: scheme.state_topic(&target.owning_instance, &target.owning_device),
            extension: scheme.extension_topic(
                &target.owning_instance,
                &target.owning_device,
                &target.mqtt_path,
            ),
        })
        .collect();

    let report = CheckReport {
        instance: instance.to_string(),
        root: scheme.root().to_owned(),
        availability_topic: scheme.availability_topic(instance),
        command_filter: scheme.command_filter(instance),
        devices,
        parasites,
    };

    let rendered = match render_json(global.output, &report)? {
        Some(json) => json,
        None => render_text(&report, should_color(global.color)),
    };
    print_output(&rendered, global.quiet);
    Ok(())
}

fn render_text(report: &CheckReport, color: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} {}", heading("instance", color), report.instance);
    let _ = writeln!(out, "  {:<13} {}", label("availability", color), report.availability_topic);
    let _ = writeln!(out, "  {:<13} {}", label("commands", color), report.command_filter);

    for device in &report.devices {
        let status = if device.enabled { "" } else { " [disabled]" };
        let _ = writeln!(
            out,
            "\n{} ({}){status}",
            heading(&device.id, color),
            device.name
        );
        let _ = writeln!(out, "  {:<13} {}", label("state", color), device.state);
        let _ = writeln!(out, "  {:<13} {}", label("command", color), device.command);
        let _ = writeln!(out, "  {:<13} {}", label("response", color), device.response);
        for topic in &device.discovery {
            let _ = writeln!(out, "  {:<13} {topic}", label("discovery", color));
        }
    }

    for parasite in &report.parasites {
        let _ = writeln!(out, "\n{} {}", heading("parasite", color), parasite.device);
        let _ = writeln!(out, "  {:<13} {}", label("owner state", color), parasite.owner_state);
        let _ = writeln!(out, "  {:<13} {}", label("extension", color), parasite.extension);
    }

    let _ = write!(
        out,
        "\nconfiguration OK: {} device(s), {} parasite(s)",
        report.devices.len(),
        report.parasites.len()
    );
    out
}
