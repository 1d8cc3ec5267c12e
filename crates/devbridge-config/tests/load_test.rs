#![allow(clippy::unwrap_used)]

use std::path::Path;
use std::time::Duration;

use figment::Jail;
use pretty_assertions::assert_eq;
use secrecy::ExposeSecret;

use devbridge_config::{Config, ConfigError, load_config, save_config};

const SAMPLE: &str = r#"
instance_id = "hue"
connector_type = "hue"
base_topic = "home"
poll_interval_secs = 15

[broker]
host = "mqtt.local"
port = 1884
username = "bridge"
password = "plain"
max_connect_attempts = 3

[discovery]
prefix = "dash"

[[devices]]
id = "lamp"
name = "Living room lamp"

[devices.fields.power]
type = "bool"
writable = true

[devices.fields.mode]
type = "enum"
writable = true
options = ["eco", "boost"]

[devices.initial]
power = false
mode = "eco"

[[devices]]
id = "cam"
enabled = false

[[parasites]]
device = "lamp"
owning_instance = "zigbee"
owning_device = "door-1"
mqtt_path = "hue/lamp"
extracted_fields = ["ip", "zone"]

[parasites.static]
zone = "living"
"#;

fn jailed(test: impl FnOnce(&mut Jail) -> Result<(), ConfigError>) {
    // Every load reads the environment, so all of them run jailed.
    Jail::expect_with(|jail| test(jail).map_err(|e| e.to_string().into()));
}

#[test]
fn loads_file_into_runtime_configs() {
    jailed(|jail| {
        jail.create_file("devbridge.toml", SAMPLE)?;
        let cfg = load_config(Some(Path::new("devbridge.toml")))?;
        let runtime = cfg.to_runtime()?;

        let broker = &runtime.broker;
        assert_eq!(broker.host, "mqtt.local");
        assert_eq!(broker.port, 1884);
        assert_eq!(broker.username.as_deref(), Some("bridge"));
        assert_eq!(broker.password.as_ref().unwrap().expose_secret(), "plain");
        assert_eq!(broker.reconnect.max_attempts, Some(3));
        assert_eq!(broker.scheme.root(), "home/v1");

        let bridge = &runtime.bridge;
        assert_eq!(bridge.instance.as_str(), "hue");
        assert_eq!(bridge.poll_interval, Duration::from_secs(15));
        assert_eq!(bridge.discovery.prefix, "dash");
        assert_eq!(bridge.devices.len(), 2);
        assert_eq!(bridge.devices[0].name, "Living room lamp");
        assert!(!bridge.devices[1].enabled);
        assert_eq!(bridge.devices[1].name, "cam");

        let parasite = &bridge.parasites[0];
        assert_eq!(parasite.owning_device.as_str(), "door-1");
        assert_eq!(parasite.extracted_fields, ["ip", "zone"]);
        assert_eq!(parasite.static_values["zone"], "living");

        assert_eq!(cfg.devices[0].initial["mode"], "eco");
        Ok(())
    });
}

#[test]
fn explicit_missing_file_is_an_error() {
    jailed(|_| {
        let err = load_config(Some(Path::new("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }), "{err}");
        Ok(())
    });
}

#[test]
fn malformed_field_spec_is_rejected() {
    jailed(|jail| {
        jail.create_file(
            "devbridge.toml",
            r#"
            instance_id = "hue"
            [[devices]]
            id = "lamp"
            [devices.fields.level]
            type = "int"
            min = 10
            max = 1
            "#,
        )?;
        let err = load_config(Some(Path::new("devbridge.toml")))?
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("devices[0].fields.level"), "{err}");
        Ok(())
    });
}

#[test]
fn save_then_load_preserves_devices() {
    jailed(|jail| {
        jail.create_file("devbridge.toml", SAMPLE)?;
        let cfg = load_config(Some(Path::new("devbridge.toml")))?;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("config.toml");
        save_config(&cfg, &path)?;

        let reloaded: Config = load_config(Some(&path))?;
        assert_eq!(reloaded.devices.len(), 2);
        assert_eq!(
            reloaded.to_runtime()?.bridge.devices,
            cfg.to_runtime()?.bridge.devices
        );
        Ok(())
    });
}

#[test]
fn environment_overrides_file() {
    jailed(|jail| {
        jail.create_file("devbridge.toml", SAMPLE)?;
        jail.set_env("DEVBRIDGE_BROKER__HOST", "override.local");
        jail.set_env("DEVBRIDGE_POLL_INTERVAL_SECS", "5");
        jail.set_env("DEVBRIDGE_BROKER__PASSWORD_ENV", "HUE_BRIDGE_PASSWORD");
        jail.set_env("HUE_BRIDGE_PASSWORD", "from-env");

        let runtime = load_config(Some(Path::new("devbridge.toml")))?.to_runtime()?;

        assert_eq!(runtime.broker.host, "override.local");
        assert_eq!(runtime.bridge.poll_interval, Duration::from_secs(5));
        assert_eq!(
            runtime.broker.password.as_ref().unwrap().expose_secret(),
            "from-env"
        );
        Ok(())
    });
}
