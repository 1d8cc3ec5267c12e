//! `devbridge send`: publish one command and wait for its response.

use std::fmt::Write as _;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use devbridge_broker::payload::Values;
use devbridge_broker::{Broker, BrokerClient, DeviceId, InstanceId, ResponsePayload};

use crate::cli::{GlobalOpts, SendArgs};
use crate::error::CliError;
use crate::output::{print_output, render_json};

/// Connect attempts for a one-shot sender when the config sets no cap.
const SEND_CONNECT_ATTEMPTS: u32 = 3;

pub async fn handle(args: SendArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let values = parse_values(&args.values)?;
    let device = DeviceId::new(&args.device).map_err(|e| CliError::Validation {
        field: "device".into(),
        reason: e.to_string(),
    })?;

    let (config, path) = super::load(global)?;
    let runtime = config.to_runtime().map_err(|e| CliError::config(e, &path))?;
    let instance = match &args.instance {
        Some(raw) => InstanceId::new(raw).map_err(|e| CliError::Validation {
            field: "instance".into(),
            reason: e.to_string(),
        })?,
        None => runtime.bridge.instance.clone(),
    };

    // A separate session that never touches the instance availability.
    let mut broker = runtime.broker;
    broker.client_id = format!("devbridge-send-{}", Uuid::new_v4().simple());
    broker.announce_availability = false;
    broker
        .reconnect
        .max_attempts
        .get_or_insert(SEND_CONNECT_ATTEMPTS);

    let client = BrokerClient::connect(broker).await?;
    let result = client
        .send_command_and_await(
            &instance,
            &device,
            values,
            Duration::from_millis(args.timeout_ms),
        )
        .await;
    client.disconnect().await;
    let response = result?;

    let rendered = match render_json(global.output, &response)? {
        Some(json) => json,
        None => render_text(&response),
    };
    print_output(&rendered, global.quiet);

    match response.error {
        Some(error) if !response.ok => Err(CliError::Rejected {
            code: error.code,
            message: error.message,
        }),
        _ => Ok(()),
    }
}

/// Parse `field=value` pairs. Values are JSON literals when they parse
/// as such, plain strings otherwise.
fn parse_values(pairs: &[String]) -> Result<Values, CliError> {
    pairs
        .iter()
        .map(|pair| {
            let (field, raw) = pair
                .split_once('=')
                .filter(|(field, _)| !field.is_empty())
                .ok_or_else(|| CliError::Validation {
                    field: pair.clone(),
                    reason: "expected FIELD=VALUE".into(),
                })?;
            let value =
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()));
            Ok((field.to_owned(), value))
        })
        .collect()
}

fn render_text(response: &ResponsePayload) -> String {
    let mut out = format!("{} {}", response.id, if response.ok { "ok" } else { "failed" });
    for (field, value) in response.result.iter().flatten() {
        let _ = write!(out, "\n  {field} = {value}");
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn values_parse_as_json_or_string() {
        let pairs: Vec<String> = ["power=true", "level=42", "mode=eco", "label=\"a=b\"", "raw=a=b"]
            .into_iter()
            .map(String::from)
            .collect();
        let values = parse_values(&pairs).unwrap();
        assert_eq!(
            Value::Object(values),
            json!({"power": true, "level": 42, "mode": "eco", "label": "a=b", "raw": "a=b"})
        );
    }

    #[test]
    fn malformed_pairs_are_rejected() {
        for bad in ["power", "=true"] {
            let err = parse_values(&[bad.to_owned()]).unwrap_err();
            assert!(matches!(err, CliError::Validation { .. }), "{bad}");
        }
    }
}
