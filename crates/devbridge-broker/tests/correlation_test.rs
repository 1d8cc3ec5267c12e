#![allow(clippy::unwrap_used)]
// Integration tests for command/response correlation over the loopback broker.

use std::time::Duration;

use devbridge_broker::{
    Broker, CommandPayload, DeviceId, Error, InstanceId, MemoryBroker, QoS, ResponsePayload,
    TopicMatch, TopicScheme, payload::Values,
};
use pretty_assertions::assert_eq;
use serde_json::json;

// ── Helpers ─────────────────────────────────────────────────────────

fn setup() -> (MemoryBroker, InstanceId, DeviceId) {
    let broker = MemoryBroker::new(TopicScheme::new("home").unwrap());
    (
        broker,
        InstanceId::new("hue").unwrap(),
        DeviceId::new("lamp").unwrap(),
    )
}

/// Answer every command on `instance` with `replies` copies of a success
/// response echoing the requested values.
async fn spawn_responder(broker: &MemoryBroker, instance: &InstanceId, replies: usize) {
    let mut rx = broker.messages();
    broker
        .subscribe(&broker.scheme().command_filter(instance))
        .await
        .unwrap();
    let broker = broker.clone();
    tokio::spawn(async move {
        while let Ok(msg) = rx.recv().await {
            let TopicMatch::Command { instance, device } = broker.scheme().parse(&msg.topic) else {
                continue;
            };
            let cmd: CommandPayload = serde_json::from_slice(&msg.payload).unwrap();
            let topic = broker.scheme().response_topic(&instance, &device);
            for n in 0..replies {
                let mut result = cmd.values.clone();
                result.insert("reply".into(), json!(n));
                let body = serde_json::to_vec(&ResponsePayload::success(&cmd.id, result)).unwrap();
                broker
                    .publish(&topic, body, false, QoS::AtLeastOnce)
                    .await
                    .unwrap();
            }
        }
    });
}

fn values(v: serde_json::Value) -> Values {
    v.as_object().unwrap().clone()
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn resolves_with_matching_response() {
    let (broker, instance, device) = setup();
    spawn_responder(&broker, &instance, 1).await;

    let resp = broker
        .send_command_and_await(
            &instance,
            &device,
            values(json!({"power": true})),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

    assert!(resp.ok);
    assert_eq!(resp.result.unwrap()["power"], json!(true));
    assert!(broker.pending().is_empty());

    let sent = broker.publications_to(&broker.scheme().command_topic(&instance, &device));
    assert_eq!(sent.len(), 1);
    assert!(!sent[0].retain);
    assert_eq!(sent[0].json()["timeout"], json!(2000));
}

#[tokio::test]
async fn response_topics_are_released_after_use() {
    let (broker, instance, device) = setup();
    spawn_responder(&broker, &instance, 1).await;
    let response_topic = broker.scheme().response_topic(&instance, &device);

    let sends = (0..4).map(|n| {
        broker.send_command_and_await(
            &instance,
            &device,
            values(json!({"brightness": n})),
            Duration::from_secs(2),
        )
    });
    for resp in futures_util::future::join_all(sends).await {
        assert!(resp.unwrap().ok);
    }
    assert!(!broker.subscriptions().contains(&response_topic));

    // A timed-out command releases its topic too.
    let silent = DeviceId::new("silent").unwrap();
    let err = broker
        .send_command_and_await(
            &InstanceId::new("nobody").unwrap(),
            &silent,
            Values::new(),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
    assert_eq!(
        broker.subscriptions(),
        [broker.scheme().command_filter(&instance)]
    );
}

#[tokio::test]
async fn first_response_wins_over_duplicates() {
    let (broker, instance, device) = setup();
    spawn_responder(&broker, &instance, 3).await;

    let resp = broker
        .send_command_and_await(&instance, &device, Values::new(), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(resp.result.unwrap()["reply"], json!(0));
}

#[tokio::test(start_paused = true)]
async fn times_out_without_response() {
    let (broker, instance, device) = setup();

    let err = broker
        .send_command_and_await(&instance, &device, Values::new(), Duration::from_millis(250))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout { timeout_ms: 250, .. }));
    assert!(broker.pending().is_empty());
}

#[tokio::test]
async fn fails_fast_while_disconnected() {
    let (broker, instance, device) = setup();
    broker.disconnect();

    let err = broker
        .send_command_and_await(&instance, &device, Values::new(), Duration::from_secs(5))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NotConnected));
    assert!(err.is_connection());
    assert!(broker.pending().is_empty());
}

#[tokio::test]
async fn unrelated_response_topics_are_ignored() {
    let (broker, instance, device) = setup();
    let other = DeviceId::new("other").unwrap();
    let response_topic = broker.scheme().response_topic(&instance, &device);
    broker.subscribe(&response_topic).await.unwrap();
    broker
        .subscribe(&broker.scheme().response_topic(&instance, &other))
        .await
        .unwrap();

    let rx = broker
        .pending()
        .register("cmd-1", &response_topic, Duration::from_secs(5))
        .unwrap();

    // Same id, wrong device: must not resolve.
    broker.inject(
        &broker.scheme().response_topic(&instance, &other),
        serde_json::to_vec(&ResponsePayload::success("cmd-1", Values::new())).unwrap(),
        false,
    );
    assert!(broker.pending().contains("cmd-1"));

    broker.inject(
        &response_topic,
        serde_json::to_vec(&ResponsePayload::success("cmd-1", Values::new())).unwrap(),
        false,
    );
    assert!(rx.await.unwrap().unwrap().ok);
}
