//! Direct get/update/delete commands against an in-memory shadow service

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{capture, connected_client, lamp_schema, wait_until, FakeShadowService};
use parking_lot::Mutex;
use serde_json::{json, Value};
use thingsync_client::{
    AttachedDevice, Behavior, Client, ClientError, LoopbackTransport, Message, Qos, TokenKind,
};
use thingsync_shadow::{document, CommandAck, ShadowCommand, ShadowConfig, ShadowDevice};

type Outcome<T> = thingsync_client::Result<T>;

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(2));

struct Fixture {
    client: Client,
    transport: LoopbackTransport,
    service: Arc<FakeShadowService>,
    lamp: ShadowDevice,
}

fn fixture(thing: &str) -> Fixture {
    let (client, transport) = connected_client(&format!("{}-client", thing));
    let service = FakeShadowService::install(&transport, thing);
    let lamp = ShadowDevice::new(
        thing,
        lamp_schema(Arc::new(Mutex::new(10))),
        ShadowConfig::passive(),
    );
    client.attach(Arc::new(lamp.clone())).unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        ShadowCommand::ALL
            .into_iter()
            .all(|command| lamp.is_command_ready(command))
    }));

    Fixture {
        client,
        transport,
        service,
        lamp,
    }
}

fn published_to(transport: &LoopbackTransport, topic: &str) -> Vec<Message> {
    transport
        .published()
        .into_iter()
        .filter(|message| message.topic() == topic)
        .collect()
}

#[test]
fn test_activation_subscribes_shadow_topics() {
    let f = fixture("lamp-activate");

    for topic in f.lamp.topics().all_subscriptions() {
        assert_eq!(f.transport.subscribe_count(&topic), 1, "{}", topic);
        assert!(f.lamp.is_topic_ready(&topic));
        assert!(f.client.is_subscribed(&topic));
    }
    assert_eq!(f.client.attached_devices(), vec!["lamp-activate".to_string()]);
}

#[test]
fn test_get_returns_document() {
    let f = fixture("lamp-get");
    f.service.seed(3, json!({ "serial": "LMP-0042" }));

    let document: Value = serde_json::from_str(&f.lamp.get(TIMEOUT).unwrap()).unwrap();
    assert_eq!(document["version"], json!(3));
    assert_eq!(document["state"]["reported"]["serial"], json!("LMP-0042"));
}

#[test]
fn test_get_missing_shadow_is_rejected() {
    let f = fixture("lamp-missing");

    match f.lamp.get(TIMEOUT) {
        Err(ClientError::AckRejected { code, message }) => {
            assert_eq!(code, 404);
            assert!(message.contains("lamp-missing"));
        }
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[test]
fn test_update_carries_client_token() {
    let f = fixture("lamp-update");

    f.lamp
        .update(r#"{"state":{"desired":{"brightness":55}}}"#, TIMEOUT)
        .unwrap();

    let requests = published_to(&f.transport, &f.lamp.topics().command(ShadowCommand::Update));
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].qos(), Qos::AtMostOnce);
    let token = document::extract_client_token(&requests[0].payload().unwrap()).unwrap();
    assert!(token.starts_with("lamp-update-"));

    assert_eq!(f.service.version(), 1);
    let document: Value = serde_json::from_str(&f.lamp.get(TIMEOUT).unwrap()).unwrap();
    assert_eq!(document["state"]["desired"]["brightness"], json!(55));
}

#[test]
fn test_delete_twice_is_rejected() {
    let f = fixture("lamp-delete");
    f.service.seed(1, json!({}));

    f.lamp.delete(TIMEOUT).unwrap();
    assert!(!f.service.exists());
    assert!(matches!(
        f.lamp.delete(TIMEOUT),
        Err(ClientError::AckRejected { code: 404, .. })
    ));
}

#[test]
fn test_async_get_delivers_document() {
    let f = fixture("lamp-async");
    f.service.seed(9, json!({ "serial": "LMP-0042" }));

    let (result, callback) = capture::<Outcome<String>>();
    f.lamp.get_async(TIMEOUT, callback).unwrap();

    assert!(wait_until(Duration::from_secs(2), || result.lock().is_some()));
    let document = result.lock().take().unwrap().unwrap();
    assert!(document.contains("\"version\":9"));
}

#[test]
fn test_one_command_of_each_kind_in_flight() {
    let f = fixture("lamp-inflight");
    f.service.seed(1, json!({}));
    f.transport.set_behavior(TokenKind::Publish, Behavior::Hold);

    let (first, callback) = capture::<Outcome<String>>();
    f.lamp.get_async(None, callback).unwrap();

    assert!(matches!(
        f.lamp.get(TIMEOUT),
        Err(ClientError::Configuration(reason)) if reason.contains("in flight")
    ));

    // Other command kinds are independent
    let (_, delete_cb) = capture::<Outcome<()>>();
    f.lamp.delete_async(None, delete_cb).unwrap();

    // Publishes are held; the first get is still waiting
    assert!(first.lock().is_none());
    assert_eq!(f.transport.held_count(), 2);
}

#[test]
fn test_foreign_ack_is_ignored() {
    let f = fixture("lamp-foreign");
    f.transport.set_behavior(TokenKind::Publish, Behavior::Hold);

    let (result, callback) = capture::<Outcome<String>>();
    f.lamp.get_async(None, callback).unwrap();

    let get_topic = f.lamp.topics().command(ShadowCommand::Get);
    assert!(wait_until(Duration::from_secs(1), || {
        !published_to(&f.transport, &get_topic).is_empty()
    }));
    let request = published_to(&f.transport, &get_topic).remove(0);
    let token = document::extract_client_token(&request.payload().unwrap()).unwrap();

    let accepted = f.lamp.topics().ack(ShadowCommand::Get, CommandAck::Accepted);
    f.transport.inject(Message::with_payload(
        accepted.clone(),
        Qos::AtMostOnce,
        json!({ "version": 1, "clientToken": "someone-else-1" }).to_string(),
    ));
    std::thread::sleep(Duration::from_millis(100));
    assert!(result.lock().is_none());

    f.transport.inject(Message::with_payload(
        accepted,
        Qos::AtMostOnce,
        json!({ "version": 2, "clientToken": token }).to_string(),
    ));
    assert!(wait_until(Duration::from_secs(2), || result.lock().is_some()));
    assert!(result.lock().take().unwrap().unwrap().contains("\"version\":2"));
}

#[test]
fn test_command_timeout_frees_the_slot() {
    let f = fixture("lamp-timeout");
    f.service.seed(4, json!({}));
    f.transport.set_behavior(TokenKind::Publish, Behavior::Hold);

    assert!(matches!(
        f.lamp.get(Some(Duration::from_millis(100))),
        Err(ClientError::Timeout(_))
    ));

    f.transport.set_behavior(TokenKind::Publish, Behavior::Succeed);
    let document: Value = serde_json::from_str(&f.lamp.get(TIMEOUT).unwrap()).unwrap();
    assert_eq!(document["version"], json!(4));
}

#[test]
fn test_async_timeout_reports_timeout() {
    let f = fixture("lamp-async-timeout");
    f.transport.set_behavior(TokenKind::Publish, Behavior::Hold);

    let (result, callback) = capture::<Outcome<()>>();
    f.lamp
        .update_async("{}", Some(Duration::from_millis(50)), callback)
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || result.lock().is_some()));
    assert!(matches!(
        result.lock().take().unwrap(),
        Err(ClientError::Timeout(_))
    ));
}

#[test]
fn test_commands_held_until_subscriptions_ack() {
    let (client, transport) = connected_client("lamp-held-client");
    let service = FakeShadowService::install(&transport, "lamp-held");
    service.seed(2, json!({}));
    transport.set_behavior(TokenKind::Subscribe, Behavior::Hold);

    let lamp = ShadowDevice::new(
        "lamp-held",
        lamp_schema(Arc::new(Mutex::new(0))),
        ShadowConfig::passive(),
    );
    client.attach(Arc::new(lamp.clone())).unwrap();
    assert_eq!(transport.held_count(), 7);

    let (result, callback) = capture::<Outcome<String>>();
    lamp.get_async(None, callback).unwrap();

    let get_topic = lamp.topics().command(ShadowCommand::Get);
    assert!(published_to(&transport, &get_topic).is_empty());

    transport.release_held(true);
    assert!(wait_until(Duration::from_secs(2), || result.lock().is_some()));
    assert!(result.lock().take().unwrap().is_ok());
    assert_eq!(published_to(&transport, &get_topic).len(), 1);
}

#[test]
fn test_failed_subscription_fails_held_command() {
    let (client, transport) = connected_client("lamp-subfail-client");
    transport.set_behavior(TokenKind::Subscribe, Behavior::Hold);

    let lamp = ShadowDevice::new(
        "lamp-subfail",
        lamp_schema(Arc::new(Mutex::new(0))),
        ShadowConfig::passive(),
    );
    client.attach(Arc::new(lamp.clone())).unwrap();

    let (result, callback) = capture::<Outcome<()>>();
    lamp.update_async("{}", None, callback).unwrap();

    transport.release_held(false);
    assert!(wait_until(Duration::from_secs(2), || result.lock().is_some()));
    assert!(matches!(
        result.lock().take().unwrap(),
        Err(ClientError::Connection(_))
    ));
    assert!(!lamp.is_command_ready(ShadowCommand::Update));
}

#[test]
fn test_detach_unsubscribes() {
    let f = fixture("lamp-detach");

    f.client.detach(f.lamp.thing_name()).unwrap();
    for topic in f.lamp.topics().all_subscriptions() {
        assert_eq!(f.transport.unsubscribe_count(&topic), 1, "{}", topic);
        assert!(!f.client.is_subscribed(&topic));
    }
    assert!(!f.lamp.is_command_ready(ShadowCommand::Get));
    assert!(f.client.attached_devices().is_empty());
}

#[test]
fn test_connection_loss_fails_pending_commands() {
    let f = fixture("lamp-lost");
    f.service.seed(1, json!({}));
    f.transport.set_behavior(TokenKind::Publish, Behavior::Hold);

    let (result, callback) = capture::<Outcome<String>>();
    f.lamp.get_async(None, callback).unwrap();

    assert!(f.transport.simulate_connection_lost("network down").is_some());
    assert!(wait_until(Duration::from_secs(2), || result.lock().is_some()));
    assert!(matches!(
        result.lock().take().unwrap(),
        Err(ClientError::Connection(_))
    ));
    assert!(!f.lamp.is_command_ready(ShadowCommand::Get));

    f.transport.set_behavior(TokenKind::Publish, Behavior::Succeed);
    f.transport.simulate_reconnect();
    assert!(wait_until(Duration::from_secs(2), || {
        f.lamp.is_command_ready(ShadowCommand::Get)
    }));
    assert!(f.lamp.get(TIMEOUT).is_ok());
}
