//! Shared helpers for shadow integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use thingsync_client::{Client, ClientConfig, LoopbackTransport, Message, Qos};
use thingsync_shadow::{
    CommandAck, DeviceSchema, PropertyDescriptor, PropertyError, ShadowCommand, ShadowTopics,
};

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Route SDK logs to the test harness; `RUST_LOG` selects the level.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn connected_client(client_id: &str) -> (Client, LoopbackTransport) {
    init_test_logging();
    let transport = LoopbackTransport::new();
    let config = ClientConfig::fast_retry(client_id).with_server_ack_timeout(Duration::from_secs(2));
    let client = Client::new(config, transport.clone()).unwrap();
    client.connect(Some(Duration::from_secs(2))).unwrap();
    assert!(wait_until(Duration::from_secs(2), || client.is_session_ready()));
    (client, transport)
}

/// A lamp with a read-only serial number and an adjustable brightness
pub fn lamp_schema(brightness: Arc<Mutex<u64>>) -> DeviceSchema {
    let read = Arc::clone(&brightness);
    DeviceSchema::new(vec![
        PropertyDescriptor::reported("serial", || json!("LMP-0042")),
        PropertyDescriptor::updatable(
            "brightness",
            move || json!(*read.lock()),
            move |value| {
                let level = value
                    .as_u64()
                    .filter(|v| *v <= 100)
                    .ok_or_else(|| PropertyError::invalid("brightness", "expected 0-100"))?;
                *brightness.lock() = level;
                Ok(())
            },
        ),
    ])
}

#[derive(Default)]
struct ShadowState {
    exists: bool,
    version: i64,
    reported: Map<String, Value>,
    desired: Map<String, Value>,
    updates: Vec<Value>,
    rejections: Vec<(ShadowCommand, u16)>,
}

/// In-memory shadow service answering a single thing's commands
pub struct FakeShadowService {
    topics: ShadowTopics,
    thing: String,
    state: Mutex<ShadowState>,
}

impl FakeShadowService {
    /// Answer publishes on `transport` as the shadow service for `thing`.
    pub fn install(transport: &LoopbackTransport, thing: &str) -> Arc<Self> {
        let service = Arc::new(Self {
            topics: ShadowTopics::new(thing),
            thing: thing.to_string(),
            state: Mutex::new(ShadowState::default()),
        });
        let responder = Arc::clone(&service);
        transport.set_responder(move |message| responder.respond(message));
        service
    }

    /// Create the document with `reported` state at `version`.
    pub fn seed(&self, version: i64, reported: Value) {
        let mut state = self.state.lock();
        state.exists = true;
        state.version = version;
        state.reported = reported.as_object().cloned().unwrap_or_default();
    }

    pub fn exists(&self) -> bool {
        self.state.lock().exists
    }

    pub fn version(&self) -> i64 {
        self.state.lock().version
    }

    pub fn reported(&self) -> Map<String, Value> {
        self.state.lock().reported.clone()
    }

    /// Every accepted update document, in order
    pub fn updates(&self) -> Vec<Value> {
        self.state.lock().updates.clone()
    }

    pub fn rejections(&self) -> Vec<(ShadowCommand, u16)> {
        self.state.lock().rejections.clone()
    }

    /// Simulate another writer updating the shadow; returns the new version.
    pub fn bump_version(&self, by: i64) -> i64 {
        let mut state = self.state.lock();
        state.exists = true;
        state.version += by;
        state.version
    }

    /// Set desired state and build the delta the service would publish.
    pub fn set_desired(&self, desired: Value) -> Message {
        let mut state = self.state.lock();
        state.exists = true;
        state.version += 1;
        if let Some(desired) = desired.as_object() {
            state.desired.extend(desired.clone());
        }
        self.delta(state.version, &desired)
    }

    /// A delta message at an explicit version
    pub fn delta(&self, version: i64, desired: &Value) -> Message {
        let body = json!({ "version": version, "state": desired });
        Message::with_payload(self.topics.delta(), Qos::AtMostOnce, body.to_string())
    }

    fn ack(&self, command: ShadowCommand, ack: CommandAck, body: Value) -> Message {
        Message::with_payload(self.topics.ack(command, ack), Qos::AtMostOnce, body.to_string())
    }

    fn reject(
        &self,
        state: &mut ShadowState,
        command: ShadowCommand,
        code: u16,
        message: &str,
        token: &Value,
    ) -> Vec<Message> {
        state.rejections.push((command, code));
        vec![self.ack(
            command,
            CommandAck::Rejected,
            json!({ "code": code, "message": message, "clientToken": token }),
        )]
    }

    fn respond(&self, message: &Message) -> Vec<Message> {
        let Some(command) = ShadowCommand::ALL
            .into_iter()
            .find(|command| message.topic() == self.topics.command(*command))
        else {
            return Vec::new();
        };

        let request: Value = message
            .payload()
            .and_then(|payload| serde_json::from_slice(&payload).ok())
            .unwrap_or_else(|| json!({}));
        let token = request.get("clientToken").cloned().unwrap_or(Value::Null);
        let mut state = self.state.lock();

        match command {
            ShadowCommand::Get => {
                if !state.exists {
                    let reason = format!("No shadow exists with name: '{}'", self.thing);
                    return self.reject(&mut state, command, 404, &reason, &token);
                }
                vec![self.ack(
                    command,
                    CommandAck::Accepted,
                    json!({
                        "state": { "reported": state.reported, "desired": state.desired },
                        "version": state.version,
                        "clientToken": token,
                    }),
                )]
            }
            ShadowCommand::Update => {
                if let Some(expected) = request.get("version").and_then(Value::as_i64) {
                    if expected != state.version {
                        return self.reject(&mut state, command, 409, "Version conflict", &token);
                    }
                }
                let Some(update) = request.get("state").and_then(Value::as_object) else {
                    return self.reject(&mut state, command, 400, "Missing required node: state", &token);
                };

                if let Some(reported) = update.get("reported").and_then(Value::as_object) {
                    state.reported.extend(reported.clone());
                }
                if let Some(desired) = update.get("desired").and_then(Value::as_object) {
                    state.desired.extend(desired.clone());
                }
                state.exists = true;
                state.version += 1;
                state.updates.push(request.clone());

                vec![self.ack(
                    command,
                    CommandAck::Accepted,
                    json!({ "state": update, "version": state.version, "clientToken": token }),
                )]
            }
            ShadowCommand::Delete => {
                if !state.exists {
                    let reason = format!("No shadow exists with name: '{}'", self.thing);
                    return self.reject(&mut state, command, 404, &reason, &token);
                }
                let version = state.version;
                state.exists = false;
                state.reported.clear();
                state.desired.clear();
                vec![self.ack(
                    command,
                    CommandAck::Accepted,
                    json!({ "version": version, "clientToken": token }),
                )]
            }
        }
    }
}

/// Captures the result of an asynchronous call
pub fn capture<T: Send + 'static>() -> (Arc<Mutex<Option<T>>>, impl FnOnce(T) + Send + 'static) {
    let slot = Arc::new(Mutex::new(None));
    let writer = Arc::clone(&slot);
    (slot, move |value| *writer.lock() = Some(value))
}
