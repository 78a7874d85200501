//! In-process transport
//!
//! [`LoopbackTransport`] acts as its own broker. It acknowledges every
//! operation (or fails or holds it, per operation kind), records each call,
//! echoes publishes back to matching broker-side subscriptions and can run a
//! responder that turns a publish into inbound messages. Lifecycle helpers
//! simulate a dropped connection, a reconnect and a remote close.
//!
//! Clones share the same broker.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::message::{Message, Qos};
use crate::token::{CompletionToken, TokenKind};
use crate::topic;
use crate::transport::{Transport, TransportEvents};

/// A call the client made on the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect,
    Disconnect,
    Publish(Message),
    Subscribe { filter: String, qos: Qos },
    Unsubscribe(String),
}

/// How the loopback answers one kind of operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behavior {
    #[default]
    Succeed,
    Fail,
    /// Keep the token unresolved until [`LoopbackTransport::release_held`]
    Hold,
}

type Responder = Arc<dyn Fn(&Message) -> Vec<Message> + Send + Sync>;

#[derive(Default)]
struct LoopbackInner {
    events: Mutex<Option<TransportEvents>>,
    calls: Mutex<Vec<TransportCall>>,
    behaviors: Mutex<HashMap<TokenKind, Behavior>>,
    held: Mutex<Vec<CompletionToken>>,
    broker_subscriptions: Mutex<Vec<String>>,
    responder: Mutex<Option<Responder>>,
    connected: AtomicBool,
}

#[derive(Clone, Default)]
pub struct LoopbackTransport {
    inner: Arc<LoopbackInner>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behavior(&self, kind: TokenKind, behavior: Behavior) {
        self.inner.behaviors.lock().insert(kind, behavior);
    }

    fn behavior(&self, kind: TokenKind) -> Behavior {
        self.inner
            .behaviors
            .lock()
            .get(&kind)
            .copied()
            .unwrap_or_default()
    }

    /// Install a hook that answers each successful publish with inbound messages.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&Message) -> Vec<Message> + Send + Sync + 'static,
    {
        *self.inner.responder.lock() = Some(Arc::new(responder));
    }

    pub fn clear_responder(&self) {
        *self.inner.responder.lock() = None;
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.inner.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.inner.calls.lock().clear();
    }

    /// Number of subscribe calls issued for exactly `filter`
    pub fn subscribe_count(&self, filter: &str) -> usize {
        self.inner
            .calls
            .lock()
            .iter()
            .filter(|call| matches!(call, TransportCall::Subscribe { filter: f, .. } if f == filter))
            .count()
    }

    pub fn unsubscribe_count(&self, filter: &str) -> usize {
        self.inner
            .calls
            .lock()
            .iter()
            .filter(|call| matches!(call, TransportCall::Unsubscribe(f) if f == filter))
            .count()
    }

    /// Every message handed to `publish`, in order
    pub fn published(&self) -> Vec<Message> {
        self.inner
            .calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                TransportCall::Publish(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Settings the bound client hands its transport
    pub fn session_config(&self) -> Option<ClientConfig> {
        self.events().map(|events| events.config().clone())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Resolve every held token, successfully or with a connection error
    pub fn release_held(&self, succeed: bool) -> usize {
        let held: Vec<CompletionToken> = self.inner.held.lock().drain(..).collect();
        let count = held.len();
        for token in held {
            if succeed {
                token.succeed();
            } else {
                token.fail(ClientError::Connection("loopback released with failure".to_string()));
            }
        }
        count
    }

    pub fn held_count(&self) -> usize {
        self.inner.held.lock().len()
    }

    fn events(&self) -> Option<TransportEvents> {
        self.inner.events.lock().clone()
    }

    /// Drop the connection as a network failure would.
    ///
    /// Returns the reconnect delay the client asked for, `None` if it gave up.
    pub fn simulate_connection_lost(&self, reason: &str) -> Option<Duration> {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.events()?.connection_lost(reason)
    }

    /// Re-establish a dropped connection.
    pub fn simulate_reconnect(&self) {
        self.inner.connected.store(true, Ordering::SeqCst);
        if let Some(events) = self.events() {
            events.connection_active();
        }
    }

    /// Close the session from the broker side.
    pub fn simulate_closed(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.broker_subscriptions.lock().clear();
        if let Some(events) = self.events() {
            events.connection_closed();
        }
    }

    /// Deliver `message` as if the broker sent it.
    pub fn inject(&self, message: Message) {
        if let Some(events) = self.events() {
            events.message_arrived(message);
        }
    }

    fn record(&self, call: TransportCall) {
        self.inner.calls.lock().push(call);
    }

    /// Apply the configured behaviour; `on_success` runs before the token resolves.
    fn answer(&self, kind: TokenKind, token: CompletionToken, on_success: impl FnOnce()) {
        match self.behavior(kind) {
            Behavior::Succeed => {
                on_success();
                token.succeed();
            }
            Behavior::Fail => {
                token.fail(ClientError::Connection(format!(
                    "loopback refused {:?}",
                    kind
                )));
            }
            Behavior::Hold => self.inner.held.lock().push(token),
        }
    }
}

impl Transport for LoopbackTransport {
    fn bind(&self, events: TransportEvents) {
        *self.inner.events.lock() = Some(events);
    }

    fn connect(&self, token: CompletionToken) {
        self.record(TransportCall::Connect);
        self.answer(TokenKind::Connect, token, || {
            self.inner.connected.store(true, Ordering::SeqCst);
            if let Some(events) = self.events() {
                events.connection_active();
            }
        });
    }

    fn disconnect(&self, token: CompletionToken) {
        self.record(TransportCall::Disconnect);
        self.answer(TokenKind::Disconnect, token, || {
            self.inner.connected.store(false, Ordering::SeqCst);
            self.inner.broker_subscriptions.lock().clear();
            if let Some(events) = self.events() {
                events.connection_closed();
            }
        });
    }

    fn publish(&self, message: Message, token: CompletionToken) {
        self.record(TransportCall::Publish(message.clone()));
        if self.behavior(TokenKind::Publish) != Behavior::Succeed {
            self.answer(TokenKind::Publish, token, || {});
            return;
        }
        token.succeed();

        let Some(events) = self.events() else {
            return;
        };

        let echoed = self
            .inner
            .broker_subscriptions
            .lock()
            .iter()
            .any(|filter| topic::matches(filter, message.topic()));
        if echoed {
            events.message_arrived(message.clone());
        }

        let responder = self.inner.responder.lock().clone();
        if let Some(responder) = responder {
            for reply in responder(&message) {
                events.message_arrived(reply);
            }
        }
    }

    fn subscribe(&self, filter: &str, qos: Qos, token: CompletionToken) {
        self.record(TransportCall::Subscribe {
            filter: filter.to_string(),
            qos,
        });
        self.answer(TokenKind::Subscribe, token, || {
            let mut subscriptions = self.inner.broker_subscriptions.lock();
            if !subscriptions.iter().any(|f| f == filter) {
                subscriptions.push(filter.to_string());
            }
        });
    }

    fn unsubscribe(&self, filter: &str, token: CompletionToken) {
        self.record(TransportCall::Unsubscribe(filter.to_string()));
        self.answer(TokenKind::Unsubscribe, token, || {
            self.inner.broker_subscriptions.lock().retain(|f| f != filter);
        });
    }
}

impl fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("connected", &self.is_connected())
            .field("calls", &self.inner.calls.lock().len())
            .finish()
    }
}
