//! Transport seam
//!
//! A [`Transport`] moves bytes to and from a broker. It receives a
//! [`TransportEvents`] handle when the client is built and reports session
//! lifecycle changes and inbound messages through it. Every operation carries
//! a [`CompletionToken`] the transport resolves when the broker acknowledges
//! (or rejects) the request.
//!
//! Transports may call back from any thread and must never block on client
//! work: event callbacks only update client state and enqueue tasks.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::client::ClientInner;
use crate::config::ClientConfig;
use crate::message::{Message, Qos};
use crate::token::CompletionToken;

/// Broker connection used by a [`Client`](crate::Client).
pub trait Transport: Send + Sync {
    /// Called once with the client's event handle, before any other call.
    fn bind(&self, events: TransportEvents);

    fn connect(&self, token: CompletionToken);

    fn disconnect(&self, token: CompletionToken);

    fn publish(&self, message: Message, token: CompletionToken);

    fn subscribe(&self, filter: &str, qos: Qos, token: CompletionToken);

    fn unsubscribe(&self, filter: &str, token: CompletionToken);
}

/// Callbacks from the transport into its client.
///
/// Holds only a weak reference; once the client is dropped every event is
/// ignored.
#[derive(Clone)]
pub struct TransportEvents {
    client: Weak<ClientInner>,
    config: Arc<ClientConfig>,
}

impl TransportEvents {
    pub(crate) fn new(client: Weak<ClientInner>, config: Arc<ClientConfig>) -> Self {
        Self { client, config }
    }

    /// The session is established (first connect or a successful reconnect).
    pub fn connection_active(&self) {
        if let Some(client) = self.client.upgrade() {
            ClientInner::on_connection_active(&client);
        }
    }

    /// An established session dropped and the transport intends to retry.
    ///
    /// Returns how long to wait before the next attempt, or `None` when the
    /// client gave up and the transport must stop retrying.
    pub fn connection_lost(&self, reason: &str) -> Option<Duration> {
        let client = self.client.upgrade()?;
        ClientInner::on_connection_lost(&client, reason)
    }

    /// The session ended for good.
    pub fn connection_closed(&self) {
        if let Some(client) = self.client.upgrade() {
            ClientInner::on_connection_closed(&client);
        }
    }

    /// A message arrived on one of the session's subscriptions.
    pub fn message_arrived(&self, message: Message) {
        if let Some(client) = self.client.upgrade() {
            ClientInner::on_message_arrived(&client, message);
        }
    }

    /// Configuration of the owning client (keep-alive, timeouts, client id)
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl std::fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportEvents")
            .field("client_id", &self.config.client_id)
            .field("attached", &(self.client.strong_count() > 0))
            .finish()
    }
}
