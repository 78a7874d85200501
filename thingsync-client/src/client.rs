//! Connection manager
//!
//! [`Client`] owns one broker session: its lifecycle state, the subscription
//! registry, attached devices, the offline publish queue and the task
//! scheduler that runs handlers and periodic work.
//!
//! # Session lifecycle
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok--> Connected
//!                              |                  |      ^
//!                              +--failure--> Disconnected |
//!                                                 v      |
//!                                   drop --> Reconnecting -+ (recovery)
//! ```
//!
//! When a session becomes active the client holds inbound messages, re-issues
//! every registered subscription, reactivates attached devices, replays the
//! offline queue and only then releases held messages to the dispatcher. A
//! failed resubscription tears the session down.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::backoff::ReconnectBackoff;
use crate::config::ClientConfig;
use crate::device::AttachedDevice;
use crate::error::{ClientError, Result};
use crate::message::{Message, Qos};
use crate::offline::OfflineQueue;
use crate::registry::{SequencedMap, Subscription, SubscriptionRegistry};
use crate::scheduler::{TaskHandle, TaskScheduler};
use crate::state::ConnectionState;
use crate::token::{CompletionToken, TokenKind};
use crate::topic;
use crate::transport::{Transport, TransportEvents};

/// Handle to a client session. Cloning shares the session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

/// Non-owning handle, used by attached devices to reach their client.
#[derive(Clone, Default)]
pub struct WeakClient {
    inner: Weak<ClientInner>,
}

impl WeakClient {
    pub fn upgrade(&self) -> Option<Client> {
        self.inner.upgrade().map(|inner| Client { inner })
    }
}

impl fmt::Debug for WeakClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakClient")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

pub(crate) struct ClientInner {
    config: Arc<ClientConfig>,
    transport: Arc<dyn Transport>,
    state: Mutex<ConnectionState>,
    subscriptions: SubscriptionRegistry,
    devices: SequencedMap<String, Arc<dyn AttachedDevice>>,
    scheduler: RwLock<Option<Arc<TaskScheduler>>>,
    backoff: Mutex<ReconnectBackoff>,
    offline: OfflineQueue,
    /// `Some` while a session is being recovered; inbound messages wait here
    inbound_gate: Mutex<Option<Vec<Message>>>,
    /// Set by `connect()`, cleared by the close sequence
    session_open: AtomicBool,
}

impl Client {
    /// Create a client over `transport`.
    ///
    /// The configuration is validated and the transport receives its event
    /// handle before this returns.
    pub fn new<T>(config: ClientConfig, transport: T) -> Result<Self>
    where
        T: Transport + 'static,
    {
        Self::with_shared_transport(config, Arc::new(transport))
    }

    pub fn with_shared_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let config = Arc::new(config);
        let inner = Arc::new(ClientInner {
            backoff: Mutex::new(ReconnectBackoff::new(
                config.base_retry_delay,
                config.max_retry_delay,
                config.max_connection_retries,
            )),
            offline: OfflineQueue::new(config.max_offline_queue_size),
            config: Arc::clone(&config),
            transport,
            state: Mutex::new(ConnectionState::Disconnected),
            subscriptions: SubscriptionRegistry::new(),
            devices: SequencedMap::new(),
            scheduler: RwLock::new(None),
            inbound_gate: Mutex::new(None),
            session_open: AtomicBool::new(false),
        });

        inner
            .transport
            .bind(TransportEvents::new(Arc::downgrade(&inner), config));

        Ok(Self { inner })
    }

    pub fn downgrade(&self) -> WeakClient {
        WeakClient {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// True once connected and session recovery has finished delivering held messages
    pub fn is_session_ready(&self) -> bool {
        self.connection_state().is_connected() && self.inner.inbound_gate.lock().is_none()
    }

    /// Open the session and block until the transport reports the outcome.
    ///
    /// Connecting an already connected client is a no-op. Calling this while a
    /// connection attempt or reconnect is in progress fails.
    pub fn connect(&self, timeout: Option<Duration>) -> Result<()> {
        if !self.inner.begin_connect()? {
            return Ok(());
        }

        let weak = Arc::downgrade(&self.inner);
        let token = CompletionToken::blocking_with_hook(TokenKind::Connect, timeout, move |result| {
            if let (Err(e), Some(inner)) = (result, weak.upgrade()) {
                inner.on_connect_failed(&e);
            }
        });

        self.inner.transport.connect(token.clone());
        token.wait()
    }

    /// Open the session without blocking; `callback` receives the outcome.
    ///
    /// A connected client gets `Ok` immediately. Errors detected before the
    /// transport is asked (an attempt already in progress, no scheduler) are
    /// returned directly and the callback is not invoked.
    pub fn connect_async<F>(&self, timeout: Option<Duration>, callback: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        if !self.inner.begin_connect()? {
            callback(Ok(()));
            return Ok(());
        }

        let weak = Arc::downgrade(&self.inner);
        let token = CompletionToken::with_callback(TokenKind::Connect, timeout, move |result| {
            if let (Err(e), Some(inner)) = (&result, weak.upgrade()) {
                inner.on_connect_failed(e);
            }
            callback(result);
        });

        self.inner.transport.connect(token.clone());
        self.inner.arm_timeout(&token);
        Ok(())
    }

    /// Close the session.
    ///
    /// Disconnecting a disconnected client is a no-op. On success the close
    /// sequence has run: devices are deactivated, subscriptions and devices
    /// forgotten and the scheduler stopped.
    pub fn disconnect(&self, timeout: Option<Duration>) -> Result<()> {
        if *self.inner.state.lock() == ConnectionState::Disconnected {
            return Ok(());
        }

        let token = CompletionToken::blocking(TokenKind::Disconnect, timeout);
        self.inner.transport.disconnect(token.clone());
        token.wait()?;

        self.inner.close_session();
        Ok(())
    }

    /// Asynchronous [`disconnect`](Self::disconnect). The close sequence runs
    /// before `callback` sees a success; a failed or timed out disconnect
    /// leaves the session as it was.
    pub fn disconnect_async<F>(&self, timeout: Option<Duration>, callback: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        if *self.inner.state.lock() == ConnectionState::Disconnected {
            callback(Ok(()));
            return Ok(());
        }

        let weak = Arc::downgrade(&self.inner);
        let token = CompletionToken::with_callback(TokenKind::Disconnect, timeout, move |result| {
            if result.is_ok() {
                if let Some(inner) = weak.upgrade() {
                    inner.close_session();
                }
            }
            callback(result);
        });

        self.inner.transport.disconnect(token.clone());
        self.inner.arm_timeout(&token);
        Ok(())
    }

    /// Publish `payload` to `topic` and wait for the transport's acknowledgement.
    pub fn publish(
        &self,
        topic: &str,
        qos: Qos,
        payload: impl AsRef<[u8]>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.publish_message(Message::with_payload(topic, qos, payload), timeout)
    }

    pub fn publish_message(&self, message: Message, timeout: Option<Duration>) -> Result<()> {
        check_topic(message.topic())?;

        let token = CompletionToken::blocking(TokenKind::Publish, timeout);
        self.inner.submit_publish(message, token.clone())?;
        token.wait()
    }

    /// Publish without blocking; `callback` receives the outcome.
    ///
    /// Errors detected before the message reaches the transport (invalid
    /// topic, disconnected client, full offline queue) are returned directly
    /// and the callback is not invoked.
    pub fn publish_async<F>(&self, message: Message, timeout: Option<Duration>, callback: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        check_topic(message.topic())?;

        let token = CompletionToken::with_callback(TokenKind::Publish, timeout, callback);
        self.inner.submit_publish(message, token.clone())?;
        self.inner.arm_timeout(&token);
        Ok(())
    }

    /// Subscribe and wait for the broker's acknowledgement.
    ///
    /// The subscription is recorded only once acknowledged. Subscribing to a
    /// filter that is already registered replaces its handler.
    pub fn subscribe(&self, subscription: Subscription, timeout: Option<Duration>) -> Result<()> {
        check_filter(subscription.filter())?;
        self.inner.require_connected()?;

        let token = CompletionToken::blocking(TokenKind::Subscribe, timeout);
        self.inner
            .transport
            .subscribe(subscription.filter(), subscription.qos(), token.clone());
        token.wait()?;

        tracing::debug!(filter = %subscription.filter(), "Subscribed");
        self.inner.subscriptions.insert(subscription);
        Ok(())
    }

    /// Subscribe without blocking. The registry is updated before `callback`
    /// runs on success.
    pub fn subscribe_async<F>(
        &self,
        subscription: Subscription,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        check_filter(subscription.filter())?;
        self.inner.require_connected()?;

        let filter = subscription.filter().to_string();
        let qos = subscription.qos();
        let weak = Arc::downgrade(&self.inner);

        let token = CompletionToken::with_callback(TokenKind::Subscribe, timeout, move |result| {
            if result.is_ok() {
                if let Some(inner) = weak.upgrade() {
                    tracing::debug!(filter = %subscription.filter(), "Subscribed");
                    inner.subscriptions.insert(subscription);
                }
            }
            callback(result);
        });

        self.inner.transport.subscribe(&filter, qos, token.clone());
        self.inner.arm_timeout(&token);
        Ok(())
    }

    /// Remove a subscription.
    ///
    /// The registry entry is removed before the broker is asked; an unknown
    /// filter is a no-op. While not connected only the local entry is removed.
    pub fn unsubscribe(&self, filter: &str, timeout: Option<Duration>) -> Result<()> {
        if self.inner.subscriptions.remove(filter).is_none() {
            return Ok(());
        }
        if !self.connection_state().is_connected() {
            tracing::debug!(filter, "Removed subscription locally while not connected");
            return Ok(());
        }

        let token = CompletionToken::blocking(TokenKind::Unsubscribe, timeout);
        self.inner.transport.unsubscribe(filter, token.clone());
        token.wait()
    }

    /// Asynchronous [`unsubscribe`](Self::unsubscribe). The callback runs
    /// immediately when no broker round trip is needed.
    pub fn unsubscribe_async<F>(&self, filter: &str, timeout: Option<Duration>, callback: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        if self.inner.subscriptions.remove(filter).is_none()
            || !self.connection_state().is_connected()
        {
            callback(Ok(()));
            return Ok(());
        }

        let token = CompletionToken::with_callback(TokenKind::Unsubscribe, timeout, callback);
        self.inner.transport.unsubscribe(filter, token.clone());
        self.inner.arm_timeout(&token);
        Ok(())
    }

    /// Attach a device to this session.
    ///
    /// A device whose thing name is already attached is left alone. The
    /// device is activated immediately when the client is connected, otherwise
    /// on the next successful connection.
    pub fn attach(&self, device: Arc<dyn AttachedDevice>) -> Result<()> {
        let name = device.thing_name().to_string();
        if self.inner.devices.contains_key(&name) {
            tracing::debug!(thing = %name, "Device already attached");
            return Ok(());
        }

        device.bind(self);
        if self
            .inner
            .devices
            .insert_if_absent(name.clone(), Arc::clone(&device))
            .is_some()
        {
            return Ok(());
        }

        tracing::info!(thing = %name, "Device attached");
        if self.connection_state().is_connected() {
            device.activate()?;
        }
        Ok(())
    }

    /// Detach and deactivate a device. Unknown names are ignored.
    pub fn detach(&self, thing_name: &str) -> Result<()> {
        match self.inner.devices.remove(&thing_name.to_string()) {
            Some(device) => {
                tracing::info!(thing = %thing_name, "Device detached");
                device.deactivate()
            }
            None => Ok(()),
        }
    }

    /// Thing names of attached devices, in attach order
    pub fn attached_devices(&self) -> Vec<String> {
        self.inner
            .devices
            .snapshot()
            .into_iter()
            .map(|(name, _)| name)
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    pub fn is_subscribed(&self, filter: &str) -> bool {
        self.inner.subscriptions.contains(filter)
    }

    /// Publishes waiting for the connection to come back
    pub fn offline_queue_len(&self) -> usize {
        self.inner.offline.len()
    }

    /// Run `task` once after `delay` on the session's scheduler.
    pub fn schedule_once<F>(&self, delay: Duration, task: F) -> Result<TaskHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.scheduler()?.schedule_once(delay, task)
    }

    /// Run `task` periodically on the session's scheduler.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: F,
    ) -> Result<TaskHandle>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner
            .scheduler()?
            .schedule_at_fixed_rate(initial_delay, period, task)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.inner.config.client_id)
            .field("state", &self.connection_state())
            .field("subscriptions", &self.inner.subscriptions.len())
            .finish()
    }
}

fn check_topic(topic: &str) -> Result<()> {
    if topic::is_valid_topic(topic) {
        Ok(())
    } else {
        Err(ClientError::Configuration(format!("invalid publish topic: {:?}", topic)))
    }
}

fn check_filter(filter: &str) -> Result<()> {
    if topic::is_valid_filter(filter) {
        Ok(())
    } else {
        Err(ClientError::Configuration(format!("invalid topic filter: {:?}", filter)))
    }
}

impl ClientInner {
    fn scheduler(&self) -> Result<Arc<TaskScheduler>> {
        self.scheduler
            .read()
            .clone()
            .ok_or_else(|| ClientError::Configuration("client has no active session".to_string()))
    }

    fn ensure_scheduler(&self) -> Result<Arc<TaskScheduler>> {
        let mut slot = self.scheduler.write();
        if let Some(scheduler) = slot.as_ref() {
            if !scheduler.is_shut_down() {
                return Ok(Arc::clone(scheduler));
            }
        }
        let scheduler = Arc::new(TaskScheduler::new(self.config.num_client_threads)?);
        *slot = Some(Arc::clone(&scheduler));
        Ok(scheduler)
    }

    /// Move to `Connecting`. Returns false when already connected.
    fn begin_connect(&self) -> Result<bool> {
        {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::Connected => return Ok(false),
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    return Err(ClientError::Configuration(format!(
                        "cannot connect while {}",
                        *state
                    )));
                }
                ConnectionState::Disconnected => {}
            }
            self.ensure_scheduler()?;
            *state = ConnectionState::Connecting;
        }

        self.session_open.store(true, Ordering::SeqCst);
        self.backoff.lock().reset();

        tracing::info!(client_id = %self.config.client_id, "Connecting");
        Ok(true)
    }

    fn require_connected(&self) -> Result<()> {
        if self.state.lock().is_connected() {
            Ok(())
        } else {
            Err(ClientError::not_connected())
        }
    }

    fn submit_publish(&self, message: Message, token: CompletionToken) -> Result<()> {
        {
            let state = self.state.lock();
            match *state {
                ConnectionState::Connected => {}
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    // Queued under the state lock so recovery cannot drain before the push
                    self.offline.push(message, token)?;
                    tracing::debug!(queued = self.offline.len(), "Publish queued until connected");
                    return Ok(());
                }
                ConnectionState::Disconnected => return Err(ClientError::not_connected()),
            }
        }

        self.transport.publish(message, token);
        Ok(())
    }

    /// Give an asynchronous token a deadline on the scheduler.
    fn arm_timeout(&self, token: &CompletionToken) {
        let Some(deadline) = token.deadline() else {
            return;
        };
        if token.is_resolved() {
            return;
        }

        let pending = token.clone();
        let armed = self
            .scheduler()
            .and_then(|scheduler| scheduler.schedule_once(deadline, move || {
                if pending.time_out() {
                    tracing::debug!(kind = ?pending.kind(), "Asynchronous operation timed out");
                }
            }));
        if let Err(e) = armed {
            tracing::warn!("Could not arm timeout for {:?}: {}", token.kind(), e);
        }
    }

    fn dispatch(&self, message: &Message) {
        let scheduler = match self.scheduler() {
            Ok(scheduler) => scheduler,
            Err(_) => {
                tracing::warn!(topic = %message.topic(), "Dropping message, no active session");
                return;
            }
        };

        if self.subscriptions.dispatch(message, &scheduler) == 0 {
            tracing::warn!(topic = %message.topic(), "Unexpected message, no subscription matches");
        }
    }

    fn activate_devices(&self) {
        for (name, device) in self.devices.snapshot() {
            if let Err(e) = device.activate() {
                tracing::warn!(thing = %name, "Failed to activate device: {}", e);
            }
        }
    }

    fn deactivate_devices(&self) {
        for (name, device) in self.devices.snapshot() {
            if let Err(e) = device.deactivate() {
                tracing::warn!(thing = %name, "Failed to deactivate device: {}", e);
            }
        }
    }

    pub(crate) fn on_connection_active(self: &Arc<Self>) {
        let previous = {
            let mut state = self.state.lock();
            if *state == ConnectionState::Disconnected {
                None
            } else {
                Some(std::mem::replace(&mut *state, ConnectionState::Connected))
            }
        };
        match previous {
            None => {
                // An abandoned attempt completed after connect() gave up
                tracing::warn!(client_id = %self.config.client_id, "Late connection-active event, closing transport");
                self.transport
                    .disconnect(CompletionToken::detached(TokenKind::Disconnect));
                return;
            }
            Some(ConnectionState::Connected) => {
                tracing::debug!("Duplicate connection-active event ignored");
                return;
            }
            Some(_) => {}
        }

        tracing::info!(client_id = %self.config.client_id, "Connection established");
        self.backoff.lock().reset();
        self.inbound_gate.lock().get_or_insert_with(Vec::new);

        let weak = Arc::downgrade(self);
        let scheduled = self.ensure_scheduler().and_then(|scheduler| {
            scheduler.schedule_once(Duration::ZERO, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.recover_session();
                }
            })
        });

        if let Err(e) = scheduled {
            tracing::error!("Cannot schedule session recovery: {}", e);
            self.release_inbound();
        }
    }

    /// Resubscribe, reactivate devices, replay queued publishes and open the
    /// inbound gate, in that order. Runs on the scheduler.
    fn recover_session(&self) {
        let subscriptions = self.subscriptions.snapshot();
        if !subscriptions.is_empty() {
            tracing::debug!(count = subscriptions.len(), "Resubscribing");
        }

        for subscription in subscriptions {
            if !self.state.lock().is_connected() {
                return;
            }

            let token = CompletionToken::blocking(
                TokenKind::Subscribe,
                Some(self.config.server_ack_timeout),
            );
            self.transport
                .subscribe(subscription.filter(), subscription.qos(), token.clone());

            if let Err(e) = token.wait() {
                tracing::warn!(
                    filter = %subscription.filter(),
                    "Failed to resubscribe, closing session: {}",
                    e
                );
                self.force_disconnect();
                return;
            }
        }

        if !self.state.lock().is_connected() {
            return;
        }
        self.activate_devices();

        let queued = self.offline.drain();
        if !queued.is_empty() {
            tracing::debug!(count = queued.len(), "Replaying queued publishes");
        }
        for (message, token) in queued {
            self.transport.publish(message, token);
        }

        self.release_inbound();
    }

    fn release_inbound(&self) {
        let mut gate = self.inbound_gate.lock();
        if let Some(held) = gate.take() {
            for message in held {
                self.dispatch(&message);
            }
        }
    }

    fn force_disconnect(&self) {
        let token = CompletionToken::detached(TokenKind::Disconnect);
        self.transport.disconnect(token);
        self.close_session();
    }

    pub(crate) fn on_connection_lost(self: &Arc<Self>, reason: &str) -> Option<Duration> {
        let previous = {
            let mut state = self.state.lock();
            if *state == ConnectionState::Disconnected {
                return None;
            }
            std::mem::replace(&mut *state, ConnectionState::Reconnecting)
        };

        tracing::warn!(client_id = %self.config.client_id, reason, "Connection lost");
        if previous == ConnectionState::Connected {
            self.deactivate_devices();
        }

        let next = self.backoff.lock().next_delay();
        match next {
            Ok(delay) => {
                tracing::info!("Reconnecting in {:?}", delay);
                Some(delay)
            }
            Err(e) => {
                tracing::error!(client_id = %self.config.client_id, "{}", e);
                self.close_session();
                None
            }
        }
    }

    pub(crate) fn on_connection_closed(self: &Arc<Self>) {
        self.close_session();
    }

    fn on_connect_failed(&self, error: &ClientError) {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Connecting {
                return;
            }
            *state = ConnectionState::Disconnected;
        }

        tracing::warn!(client_id = %self.config.client_id, "Connection attempt failed: {}", error);
        self.session_open.store(false, Ordering::SeqCst);
        self.offline
            .fail_all(ClientError::Connection("connection attempt failed".to_string()));
    }

    /// Terminal close sequence. Runs at most once per session.
    fn close_session(&self) {
        *self.state.lock() = ConnectionState::Disconnected;
        if !self.session_open.swap(false, Ordering::SeqCst) {
            return;
        }

        tracing::info!(client_id = %self.config.client_id, "Connection closed");
        self.deactivate_devices();
        self.subscriptions.clear();
        self.devices.clear();
        self.offline
            .fail_all(ClientError::Connection("connection closed".to_string()));
        *self.inbound_gate.lock() = None;

        let scheduler = self.scheduler.write().take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown();
        }
    }

    pub(crate) fn on_message_arrived(self: &Arc<Self>, message: Message) {
        {
            let mut gate = self.inbound_gate.lock();
            if let Some(held) = gate.as_mut() {
                held.push(message);
                return;
            }
        }
        self.dispatch(&message);
    }
}
