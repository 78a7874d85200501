//! Shadow-backed device
//!
//! A [`ShadowDevice`] mirrors a set of local properties into a device shadow.
//! Once attached to a connected [`Client`] it:
//!
//! - subscribes to the shadow's delta topic and the accepted/rejected topics
//!   of get, update and delete
//! - periodically reports its reported properties as an update
//! - applies incoming deltas to its updatable properties
//! - optionally tracks the shadow document version, resynchronizing with a
//!   get whenever the local version is unknown
//!
//! Direct `get`/`update`/`delete` calls are available in blocking and
//! callback forms.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thingsync_client::{
    AttachedDevice, Client, ClientError, Message, Result, Subscription, TaskHandle, WeakClient,
};

use crate::command::{ShadowCommand, ShadowTopics};
use crate::config::ShadowConfig;
use crate::document;
use crate::manager::CommandManager;
use crate::property::DeviceSchema;

/// Version value meaning "not synchronized with the shadow"
pub const UNKNOWN_VERSION: i64 = -1;

const VERSION_CONFLICT: u16 = 409;
const NOT_FOUND: u16 = 404;

#[derive(Clone)]
pub struct ShadowDevice {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    thing_name: String,
    config: ShadowConfig,
    schema: DeviceSchema,
    commands: Arc<CommandManager>,
    local_version: AtomicI64,
    /// Serializes property reads for reports against delta writes
    critical: Mutex<()>,
    client: RwLock<WeakClient>,
    sync_task: Mutex<Option<TaskHandle>>,
}

impl ShadowDevice {
    pub fn new(thing_name: impl Into<String>, schema: DeviceSchema, config: ShadowConfig) -> Self {
        let thing_name = thing_name.into();
        let commands = CommandManager::new(thing_name.clone());

        Self {
            inner: Arc::new(DeviceInner {
                thing_name,
                config,
                schema,
                commands,
                local_version: AtomicI64::new(UNKNOWN_VERSION),
                critical: Mutex::new(()),
                client: RwLock::new(WeakClient::default()),
                sync_task: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ShadowConfig {
        &self.inner.config
    }

    pub fn schema(&self) -> &DeviceSchema {
        &self.inner.schema
    }

    pub fn topics(&self) -> &ShadowTopics {
        self.inner.commands.topics()
    }

    /// Last shadow version this device agreed with, or [`UNKNOWN_VERSION`]
    pub fn local_version(&self) -> i64 {
        self.inner.local_version.load(Ordering::SeqCst)
    }

    pub fn is_command_ready(&self, command: ShadowCommand) -> bool {
        self.inner.commands.is_command_ready(command)
    }

    pub fn is_topic_ready(&self, topic: &str) -> bool {
        self.inner.commands.is_topic_ready(topic)
    }

    /// The periodic report task is scheduled
    pub fn is_reporting(&self) -> bool {
        self.inner.sync_task.lock().is_some()
    }

    fn client(&self) -> Result<Client> {
        self.inner.client.read().upgrade().ok_or_else(|| {
            ClientError::Configuration(format!(
                "device {} is not attached to a client",
                self.inner.thing_name
            ))
        })
    }

    fn server_ack_timeout(&self) -> Option<Duration> {
        self.client()
            .ok()
            .map(|client| client.config().server_ack_timeout)
    }

    /// Fetch the shadow document.
    pub fn get(&self, timeout: Option<Duration>) -> Result<String> {
        let request = Message::new("", self.inner.config.method_qos);
        let ack = self
            .inner
            .commands
            .run_command_sync(ShadowCommand::Get, request, timeout)?;
        Ok(ack.string_payload().unwrap_or_default())
    }

    pub fn get_async<F>(&self, timeout: Option<Duration>, callback: F) -> Result<()>
    where
        F: FnOnce(Result<String>) + Send + 'static,
    {
        let request = Message::new("", self.inner.config.method_qos);
        self.inner
            .commands
            .run_command(ShadowCommand::Get, request, timeout, move |result| {
                callback(result.map(|ack| ack.string_payload().unwrap_or_default()))
            })
    }

    /// Send an update document such as `{"state":{"desired":{...}}}`.
    pub fn update(&self, document: &str, timeout: Option<Duration>) -> Result<()> {
        let request = Message::with_payload("", self.inner.config.method_qos, document);
        self.inner
            .commands
            .run_command_sync(ShadowCommand::Update, request, timeout)
            .map(|_| ())
    }

    pub fn update_async<F>(&self, document: &str, timeout: Option<Duration>, callback: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let request = Message::with_payload("", self.inner.config.method_qos, document);
        self.inner
            .commands
            .run_command(ShadowCommand::Update, request, timeout, move |result| {
                callback(result.map(|_| ()))
            })
    }

    /// Delete the shadow document.
    pub fn delete(&self, timeout: Option<Duration>) -> Result<()> {
        let request = Message::new("", self.inner.config.method_qos);
        self.inner
            .commands
            .run_command_sync(ShadowCommand::Delete, request, timeout)
            .map(|_| ())
    }

    pub fn delete_async<F>(&self, timeout: Option<Duration>, callback: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let request = Message::new("", self.inner.config.method_qos);
        self.inner
            .commands
            .run_command(ShadowCommand::Delete, request, timeout, move |result| {
                callback(result.map(|_| ()))
            })
    }

    /// Run one tick of the report task.
    ///
    /// Does nothing until the update acknowledgement topics are subscribed.
    /// With versioning enabled and the version unknown, a version sync is
    /// started instead of a report.
    pub fn report_once(&self) {
        if !self.inner.commands.is_command_ready(ShadowCommand::Update) {
            tracing::trace!(thing = %self.inner.thing_name, "Update not ready, skipping report");
            return;
        }

        let version = self.local_version();
        if self.inner.config.enable_versioning && version < 0 {
            self.start_version_sync();
            return;
        }

        match self.prepare_report(version) {
            Ok(payload) => self.send_report(version, payload),
            Err(e) => tracing::warn!(thing = %self.inner.thing_name, "Skipping report: {}", e),
        }
    }

    /// Render the report payload for the snapshot `version`.
    ///
    /// Fails with [`ClientError::VersionConflict`] if the local version moved
    /// while the properties were being read.
    fn prepare_report(&self, version: i64) -> Result<String> {
        let reported = {
            let _guard = self.inner.critical.lock();
            self.inner.schema.render_reported()
        };
        let versioned = self.inner.config.enable_versioning.then_some(version);
        let payload = document::report_payload(versioned, &reported);

        let current = self.local_version();
        if current != version {
            return Err(ClientError::VersionConflict {
                expected: version,
                actual: current,
            });
        }
        Ok(payload)
    }

    fn send_report(&self, version: i64, payload: String) {
        let request = Message::with_payload("", self.inner.config.report_qos, payload);
        let inner = Arc::downgrade(&self.inner);

        let submitted = self.inner.commands.run_command(
            ShadowCommand::Update,
            request,
            self.server_ack_timeout(),
            move |result| {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                match result {
                    Ok(_) if version >= 0 => {
                        let _ = inner.local_version.compare_exchange(
                            version,
                            version + 1,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        );
                    }
                    Ok(_) => {}
                    Err(ClientError::AckRejected { code, .. }) if code == VERSION_CONFLICT => {
                        tracing::debug!(thing = %inner.thing_name, version, "Report rejected on version, resyncing");
                        let _ = inner.local_version.compare_exchange(
                            version,
                            UNKNOWN_VERSION,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        );
                    }
                    Err(e) => tracing::warn!(thing = %inner.thing_name, "Report failed: {}", e),
                }
            },
        );

        if let Err(e) = submitted {
            tracing::debug!(thing = %self.inner.thing_name, "Report not sent: {}", e);
        }
    }

    fn start_version_sync(&self) {
        self.inner
            .local_version
            .store(UNKNOWN_VERSION, Ordering::SeqCst);

        let request = Message::new("", self.inner.config.report_qos);
        let inner = Arc::downgrade(&self.inner);

        let submitted = self.inner.commands.run_command(
            ShadowCommand::Get,
            request,
            self.server_ack_timeout(),
            move |result| {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let synced = match result {
                    Ok(ack) => ack.payload().and_then(|p| document::extract_version(&p)),
                    Err(ClientError::AckRejected { code, .. }) if code == NOT_FOUND => Some(0),
                    Err(e) => {
                        tracing::warn!(thing = %inner.thing_name, "Version sync failed: {}", e);
                        None
                    }
                };

                if let Some(version) = synced {
                    if inner
                        .local_version
                        .compare_exchange(UNKNOWN_VERSION, version, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        tracing::debug!(thing = %inner.thing_name, version, "Synchronized shadow version");
                    }
                }
            },
        );

        if let Err(e) = submitted {
            tracing::debug!(thing = %self.inner.thing_name, "Version sync not sent: {}", e);
        }
    }

    fn on_delta(&self, message: &Message) {
        let Some(payload) = message.payload() else {
            return;
        };

        if self.inner.config.enable_versioning {
            if let Some(version) = document::extract_version(&payload) {
                let local = self.local_version();
                if local >= 0 && version <= local {
                    tracing::debug!(thing = %self.inner.thing_name, version, local, "Ignoring stale delta");
                    return;
                }
                self.inner.local_version.store(version, Ordering::SeqCst);
            }
        }

        let Some(state) = document::extract_state(&payload) else {
            tracing::warn!(thing = %self.inner.thing_name, "Delta without a state object");
            return;
        };

        let applied = {
            let _guard = self.inner.critical.lock();
            self.inner.schema.apply_update(&state)
        };
        tracing::debug!(thing = %self.inner.thing_name, ?applied, "Applied shadow delta");
    }

    fn start_sync(&self, client: &Client) -> Result<()> {
        let interval = self.inner.config.report_interval;
        if !self.inner.schema.has_reported() || interval.is_zero() {
            return Ok(());
        }

        let inner = Arc::downgrade(&self.inner);
        let handle = client.schedule_at_fixed_rate(Duration::ZERO, interval, move || {
            if let Some(inner) = inner.upgrade() {
                ShadowDevice { inner }.report_once();
            }
        })?;

        if let Some(previous) = self.inner.sync_task.lock().replace(handle) {
            previous.cancel();
        }
        Ok(())
    }

    fn stop_sync(&self) {
        if let Some(handle) = self.inner.sync_task.lock().take() {
            handle.cancel();
        }
        self.inner
            .local_version
            .store(UNKNOWN_VERSION, Ordering::SeqCst);
    }

    fn subscription_for(&self, topic: &str) -> Subscription {
        let inner = Arc::downgrade(&self.inner);
        let config = &self.inner.config;

        if self.topics().is_delta(topic) {
            Subscription::new(topic, config.shadow_update_qos, move |message: Message| {
                if let Some(inner) = inner.upgrade() {
                    ShadowDevice { inner }.on_delta(&message);
                }
            })
        } else {
            Subscription::new(topic, config.method_ack_qos, move |message: Message| {
                if let Some(inner) = inner.upgrade() {
                    inner.commands.on_command_ack(&message);
                }
            })
        }
    }
}

impl AttachedDevice for ShadowDevice {
    fn thing_name(&self) -> &str {
        &self.inner.thing_name
    }

    fn bind(&self, client: &Client) {
        *self.inner.client.write() = client.downgrade();
        self.inner.commands.bind(client);
    }

    fn activate(&self) -> Result<()> {
        self.stop_sync();
        let client = self.client()?;
        let timeout = Some(client.config().server_ack_timeout);

        for topic in self.topics().all_subscriptions() {
            let commands = Arc::downgrade(&self.inner.commands);
            let acked = topic.clone();
            client.subscribe_async(self.subscription_for(&topic), timeout, move |result| {
                if let Some(commands) = commands.upgrade() {
                    commands.on_subscription_ack(&acked, result.is_ok());
                }
            })?;
        }

        self.start_sync(&client)?;
        tracing::info!(thing = %self.inner.thing_name, "Shadow device activated");
        Ok(())
    }

    fn deactivate(&self) -> Result<()> {
        self.stop_sync();
        self.inner.commands.on_deactivate();

        let Ok(client) = self.client() else {
            return Ok(());
        };
        let timeout = Some(client.config().server_ack_timeout);
        for topic in self.topics().all_subscriptions() {
            let name = self.inner.thing_name.clone();
            client.unsubscribe_async(&topic, timeout, move |result| {
                if let Err(e) = result {
                    tracing::debug!(thing = %name, "Unsubscribe failed: {}", e);
                }
            })?;
        }

        tracing::info!(thing = %self.inner.thing_name, "Shadow device deactivated");
        Ok(())
    }
}

impl fmt::Debug for ShadowDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowDevice")
            .field("thing_name", &self.inner.thing_name)
            .field("local_version", &self.local_version())
            .field("reporting", &self.is_reporting())
            .finish()
    }
}
