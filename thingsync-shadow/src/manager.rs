//! Shadow command manager
//!
//! Correlates get/update/delete requests with their accepted/rejected
//! acknowledgements. At most one command of each kind is in flight per
//! device; a second request of the same kind fails immediately.
//!
//! A command is only published once both of its acknowledgement topics are
//! subscribed. Requests issued earlier are held and published as soon as the
//! second subscription is acknowledged, or failed if a subscription fails.
//!
//! Each request carries a `clientToken` of the form `{thing}-{n}`. An
//! acknowledgement with a different token belongs to another client working
//! on the same shadow and is ignored.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use thingsync_client::token::effective_timeout;
use thingsync_client::{Client, ClientError, Message, Result, WeakClient};

use crate::command::{CommandAck, ShadowCommand, ShadowTopics};
use crate::document;

/// Callback receiving the acknowledgement of an asynchronous command
pub type CommandCallback = Box<dyn FnOnce(Result<Message>) + Send + 'static>;

enum CommandCompletion {
    Blocking(mpsc::SyncSender<Result<Message>>),
    Callback(CommandCallback),
}

impl CommandCompletion {
    fn complete(self, result: Result<Message>) {
        match self {
            // The waiter may already have given up
            CommandCompletion::Blocking(sender) => {
                let _ = sender.try_send(result);
            }
            CommandCompletion::Callback(callback) => callback(result),
        }
    }
}

struct PendingCommand {
    id: u64,
    client_token: Option<String>,
    request: Message,
    published: bool,
    completion: CommandCompletion,
}

pub struct CommandManager {
    thing_name: String,
    topics: ShadowTopics,
    client: RwLock<WeakClient>,
    pending: Mutex<HashMap<ShadowCommand, PendingCommand>>,
    readiness: DashMap<String, bool>,
    next_id: AtomicU64,
}

impl CommandManager {
    pub fn new(thing_name: impl Into<String>) -> Arc<Self> {
        let thing_name = thing_name.into();
        let topics = ShadowTopics::new(&thing_name);
        let readiness = DashMap::new();
        for topic in topics.all_subscriptions() {
            readiness.insert(topic, false);
        }

        Arc::new(Self {
            thing_name,
            topics,
            client: RwLock::new(WeakClient::default()),
            pending: Mutex::new(HashMap::new()),
            readiness,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn bind(&self, client: &Client) {
        *self.client.write() = client.downgrade();
    }

    fn client(&self) -> Result<Client> {
        self.client.read().upgrade().ok_or_else(|| {
            ClientError::Configuration(format!(
                "device {} is not attached to a client",
                self.thing_name
            ))
        })
    }

    pub fn topics(&self) -> &ShadowTopics {
        &self.topics
    }

    pub fn is_topic_ready(&self, topic: &str) -> bool {
        self.readiness.get(topic).map(|ready| *ready).unwrap_or(false)
    }

    /// Both acknowledgement topics of `command` are subscribed
    pub fn is_command_ready(&self, command: ShadowCommand) -> bool {
        self.is_topic_ready(&self.topics.ack(command, CommandAck::Accepted))
            && self.is_topic_ready(&self.topics.ack(command, CommandAck::Rejected))
    }

    /// Number of commands awaiting an acknowledgement
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Run a command and block until it is acknowledged or `timeout` elapses.
    ///
    /// Accepted acknowledgements are returned as-is; rejections become
    /// [`ClientError::AckRejected`].
    pub fn run_command_sync(
        self: &Arc<Self>,
        command: ShadowCommand,
        message: Message,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        let (sender, receiver) = mpsc::sync_channel(1);
        let id = self.submit(command, message, CommandCompletion::Blocking(sender))?;

        match effective_timeout(timeout) {
            None => receiver.recv().unwrap_or_else(|_| Err(abandoned(command))),
            Some(timeout) => match receiver.recv_timeout(timeout) {
                Ok(result) => result,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    self.take_pending(command, id);
                    tracing::debug!(thing = %self.thing_name, %command, "Command timed out");
                    Err(ClientError::Timeout(timeout))
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => Err(abandoned(command)),
            },
        }
    }

    /// Run a command without blocking; `callback` receives the acknowledgement.
    pub fn run_command<F>(
        self: &Arc<Self>,
        command: ShadowCommand,
        message: Message,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<Message>) + Send + 'static,
    {
        let id = self.submit(command, message, CommandCompletion::Callback(Box::new(callback)))?;

        if let Some(timeout) = effective_timeout(timeout) {
            let weak = Arc::downgrade(self);
            let armed = self.client().and_then(|client| {
                client.schedule_once(timeout, move || {
                    if let Some(manager) = weak.upgrade() {
                        manager.fail_command(command, id, ClientError::Timeout(timeout));
                    }
                })
            });
            if let Err(e) = armed {
                tracing::warn!(thing = %self.thing_name, "Could not arm command timeout: {}", e);
            }
        }

        Ok(())
    }

    fn submit(
        self: &Arc<Self>,
        command: ShadowCommand,
        mut message: Message,
        completion: CommandCompletion,
    ) -> Result<u64> {
        let client = self.client()?;

        let (id, ready) = {
            let mut pending = self.pending.lock();
            if pending.contains_key(&command) {
                return Err(ClientError::Configuration(format!(
                    "{} command already in flight for {}",
                    command, self.thing_name
                )));
            }

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let client_token = format!("{}-{}", self.thing_name, id);
            let stamped = document::with_client_token(message.payload().as_deref(), &client_token);
            if let Some(payload) = &stamped {
                message.set_payload(payload);
            }
            message.set_topic(self.topics.command(command));

            let ready = self.is_command_ready(command);
            pending.insert(
                command,
                PendingCommand {
                    id,
                    client_token: stamped.map(|_| client_token),
                    request: message.clone(),
                    published: ready,
                    completion,
                },
            );
            (id, ready)
        };

        if ready {
            self.publish(&client, command, id, message);
        } else {
            tracing::debug!(thing = %self.thing_name, %command, "Command held until acknowledgement topics are subscribed");
        }
        Ok(id)
    }

    fn publish(self: &Arc<Self>, client: &Client, command: ShadowCommand, id: u64, message: Message) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let published = client.publish_async(message, None, move |result| {
            if let (Err(e), Some(manager)) = (result, weak.upgrade()) {
                manager.fail_command(command, id, e);
            }
        });

        if let Err(e) = published {
            self.fail_command(command, id, e);
        }
    }

    fn take_pending(&self, command: ShadowCommand, id: u64) -> Option<PendingCommand> {
        let mut pending = self.pending.lock();
        match pending.get(&command) {
            Some(entry) if entry.id == id => pending.remove(&command),
            _ => None,
        }
    }

    fn fail_command(&self, command: ShadowCommand, id: u64, error: ClientError) {
        if let Some(entry) = self.take_pending(command, id) {
            tracing::debug!(thing = %self.thing_name, %command, "Command failed: {}", error);
            entry.completion.complete(Err(error));
        }
    }

    /// Record the outcome of an acknowledgement-topic subscription.
    pub fn on_subscription_ack(self: &Arc<Self>, topic: &str, success: bool) {
        self.readiness.insert(topic.to_string(), success);

        let Some((command, _)) = self.topics.parse_ack(topic) else {
            return;
        };

        if !success {
            tracing::warn!(thing = %self.thing_name, topic, "Subscription failed");
            let failed = self.pending.lock().remove(&command);
            if let Some(entry) = failed {
                entry.completion.complete(Err(ClientError::Connection(format!(
                    "subscription to {} failed",
                    topic
                ))));
            }
            return;
        }

        if !self.is_command_ready(command) {
            return;
        }

        let held = {
            let mut pending = self.pending.lock();
            match pending.get_mut(&command) {
                Some(entry) if !entry.published => {
                    entry.published = true;
                    Some((entry.id, entry.request.clone()))
                }
                _ => None,
            }
        };

        if let Some((id, request)) = held {
            match self.client() {
                Ok(client) => self.publish(&client, command, id, request),
                Err(e) => self.fail_command(command, id, e),
            }
        }
    }

    /// Resolve the pending command an acknowledgement belongs to.
    pub fn on_command_ack(&self, message: &Message) {
        let Some((command, ack)) = self.topics.parse_ack(message.topic()) else {
            return;
        };
        let received_token = message
            .payload()
            .and_then(|payload| document::extract_client_token(&payload));

        let entry = {
            let mut pending = self.pending.lock();
            let Some(entry) = pending.get(&command) else {
                tracing::debug!(thing = %self.thing_name, %command, "Acknowledgement without pending command");
                return;
            };

            let foreign = match (&entry.client_token, &received_token) {
                (Some(ours), Some(theirs)) => ours != theirs,
                _ => false,
            };
            if foreign || !entry.published {
                tracing::debug!(thing = %self.thing_name, %command, "Ignoring acknowledgement of another request");
                return;
            }
            pending.remove(&command)
        };

        if let Some(entry) = entry {
            let result = match ack {
                CommandAck::Accepted => Ok(message.clone()),
                CommandAck::Rejected => {
                    let mut rejected = message.clone();
                    let code = document::annotate_rejection(&mut rejected);
                    tracing::debug!(
                        thing = %self.thing_name,
                        %command,
                        error_code = ?rejected.error_code(),
                        "Command rejected"
                    );
                    Err(ClientError::AckRejected {
                        code,
                        message: rejected.error_message().unwrap_or_default().to_string(),
                    })
                }
            };
            entry.completion.complete(result);
        }
    }

    /// Fail every pending command and forget subscription readiness.
    pub fn on_deactivate(&self) {
        for mut entry in self.readiness.iter_mut() {
            *entry.value_mut() = false;
        }

        let drained: Vec<PendingCommand> = self.pending.lock().drain().map(|(_, e)| e).collect();
        for entry in drained {
            entry.completion.complete(Err(ClientError::Connection(format!(
                "device {} deactivated",
                self.thing_name
            ))));
        }
    }
}

fn abandoned(command: ShadowCommand) -> ClientError {
    ClientError::Connection(format!("{} command was abandoned", command))
}

impl fmt::Debug for CommandManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandManager")
            .field("thing_name", &self.thing_name)
            .field("pending", &self.pending_count())
            .finish()
    }
}
