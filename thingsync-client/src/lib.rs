//! # thingsync client
//!
//! A managed publish/subscribe session for IoT devices, built on a pluggable
//! broker [`Transport`].
//!
//! ## Overview
//!
//! The client keeps a broker session usable across network failures. It
//! tracks the connection state, retries with exponential backoff, re-issues
//! subscriptions after every reconnect and routes inbound messages to the
//! handlers whose topic filter matches. All calls are synchronous or take a
//! completion callback; the background work runs on an internal tokio runtime
//! so callers never need async/await.
//!
//! ## Key Features
//!
//! - **Connection state machine**: `Disconnected`, `Connecting`, `Connected`, `Reconnecting`
//! - **Session recovery**: resubscribe, reactivate devices, replay queued publishes, then deliver
//! - **Wildcard dispatch**: `+` and `#` filters, each matching handler invoked once per message
//! - **Completion tokens**: blocking waits with optional deadlines or callbacks
//! - **Offline queue**: bounded buffer for publishes issued while reconnecting
//!
//! ## Usage
//!
//! ```rust,ignore
//! use thingsync_client::{Client, ClientConfig, LoopbackTransport, Message, Qos, Subscription};
//! use std::time::Duration;
//!
//! let client = Client::new(ClientConfig::new("porch-light"), LoopbackTransport::new())?;
//! client.connect(Some(Duration::from_secs(5)))?;
//!
//! client.subscribe(
//!     Subscription::new("sensors/+/temperature", Qos::AtLeastOnce, |message: Message| {
//!         println!("{}: {:?}", message.topic(), message.string_payload());
//!     }),
//!     None,
//! )?;
//!
//! client.publish("sensors/porch/temperature", Qos::AtMostOnce, "21.5", None)?;
//! client.disconnect(None)?;
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod loopback;
pub mod message;
pub mod offline;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod token;
pub mod topic;
pub mod transport;

pub use backoff::{BackoffError, ReconnectBackoff};
pub use client::{Client, WeakClient};
pub use config::ClientConfig;
pub use device::AttachedDevice;
pub use error::{ClientError, Result};
pub use loopback::{Behavior, LoopbackTransport, TransportCall};
pub use message::{Message, Qos, ShadowErrorCode};
pub use registry::{MessageHandler, Subscription, SubscriptionRegistry};
pub use scheduler::{TaskHandle, TaskScheduler};
pub use state::ConnectionState;
pub use token::{CompletionToken, TokenKind, TokenState};
pub use transport::{Transport, TransportEvents};
