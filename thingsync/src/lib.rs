//! # thingsync
//!
//! Sync-first SDK for connected devices: a resilient publish/subscribe
//! session plus device shadow synchronization.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use thingsync::prelude::*;
//!
//! fn main() -> thingsync::Result<()> {
//!     thingsync::logging::init_logging_from_env().ok();
//!
//!     let config = ClientConfig::load()?;
//!     let client = Client::new(config, LoopbackTransport::new())?;
//!
//!     let schema = DeviceSchema::new(vec![
//!         PropertyDescriptor::reported("temperature", || serde_json::json!(21.5)),
//!     ]);
//!     let sensor = ShadowDevice::new("greenhouse-1", schema, ShadowConfig::default());
//!     client.attach(Arc::new(sensor))?;
//!
//!     client.connect(None)?;
//!     client.subscribe(
//!         Subscription::new("greenhouse/+/alerts", Qos::AtLeastOnce, |message: Message| {
//!             println!("{}: {:?}", message.topic(), message.string_payload());
//!         }),
//!         None,
//!     )?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! thingsync (facade, logging)
//!     ↓
//! thingsync-shadow (shadow commands, versioned reporting, deltas)
//!     ↓
//! thingsync-client (session, reconnect, dispatch, scheduling)
//!     ↓
//! Transport (broker connection supplied by the application)
//! ```

pub mod logging;

pub use thingsync_client as client;
pub use thingsync_shadow as shadow;

pub use thingsync_client::{
    AttachedDevice, Behavior, Client, ClientConfig, ClientError, CompletionToken,
    ConnectionState, LoopbackTransport, Message, MessageHandler, Qos, Result, ShadowErrorCode,
    Subscription, TaskHandle, TokenKind, TokenState, Transport, TransportCall, TransportEvents,
    WeakClient,
};
pub use thingsync_shadow::{
    DeviceSchema, PropertyDescriptor, PropertyError, ShadowCommand, ShadowConfig, ShadowDevice,
};

/// The types most applications need
pub mod prelude {
    pub use thingsync_client::{
        AttachedDevice, Client, ClientConfig, ClientError, ConnectionState, LoopbackTransport,
        Message, Qos, Subscription,
    };
    pub use thingsync_shadow::{
        DeviceSchema, PropertyDescriptor, PropertyError, ShadowConfig, ShadowDevice,
    };
}
