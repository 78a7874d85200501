//! # thingsync-shadow
//!
//! Device shadow support for `thingsync-client`.
//!
//! A shadow is a JSON document kept by the service on behalf of a device. The
//! device reports its state into `state.reported`; applications write
//! `state.desired`, and the service publishes the difference as a delta.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use thingsync_client::{Client, ClientConfig, LoopbackTransport};
//! use thingsync_shadow::{DeviceSchema, PropertyDescriptor, ShadowConfig, ShadowDevice};
//!
//! # fn main() -> thingsync_client::Result<()> {
//! let client = Client::new(ClientConfig::new("lamp-client"), LoopbackTransport::new())?;
//!
//! let schema = DeviceSchema::new(vec![
//!     PropertyDescriptor::reported("firmware", || json!("1.4.2")),
//! ]);
//! let lamp = ShadowDevice::new("lamp", schema, ShadowConfig::default());
//!
//! client.attach(Arc::new(lamp.clone()))?;
//! client.connect(None)?;
//!
//! let document = lamp.get(None)?;
//! println!("{}", document);
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod config;
pub mod device;
pub mod document;
pub mod error;
pub mod manager;
pub mod property;

pub use command::{CommandAck, ShadowCommand, ShadowTopics};
pub use config::ShadowConfig;
pub use device::{ShadowDevice, UNKNOWN_VERSION};
pub use error::PropertyError;
pub use manager::{CommandCallback, CommandManager};
pub use property::{DeviceSchema, Getter, PropertyDescriptor, Setter};
