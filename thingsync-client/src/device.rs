//! Devices attached to a client session

use crate::client::Client;
use crate::error::Result;

/// Capability a device exposes to the connection manager.
///
/// The client activates attached devices once a session is live (after
/// resubscription) and deactivates them when the session drops or closes.
/// Both calls may repeat across reconnects and must tolerate it.
pub trait AttachedDevice: Send + Sync {
    /// Unique name used as the device table key
    fn thing_name(&self) -> &str;

    /// Called once on attach, before any activation.
    fn bind(&self, client: &Client);

    fn activate(&self) -> Result<()>;

    fn deactivate(&self) -> Result<()>;
}
