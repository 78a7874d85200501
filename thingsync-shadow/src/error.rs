//! Error types for the thingsync-shadow crate.

/// Failures raised by property setters while applying shadow updates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PropertyError {
    /// The property exists but does not accept remote updates
    #[error("Property {0} is not updatable")]
    NotUpdatable(String),

    /// The setter refused the value
    #[error("Invalid value for property {name}: {reason}")]
    InvalidValue { name: String, reason: String },
}

impl PropertyError {
    /// Shorthand for setters rejecting a value
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        PropertyError::InvalidValue {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
