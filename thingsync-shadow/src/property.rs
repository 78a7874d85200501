//! Device property schema
//!
//! A device declares its shadow properties once, as a list of descriptors.
//! Each descriptor names a property, reads it as JSON and optionally writes
//! it back from JSON. Reported properties are rendered into periodic shadow
//! reports; updatable properties receive values from shadow deltas.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::PropertyError;

pub type Getter = Arc<dyn Fn() -> Value + Send + Sync>;
pub type Setter = Arc<dyn Fn(Value) -> Result<(), PropertyError> + Send + Sync>;

/// One shadow property
#[derive(Clone)]
pub struct PropertyDescriptor {
    name: String,
    getter: Getter,
    setter: Option<Setter>,
    report: bool,
    update: bool,
}

impl PropertyDescriptor {
    pub fn new(
        name: impl Into<String>,
        getter: Getter,
        setter: Option<Setter>,
        report: bool,
        update: bool,
    ) -> Self {
        Self {
            name: name.into(),
            getter,
            setter,
            report,
            update,
        }
    }

    /// Read-only property included in reports
    pub fn reported<G>(name: impl Into<String>, getter: G) -> Self
    where
        G: Fn() -> Value + Send + Sync + 'static,
    {
        Self::new(name, Arc::new(getter), None, true, false)
    }

    /// Property included in reports and writable from deltas
    pub fn updatable<G, S>(name: impl Into<String>, getter: G, setter: S) -> Self
    where
        G: Fn() -> Value + Send + Sync + 'static,
        S: Fn(Value) -> Result<(), PropertyError> + Send + Sync + 'static,
    {
        Self::new(name, Arc::new(getter), Some(Arc::new(setter)), true, true)
    }

    /// Stop including this property in reports
    pub fn without_report(mut self) -> Self {
        self.report = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_reported(&self) -> bool {
        self.report
    }

    pub fn is_updatable(&self) -> bool {
        self.update && self.setter.is_some()
    }

    pub fn read(&self) -> Value {
        (self.getter)()
    }

    pub fn write(&self, value: Value) -> Result<(), PropertyError> {
        match (&self.setter, self.update) {
            (Some(setter), true) => setter(value),
            _ => Err(PropertyError::NotUpdatable(self.name.clone())),
        }
    }
}

impl fmt::Debug for PropertyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyDescriptor")
            .field("name", &self.name)
            .field("report", &self.report)
            .field("update", &self.is_updatable())
            .finish()
    }
}

/// Immutable set of a device's properties, split into reported and updatable views
#[derive(Debug, Clone, Default)]
pub struct DeviceSchema {
    reported: Vec<PropertyDescriptor>,
    updatable: HashMap<String, PropertyDescriptor>,
    known: Vec<String>,
}

impl DeviceSchema {
    pub fn new(descriptors: Vec<PropertyDescriptor>) -> Self {
        let mut schema = Self::default();
        for descriptor in descriptors {
            schema.known.push(descriptor.name.clone());
            if descriptor.is_updatable() {
                schema
                    .updatable
                    .insert(descriptor.name.clone(), descriptor.clone());
            }
            if descriptor.is_reported() {
                schema.reported.push(descriptor);
            }
        }
        schema
    }

    pub fn has_reported(&self) -> bool {
        !self.reported.is_empty()
    }

    pub fn reported_names(&self) -> Vec<&str> {
        self.reported.iter().map(|d| d.name()).collect()
    }

    pub fn is_updatable(&self, name: &str) -> bool {
        self.updatable.contains_key(name)
    }

    /// Current values of every reported property
    pub fn render_reported(&self) -> Map<String, Value> {
        self.reported
            .iter()
            .map(|descriptor| (descriptor.name.clone(), descriptor.read()))
            .collect()
    }

    /// Write each entry of `state` to its updatable property.
    ///
    /// Unknown names and rejected values are logged and skipped; the rest of
    /// the state is still applied. Returns the names that were written.
    pub fn apply_update(&self, state: &Map<String, Value>) -> Vec<String> {
        let mut applied = Vec::new();

        for (name, value) in state {
            let Some(descriptor) = self.updatable.get(name) else {
                if self.known.iter().any(|known| known == name) {
                    tracing::warn!("{}", PropertyError::NotUpdatable(name.clone()));
                } else {
                    tracing::debug!(property = %name, "Ignoring unknown property in update");
                }
                continue;
            };

            match descriptor.write(value.clone()) {
                Ok(()) => applied.push(name.clone()),
                Err(e) => tracing::warn!("Failed to update property: {}", e),
            }
        }

        applied
    }
}
