//! Shadow device configuration

use std::time::Duration;

use thingsync_client::Qos;

/// Configuration for a [`ShadowDevice`](crate::ShadowDevice)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowConfig {
    /// Period of the automatic report task; zero disables reporting
    /// Default: 3 seconds
    pub report_interval: Duration,

    /// Carry and reconcile the shadow document version
    /// Default: false
    pub enable_versioning: bool,

    /// QoS of periodic reports and version sync requests
    /// Default: AtMostOnce
    pub report_qos: Qos,

    /// QoS of the delta subscription
    /// Default: AtMostOnce
    pub shadow_update_qos: Qos,

    /// QoS of direct get/update/delete requests
    /// Default: AtMostOnce
    pub method_qos: Qos,

    /// QoS of the accepted/rejected subscriptions
    /// Default: AtMostOnce
    pub method_ack_qos: Qos,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            report_interval: Duration::from_secs(3),
            enable_versioning: false,
            report_qos: Qos::AtMostOnce,
            shadow_update_qos: Qos::AtMostOnce,
            method_qos: Qos::AtMostOnce,
            method_ack_qos: Qos::AtMostOnce,
        }
    }
}

impl ShadowConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    pub fn with_versioning(mut self, enabled: bool) -> Self {
        self.enable_versioning = enabled;
        self
    }

    pub fn with_report_qos(mut self, qos: Qos) -> Self {
        self.report_qos = qos;
        self
    }

    pub fn with_shadow_update_qos(mut self, qos: Qos) -> Self {
        self.shadow_update_qos = qos;
        self
    }

    pub fn with_method_qos(mut self, qos: Qos) -> Self {
        self.method_qos = qos;
        self
    }

    pub fn with_method_ack_qos(mut self, qos: Qos) -> Self {
        self.method_ack_qos = qos;
        self
    }

    /// Reporting disabled; the device only answers deltas and direct calls
    pub fn passive() -> Self {
        Self {
            report_interval: Duration::ZERO,
            ..Default::default()
        }
    }
}
