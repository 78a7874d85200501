//! Shared helpers for client integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thingsync_client::{AttachedDevice, Client, ClientConfig, LoopbackTransport, Result};

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn test_config(client_id: &str) -> ClientConfig {
    ClientConfig::fast_retry(client_id).with_server_ack_timeout(Duration::from_secs(2))
}

/// Route SDK logs to the test harness; `RUST_LOG` selects the level.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn connected_client(client_id: &str) -> (Client, LoopbackTransport) {
    init_test_logging();
    let transport = LoopbackTransport::new();
    let client = Client::new(test_config(client_id), transport.clone()).unwrap();
    client.connect(Some(Duration::from_secs(2))).unwrap();
    assert!(wait_until(Duration::from_secs(2), || client.is_session_ready()));
    (client, transport)
}

/// Device that records its lifecycle calls
pub struct RecordingDevice {
    name: String,
    pub events: Mutex<Vec<&'static str>>,
}

impl RecordingDevice {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| **e == event).count()
    }
}

impl AttachedDevice for RecordingDevice {
    fn thing_name(&self) -> &str {
        &self.name
    }

    fn bind(&self, _client: &Client) {
        self.events.lock().push("bind");
    }

    fn activate(&self) -> Result<()> {
        self.events.lock().push("activate");
        Ok(())
    }

    fn deactivate(&self) -> Result<()> {
        self.events.lock().push("deactivate");
        Ok(())
    }
}
