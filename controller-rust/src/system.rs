//! Observable system status: battery, charger, connected client.
//!
//! The demultiplexer and battery poller write here; emulators (battery
//! responses) and the display status line read.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemStatus {
    /// Battery level on the MCU's 0..20 scale; `None` until first read.
    pub battery_level: Option<u8>,
    pub charger_connected: bool,
    /// Name of the emulator protocol a client is attached through, if any.
    pub client_type: Option<String>,
}

impl SystemStatus {
    pub fn battery_percent(&self) -> Option<u8> {
        self.battery_level.map(|level| level.min(20) * 5)
    }
}

#[derive(Clone, Default)]
pub struct SystemState {
    status: Arc<RwLock<SystemStatus>>,
}

impl SystemState {
    pub fn new() -> SystemState {
        SystemState::default()
    }

    pub fn snapshot(&self) -> SystemStatus {
        self.status.read().unwrap().clone()
    }

    pub fn set_battery(&self, level: u8, charging: bool) {
        let mut status = self.status.write().unwrap();
        status.battery_level = Some(level.min(20));
        status.charger_connected = charging;
    }

    pub fn charger_connected(&self) -> bool {
        self.status.read().unwrap().charger_connected
    }

    pub fn set_client_type(&self, client: Option<String>) {
        self.status.write().unwrap().client_type = client;
    }
}
