//! Runtime settings.
//!
//! Layered: `config.toml` (if present) under environment overrides. All
//! reads go through the shared [`Settings`] handle — nothing else caches
//! configuration.

use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Sound gating classes. Every beep call carries one; legacy paths pass
/// `None` and are gated by the master switch alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundEventType {
    KeyPress,
    Error,
    GameEvent,
    PieceEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// `serial:/dev/serial0` or `tcp:HOST:PORT` (simulator).
    pub spec: String,
    pub baud: u32,
    /// Discovery attempts before startup fails.
    pub discovery_attempts: u32,
}

impl Default for LinkSettings {
    fn default() -> Self {
        LinkSettings {
            spec: "serial:/dev/serial0".to_string(),
            baud: 1_000_000,
            discovery_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundSettings {
    pub enabled: bool,
    pub key_press: bool,
    pub error: bool,
    pub game_event: bool,
    pub piece_event: bool,
}

impl Default for SoundSettings {
    fn default() -> Self {
        SoundSettings {
            enabled: true,
            key_press: true,
            error: true,
            game_event: true,
            piece_event: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InactivitySettings {
    /// Idle seconds before automatic shutdown.
    pub timeout_secs: u64,
    /// The on-screen countdown appears when this much time remains.
    pub countdown_secs: u64,
}

impl Default for InactivitySettings {
    fn default() -> Self {
        InactivitySettings {
            timeout_secs: 900,
            countdown_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorSettings {
    pub enabled: bool,
    /// TCP port the BLE/RFCOMM bridge connects to.
    pub port: u16,
}

impl Default for EmulatorSettings {
    fn default() -> Self {
        EmulatorSettings {
            enabled: true,
            port: 3335,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// UCI engine binary; `None` disables engine players.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub move_time_ms: u64,
    /// Sides the engine plays (requires `path`).
    pub play_white: bool,
    pub play_black: bool,
    /// Assistant for human sides: "hint" or "hand_and_brain".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            path: None,
            move_time_ms: 2000,
            play_white: false,
            play_black: false,
            assistant: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GameInfoSettings {
    pub event: String,
    pub site: String,
    pub round: String,
    pub white: String,
    pub black: String,
}

impl Default for GameInfoSettings {
    fn default() -> Self {
        GameInfoSettings {
            event: "Casual game".to_string(),
            site: "Tabula board".to_string(),
            round: String::new(),
            white: "White".to_string(),
            black: "Black".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsData {
    // Top-level values stay ahead of the tables for toml serialization.
    pub database_path: DatabasePath,
    pub fen_log_path: FenLogPath,
    /// Command run after a successful MCU sleep; `None` just exits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halt_command: Option<String>,
    pub link: LinkSettings,
    pub sound: SoundSettings,
    pub inactivity: InactivitySettings,
    pub emulator: EmulatorSettings,
    pub engine: EngineSettings,
    pub game_info: GameInfoSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabasePath(pub String);

impl Default for DatabasePath {
    fn default() -> Self {
        DatabasePath("tabula.db".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FenLogPath(pub String);

impl Default for FenLogPath {
    fn default() -> Self {
        FenLogPath("tabula.fen".to_string())
    }
}

/// Shared settings handle. Clone freely.
#[derive(Clone)]
pub struct Settings {
    data: Arc<RwLock<SettingsData>>,
}

impl Settings {
    /// Load from a toml file (missing/corrupt files fall back to defaults),
    /// then apply environment overrides.
    pub fn load(path: &str) -> Settings {
        let mut data = if Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(text) => match toml::from_str::<SettingsData>(&text) {
                    Ok(data) => {
                        info!("Settings: loaded {path}");
                        data
                    }
                    Err(e) => {
                        warn!("Settings: failed to parse {path}: {e}, using defaults");
                        SettingsData::default()
                    }
                },
                Err(e) => {
                    warn!("Settings: failed to read {path}: {e}, using defaults");
                    SettingsData::default()
                }
            }
        } else {
            info!("Settings: no {path}, using defaults");
            SettingsData::default()
        };

        if let Ok(spec) = std::env::var("TABULA_LINK") {
            data.link.spec = spec;
        }
        if let Some(port) = std::env::var("TABULA_EMULATOR_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            data.emulator.port = port;
        }
        if let Some(secs) = std::env::var("TABULA_INACTIVITY_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            data.inactivity.timeout_secs = secs;
        }
        if let Ok(db) = std::env::var("TABULA_DB") {
            data.database_path = DatabasePath(db);
        }
        if let Ok(engine) = std::env::var("TABULA_ENGINE") {
            data.engine.path = Some(engine);
        }

        Settings {
            data: Arc::new(RwLock::new(data)),
        }
    }

    pub fn from_data(data: SettingsData) -> Settings {
        Settings {
            data: Arc::new(RwLock::new(data)),
        }
    }

    pub fn snapshot(&self) -> SettingsData {
        self.data.read().unwrap().clone()
    }

    /// Master + per-event-type sound gate.
    pub fn sound_allowed(&self, event_type: Option<SoundEventType>) -> bool {
        let data = self.data.read().unwrap();
        if !data.sound.enabled {
            return false;
        }
        match event_type {
            None => true,
            Some(SoundEventType::KeyPress) => data.sound.key_press,
            Some(SoundEventType::Error) => data.sound.error,
            Some(SoundEventType::GameEvent) => data.sound.game_event,
            Some(SoundEventType::PieceEvent) => data.sound.piece_event,
        }
    }

    pub fn set_sound_enabled(&self, enabled: bool) {
        self.data.write().unwrap().sound.enabled = enabled;
    }

    pub fn inactivity(&self) -> InactivitySettings {
        self.data.read().unwrap().inactivity.clone()
    }

    pub fn link(&self) -> LinkSettings {
        self.data.read().unwrap().link.clone()
    }

    pub fn emulator(&self) -> EmulatorSettings {
        self.data.read().unwrap().emulator.clone()
    }

    pub fn engine(&self) -> EngineSettings {
        self.data.read().unwrap().engine.clone()
    }

    pub fn game_info(&self) -> GameInfoSettings {
        self.data.read().unwrap().game_info.clone()
    }

    pub fn database_path(&self) -> String {
        self.data.read().unwrap().database_path.0.clone()
    }

    pub fn fen_log_path(&self) -> String {
        self.data.read().unwrap().fen_log_path.0.clone()
    }

    pub fn halt_command(&self) -> Option<String> {
        self.data.read().unwrap().halt_command.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::from_data(SettingsData::default());
        assert!(settings.sound_allowed(None));
        assert!(settings.sound_allowed(Some(SoundEventType::Error)));
        assert_eq!(settings.inactivity().countdown_secs, 120);
    }

    #[test]
    fn master_switch_gates_everything() {
        let settings = Settings::from_data(SettingsData::default());
        settings.set_sound_enabled(false);
        assert!(!settings.sound_allowed(None));
        assert!(!settings.sound_allowed(Some(SoundEventType::GameEvent)));
    }

    #[test]
    fn per_event_switch_gates_only_its_class() {
        let mut data = SettingsData::default();
        data.sound.key_press = false;
        let settings = Settings::from_data(data);
        assert!(!settings.sound_allowed(Some(SoundEventType::KeyPress)));
        assert!(settings.sound_allowed(Some(SoundEventType::GameEvent)));
        // Legacy paths with no event type see only the master switch.
        assert!(settings.sound_allowed(None));
    }

    #[test]
    fn toml_roundtrip() {
        let text = toml::to_string(&SettingsData::default()).unwrap();
        let parsed: SettingsData = toml::from_str(&text).unwrap();
        assert_eq!(parsed.link.baud, 1_000_000);
    }
}
