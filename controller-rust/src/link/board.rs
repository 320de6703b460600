//! Typed board operations over the bus.
//!
//! Everything above this module speaks chess indexing (a1 = 0 .. h8 = 63);
//! the conversion to the hardware matrix happens here and nowhere higher.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use boardlink_types::{chess_square, hardware_square, Command};

use super::bus::Bus;
use super::LinkError;
use crate::settings::{Settings, SoundEventType};

/// Occupancy vector in chess-index order; 1 = piece detected.
pub type Occupancy = [u8; 64];

/// Snapshot reply: 6 header bytes + 64 big-endian sensor words.
const SNAPSHOT_REPLY_LEN: usize = 6 + 128;

/// Sensor thresholds separating "piece present" from noise.
const SENSOR_LOW: u16 = 300;
const SENSOR_HIGH: u16 = 32000;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundKind {
    General,
    Factory,
    PowerOn,
    PowerOff,
    Wrong,
    WrongMove,
}

impl SoundKind {
    fn command(self) -> Command {
        match self {
            SoundKind::General => Command::SoundGeneral,
            SoundKind::Factory => Command::SoundFactory,
            SoundKind::PowerOn => Command::SoundPowerOn,
            SoundKind::PowerOff => Command::SoundPowerOff,
            SoundKind::Wrong => Command::SoundWrong,
            SoundKind::WrongMove => Command::SoundWrongMove,
        }
    }
}

#[derive(Clone)]
pub struct BoardController {
    bus: Bus,
    settings: Settings,
    meta: Arc<StdMutex<Option<HashMap<String, String>>>>,
}

impl BoardController {
    pub fn new(bus: Bus, settings: Settings) -> BoardController {
        BoardController {
            bus,
            settings,
            meta: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    // ── Occupancy ────────────────────────────────────────────────────────

    /// Read the 64-square occupancy vector (chess order).
    pub async fn get_state(&self) -> Result<Occupancy, LinkError> {
        let raw = self
            .bus
            .request_raw(
                Command::SnapshotF0,
                None,
                SNAPSHOT_REPLY_LEN,
                REQUEST_TIMEOUT,
                false,
            )
            .await?;
        Ok(decode_snapshot(&raw))
    }

    /// Occupancy read that yields to any pending high-priority request;
    /// returns [`LinkError::Skipped`] instead of waiting.
    pub async fn get_state_low_priority(&self) -> Result<Occupancy, LinkError> {
        let raw = self
            .bus
            .request_raw(
                Command::SnapshotF0,
                None,
                SNAPSHOT_REPLY_LEN,
                REQUEST_TIMEOUT,
                true,
            )
            .await?;
        Ok(decode_snapshot(&raw))
    }

    // ── LEDs ─────────────────────────────────────────────────────────────

    pub async fn leds_off(&self) -> Result<(), LinkError> {
        self.bus.send_command(Command::LedsOff, None).await
    }

    /// Flash a single square. `repeat == 0` keeps flashing until the next
    /// LED command.
    pub async fn led(&self, square: u8, intensity: u8, speed: u8, repeat: u8) -> Result<(), LinkError> {
        let payload = [
            0x05,
            speed.clamp(1, 100),
            repeat,
            intensity.clamp(0, 10),
            hardware_square(square & 63),
        ];
        self.bus.send_command(Command::LedFlash, Some(&payload)).await
    }

    /// Guidance arrow from one square to another.
    pub async fn led_from_to(
        &self,
        from: u8,
        to: u8,
        intensity: u8,
        speed: u8,
        repeat: u8,
    ) -> Result<(), LinkError> {
        let payload = [
            0x05,
            speed.clamp(1, 100),
            repeat,
            intensity.clamp(0, 10),
            hardware_square(from & 63),
            hardware_square(to & 63),
        ];
        self.bus.send_command(Command::LedFlash, Some(&payload)).await
    }

    /// Flash a set of squares together.
    pub async fn led_array(
        &self,
        squares: &[u8],
        intensity: u8,
        speed: u8,
        repeat: u8,
    ) -> Result<(), LinkError> {
        let mut payload = vec![0x05, speed.clamp(1, 100), repeat, intensity.clamp(0, 10)];
        payload.extend(
            squares
                .iter()
                .take(64)
                .map(|sq| hardware_square(sq & 63)),
        );
        self.bus.send_command(Command::LedFlash, Some(&payload)).await
    }

    // ── Sound ────────────────────────────────────────────────────────────

    /// Beep, gated by the sound policy. Callers without a classification
    /// pass `None` and are gated only by the master switch.
    pub async fn beep(&self, kind: SoundKind, event_type: Option<SoundEventType>) {
        if !self.settings.sound_allowed(event_type) {
            return;
        }
        if let Err(e) = self.bus.send_command(kind.command(), None).await {
            warn!("Board: beep failed: {e}");
        }
    }

    // ── Power ────────────────────────────────────────────────────────────

    /// Put the MCU to sleep. The MCU keeps draining the battery if this
    /// never gets acknowledged, so exhausting the retries is logged at
    /// error level and surfaced to the caller.
    pub async fn sleep(&self, retries: u32, retry_delay: Duration) -> Result<(), LinkError> {
        let mut last = LinkError::Timeout { expected: 0xb1 };
        for attempt in 0..=retries {
            match self
                .bus
                .request(Command::Sleep, None, REQUEST_TIMEOUT, 0)
                .await
            {
                Ok(_) => {
                    info!("Board: MCU acknowledged sleep");
                    return Ok(());
                }
                Err(e) => {
                    warn!("Board: sleep attempt {}/{} failed: {e}", attempt + 1, retries + 1);
                    last = e;
                }
            }
            if attempt < retries {
                tokio::time::sleep(retry_delay).await;
            }
        }
        error!("Board: MCU never acknowledged sleep - it will stay powered and drain the battery");
        Err(last)
    }

    // ── Battery ──────────────────────────────────────────────────────────

    /// Battery level (0..20) and charger state.
    pub async fn get_battery(&self) -> Result<(u8, bool), LinkError> {
        let payload = self
            .bus
            .request(Command::SendBatteryInfo, None, Duration::from_secs(1), 0)
            .await?;
        let status = payload.first().copied().unwrap_or(0);
        let level = status & 0x1f;
        let charging = ((status >> 5) & 0x07) == 1;
        Ok((level, charging))
    }

    // ── Metadata ─────────────────────────────────────────────────────────

    /// Cached metadata from the trademark response. Keys: `serial no`,
    /// `software version`, `hardware version`, `build`, `tm`.
    pub async fn get_meta(&self, key: &str) -> Option<String> {
        {
            let cache = self.meta.lock().unwrap();
            if let Some(map) = cache.as_ref() {
                return map.get(key).cloned();
            }
        }
        match self
            .bus
            .request(Command::SendTrademark, None, REQUEST_TIMEOUT, 2)
            .await
        {
            Ok(payload) => {
                let text = String::from_utf8_lossy(&payload).to_string();
                let map = parse_trademark(&text);
                let value = map.get(key).cloned();
                *self.meta.lock().unwrap() = Some(map);
                value
            }
            Err(e) => {
                warn!("Board: trademark read failed: {e}");
                None
            }
        }
    }
}

fn decode_snapshot(raw: &[u8]) -> Occupancy {
    let mut occupancy = [0u8; 64];
    if raw.len() < SNAPSHOT_REPLY_LEN {
        return occupancy;
    }
    let payload = &raw[6..6 + 128];
    for hw in 0..64 {
        let word = (u16::from(payload[hw * 2]) << 8) | u16::from(payload[hw * 2 + 1]);
        if (SENSOR_LOW..=SENSOR_HIGH).contains(&word) {
            occupancy[usize::from(chess_square(hw as u8))] = 1;
        }
    }
    occupancy
}

fn parse_trademark(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(first) = text.lines().next() {
        map.insert("tm".to_string(), first.trim().to_string());
    }
    for line in text.lines() {
        for part in line.split(',') {
            if let Some((key, value)) = part.split_once(':') {
                let key = key.trim().to_lowercase();
                let value = value.trim().to_string();
                if matches!(
                    key.as_str(),
                    "serial no" | "software version" | "hardware version" | "build"
                ) {
                    map.insert(key, value);
                }
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_decoding_applies_thresholds_and_rotation() {
        let mut raw = vec![0u8; SNAPSHOT_REPLY_LEN];
        // Hardware square 0 (a8): strong signal.
        raw[6] = 0x01;
        raw[7] = 0x90; // 400
        // Hardware square 1 (b8): below threshold.
        raw[8] = 0x00;
        raw[9] = 0x64; // 100
        // Hardware square 63 (h1): in range.
        raw[6 + 126] = 0x02;
        raw[6 + 127] = 0x00; // 512
        let occ = decode_snapshot(&raw);
        assert_eq!(occ[usize::from(chess_square(0))], 1); // a8
        assert_eq!(occ[usize::from(chess_square(1))], 0);
        assert_eq!(occ[usize::from(chess_square(63))], 1); // h1
        assert_eq!(occ.iter().map(|b| *b as u32).sum::<u32>(), 2);
    }

    #[test]
    fn short_snapshot_reply_is_empty_board() {
        let occ = decode_snapshot(&[0u8; 10]);
        assert!(occ.iter().all(|b| *b == 0));
    }

    #[test]
    fn trademark_parse_extracts_fields() {
        let text = "Digital Game Technology\r\nCopyright (c) 2021 DGT\r\n\
                    software version: 1.00, build: 210722\r\n\
                    hardware version: 1.00, serial no: P00000000X";
        let map = parse_trademark(text);
        assert_eq!(map.get("software version").unwrap(), "1.00");
        assert_eq!(map.get("build").unwrap(), "210722");
        assert_eq!(map.get("serial no").unwrap(), "P00000000X");
        assert_eq!(map.get("tm").unwrap(), "Digital Game Technology");
    }
}
