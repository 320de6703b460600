//! Key and piece-event payload scanning.

use serde::{Deserialize, Serialize};

use crate::square::chess_square;
use crate::timeclock::decode_elapsed;

/// Front-panel keys, carried as 7-bit codes in key-notification frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Key {
    Back,
    Tick,
    Up,
    Down,
    Help,
    Play,
    /// Declared in the MCU's code table but never observed on the wire;
    /// long-press handling is synthesized host-side from a held `Play`.
    LongPlay,
}

impl Key {
    pub fn from_code(code: u8) -> Option<Key> {
        match code {
            0x01 => Some(Key::Back),
            0x10 => Some(Key::Tick),
            0x08 => Some(Key::Up),
            0x02 => Some(Key::Down),
            0x40 => Some(Key::Help),
            0x04 => Some(Key::Play),
            0x06 => Some(Key::LongPlay),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Key::Back => 0x01,
            Key::Tick => 0x10,
            Key::Up => 0x08,
            Key::Down => 0x02,
            Key::Help => 0x40,
            Key::Play => 0x04,
            Key::LongPlay => 0x06,
        }
    }
}

/// A key event found in a key-notification payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: Key,
    pub down: bool,
}

/// Scan a key payload for the event preamble:
///
/// ```text
/// 00 14 0a 05 <code> 00   key down
/// 00 14 0a 05 00 <code>   key up
/// ```
pub fn scan_key_event(payload: &[u8]) -> Option<KeyEvent> {
    if payload.len() < 6 {
        return None;
    }
    for i in 0..payload.len() - 5 {
        if payload[i] == 0x00
            && payload[i + 1] == 0x14
            && payload[i + 2] == 0x0a
            && payload[i + 3] == 0x05
        {
            let first = payload[i + 4];
            let second = payload[i + 5];
            if first != 0x00 {
                return Key::from_code(first).map(|key| KeyEvent { key, down: true });
            }
            if second != 0x00 {
                return Key::from_code(second).map(|key| KeyEvent { key, down: false });
            }
            return None;
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PieceEventKind {
    Lift,
    Place,
}

/// One physical sensor transition, already converted to chess indexing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PieceEvent {
    pub kind: PieceEventKind,
    /// Chess square index 0..63.
    pub square: u8,
    /// Seconds since game start, from the frame's time prefix.
    pub elapsed: f64,
}

/// Extract all piece events from a changes/notification payload.
///
/// Markers: `0x40` lift, `0x41` place; each followed by one hardware-square
/// byte. Several events can ride one frame. The time prefix (bytes before
/// the first marker) applies to every event in the frame.
pub fn scan_piece_events(payload: &[u8]) -> Vec<PieceEvent> {
    let elapsed = decode_elapsed(payload);
    let mut events = Vec::new();
    let mut i = 0;
    while i + 1 < payload.len() {
        match payload[i] {
            0x40 | 0x41 => {
                let hw = payload[i + 1];
                if hw < 64 {
                    events.push(PieceEvent {
                        kind: if payload[i] == 0x40 {
                            PieceEventKind::Lift
                        } else {
                            PieceEventKind::Place
                        },
                        square: chess_square(hw),
                        elapsed,
                    });
                }
                i += 2;
            }
            _ => i += 1,
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_down_then_up() {
        let down = [0x00, 0x14, 0x0a, 0x05, 0x10, 0x00];
        assert_eq!(
            scan_key_event(&down),
            Some(KeyEvent {
                key: Key::Tick,
                down: true
            })
        );
        let up = [0x00, 0x14, 0x0a, 0x05, 0x00, 0x10];
        assert_eq!(
            scan_key_event(&up),
            Some(KeyEvent {
                key: Key::Tick,
                down: false
            })
        );
    }

    #[test]
    fn key_preamble_not_at_start() {
        let payload = [0x7f, 0x00, 0x14, 0x0a, 0x05, 0x04, 0x00];
        assert_eq!(
            scan_key_event(&payload),
            Some(KeyEvent {
                key: Key::Play,
                down: true
            })
        );
    }

    #[test]
    fn no_event_in_garbage() {
        assert_eq!(scan_key_event(&[0x00, 0x14, 0x0a]), None);
        assert_eq!(scan_key_event(&[0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc]), None);
    }

    #[test]
    fn single_lift_with_time() {
        // 0x18 subseconds, 0x0c seconds, lift at hardware 0x30.
        let payload = [0x18, 0x0c, 0x40, 0x30];
        let events = scan_piece_events(&payload);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, PieceEventKind::Lift);
        assert_eq!(events[0].square, chess_square(0x30));
        assert!((events[0].elapsed - 12.09).abs() < 0.05);
    }

    #[test]
    fn multiple_events_in_one_frame() {
        let payload = [0x00, 0x40, 0x0c, 0x41, 0x1c];
        let events = scan_piece_events(&payload);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, PieceEventKind::Lift);
        assert_eq!(events[1].kind, PieceEventKind::Place);
    }

    #[test]
    fn out_of_range_square_is_skipped() {
        let payload = [0x40, 0x7b];
        assert!(scan_piece_events(&payload).is_empty());
    }
}
