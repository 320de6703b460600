//! Chessnut Air personality.
//!
//! Commands are `[cmd, length, payload...]`. Position notifications are
//! 38 bytes: header `[0x01, 0x24]`, 32 position bytes packing two squares
//! per nibble-coded byte from h8 down to a1, a little-endian uptime
//! counter, and two reserved zeros.

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::game::ManagerEvent;

use super::{Emulator, EmulatorAction, EmulatorContext};

const CMD_INIT: u8 = 0x0b;
const CMD_LED_CONTROL: u8 = 0x0a;
const CMD_ENABLE_REPORTING: u8 = 0x21;
const CMD_HAPTIC: u8 = 0x27;
const CMD_BATTERY_REQUEST: u8 = 0x29;
const CMD_SOUND: u8 = 0x31;

const RESP_FEN_DATA: u8 = 0x01;
const RESP_BATTERY: u8 = 0x2a;

const VALID_COMMANDS: [u8; 6] = [
    CMD_INIT,
    CMD_LED_CONTROL,
    CMD_ENABLE_REPORTING,
    CMD_HAPTIC,
    CMD_BATTERY_REQUEST,
    CMD_SOUND,
];

/// FEN letter to Chessnut piece code.
fn piece_code(c: char) -> u8 {
    match c {
        'q' => 1,
        'k' => 2,
        'b' => 3,
        'p' => 4,
        'n' => 5,
        'R' => 6,
        'P' => 7,
        'r' => 8,
        'B' => 9,
        'N' => 10,
        'Q' => 11,
        'K' => 12,
        _ => 0,
    }
}

pub struct Chessnut {
    buffer: Vec<u8>,
    reporting_enabled: bool,
    last_fen: Option<String>,
    started: Instant,
}

impl Default for Chessnut {
    fn default() -> Self {
        Self::new()
    }
}

impl Chessnut {
    pub fn new() -> Chessnut {
        Chessnut {
            buffer: Vec::new(),
            reporting_enabled: false,
            last_fen: None,
            started: Instant::now(),
        }
    }

    fn handle_command(
        &mut self,
        cmd: u8,
        payload: &[u8],
        ctx: &EmulatorContext,
        out: &mut Vec<EmulatorAction>,
    ) -> bool {
        match cmd {
            CMD_INIT => {
                info!("[Chessnut] init/config command");
                true
            }
            CMD_ENABLE_REPORTING => {
                info!("[Chessnut] reporting enabled");
                self.reporting_enabled = true;
                self.send_fen_notification(ctx, out);
                true
            }
            CMD_HAPTIC => {
                debug!(
                    "[Chessnut] haptic {}",
                    if payload.first() == Some(&1) { "on" } else { "off" }
                );
                true
            }
            CMD_BATTERY_REQUEST => {
                // Battery byte: bit 7 charging, bits 0-6 percentage.
                let percent = ctx.battery_level.min(20) * 5;
                let mut battery = percent & 0x7f;
                if ctx.charging {
                    battery |= 0x80;
                }
                out.push(EmulatorAction::Send(vec![RESP_BATTERY, 0x02, battery, 0x00]));
                true
            }
            CMD_SOUND => {
                debug!(
                    "[Chessnut] sound {}",
                    if payload.first() == Some(&1) { "on" } else { "off" }
                );
                true
            }
            CMD_LED_CONTROL => {
                self.handle_led_command(payload, out);
                true
            }
            other => {
                warn!("[Chessnut] unknown command 0x{other:02x}");
                false
            }
        }
    }

    /// 8 payload bytes, one per rank: byte 0 = rank 8 down to byte 7 =
    /// rank 1; within a byte the MSB is file a.
    fn handle_led_command(&mut self, payload: &[u8], out: &mut Vec<EmulatorAction>) {
        if payload.len() < 8 {
            warn!("[Chessnut] LED command too short: {} bytes", payload.len());
            return;
        }
        let mut squares = Vec::new();
        for (row, byte) in payload[..8].iter().enumerate() {
            let rank = 7 - row as u8;
            for file in 0..8u8 {
                if byte & (1 << (7 - file)) != 0 {
                    squares.push(rank * 8 + file);
                }
            }
        }
        if squares.is_empty() {
            out.push(EmulatorAction::LedsOff);
        } else {
            out.push(EmulatorAction::LedArray {
                squares,
                intensity: 5,
                speed: 3,
            });
        }
    }

    /// Pack the position into the 32-byte wire layout: squares h8, g8, ...
    /// a8, h7, ... a1; first square of each pair in the low nibble.
    fn position_bytes(fen: &str) -> [u8; 32] {
        let placement = fen.split_whitespace().next().unwrap_or("");
        // board[rank_idx][file], rank_idx 0 = rank 8.
        let mut board = [[0u8; 8]; 8];
        for (rank_idx, rank_str) in placement.split('/').take(8).enumerate() {
            let mut file = 0usize;
            for c in rank_str.chars() {
                if file >= 8 {
                    break;
                }
                if let Some(skip) = c.to_digit(10) {
                    file += skip as usize;
                } else {
                    board[rank_idx][file] = piece_code(c);
                    file += 1;
                }
            }
        }
        let mut packed = [0u8; 32];
        let mut square_idx = 0usize;
        for rank in board.iter() {
            for file in (0..8).rev() {
                let code = rank[file] & 0x0f;
                let byte = square_idx / 2;
                if square_idx % 2 == 0 {
                    packed[byte] |= code;
                } else {
                    packed[byte] |= code << 4;
                }
                square_idx += 1;
            }
        }
        packed
    }

    fn send_fen_notification(&mut self, ctx: &EmulatorContext, out: &mut Vec<EmulatorAction>) {
        if self.last_fen.as_deref() == Some(ctx.fen.as_str()) {
            debug!("[Chessnut] FEN unchanged, skipping notification");
            return;
        }
        self.last_fen = Some(ctx.fen.clone());

        let uptime = (self.started.elapsed().as_secs() & 0xffff) as u16;
        let mut frame = Vec::with_capacity(38);
        frame.push(RESP_FEN_DATA);
        frame.push(0x24);
        frame.extend_from_slice(&Self::position_bytes(&ctx.fen));
        frame.push((uptime & 0xff) as u8);
        frame.push((uptime >> 8) as u8);
        frame.push(0x00);
        frame.push(0x00);
        out.push(EmulatorAction::Send(frame));
    }
}

impl Emulator for Chessnut {
    fn name(&self) -> &'static str {
        "chessnut"
    }

    fn parse_byte(
        &mut self,
        byte: u8,
        ctx: &EmulatorContext,
        out: &mut Vec<EmulatorAction>,
    ) -> bool {
        self.buffer.push(byte);

        // The first byte must be a known command, otherwise these bytes
        // belong to some other protocol.
        if !VALID_COMMANDS.contains(&self.buffer[0]) {
            self.buffer.clear();
            return false;
        }
        if self.buffer.len() < 2 {
            return false;
        }
        let cmd = self.buffer[0];
        let length = usize::from(self.buffer[1]);
        if length > 64 {
            debug!("[Chessnut] implausible length {length}, clearing");
            self.buffer.clear();
            return false;
        }
        if self.buffer.len() < 2 + length {
            return false;
        }
        let payload: Vec<u8> = self.buffer[2..2 + length].to_vec();
        self.buffer.drain(..2 + length);
        self.handle_command(cmd, &payload, ctx, out)
    }

    fn handle_event(
        &mut self,
        event: &ManagerEvent,
        ctx: &EmulatorContext,
        out: &mut Vec<EmulatorAction>,
    ) {
        if !self.reporting_enabled {
            return;
        }
        match event {
            ManagerEvent::PieceLift { .. }
            | ManagerEvent::PiecePlace { .. }
            | ManagerEvent::MoveMade { .. }
            | ManagerEvent::Takeback
            | ManagerEvent::NewGame => {
                self.send_fen_notification(ctx, out);
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.reporting_enabled = false;
        self.last_fen = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const STARTING: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

    fn ctx(fen: &str) -> EmulatorContext {
        EmulatorContext {
            fen: fen.to_string(),
            occupancy: [0; 64],
            battery_level: 17,
            charging: true,
            meta: HashMap::new(),
        }
    }

    fn feed(emulator: &mut Chessnut, bytes: &[u8], fen: &str) -> (bool, Vec<EmulatorAction>) {
        let context = ctx(fen);
        let mut out = Vec::new();
        let mut handled = false;
        for b in bytes {
            handled |= emulator.parse_byte(*b, &context, &mut out);
        }
        (handled, out)
    }

    /// Decode the 32-byte packed position back to a piece-placement FEN.
    fn decode_position(packed: &[u8]) -> String {
        const CODES: [Option<char>; 13] = [
            None,
            Some('q'),
            Some('k'),
            Some('b'),
            Some('p'),
            Some('n'),
            Some('R'),
            Some('P'),
            Some('r'),
            Some('B'),
            Some('N'),
            Some('Q'),
            Some('K'),
        ];
        let mut board = [[None::<char>; 8]; 8];
        for square_idx in 0..64usize {
            let byte = packed[square_idx / 2];
            let code = if square_idx % 2 == 0 {
                byte & 0x0f
            } else {
                byte >> 4
            };
            let rank_idx = square_idx / 8;
            let file = 7 - (square_idx % 8);
            board[rank_idx][file] = CODES[usize::from(code).min(12)];
        }
        let mut fen = String::new();
        for (i, rank) in board.iter().enumerate() {
            if i > 0 {
                fen.push('/');
            }
            let mut empty = 0;
            for square in rank {
                match square {
                    Some(c) => {
                        if empty > 0 {
                            fen.push_str(&empty.to_string());
                            empty = 0;
                        }
                        fen.push(*c);
                    }
                    None => empty += 1,
                }
            }
            if empty > 0 {
                fen.push_str(&empty.to_string());
            }
        }
        fen
    }

    #[test]
    fn enable_reporting_sends_38_byte_fen_frame() {
        let mut emulator = Chessnut::new();
        let (handled, out) = feed(&mut emulator, &[CMD_ENABLE_REPORTING, 1, 0], STARTING);
        assert!(handled);
        let EmulatorAction::Send(frame) = &out[0] else {
            panic!()
        };
        assert_eq!(frame.len(), 38);
        assert_eq!(frame[0], RESP_FEN_DATA);
        assert_eq!(frame[1], 0x24);
        assert_eq!(&frame[36..], &[0, 0]);
    }

    #[test]
    fn position_encoding_roundtrips() {
        for fen in [
            STARTING,
            "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 1",
            "r3k2r/pppppppp/8/8/8/8/PPPPPPPP/R4RK1 b kq - 1 1",
            "8/8/8/8/8/8/8/4K2k w - - 0 1",
        ] {
            let packed = Chessnut::position_bytes(fen);
            let placement = fen.split_whitespace().next().unwrap();
            assert_eq!(decode_position(&packed), placement, "fen {fen}");
        }
    }

    #[test]
    fn battery_response_carries_charging_bit() {
        let mut emulator = Chessnut::new();
        let (handled, out) = feed(&mut emulator, &[CMD_BATTERY_REQUEST, 0], STARTING);
        assert!(handled);
        let EmulatorAction::Send(frame) = &out[0] else {
            panic!()
        };
        assert_eq!(frame[0], RESP_BATTERY);
        assert_eq!(frame[1], 0x02);
        assert_eq!(frame[2] & 0x7f, 85); // 17 * 5 percent
        assert_eq!(frame[2] & 0x80, 0x80); // charging
        assert_eq!(frame[3], 0);
    }

    #[test]
    fn led_bitmap_maps_rank8_msb_file_a() {
        let mut emulator = Chessnut::new();
        // Rank 8 byte 0x80 = a8; rank 1 byte 0x01 = h1.
        let mut payload = vec![CMD_LED_CONTROL, 8];
        payload.extend_from_slice(&[0x80, 0, 0, 0, 0, 0, 0, 0x01]);
        let (handled, out) = feed(&mut emulator, &payload, STARTING);
        assert!(handled);
        match &out[0] {
            EmulatorAction::LedArray { squares, .. } => {
                assert_eq!(squares, &vec![56, 7]); // a8, h1
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fen_notifications_deduplicate() {
        let mut emulator = Chessnut::new();
        feed(&mut emulator, &[CMD_ENABLE_REPORTING, 1, 0], STARTING);
        let mut out = Vec::new();
        emulator.handle_event(
            &ManagerEvent::MoveMade {
                uci: "e2e4".to_string(),
                fen: "x".to_string(),
            },
            &ctx(STARTING),
            &mut out,
        );
        // Same FEN as the enable notification: suppressed.
        assert!(out.is_empty());
        emulator.handle_event(
            &ManagerEvent::MoveMade {
                uci: "e2e4".to_string(),
                fen: "y".to_string(),
            },
            &ctx("rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 1"),
            &mut out,
        );
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn foreign_bytes_are_rejected_immediately() {
        let mut emulator = Chessnut::new();
        let (handled, out) = feed(&mut emulator, &[0x56, 0x33, 0x12], STARTING);
        assert!(!handled);
        assert!(out.is_empty());
        assert!(emulator.buffer.is_empty());
    }
}
