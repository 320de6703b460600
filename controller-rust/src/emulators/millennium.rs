//! Millennium ChessLink personality.
//!
//! ASCII-letter commands, each byte carried with odd parity; every outgoing
//! string gets a two-hex-char XOR checksum. Board status is a 64-character
//! string, '.' for empty squares, FEN letters otherwise, rank 8 first.
//!
//! The 'L' command carries a 9×9 LED corner grid (81 hex pairs). It is
//! downmixed onto the 8×8 square grid: a square lights when all four of its
//! surrounding corner cells are lit, and the middle square of any straight
//! three-in-a-row run is dropped so a from/to move shows as two lamps.

use tracing::{debug, info, warn};

use crate::game::ManagerEvent;

use super::{Emulator, EmulatorAction, EmulatorContext};

use boardlink_types::Key;

const MAX_BUFFER: usize = 1000;
const EEPROM_SIZE: usize = 256;

/// EEPROM register whose bit 0 disables unsolicited status updates.
const REG_STATUS_MODE: usize = 2;

pub struct Millennium {
    rx_buffer: Vec<u8>,
    eeprom: [u8; EEPROM_SIZE],
    send_state_unsolicited: bool,
}

impl Default for Millennium {
    fn default() -> Self {
        Self::new()
    }
}

impl Millennium {
    pub fn new() -> Millennium {
        Millennium {
            rx_buffer: Vec::new(),
            eeprom: [0; EEPROM_SIZE],
            send_state_unsolicited: true,
        }
    }

    fn send_command(&self, text: &str, out: &mut Vec<EmulatorAction>) {
        debug!("[Millennium] send: {text}");
        let mut frame = Vec::with_capacity(text.len() + 2);
        let mut checksum = 0u8;
        for ch in text.bytes() {
            frame.push(odd_parity(ch));
            checksum ^= ch;
        }
        let hex = format!("{checksum:02x}");
        for ch in hex.bytes() {
            frame.push(odd_parity(ch));
        }
        out.push(EmulatorAction::Send(frame));
    }

    fn board_status_string(ctx: &EmulatorContext) -> String {
        let placement = ctx.fen.split_whitespace().next().unwrap_or("");
        let mut status = String::with_capacity(65);
        status.push('s');
        for c in placement.chars() {
            match c {
                '/' => {}
                '1'..='8' => {
                    for _ in 0..(c as u8 - b'0') {
                        status.push('.');
                    }
                }
                other => status.push(other),
            }
        }
        while status.len() < 65 {
            status.push('.');
        }
        status.truncate(65);
        status
    }

    fn send_board_status(&self, ctx: &EmulatorContext, out: &mut Vec<EmulatorAction>) {
        self.send_command(&Self::board_status_string(ctx), out);
    }

    /// Try to consume complete commands off the front of the buffer.
    /// Returns true if at least one command was handled.
    fn process_buffer(&mut self, ctx: &EmulatorContext, out: &mut Vec<EmulatorAction>) -> bool {
        let mut handled_any = false;
        loop {
            if self.rx_buffer.is_empty() {
                break;
            }
            let cmd = (self.rx_buffer[0] & 0x7f) as char;
            let handled = match cmd {
                'V' => {
                    if self.rx_buffer.len() < 3 {
                        break;
                    }
                    self.rx_buffer.drain(..3);
                    self.send_command("v3130", out);
                    true
                }
                'I' => {
                    if self.rx_buffer.len() < 7 {
                        break;
                    }
                    self.rx_buffer.drain(..7);
                    self.send_command("i0055mm\n", out);
                    true
                }
                'S' => {
                    if self.rx_buffer.len() < 3 {
                        break;
                    }
                    self.rx_buffer.drain(..3);
                    self.send_board_status(ctx, out);
                    true
                }
                'W' => {
                    if self.rx_buffer.len() < 7 {
                        break;
                    }
                    let Some(address) = self.hex_pair(1, 2) else {
                        warn!("[Millennium] invalid address in W command");
                        self.rx_buffer.remove(0);
                        break;
                    };
                    let Some(value) = self.hex_pair(3, 4) else {
                        warn!("[Millennium] invalid value in W command");
                        self.rx_buffer.remove(0);
                        break;
                    };
                    let echo: String = self.rx_buffer[1..=4]
                        .iter()
                        .map(|b| (b & 0x7f) as char)
                        .collect();
                    self.rx_buffer.drain(..7);
                    self.eeprom[usize::from(address)] = value;
                    info!("[Millennium] write EEPROM[{address}] = {value:#04x}");
                    self.send_command(&format!("w{echo}"), out);
                    if usize::from(address) == REG_STATUS_MODE && value & 0x01 == 1 {
                        self.send_state_unsolicited = false;
                    }
                    true
                }
                'X' => {
                    if self.rx_buffer.len() < 3 {
                        break;
                    }
                    self.rx_buffer.drain(..3);
                    out.push(EmulatorAction::LedsOff);
                    self.send_command("x", out);
                    true
                }
                'R' => {
                    if self.rx_buffer.len() < 5 {
                        break;
                    }
                    let Some(address) = self.hex_pair(1, 2) else {
                        warn!("[Millennium] invalid address in R command");
                        self.rx_buffer.remove(0);
                        break;
                    };
                    let echo: String = self.rx_buffer[1..=2]
                        .iter()
                        .map(|b| (b & 0x7f) as char)
                        .collect();
                    self.rx_buffer.drain(..5);
                    let value = self.eeprom[usize::from(address)];
                    self.send_command(&format!("r{echo}{value:02X}"), out);
                    true
                }
                'L' => {
                    // L + 2 slot-time chars + 81 hex pairs + 2 checksum.
                    const REQUIRED: usize = 1 + 2 + 81 * 2 + 2;
                    if self.rx_buffer.len() < REQUIRED {
                        break;
                    }
                    let mut pattern = [0u8; 81];
                    let mut ok = true;
                    for (i, cell) in pattern.iter_mut().enumerate() {
                        match self.hex_pair(3 + i * 2, 4 + i * 2) {
                            Some(v) => *cell = v,
                            None => {
                                warn!("[Millennium] invalid hex at LED cell {i}");
                                ok = false;
                                break;
                            }
                        }
                    }
                    if !ok {
                        self.rx_buffer.remove(0);
                        break;
                    }
                    self.rx_buffer.drain(..REQUIRED);
                    let squares = downmix_led_grid(&pattern);
                    out.push(EmulatorAction::LedsOff);
                    if !squares.is_empty() {
                        out.push(EmulatorAction::LedArray {
                            squares,
                            intensity: 5,
                            speed: 5,
                        });
                    }
                    self.send_command("l", out);
                    true
                }
                'T' => {
                    if self.rx_buffer.len() < 3 {
                        break;
                    }
                    self.rx_buffer.drain(..3);
                    self.send_command("t", out);
                    self.send_state_unsolicited = true;
                    true
                }
                other => {
                    debug!("[Millennium] unhandled command '{other}'");
                    self.rx_buffer.remove(0);
                    false
                }
            };
            if handled {
                handled_any = true;
            }
        }
        handled_any
    }

    fn hex_pair(&self, idx1: usize, idx2: usize) -> Option<u8> {
        if idx2 >= self.rx_buffer.len() {
            return None;
        }
        let c1 = (self.rx_buffer[idx1] & 0x7f) as char;
        let c2 = (self.rx_buffer[idx2] & 0x7f) as char;
        let hi = c1.to_digit(16)?;
        let lo = c2.to_digit(16)?;
        Some((hi * 16 + lo) as u8)
    }
}

impl Emulator for Millennium {
    fn name(&self) -> &'static str {
        "millennium"
    }

    fn parse_byte(
        &mut self,
        byte: u8,
        ctx: &EmulatorContext,
        out: &mut Vec<EmulatorAction>,
    ) -> bool {
        self.rx_buffer.push(byte);
        if self.rx_buffer.len() > MAX_BUFFER {
            warn!("[Millennium] buffer overflow, clearing");
            self.rx_buffer.clear();
            return false;
        }
        self.process_buffer(ctx, out)
    }

    fn handle_event(
        &mut self,
        event: &ManagerEvent,
        ctx: &EmulatorContext,
        out: &mut Vec<EmulatorAction>,
    ) {
        match event {
            ManagerEvent::NewGame | ManagerEvent::MoveMade { .. } | ManagerEvent::Takeback => {
                if self.send_state_unsolicited {
                    self.send_board_status(ctx, out);
                }
                if matches!(event, ManagerEvent::NewGame) {
                    out.push(EmulatorAction::LedsOff);
                }
            }
            ManagerEvent::Key(Key::Play) => {
                // Resend the board state on demand.
                out.push(EmulatorAction::Beep);
                self.send_board_status(ctx, out);
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.rx_buffer.clear();
        self.send_state_unsolicited = true;
    }
}

/// Odd parity over the low 7 bits, carried in bit 7.
pub fn odd_parity(byte: u8) -> u8 {
    let low = byte & 0x7f;
    let mut parity = 1u8;
    let mut bits = low;
    for _ in 0..7 {
        parity ^= bits & 1;
        bits >>= 1;
    }
    if parity == 1 {
        low | 0x80
    } else {
        low
    }
}

/// Corner-cell indices (9×9 grid) surrounding a chess square.
fn corner_cells(square: u8) -> [usize; 4] {
    let rank = usize::from(square / 8);
    let file = usize::from(square % 8);
    let base = (7 - rank) + 9 * file;
    [base, base + 1, base + 9, base + 10]
}

/// Downmix the 81-cell corner grid to the squares to light.
fn downmix_led_grid(pattern: &[u8; 81]) -> Vec<u8> {
    let mut corners_lit = [0u8; 64];
    for square in 0..64u8 {
        for cell in corner_cells(square) {
            if pattern[cell] > 0 {
                corners_lit[usize::from(square)] += 1;
            }
        }
    }
    // Only squares with all four corners lit count.
    for count in corners_lit.iter_mut() {
        if *count != 4 {
            *count = 0;
        }
    }
    // Drop the middle of straight three-square runs.
    let mut keep = corners_lit;
    for rank in 0..8usize {
        for file in 0..6usize {
            let i = rank * 8 + file;
            if corners_lit[i] == 4 && corners_lit[i + 1] == 4 && corners_lit[i + 2] == 4 {
                keep[i + 1] = 0;
            }
        }
    }
    for rank in 0..6usize {
        for file in 0..8usize {
            let i = rank * 8 + file;
            if corners_lit[i] == 4 && corners_lit[i + 8] == 4 && corners_lit[i + 16] == 4 {
                keep[i + 8] = 0;
            }
        }
    }
    (0..64u8).filter(|s| keep[usize::from(*s)] > 0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ctx() -> EmulatorContext {
        EmulatorContext {
            fen: "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1".to_string(),
            occupancy: [1; 64],
            battery_level: 15,
            charging: false,
            meta: HashMap::new(),
        }
    }

    fn feed(emulator: &mut Millennium, text: &str) -> (bool, Vec<EmulatorAction>) {
        let context = ctx();
        let mut out = Vec::new();
        let mut handled = false;
        for b in text.bytes() {
            handled |= emulator.parse_byte(odd_parity(b), &context, &mut out);
        }
        (handled, out)
    }

    fn decode(frame: &[u8]) -> String {
        frame.iter().map(|b| (b & 0x7f) as char).collect()
    }

    #[test]
    fn odd_parity_examples() {
        // 'V' = 0x56 has four set bits; odd parity adds the top bit.
        assert_eq!(odd_parity(0x56) & 0x7f, 0x56);
        for b in 0u8..=127 {
            let encoded = odd_parity(b);
            let ones = encoded.count_ones();
            assert_eq!(ones % 2, 1, "byte {b:#04x} not odd parity");
        }
    }

    #[test]
    fn version_request() {
        let mut emulator = Millennium::new();
        let (handled, out) = feed(&mut emulator, "Vxx");
        assert!(handled);
        match &out[0] {
            EmulatorAction::Send(frame) => {
                let text = decode(frame);
                assert!(text.starts_with("v3130"));
                assert_eq!(text.len(), "v3130".len() + 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn status_request_sends_dot_board() {
        let mut emulator = Millennium::new();
        let (handled, out) = feed(&mut emulator, "Sxx");
        assert!(handled);
        match &out[0] {
            EmulatorAction::Send(frame) => {
                let text = decode(frame);
                assert!(text.starts_with("srnbqkbnr"));
                // 's' + 64 squares + 2 checksum chars.
                assert_eq!(text.len(), 67);
                assert_eq!(&text[17..25], "........");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn outgoing_checksum_is_xor_of_chars() {
        let mut emulator = Millennium::new();
        let mut out = Vec::new();
        emulator.send_command("x", &mut out);
        let EmulatorAction::Send(frame) = &out[0] else {
            panic!()
        };
        let text = decode(frame);
        let expected = format!("{:02x}", b'x');
        assert_eq!(&text[1..], expected.as_str());
    }

    #[test]
    fn eeprom_write_and_read_roundtrip() {
        let mut emulator = Millennium::new();
        // W addr=0A value=3C
        let (handled, out) = feed(&mut emulator, "W0A3Cxx");
        assert!(handled);
        let EmulatorAction::Send(frame) = &out[0] else {
            panic!()
        };
        assert!(decode(frame).starts_with("w0A3C"));
        assert_eq!(emulator.eeprom[0x0a], 0x3c);

        let (handled, out) = feed(&mut emulator, "R0Axx");
        assert!(handled);
        let EmulatorAction::Send(frame) = &out[0] else {
            panic!()
        };
        assert!(decode(frame).starts_with("r0A3C"));
    }

    #[test]
    fn eeprom_register_two_disables_unsolicited_state() {
        let mut emulator = Millennium::new();
        assert!(emulator.send_state_unsolicited);
        feed(&mut emulator, "W0201xx");
        assert!(!emulator.send_state_unsolicited);
        // 'T' (reset) re-enables.
        feed(&mut emulator, "Txx");
        assert!(emulator.send_state_unsolicited);
    }

    #[test]
    fn led_grid_downmix_two_square_move() {
        // Light the corner cells of e2 (12) and e4 (28) plus e3 between
        // them; the run-elimination must drop e3.
        let mut pattern = [0u8; 81];
        for sq in [12u8, 20, 28] {
            for cell in corner_cells(sq) {
                pattern[cell] = 1;
            }
        }
        let squares = downmix_led_grid(&pattern);
        assert!(squares.contains(&12));
        assert!(squares.contains(&28));
        assert!(!squares.contains(&20));
    }

    #[test]
    fn partial_command_waits_for_more_bytes() {
        let mut emulator = Millennium::new();
        let (handled, out) = feed(&mut emulator, "S");
        assert!(!handled);
        assert!(out.is_empty());
        let (handled, _) = feed(&mut emulator, "xx");
        assert!(handled);
    }
}
