//! DGT Pegasus personality.
//!
//! Long-form packets `<type> <len_hi> <len_lo> <payload>` outbound; inbound
//! commands are either single short bytes or `<type> <length> <payload> 00`
//! frames found by scanning back from the terminator. The session starts
//! with the app's initial command `0x40`.

use tracing::{debug, info, warn};

use boardlink_types::{chess_square, hardware_square};

use crate::game::ManagerEvent;

use super::{Emulator, EmulatorAction, EmulatorContext};

const MAX_BUFFER: usize = 1000;

// Inbound command bytes.
const CMD_INITIAL: u8 = 0x40;
const CMD_BOARD_DUMP: u8 = 0x42;
const CMD_UNKNOWN_44: u8 = 0x44;
const CMD_LONG_SERIAL: u8 = 0x45;
const CMD_TRADEMARK: u8 = 0x47;
const CMD_VERSION: u8 = 0x4d;
const CMD_SERIAL: u8 = 0x55;
const CMD_LED_CONTROL: u8 = 0x60;
const CMD_DEVELOPER_KEY: u8 = 0x63;
const CMD_BATTERY: u8 = 0x32;

// Response types.
const RESP_BOARD_DUMP: u8 = 0x86;
const RESP_LONG_SERIAL: u8 = 0x91;
const RESP_TRADEMARK: u8 = 0x92;
const RESP_VERSION: u8 = 0x93;
const RESP_BATTERY: u8 = 0xa0;
const RESP_SERIAL: u8 = 0xa2;
const RESP_FIELD_UPDATE: u8 = 0x8e;

/// Commands carried as one bare byte (no frame).
const SHORT_COMMANDS: [u8; 8] = [
    CMD_INITIAL,
    CMD_BOARD_DUMP,
    CMD_UNKNOWN_44,
    CMD_LONG_SERIAL,
    CMD_TRADEMARK,
    CMD_VERSION,
    CMD_SERIAL,
    CMD_BATTERY,
];

/// All command bytes the backward frame scan will accept.
const VALID_COMMANDS: [u8; 10] = [
    CMD_INITIAL,
    CMD_BOARD_DUMP,
    CMD_UNKNOWN_44,
    CMD_LONG_SERIAL,
    CMD_TRADEMARK,
    CMD_VERSION,
    CMD_SERIAL,
    CMD_LED_CONTROL,
    CMD_DEVELOPER_KEY,
    CMD_BATTERY,
];

#[derive(Debug, PartialEq, Eq)]
enum ParserState {
    WaitingForInitial,
    WaitingForPacket,
}

pub struct Pegasus {
    buffer: Vec<u8>,
    state: ParserState,
}

impl Default for Pegasus {
    fn default() -> Self {
        Self::new()
    }
}

impl Pegasus {
    pub fn new() -> Pegasus {
        Pegasus {
            buffer: Vec::new(),
            state: ParserState::WaitingForInitial,
        }
    }

    fn begin(&mut self, out: &mut Vec<EmulatorAction>) {
        info!("[Pegasus] initial command received, beginning protocol");
        self.state = ParserState::WaitingForPacket;
        out.push(EmulatorAction::LedsOff);
    }

    /// Outbound frame: `<type> <len_hi> <len_lo> <payload>`, the length
    /// counting the three header bytes.
    fn send_packet(packet_type: u8, payload: &[u8], out: &mut Vec<EmulatorAction>) {
        let total = payload.len() + 3;
        let mut frame = vec![
            packet_type,
            ((total >> 7) & 0x7f) as u8,
            (total & 0x7f) as u8,
        ];
        frame.extend_from_slice(payload);
        out.push(EmulatorAction::Send(frame));
    }

    fn send_string(packet_type: u8, text: &str, out: &mut Vec<EmulatorAction>) {
        Self::send_packet(packet_type, text.as_bytes(), out);
    }

    fn handle_packet(
        &mut self,
        packet_type: u8,
        payload: &[u8],
        ctx: &EmulatorContext,
        out: &mut Vec<EmulatorAction>,
    ) -> bool {
        debug!(
            "[Pegasus] command 0x{packet_type:02x}, payload {} byte(s)",
            payload.len()
        );
        match packet_type {
            CMD_INITIAL => {
                // The real board sends no response to the reset command.
                self.begin(out);
                false
            }
            CMD_DEVELOPER_KEY => {
                info!("[Pegasus] developer key registered ({} bytes)", payload.len());
                false
            }
            CMD_LED_CONTROL => {
                self.led_control(payload, out);
                false
            }
            CMD_SERIAL => {
                Self::send_string(RESP_SERIAL, &meta(ctx, "serial no", "P00000000X"), out);
                true
            }
            CMD_LONG_SERIAL => {
                Self::send_string(RESP_LONG_SERIAL, &meta(ctx, "serial no", "P00000000X"), out);
                true
            }
            CMD_TRADEMARK => {
                let trademark = format!(
                    "Digital Game Technology\r\nCopyright (c) 2021 DGT\r\n\
                     software version: {}, build: {}\r\n\
                     hardware version: {}, serial no: {}",
                    meta(ctx, "software version", "1.00"),
                    meta(ctx, "build", "210722"),
                    meta(ctx, "hardware version", "1.00"),
                    meta(ctx, "serial no", "P00000000X"),
                );
                Self::send_string(RESP_TRADEMARK, &trademark, out);
                true
            }
            CMD_VERSION => {
                Self::send_packet(RESP_VERSION, &[1, 0], out);
                true
            }
            CMD_BOARD_DUMP => {
                // Occupancy only; the app does not care about piece types.
                let mut dump = [0u8; 64];
                for hw in 0..64u8 {
                    dump[usize::from(hw)] = ctx.occupancy[usize::from(chess_square(hw))];
                }
                Self::send_packet(RESP_BOARD_DUMP, &dump, out);
                true
            }
            CMD_BATTERY => {
                Self::send_packet(RESP_BATTERY, &[0x58, 0, 0, 0, 0, 0, 0, 0, 2], out);
                true
            }
            other => {
                debug!("[Pegasus] unsupported packet type 0x{other:02x}");
                false
            }
        }
    }

    /// LED control payload:
    /// - mode 0: all off
    /// - mode 2 with zero args: all off
    /// - mode 5: `[5, speed, mode, intensity, fields...]` (hardware indexing)
    fn led_control(&mut self, payload: &[u8], out: &mut Vec<EmulatorAction>) {
        let Some(&mode) = payload.first() else {
            return;
        };
        match mode {
            0 => out.push(EmulatorAction::LedsOff),
            2 => {
                if payload.get(1) == Some(&0) && payload.get(2) == Some(&0) {
                    out.push(EmulatorAction::LedsOff);
                } else {
                    debug!("[Pegasus] unsupported mode 2 arguments");
                }
            }
            5 => {
                if payload.len() < 4 {
                    return;
                }
                let speed_in = payload[1];
                let intensity_in = payload[3];
                let squares: Vec<u8> = payload[4..]
                    .iter()
                    .filter(|f| **f < 64)
                    .map(|f| chess_square(*f))
                    .collect();
                // App intensity runs 10 (dim) down to 2 (bright); 0 and 1
                // mean off.
                let intensity = match intensity_in {
                    0 | 1 => 0,
                    other => (11u8.saturating_sub(other)).min(10),
                };
                let speed = speed_in.clamp(1, 100);
                if squares.is_empty() {
                    out.push(EmulatorAction::LedsOff);
                } else if squares.len() == 1 {
                    out.push(EmulatorAction::LedSingle {
                        square: squares[0],
                        intensity,
                        speed,
                    });
                } else {
                    out.push(EmulatorAction::LedArray {
                        squares,
                        intensity,
                        speed,
                    });
                }
            }
            other => debug!("[Pegasus] unsupported LED mode {other}"),
        }
    }
}

impl Emulator for Pegasus {
    fn name(&self) -> &'static str {
        "pegasus"
    }

    fn parse_byte(
        &mut self,
        byte: u8,
        ctx: &EmulatorContext,
        out: &mut Vec<EmulatorAction>,
    ) -> bool {
        match self.state {
            ParserState::WaitingForInitial => {
                if byte == CMD_INITIAL {
                    return self.handle_packet(CMD_INITIAL, &[], ctx, out);
                }
                false
            }
            ParserState::WaitingForPacket => {
                if SHORT_COMMANDS.contains(&byte) {
                    return self.handle_packet(byte, &[], ctx, out);
                }
                self.buffer.push(byte);
                if self.buffer.len() > MAX_BUFFER {
                    warn!("[Pegasus] buffer overflow, clearing");
                    self.buffer.clear();
                    return false;
                }
                if byte != 0x00 {
                    return false;
                }
                // Scan back from the terminator for `<type> <length>` where
                // the length spans payload + terminator.
                let terminator = self.buffer.len() - 1;
                for i in (1..terminator).rev() {
                    let candidate = usize::from(self.buffer[i]);
                    if candidate != terminator - i {
                        continue;
                    }
                    let packet_type = self.buffer[i - 1];
                    if !VALID_COMMANDS.contains(&packet_type) {
                        continue;
                    }
                    let payload: Vec<u8> = self.buffer[i + 1..terminator].to_vec();
                    if i > 1 {
                        let orphaned = &self.buffer[..i - 1];
                        debug!("[Pegasus] {} orphaned byte(s) before packet", orphaned.len());
                    }
                    self.buffer.clear();
                    return self.handle_packet(packet_type, &payload, ctx, out);
                }
                false
            }
        }
    }

    fn handle_event(
        &mut self,
        event: &ManagerEvent,
        _ctx: &EmulatorContext,
        out: &mut Vec<EmulatorAction>,
    ) {
        if self.state != ParserState::WaitingForPacket {
            return;
        }
        match event {
            ManagerEvent::PieceLift { square, .. } => {
                Self::send_packet(RESP_FIELD_UPDATE, &[hardware_square(*square), 0], out);
            }
            ManagerEvent::PiecePlace { square, .. } => {
                Self::send_packet(RESP_FIELD_UPDATE, &[hardware_square(*square), 1], out);
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.state = ParserState::WaitingForInitial;
    }
}

fn meta(ctx: &EmulatorContext, key: &str, fallback: &str) -> String {
    ctx.meta
        .get(key)
        .cloned()
        .unwrap_or_else(|| fallback.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ctx() -> EmulatorContext {
        let mut occupancy = [0u8; 64];
        occupancy[0] = 1; // a1
        occupancy[28] = 1; // e4
        let mut meta = HashMap::new();
        meta.insert("serial no".to_string(), "T12345".to_string());
        EmulatorContext {
            fen: "8/8/8/8/4P3/8/8/R7 w - - 0 1".to_string(),
            occupancy,
            battery_level: 18,
            charging: false,
            meta,
        }
    }

    fn feed(emulator: &mut Pegasus, bytes: &[u8]) -> (bool, Vec<EmulatorAction>) {
        let context = ctx();
        let mut out = Vec::new();
        let mut handled = false;
        for b in bytes {
            handled |= emulator.parse_byte(*b, &context, &mut out);
        }
        (handled, out)
    }

    #[test]
    fn ignores_everything_before_initial() {
        let mut emulator = Pegasus::new();
        let (handled, out) = feed(&mut emulator, &[0x55, 0x42]);
        assert!(!handled);
        assert!(out.is_empty());
        assert_eq!(emulator.state, ParserState::WaitingForInitial);
    }

    #[test]
    fn initial_begins_the_session_without_a_response() {
        let mut emulator = Pegasus::new();
        let (handled, out) = feed(&mut emulator, &[CMD_INITIAL]);
        assert!(!handled);
        assert_eq!(out, vec![EmulatorAction::LedsOff]);
        assert_eq!(emulator.state, ParserState::WaitingForPacket);
    }

    #[test]
    fn serial_number_round_trip() {
        let mut emulator = Pegasus::new();
        feed(&mut emulator, &[CMD_INITIAL]);
        let (handled, out) = feed(&mut emulator, &[CMD_SERIAL]);
        assert!(handled);
        let EmulatorAction::Send(frame) = &out[0] else {
            panic!()
        };
        assert_eq!(frame[0], RESP_SERIAL);
        let declared = ((usize::from(frame[1])) << 7) | usize::from(frame[2]);
        assert_eq!(declared, frame.len());
        assert_eq!(&frame[3..], b"T12345");
    }

    #[test]
    fn board_dump_is_hardware_ordered_occupancy() {
        let mut emulator = Pegasus::new();
        feed(&mut emulator, &[CMD_INITIAL]);
        let (handled, out) = feed(&mut emulator, &[CMD_BOARD_DUMP]);
        assert!(handled);
        let EmulatorAction::Send(frame) = &out[0] else {
            panic!()
        };
        assert_eq!(frame[0], RESP_BOARD_DUMP);
        let dump = &frame[3..];
        assert_eq!(dump.len(), 64);
        // a1 (chess 0) is hardware 56; e4 (chess 28) is hardware 28.
        assert_eq!(dump[usize::from(hardware_square(0))], 1);
        assert_eq!(dump[usize::from(hardware_square(28))], 1);
        assert_eq!(dump.iter().map(|b| u32::from(*b)).sum::<u32>(), 2);
    }

    #[test]
    fn led_control_mode5_maps_hardware_fields() {
        let mut emulator = Pegasus::new();
        feed(&mut emulator, &[CMD_INITIAL]);
        // Framed command: 60 <len> 05 0a 00 04 <field> 00 with len covering
        // payload + terminator.
        let field_hw = hardware_square(28); // e4
        let frame = [CMD_LED_CONTROL, 6, 5, 10, 0, 4, field_hw, 0x00];
        let (_, out) = feed(&mut emulator, &frame);
        assert!(out.iter().any(|a| matches!(
            a,
            EmulatorAction::LedSingle { square: 28, intensity: 7, .. }
        )));
    }

    #[test]
    fn led_control_mode0_turns_off() {
        let mut emulator = Pegasus::new();
        feed(&mut emulator, &[CMD_INITIAL]);
        let frame = [CMD_LED_CONTROL, 2, 0, 0x00];
        let (_, out) = feed(&mut emulator, &frame);
        assert_eq!(out, vec![EmulatorAction::LedsOff]);
    }

    #[test]
    fn field_updates_use_hardware_indexing() {
        let mut emulator = Pegasus::new();
        feed(&mut emulator, &[CMD_INITIAL]);
        let mut out = Vec::new();
        emulator.handle_event(
            &ManagerEvent::PieceLift {
                square: 12,
                elapsed: 1.0,
            },
            &ctx(),
            &mut out,
        );
        let EmulatorAction::Send(frame) = &out[0] else {
            panic!()
        };
        assert_eq!(frame[0], RESP_FIELD_UPDATE);
        assert_eq!(frame[3], hardware_square(12));
        assert_eq!(frame[4], 0);
    }
}
