//! Frame builder and rolling-buffer parser for the board link.
//!
//! The parser is byte-fed: the serial reader pushes one byte at a time and
//! gets back a [`ParsedFrame`] when a frame boundary is recognized. It never
//! panics on malformed input — bad frames are classified and dropped.

use serde::{Deserialize, Serialize};

use crate::commands::{short_response_types, start_type_bytes};

/// Largest buffer the parser will hold before shedding old bytes.
const MAX_BUFFER: usize = 1000;

/// Header length of a long-form frame up to and including `addr2`.
const HEADER_LEN: usize = 5;

/// Sum of all bytes, mod 128.
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum: u32 = bytes.iter().map(|b| u32::from(*b)).sum();
    (sum % 128) as u8
}

/// Build a complete outgoing frame.
///
/// Long form: `[cmd, len_hi, len_lo, addr1, addr2, payload..., checksum]`
/// where the length counts every byte of the frame including the checksum.
/// Short form (`payload == None`): `[cmd, addr1, addr2, checksum]`.
pub fn build_packet(cmd: u8, addr1: u8, addr2: u8, payload: Option<&[u8]>) -> Vec<u8> {
    let mut frame = vec![cmd];
    if let Some(data) = payload {
        let total = data.len() + 6;
        frame.push(((total >> 7) & 0x7f) as u8);
        frame.push((total & 0x7f) as u8);
    }
    frame.push(addr1);
    frame.push(addr2);
    if let Some(data) = payload {
        frame.extend_from_slice(data);
    }
    frame.push(checksum(&frame));
    frame
}

/// One complete inbound frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub packet_type: u8,
    pub addr1: u8,
    pub addr2: u8,
    /// Bytes between `addr2` and the checksum.
    pub payload: Vec<u8>,
    /// The raw frame as received.
    pub raw: Vec<u8>,
}

impl Packet {
    fn from_long_frame(raw: &[u8]) -> Self {
        let payload = if raw.len() > HEADER_LEN + 1 {
            raw[HEADER_LEN..raw.len() - 1].to_vec()
        } else {
            Vec::new()
        };
        Packet {
            packet_type: raw[0],
            addr1: raw[3],
            addr2: raw[4],
            payload,
            raw: raw.to_vec(),
        }
    }
}

/// What the parser recognized at a frame boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedFrame {
    /// A checksummed long-form frame.
    Packet(Packet),
    /// A short-command response: type byte plus payload, no address fields.
    Short { packet_type: u8, payload: Vec<u8> },
    /// A key-notification frame whose trailing byte failed the frame
    /// checksum but whose type byte marks it as a key report. The payload
    /// is everything after the type byte, untrimmed.
    KeyReport(Vec<u8>),
    /// Bytes discarded because a new frame start was detected behind them.
    Orphaned(Vec<u8>),
    /// A frame-sized run whose checksum did not match; discarded.
    ChecksumMismatch(Vec<u8>),
}

/// Rolling-buffer frame parser.
///
/// Frame boundaries are found two ways:
/// 1. The declared length (`((buf[1] & 0x7F) << 7) | (buf[2] & 0x7F)`)
///    equals the buffered length and the last byte checks out.
/// 2. The buffer starts with a whitelisted short-response type and the last
///    byte equals the checksum of everything before it.
///
/// If a known start-type byte followed by the learned address pair shows up
/// while earlier bytes are still buffered, those earlier bytes are reported
/// as orphaned and parsing restarts from the new frame head.
#[derive(Debug)]
pub struct PacketParser {
    buffer: Vec<u8>,
    addr1: u8,
    addr2: u8,
    start_types: Vec<u8>,
    short_types: Vec<u8>,
    packet_count: u64,
}

impl Default for PacketParser {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketParser {
    pub fn new() -> Self {
        PacketParser {
            buffer: Vec::new(),
            addr1: 0,
            addr2: 0,
            start_types: start_type_bytes(),
            short_types: short_response_types(),
            packet_count: 0,
        }
    }

    /// Teach the parser the bus address learned during discovery. Orphan
    /// detection is inert while the address is still zero.
    pub fn set_address(&mut self, addr1: u8, addr2: u8) {
        self.addr1 = addr1;
        self.addr2 = addr2;
    }

    pub fn address(&self) -> (u8, u8) {
        (self.addr1, self.addr2)
    }

    /// Frames recognized since construction.
    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    /// Drop any buffered bytes (used before raw-capture requests).
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Feed one byte. Returns every frame event recognized at this byte —
    /// an orphan trim and a completed frame can land together.
    pub fn feed(&mut self, byte: u8) -> Vec<ParsedFrame> {
        let mut out = Vec::new();

        if let Some(orphan) = self.detect_orphan(byte) {
            out.push(ParsedFrame::Orphaned(orphan));
        }
        self.buffer.push(byte);

        if let Some(frame) = self.try_complete(byte) {
            out.push(frame);
            return out;
        }

        if self.buffer.len() > MAX_BUFFER {
            self.buffer.remove(0);
        }
        out
    }

    /// A new frame head is `<start_type> .. addr1` with the incoming byte
    /// equal to `addr2`, positioned four bytes back in the buffer. Everything
    /// before that head is orphaned; the buffer keeps only the head.
    fn detect_orphan(&mut self, byte: u8) -> Option<Vec<u8>> {
        const HEAD: usize = 4;
        if self.addr1 == 0 && self.addr2 == 0 {
            return None;
        }
        if self.buffer.len() < HEAD {
            return None;
        }
        let head_start = self.buffer.len() - HEAD;
        if !self.start_types.contains(&self.buffer[head_start]) {
            return None;
        }
        if self.buffer[head_start + 3] != self.addr1 || byte != self.addr2 {
            return None;
        }
        if self.buffer.len() == HEAD {
            return None;
        }
        let orphan = self.buffer[..head_start].to_vec();
        self.buffer.drain(..head_start);
        Some(orphan)
    }

    fn try_complete(&mut self, byte: u8) -> Option<ParsedFrame> {
        if self.buffer.len() < 3 {
            return None;
        }

        let declared =
            ((usize::from(self.buffer[1] & 0x7f)) << 7) | usize::from(self.buffer[2] & 0x7f);
        if self.buffer.len() == declared {
            if declared > HEADER_LEN {
                let body = &self.buffer[..self.buffer.len() - 1];
                if byte == checksum(body) {
                    let packet = Packet::from_long_frame(&self.buffer);
                    self.buffer.clear();
                    self.packet_count += 1;
                    return Some(ParsedFrame::Packet(packet));
                }
                // Key notifications ride a frame whose final byte is part of
                // the report rather than a frame checksum.
                if self.buffer[0] == 0xa3 {
                    let payload = self.buffer[1..].to_vec();
                    self.buffer.clear();
                    self.packet_count += 1;
                    return Some(ParsedFrame::KeyReport(payload));
                }
                let bad = std::mem::take(&mut self.buffer);
                return Some(ParsedFrame::ChecksumMismatch(bad));
            }
            // Frames at or under header size carry no checksum of their own.
            let packet_type = self.buffer[0];
            let payload = self.buffer[1..].to_vec();
            self.buffer.clear();
            self.packet_count += 1;
            return Some(ParsedFrame::Short {
                packet_type,
                payload,
            });
        }

        // Short-response frames: whitelisted type byte, checksum over the
        // preceding bytes. Minimum useful run is type + one byte + checksum.
        if self.buffer.len() >= 3
            && self.short_types.contains(&self.buffer[0])
            && byte == checksum(&self.buffer[..self.buffer.len() - 1])
        {
            let packet_type = self.buffer[0];
            let payload = self.buffer[1..self.buffer.len() - 1].to_vec();
            self.buffer.clear();
            self.packet_count += 1;
            return Some(ParsedFrame::Short {
                packet_type,
                payload,
            });
        }

        None
    }
}
