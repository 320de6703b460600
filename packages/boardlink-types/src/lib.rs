//! # boardlink-types
//!
//! Shared wire-protocol structures for the Tabula board link.
//!
//! These types are used by:
//! - `tabula-controller`: framing outgoing commands and deframing MCU responses
//! - `boardlink-simulator`: producing byte-identical frames on the fake MCU
//!
//! ## Wire format
//!
//! The board MCU speaks a 7-bit-oriented binary protocol over a 1 Mbaud
//! half-duplex UART. All long-form frames share one layout:
//!
//! ```text
//! <type> <len_hi> <len_lo> <addr1> <addr2> [payload...] <checksum>
//! ```
//!
//! - `len_hi`/`len_lo` carry the total frame length split across two 7-bit
//!   bytes: `length = ((len_hi & 0x7F) << 7) | (len_lo & 0x7F)`
//! - `addr1`/`addr2` are the bus address learned during discovery
//! - `checksum` is the sum of every preceding byte, mod 128
//!
//! Short commands omit the length and address fields entirely; their
//! responses are recognized by a type-byte whitelist plus the same mod-128
//! sum over the shorter byte run.
//!
//! ## Coordinate conventions
//!
//! - **Chess index**: 0..63, file-major from a1 = 0 to h8 = 63. Everything
//!   above the board controller uses this.
//! - **Hardware index**: 0..63 addressing rows a8..h1. Only the codec and
//!   the LED/sensor paths see it. The mapping is its own inverse.
//!
//! ## Invariants
//! - For every built frame `F`: `F[last] == sum(F[..last]) % 128`
//! - `parse(build(type, payload)) == (type, payload)` for payloads ≤ 250 bytes
//! - `chess_square(hardware_square(s)) == s` for all 64 squares

pub mod commands;
pub mod events;
pub mod packet;
pub mod square;
pub mod timeclock;

pub use commands::{Command, CommandSpec, PIECE_EVENT_RESP};
pub use events::{scan_key_event, scan_piece_events, Key, PieceEvent, PieceEventKind};
pub use packet::{build_packet, checksum, Packet, PacketParser, ParsedFrame};
pub use square::{chess_square, hardware_square, square_name};
pub use timeclock::{decode_elapsed, encode_elapsed};
