//! Variable-length event timestamps.
//!
//! Piece-event frames may carry the elapsed game time in 1–4 bytes ahead of
//! the first event marker:
//!
//! ```text
//! [subsec] [sec] [min] [hour]
//! ```
//!
//! - `subsec` scales 0x00..0xFF onto 0.00..0.99 seconds
//! - each higher-order byte appears only when its lower neighbor saturates
//!
//! The decoder takes exactly the bytes preceding the first `0x40`/`0x41`
//! marker; the encoder produces the shortest encoding for a given time.

const SUBSEC_SPAN: f64 = 0.99;

/// Decode the time prefix of a piece-event payload. Returns elapsed seconds
/// since game start. Payloads with no time prefix decode to 0.0.
pub fn decode_elapsed(payload: &[u8]) -> f64 {
    let prefix_len = payload
        .iter()
        .position(|b| *b == 0x40 || *b == 0x41)
        .unwrap_or(payload.len())
        .min(4);
    let prefix = &payload[..prefix_len];

    let mut seconds = 0.0;
    if let Some(subsec) = prefix.first() {
        seconds += f64::from(*subsec) / 255.0 * SUBSEC_SPAN;
    }
    if let Some(sec) = prefix.get(1) {
        seconds += f64::from(*sec);
    }
    if let Some(min) = prefix.get(2) {
        seconds += f64::from(*min) * 60.0;
    }
    if let Some(hour) = prefix.get(3) {
        seconds += f64::from(*hour) * 3600.0;
    }
    seconds
}

/// Encode elapsed seconds as the shortest time prefix.
pub fn encode_elapsed(elapsed: f64) -> Vec<u8> {
    let elapsed = elapsed.max(0.0);
    let whole = elapsed.floor() as u64;
    let frac = elapsed - whole as f64;

    let subsec = ((frac / SUBSEC_SPAN) * 255.0).round().min(255.0) as u8;
    let hours = whole / 3600;
    let minutes = (whole % 3600) / 60;
    let seconds = whole % 60;

    let mut out = vec![subsec];
    if whole > 0 {
        out.push(seconds as u8);
    }
    if hours > 0 || minutes > 0 {
        out.push(minutes as u8);
    }
    if hours > 0 {
        out.push(hours as u8);
    }
    out
}
