//! In-progress physical move tracking.
//!
//! `MoveState` mirrors what is happening on the wood: which square a piece
//! was lifted from, where it may legally land, whether a castling sequence
//! or forced (computer-announced) move is in flight, and the king-lift
//! resign gesture.

use shakmaty::Color;
use tokio::time::Instant;

/// Castling geometry in chess indexing.
pub const WHITE_KING_SQUARE: u8 = 4; // e1
pub const BLACK_KING_SQUARE: u8 = 60; // e8
pub const WHITE_KINGSIDE_ROOK: u8 = 7; // h1
pub const WHITE_QUEENSIDE_ROOK: u8 = 0; // a1
pub const BLACK_KINGSIDE_ROOK: u8 = 63; // h8
pub const BLACK_QUEENSIDE_ROOK: u8 = 56; // a8
pub const WHITE_KINGSIDE_KING_DEST: u8 = 6; // g1
pub const WHITE_QUEENSIDE_KING_DEST: u8 = 2; // c1
pub const BLACK_KINGSIDE_KING_DEST: u8 = 62; // g8
pub const BLACK_QUEENSIDE_KING_DEST: u8 = 58; // c8

/// How long a king must stay off the board to raise the resign menu.
pub const KING_LIFT_RESIGN: std::time::Duration = std::time::Duration::from_secs(3);

/// Minimum length of a usable UCI string.
pub const MIN_UCI_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KingLift {
    pub square: u8,
    pub color: Color,
    pub since: Instant,
    pub menu_raised: bool,
}

#[derive(Debug, Default)]
pub struct MoveState {
    /// Square the side to move lifted from; at most one side has one.
    pub source_square: Option<u8>,
    pub source_color: Option<Color>,
    /// Non-empty iff `source_square` is set; includes the source square so
    /// the piece can be put back.
    pub legal_destinations: Vec<u8>,
    /// Square where an opponent piece was lifted (so replacing it clears
    /// stray LEDs without touching the move).
    pub opponent_source_square: Option<u8>,
    /// Rook lifted from its castling square while castling was legal.
    pub castling_rook_source: Option<u8>,
    /// The rook now sits on its castling destination; awaiting the king.
    pub castling_rook_placed: bool,
    pub late_castling_in_progress: bool,
    /// Engine/online move the player must reproduce, in UCI.
    pub forced_move: Option<String>,
    /// King off-board tracking for the resign gesture.
    pub king_lift: Option<KingLift>,
}

impl MoveState {
    pub fn new() -> MoveState {
        MoveState::default()
    }

    pub fn is_forced(&self) -> bool {
        self.forced_move.is_some()
    }

    pub fn forced_source(&self) -> Option<u8> {
        let uci = self.forced_move.as_deref()?;
        if uci.len() < MIN_UCI_LEN {
            return None;
        }
        boardlink_types::square::parse_square(&uci[0..2])
    }

    pub fn forced_target(&self) -> Option<u8> {
        let uci = self.forced_move.as_deref()?;
        if uci.len() < MIN_UCI_LEN {
            return None;
        }
        boardlink_types::square::parse_square(&uci[2..4])
    }

    /// Clear the in-flight move. Forced-move bookkeeping is owned by the
    /// manager and cleared separately.
    pub fn reset(&mut self) {
        self.source_square = None;
        self.source_color = None;
        self.legal_destinations.clear();
        self.opponent_source_square = None;
        self.castling_rook_source = None;
        self.castling_rook_placed = false;
        self.late_castling_in_progress = false;
        self.king_lift = None;
    }

    pub fn clear_castling_tracking(&mut self) {
        self.castling_rook_source = None;
        self.castling_rook_placed = false;
        self.late_castling_in_progress = false;
    }

    pub fn is_rook_castling_square(square: u8) -> bool {
        matches!(
            square,
            WHITE_KINGSIDE_ROOK | WHITE_QUEENSIDE_ROOK | BLACK_KINGSIDE_ROOK | BLACK_QUEENSIDE_ROOK
        )
    }

    /// The castling king move for a rook lifted from `rook_source`.
    pub fn castling_uci_for_rook(rook_source: u8) -> Option<&'static str> {
        match rook_source {
            WHITE_KINGSIDE_ROOK => Some("e1g1"),
            WHITE_QUEENSIDE_ROOK => Some("e1c1"),
            BLACK_KINGSIDE_ROOK => Some("e8g8"),
            BLACK_QUEENSIDE_ROOK => Some("e8c8"),
            _ => None,
        }
    }

    /// The rook's own move within the castling pattern.
    pub fn rook_move_uci(rook_source: u8) -> Option<&'static str> {
        match rook_source {
            WHITE_KINGSIDE_ROOK => Some("h1f1"),
            WHITE_QUEENSIDE_ROOK => Some("a1d1"),
            BLACK_KINGSIDE_ROOK => Some("h8f8"),
            BLACK_QUEENSIDE_ROOK => Some("a8d8"),
            _ => None,
        }
    }

    pub fn king_square_for_rook(rook_source: u8) -> Option<(u8, Color)> {
        match rook_source {
            WHITE_KINGSIDE_ROOK | WHITE_QUEENSIDE_ROOK => Some((WHITE_KING_SQUARE, Color::White)),
            BLACK_KINGSIDE_ROOK | BLACK_QUEENSIDE_ROOK => Some((BLACK_KING_SQUARE, Color::Black)),
            _ => None,
        }
    }

    pub fn king_dest_for_rook(rook_source: u8) -> Option<u8> {
        match rook_source {
            WHITE_KINGSIDE_ROOK => Some(WHITE_KINGSIDE_KING_DEST),
            WHITE_QUEENSIDE_ROOK => Some(WHITE_QUEENSIDE_KING_DEST),
            BLACK_KINGSIDE_ROOK => Some(BLACK_KINGSIDE_KING_DEST),
            BLACK_QUEENSIDE_ROOK => Some(BLACK_QUEENSIDE_KING_DEST),
            _ => None,
        }
    }

    /// The rook's castling destination square.
    pub fn rook_dest_for_rook(rook_source: u8) -> Option<u8> {
        match rook_source {
            WHITE_KINGSIDE_ROOK => Some(5),  // f1
            WHITE_QUEENSIDE_ROOK => Some(3), // d1
            BLACK_KINGSIDE_ROOK => Some(61), // f8
            BLACK_QUEENSIDE_ROOK => Some(59), // d8
            _ => None,
        }
    }

    pub fn is_valid_rook_castling_destination(rook_source: u8, dest: u8) -> bool {
        Self::rook_dest_for_rook(rook_source) == Some(dest)
    }

    /// King castling destination reached from the king square, if `(from,
    /// to)` matches one of the four castling patterns.
    pub fn castling_pattern(from: u8, to: u8) -> Option<u8> {
        match (from, to) {
            (WHITE_KING_SQUARE, WHITE_KINGSIDE_KING_DEST) => Some(WHITE_KINGSIDE_ROOK),
            (WHITE_KING_SQUARE, WHITE_QUEENSIDE_KING_DEST) => Some(WHITE_QUEENSIDE_ROOK),
            (BLACK_KING_SQUARE, BLACK_KINGSIDE_KING_DEST) => Some(BLACK_KINGSIDE_ROOK),
            (BLACK_KING_SQUARE, BLACK_QUEENSIDE_KING_DEST) => Some(BLACK_QUEENSIDE_ROOK),
            _ => None,
        }
    }
}
