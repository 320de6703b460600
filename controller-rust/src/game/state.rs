//! Authoritative chess game state.
//!
//! Owns the position and the move stack. Everything else reads through
//! accessors or listens on the event channel; mutations happen only on the
//! game task.
//!
//! Events after a mutation, in priority order: position change always, then
//! exactly one of check / queen-threat / alert-clear, then game-over if the
//! position is terminal.

use shakmaty::fen::Fen;
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, CastlingSide, Chess, Color, EnPassantMode, Move, Position, Role, Square};
use thiserror::Error;
use tokio::sync::broadcast;

pub const STARTING_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// Piece-presence projection of the starting position.
pub const STARTING_STATE: [u8; 64] = {
    let mut state = [0u8; 64];
    let mut i = 0;
    while i < 64 {
        let rank = i / 8;
        if rank <= 1 || rank >= 6 {
            state[i] = 1;
        }
        i += 1;
    }
    state
};

#[derive(Debug, Error)]
pub enum GameError {
    #[error("invalid UCI move '{0}'")]
    InvalidUci(String),
    #[error("illegal move '{0}'")]
    IllegalMove(String),
    #[error("invalid FEN: {0}")]
    InvalidFen(String),
    #[error("no moves to take back")]
    EmptyStack,
}

/// Events published by the game state.
#[derive(Debug, Clone)]
pub enum GameStateEvent {
    PositionChanged,
    GameOver {
        result: String,
        termination: String,
    },
    Check {
        black_in_check: bool,
        attacker: u8,
        king: u8,
    },
    QueenThreat {
        black_queen_threatened: bool,
        attacker: u8,
        queen: u8,
    },
    AlertClear,
}

pub struct ChessGameState {
    pos: Chess,
    /// Position before each move, the move, and its UCI string.
    stack: Vec<(Chess, Move, String)>,
    result: Option<String>,
    termination: Option<String>,
    events: broadcast::Sender<GameStateEvent>,
}

impl Default for ChessGameState {
    fn default() -> Self {
        Self::new()
    }
}

impl ChessGameState {
    pub fn new() -> ChessGameState {
        let (events, _) = broadcast::channel(64);
        ChessGameState {
            pos: Chess::default(),
            stack: Vec::new(),
            result: None,
            termination: None,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GameStateEvent> {
        self.events.subscribe()
    }

    // ── Reads ─────────────────────────────────────────────────────────────

    pub fn fen(&self) -> String {
        Fen::from_position(self.pos.clone(), EnPassantMode::Legal).to_string()
    }

    pub fn turn(&self) -> Color {
        self.pos.turn()
    }

    pub fn move_count(&self) -> usize {
        self.stack.len()
    }

    pub fn move_stack_uci(&self) -> Vec<String> {
        self.stack.iter().map(|(_, _, uci)| uci.clone()).collect()
    }

    pub fn last_move_uci(&self) -> Option<&str> {
        self.stack.last().map(|(_, _, uci)| uci.as_str())
    }

    pub fn is_game_in_progress(&self) -> bool {
        !self.stack.is_empty()
    }

    pub fn is_check(&self) -> bool {
        self.pos.is_check()
    }

    pub fn is_game_over(&self) -> bool {
        self.result.is_some() || self.pos.outcome().is_some()
    }

    /// '1-0', '0-1' or '1/2-1/2'; `None` while the game runs.
    pub fn result(&self) -> Option<String> {
        if self.result.is_some() {
            return self.result.clone();
        }
        self.pos.outcome().map(outcome_result)
    }

    pub fn termination(&self) -> Option<String> {
        if self.termination.is_some() {
            return self.termination.clone();
        }
        if self.pos.outcome().is_some() {
            Some(self.board_termination())
        } else {
            None
        }
    }

    fn board_termination(&self) -> String {
        if self.pos.is_checkmate() {
            "checkmate".to_string()
        } else if self.pos.is_stalemate() {
            "stalemate".to_string()
        } else if self.pos.is_insufficient_material() {
            "insufficient material".to_string()
        } else {
            "ended".to_string()
        }
    }

    pub fn piece_color_at(&self, square: u8) -> Option<Color> {
        self.pos
            .board()
            .piece_at(Square::new(u32::from(square & 63)))
            .map(|p| p.color)
    }

    pub fn piece_role_at(&self, square: u8) -> Option<Role> {
        self.pos
            .board()
            .piece_at(Square::new(u32::from(square & 63)))
            .map(|p| p.role)
    }

    /// Legal destination squares for the piece on `source`, including the
    /// source itself so the player may put the piece back. Castling moves
    /// report the king's destination square.
    pub fn legal_destinations(&self, source: u8) -> Vec<u8> {
        let source_sq = Square::new(u32::from(source & 63));
        let mut destinations = vec![source & 63];
        for m in self.pos.legal_moves() {
            if m.from() != Some(source_sq) {
                continue;
            }
            let to = match &m {
                Move::Castle { king, rook } => {
                    let side = if rook > king {
                        CastlingSide::KingSide
                    } else {
                        CastlingSide::QueenSide
                    };
                    Square::from_coords(side.king_to_file(), king.rank())
                }
                other => other.to(),
            };
            let idx = u8::from(to);
            if !destinations.contains(&idx) {
                destinations.push(idx);
            }
        }
        destinations
    }

    pub fn is_legal_uci(&self, uci: &str) -> bool {
        uci.parse::<UciMove>()
            .ok()
            .and_then(|u| u.to_move(&self.pos).ok())
            .is_some()
    }

    /// 64-byte projection: 1 where any piece sits on the logical board.
    pub fn to_piece_presence_state(&self) -> [u8; 64] {
        let mut state = [0u8; 64];
        let occupied = self.pos.board().occupied();
        for square in Square::ALL {
            if occupied.contains(square) {
                state[usize::from(square)] = 1;
            }
        }
        state
    }

    pub fn is_starting_position(state: &[u8]) -> bool {
        state.len() == 64 && state == STARTING_STATE
    }

    pub fn states_match(a: &[u8], b: &[u8]) -> bool {
        a.len() == 64 && b.len() == 64 && a == b
    }

    // ── Mutations ─────────────────────────────────────────────────────────

    /// Push a move in UCI form. Emits position-change, alert, and game-over
    /// events as appropriate.
    pub fn push_uci(&mut self, uci: &str) -> Result<(), GameError> {
        let parsed = uci
            .parse::<UciMove>()
            .map_err(|_| GameError::InvalidUci(uci.to_string()))?;
        let m = parsed
            .to_move(&self.pos)
            .map_err(|_| GameError::IllegalMove(uci.to_string()))?;
        let normalized = m.to_uci(CastlingMode::Standard).to_string();
        let before = self.pos.clone();
        self.pos = self
            .pos
            .clone()
            .play(&m)
            .map_err(|_| GameError::IllegalMove(uci.to_string()))?;
        self.stack.push((before, m, normalized));

        self.emit(GameStateEvent::PositionChanged);
        self.notify_alerts();

        if let Some(outcome) = self.pos.outcome() {
            let result = outcome_result(outcome);
            let termination = self.board_termination();
            self.result = Some(result.clone());
            self.termination = Some(termination.clone());
            self.emit(GameStateEvent::GameOver {
                result,
                termination,
            });
        }
        Ok(())
    }

    /// Pop the last move (takeback). Clears any externally set result.
    pub fn pop_move(&mut self) -> Option<String> {
        let (before, _m, uci) = self.stack.pop()?;
        self.pos = before;
        self.result = None;
        self.termination = None;
        self.emit(GameStateEvent::PositionChanged);
        Some(uci)
    }

    pub fn set_position(&mut self, fen: &str) -> Result<(), GameError> {
        let parsed: Fen = fen
            .parse()
            .map_err(|_| GameError::InvalidFen(fen.to_string()))?;
        self.pos = parsed
            .into_position(CastlingMode::Standard)
            .map_err(|_| GameError::InvalidFen(fen.to_string()))?;
        self.stack.clear();
        self.result = None;
        self.termination = None;
        self.emit(GameStateEvent::PositionChanged);
        Ok(())
    }

    pub fn reset(&mut self) {
        self.pos = Chess::default();
        self.stack.clear();
        self.result = None;
        self.termination = None;
        self.emit(GameStateEvent::PositionChanged);
        self.notify_alerts();
    }

    /// Record an external ending: resignation, flag fall, draw agreement.
    pub fn set_result(&mut self, result: &str, termination: &str) {
        self.result = Some(result.to_string());
        self.termination = Some(termination.to_string());
        self.emit(GameStateEvent::GameOver {
            result: result.to_string(),
            termination: termination.to_string(),
        });
    }

    // ── Alerts ────────────────────────────────────────────────────────────

    /// Check has priority over queen threat; at most one alert is active.
    fn notify_alerts(&self) {
        if let Some((black_in_check, attacker, king)) = self.check_info() {
            self.emit(GameStateEvent::Check {
                black_in_check,
                attacker,
                king,
            });
            return;
        }
        if let Some((black_queen, attacker, queen)) = self.queen_threat_info() {
            self.emit(GameStateEvent::QueenThreat {
                black_queen_threatened: black_queen,
                attacker,
                queen,
            });
            return;
        }
        self.emit(GameStateEvent::AlertClear);
    }

    pub fn check_info(&self) -> Option<(bool, u8, u8)> {
        if !self.pos.is_check() {
            return None;
        }
        let side = self.pos.turn();
        let king = self.pos.board().king_of(side)?;
        let attacker = self.pos.checkers().first()?;
        Some((side == Color::Black, u8::from(attacker), u8::from(king)))
    }

    /// The side to move has their queen under attack (and can still move
    /// it, which is what makes the alert worth showing).
    pub fn queen_threat_info(&self) -> Option<(bool, u8, u8)> {
        let victim_side = self.pos.turn();
        let attacker_side = !victim_side;
        let board = self.pos.board();
        let queens = board.queens() & board.by_color(victim_side);
        let queen = queens.first()?;
        let attackers = board.attacks_to(queen, attacker_side, board.occupied());
        let attacker = attackers.first()?;
        Some((victim_side == Color::Black, u8::from(attacker), u8::from(queen)))
    }

    fn emit(&self, event: GameStateEvent) {
        let _ = self.events.send(event);
    }
}

fn outcome_result(outcome: shakmaty::Outcome) -> String {
    match outcome {
        shakmaty::Outcome::Decisive {
            winner: Color::White,
        } => "1-0".to_string(),
        shakmaty::Outcome::Decisive {
            winner: Color::Black,
        } => "0-1".to_string(),
        shakmaty::Outcome::Draw => "1/2-1/2".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starting_state_projection() {
        let state = ChessGameState::new();
        assert_eq!(state.to_piece_presence_state(), STARTING_STATE);
        assert!(ChessGameState::is_starting_position(
            &state.to_piece_presence_state()
        ));
    }

    #[test]
    fn push_e4_updates_fen_and_projection() {
        let mut state = ChessGameState::new();
        state.push_uci("e2e4").unwrap();
        assert_eq!(
            state.fen(),
            "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 1"
        );
        let projection = state.to_piece_presence_state();
        assert_eq!(projection[12], 0); // e2 empty
        assert_eq!(projection[28], 1); // e4 occupied
    }

    #[test]
    fn push_then_pop_restores_everything() {
        let mut state = ChessGameState::new();
        let fen_before = state.fen();
        state.push_uci("e2e4").unwrap();
        assert_eq!(state.pop_move().as_deref(), Some("e2e4"));
        assert_eq!(state.fen(), fen_before);
        assert_eq!(state.move_count(), 0);
    }

    #[test]
    fn illegal_move_is_rejected() {
        let mut state = ChessGameState::new();
        assert!(matches!(
            state.push_uci("e2e5"),
            Err(GameError::IllegalMove(_))
        ));
        assert!(matches!(
            state.push_uci("zz99"),
            Err(GameError::InvalidUci(_))
        ));
        assert_eq!(state.move_count(), 0);
    }

    #[test]
    fn legal_destinations_include_source_and_castling_target() {
        let mut state = ChessGameState::new();
        state
            .set_position("r3k2r/pppppppp/8/8/8/8/PPPPPPPP/R3K2R w KQkq - 0 1")
            .unwrap();
        let dests = state.legal_destinations(4); // e1
        assert!(dests.contains(&4)); // source
        assert!(dests.contains(&6)); // g1 kingside
        assert!(dests.contains(&2)); // c1 queenside
        assert!(dests.contains(&3)); // d1
    }

    #[test]
    fn castling_push_moves_rook_too() {
        let mut state = ChessGameState::new();
        state
            .set_position("r3k2r/pppppppp/8/8/8/8/PPPPPPPP/R3K2R w KQkq - 0 1")
            .unwrap();
        state.push_uci("e1g1").unwrap();
        let projection = state.to_piece_presence_state();
        assert_eq!(projection[6], 1); // g1 king
        assert_eq!(projection[5], 1); // f1 rook
        assert_eq!(projection[7], 0); // h1 empty
        assert_eq!(projection[4], 0); // e1 empty
        assert_eq!(state.last_move_uci(), Some("e1g1"));
    }

    #[test]
    fn scholars_mate_ends_the_game() {
        let mut state = ChessGameState::new();
        let mut events = state.subscribe();
        for uci in ["e2e4", "e7e5", "d1h5", "b8c6", "f1c4", "g8f6", "h5f7"] {
            state.push_uci(uci).unwrap();
        }
        assert!(state.is_game_over());
        assert_eq!(state.result().as_deref(), Some("1-0"));
        assert_eq!(state.termination().as_deref(), Some("checkmate"));
        let mut saw_game_over = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, GameStateEvent::GameOver { .. }) {
                saw_game_over = true;
            }
        }
        assert!(saw_game_over);
    }

    #[test]
    fn check_beats_queen_threat() {
        let mut state = ChessGameState::new();
        let mut events = state.subscribe();
        // 1. e4 e5 2. Qh5 Nc6 3. Qxf7+ - check with the queen en prise.
        for uci in ["e2e4", "e7e5", "d1h5", "b8c6", "h5f7"] {
            state.push_uci(uci).unwrap();
        }
        assert!(state.is_check());
        let mut last_alert = None;
        while let Ok(event) = events.try_recv() {
            match event {
                GameStateEvent::Check { .. }
                | GameStateEvent::QueenThreat { .. }
                | GameStateEvent::AlertClear => last_alert = Some(event),
                _ => {}
            }
        }
        assert!(matches!(last_alert, Some(GameStateEvent::Check { .. })));
    }

    #[test]
    fn queen_threat_targets_the_side_to_move() {
        let mut state = ChessGameState::new();
        // 1. e4 d5 2. exd5 Qxd5 3. Nc3 - the knight hits the black queen.
        for uci in ["e2e4", "d7d5", "e4d5", "d8d5", "b1c3"] {
            state.push_uci(uci).unwrap();
        }
        assert!(!state.is_check());
        let (black_queen, attacker, queen) = state.queen_threat_info().unwrap();
        assert!(black_queen);
        assert_eq!(attacker, 18); // c3
        assert_eq!(queen, 35); // d5
    }

    #[test]
    fn external_result_locks_the_game() {
        let mut state = ChessGameState::new();
        state.push_uci("e2e4").unwrap();
        state.set_result("0-1", "resignation");
        assert!(state.is_game_over());
        assert_eq!(state.termination().as_deref(), Some("resignation"));
        // Takeback clears it.
        state.pop_move();
        assert!(!state.is_game_over());
    }

    #[test]
    fn en_passant_capture_projection() {
        let mut state = ChessGameState::new();
        for uci in ["e2e4", "a7a6", "e4e5", "d7d5", "e5d6"] {
            state.push_uci(uci).unwrap();
        }
        let projection = state.to_piece_presence_state();
        assert_eq!(projection[43], 1); // d6 white pawn
        assert_eq!(projection[35], 0); // d5 captured pawn gone
    }
}
