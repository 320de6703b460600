//! Castling flows beyond the plain king-first move.
//!
//! Rook-first: the rook is parked on its castling destination without a
//! move being pushed; the king's arrival commits the castling UCI as one
//! logical move.
//!
//! Late castling: the rook component already went onto the stack as a
//! regular move. When the king then lands on its castling destination, the
//! stack is rewound (at most two plies) and the castling move is pushed in
//! its place. If an opponent move was popped, the takeback event fires so a
//! computer opponent re-requests its move.

use tracing::{error, info, warn};

use crate::link::SoundKind;
use crate::settings::SoundEventType;

use super::moves::MoveState;
use super::{GameManager, ManagerEvent};

/// The deepest the rook move may sit in the stack for late castling.
const MAX_LATE_CASTLING_PLIES: usize = 2;

impl GameManager {
    /// Commit a castling move whose rook was physically moved first. The
    /// rook move was never pushed, so the castling UCI must be legal as-is.
    pub(crate) async fn execute_castling(&mut self, rook_source: u8) {
        if self.state.is_game_over() {
            warn!("Castling attempted after game end");
            self.board
                .beep(SoundKind::WrongMove, Some(SoundEventType::Error))
                .await;
            let _ = self.board.leds_off().await;
            self.move_state.reset();
            return;
        }
        let Some(castling_uci) = MoveState::castling_uci_for_rook(rook_source) else {
            error!("Castling: invalid rook source {rook_source}");
            self.board
                .beep(SoundKind::WrongMove, Some(SoundEventType::Error))
                .await;
            self.move_state.reset();
            return;
        };
        if !self.state.is_legal_uci(castling_uci) {
            error!("Castling: {castling_uci} is not legal here");
            self.board
                .beep(SoundKind::WrongMove, Some(SoundEventType::Error))
                .await;
            self.move_state.reset();
            self.enter_correction().await;
            return;
        }
        let Some(king_dest) = MoveState::king_dest_for_rook(rook_source) else {
            return;
        };
        info!("Castling: executing rook-first {castling_uci}");
        self.move_state.clear_castling_tracking();
        self.finish_commit(castling_uci.to_string(), king_dest).await;
    }

    /// A king placed on its castling destination when that square was not a
    /// legal target: check whether the matching rook move sits on top of the
    /// stack (or one ply down) and rewrite it into a castling move.
    ///
    /// Returns true when the placement was consumed.
    pub(crate) async fn try_late_castling_from_king_move(&mut self, placed: u8) -> bool {
        let Some(source) = self.move_state.source_square else {
            return false;
        };
        let Some(rook_source) = MoveState::castling_pattern(source, placed) else {
            return false;
        };
        let Some(rook_uci) = MoveState::rook_move_uci(rook_source) else {
            return false;
        };
        let castling_uci = match MoveState::castling_uci_for_rook(rook_source) {
            Some(uci) => uci,
            None => return false,
        };

        let stack = self.state.move_stack_uci();
        let mut plies_back = None;
        for back in 1..=MAX_LATE_CASTLING_PLIES.min(stack.len()) {
            if stack[stack.len() - back] == rook_uci {
                plies_back = Some(back);
                break;
            }
        }
        let Some(plies_back) = plies_back else {
            return false;
        };

        info!("Late castling: rewinding {plies_back} move(s) to restore {castling_uci}");
        let mut undone = Vec::new();
        for _ in 0..plies_back {
            if let Some(uci) = self.state.pop_move() {
                info!("Late castling: undid {uci}");
                undone.push(uci);
            }
            self.board_states.pop();
            if let (Some(store), Some(id)) = (&self.store, self.game_db_id) {
                if let Err(e) = store.remove_last_move(id).await {
                    error!("Late castling: row removal failed: {e}");
                }
            }
        }
        self.update_fen_mirror();

        if !self.state.is_legal_uci(castling_uci) {
            error!("Late castling: {castling_uci} still not legal after rewind");
            for uci in undone.iter().rev() {
                if self.state.push_uci(uci).is_ok() {
                    self.board_states.push(self.state.to_piece_presence_state());
                }
            }
            self.update_fen_mirror();
            self.board
                .beep(SoundKind::WrongMove, Some(SoundEventType::Error))
                .await;
            self.move_state.reset();
            self.enter_correction().await;
            return true;
        }

        self.move_state.clear_castling_tracking();
        self.finish_commit(castling_uci.to_string(), placed).await;

        if plies_back > 1 {
            // An opponent move was unwound; let controllers re-request it.
            self.emit(ManagerEvent::Takeback);
        }
        true
    }
}
