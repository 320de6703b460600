//! Evaluation cache fed by UCI `info` lines.
//!
//! The engine and assistant searches report scores here; persistence reads
//! the latest centipawn value when recording a move, the display shows it.

use std::sync::{Arc, RwLock};

use shakmaty::Color;

#[derive(Debug, Clone, Default)]
pub struct AnalysisSnapshot {
    /// Centipawns from White's point of view.
    pub eval_cp: Option<i32>,
    /// Moves to mate (positive: White mates).
    pub mate_in: Option<i32>,
    pub depth: Option<u32>,
    pub best_move: Option<String>,
}

#[derive(Clone, Default)]
pub struct AnalysisState {
    data: Arc<RwLock<AnalysisSnapshot>>,
}

impl AnalysisState {
    pub fn new() -> AnalysisState {
        AnalysisState::default()
    }

    pub fn snapshot(&self) -> AnalysisSnapshot {
        self.data.read().unwrap().clone()
    }

    pub fn eval_cp(&self) -> Option<i32> {
        self.data.read().unwrap().eval_cp
    }

    pub fn clear(&self) {
        *self.data.write().unwrap() = AnalysisSnapshot::default();
    }

    pub fn set_best_move(&self, uci: &str) {
        self.data.write().unwrap().best_move = Some(uci.to_string());
    }

    /// Digest one UCI `info` line. Scores arrive relative to the side to
    /// move and are normalized to White's point of view.
    pub fn record_info(&self, line: &str, side_to_move: Color) {
        if !line.starts_with("info") {
            return;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let mut update = self.data.write().unwrap();
        let mut i = 0;
        while i < tokens.len() {
            match tokens[i] {
                "depth" => {
                    if let Some(d) = tokens.get(i + 1).and_then(|t| t.parse().ok()) {
                        update.depth = Some(d);
                    }
                    i += 2;
                }
                "score" => match tokens.get(i + 1) {
                    Some(&"cp") => {
                        if let Some(cp) = tokens.get(i + 2).and_then(|t| t.parse::<i32>().ok()) {
                            update.eval_cp = Some(match side_to_move {
                                Color::White => cp,
                                Color::Black => -cp,
                            });
                            update.mate_in = None;
                        }
                        i += 3;
                    }
                    Some(&"mate") => {
                        if let Some(mate) = tokens.get(i + 2).and_then(|t| t.parse::<i32>().ok()) {
                            update.mate_in = Some(match side_to_move {
                                Color::White => mate,
                                Color::Black => -mate,
                            });
                        }
                        i += 3;
                    }
                    _ => i += 1,
                },
                "pv" => {
                    if let Some(first) = tokens.get(i + 1) {
                        update.best_move = Some((*first).to_string());
                    }
                    break;
                }
                _ => i += 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cp_score_normalized_to_white() {
        let state = AnalysisState::new();
        state.record_info("info depth 12 score cp 35 pv e2e4 e7e5", Color::White);
        let snap = state.snapshot();
        assert_eq!(snap.eval_cp, Some(35));
        assert_eq!(snap.depth, Some(12));
        assert_eq!(snap.best_move.as_deref(), Some("e2e4"));

        state.record_info("info depth 10 score cp 50 pv g8f6", Color::Black);
        assert_eq!(state.eval_cp(), Some(-50));
    }

    #[test]
    fn mate_score() {
        let state = AnalysisState::new();
        state.record_info("info depth 20 score mate 3 pv d1h5", Color::White);
        let snap = state.snapshot();
        assert_eq!(snap.mate_in, Some(3));
    }

    #[test]
    fn non_info_lines_ignored() {
        let state = AnalysisState::new();
        state.record_info("bestmove e2e4", Color::White);
        assert!(state.eval_cp().is_none());
    }
}
