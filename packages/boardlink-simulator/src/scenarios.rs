//! Scripted piece/key sequences for driving the controller.

use serde::{Deserialize, Serialize};

use boardlink_types::square::parse_square;
use boardlink_types::Key;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Lift { square: String },
    Place { square: String },
    Key { key: String },
    /// Extra delay in milliseconds on top of the step interval.
    Wait { ms: u64 },
}

impl Step {
    pub fn square_index(&self) -> Option<u8> {
        match self {
            Step::Lift { square } | Step::Place { square } => parse_square(square),
            _ => None,
        }
    }

    pub fn key(&self) -> Option<Key> {
        let Step::Key { key } = self else {
            return None;
        };
        match key.to_lowercase().as_str() {
            "back" => Some(Key::Back),
            "tick" => Some(Key::Tick),
            "up" => Some(Key::Up),
            "down" => Some(Key::Down),
            "help" => Some(Key::Help),
            "play" => Some(Key::Play),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub steps: Vec<Step>,
}

fn lift(square: &str) -> Step {
    Step::Lift {
        square: square.to_string(),
    }
}

fn place(square: &str) -> Step {
    Step::Place {
        square: square.to_string(),
    }
}

/// 1. e4 e5 2. Nf3.
pub fn preset_opening() -> Scenario {
    Scenario {
        name: "opening".to_string(),
        steps: vec![
            lift("e2"),
            place("e4"),
            lift("e7"),
            place("e5"),
            lift("g1"),
            place("f3"),
        ],
    }
}

/// Rook-first kingside castling for white after clearing f1/g1.
pub fn preset_rook_first_castle() -> Scenario {
    Scenario {
        name: "rook_first_castle".to_string(),
        steps: vec![
            lift("e2"),
            place("e4"),
            lift("e7"),
            place("e5"),
            lift("g1"),
            place("f3"),
            lift("b8"),
            place("c6"),
            lift("f1"),
            place("c4"),
            lift("g8"),
            place("f6"),
            // Rook first, then the king.
            lift("h1"),
            place("f1"),
            lift("e1"),
            place("g1"),
        ],
    }
}

/// An illegal placement that drives the controller into correction mode,
/// then fixes it.
pub fn preset_misplace() -> Scenario {
    Scenario {
        name: "misplace".to_string(),
        steps: vec![
            lift("e2"),
            place("e5"),
            Step::Wait { ms: 1500 },
            lift("e5"),
            place("e2"),
        ],
    }
}

pub fn preset(name: &str) -> Option<Scenario> {
    match name {
        "opening" => Some(preset_opening()),
        "rook_first_castle" => Some(preset_rook_first_castle()),
        "misplace" => Some(preset_misplace()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_resolve_squares() {
        for scenario in [preset_opening(), preset_rook_first_castle(), preset_misplace()] {
            for step in &scenario.steps {
                match step {
                    Step::Lift { .. } | Step::Place { .. } => {
                        assert!(step.square_index().is_some(), "{step:?}");
                    }
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn key_steps_parse() {
        let step = Step::Key {
            key: "tick".to_string(),
        };
        assert_eq!(step.key(), Some(Key::Tick));
    }
}
