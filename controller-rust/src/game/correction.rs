//! Correction mode: LED guidance until the physical board matches the
//! logical board again.
//!
//! While active, the game task routes every piece event here instead of the
//! move recognizer. Guidance pairs extra pieces with missing squares by
//! minimum total Manhattan distance and lights one arrow at a time.

use tracing::{info, warn};

use crate::link::BoardController;

/// Sensors settle for a moment after a PLACE before the state is trusted.
pub const PLACE_SETTLE: std::time::Duration = std::time::Duration::from_millis(50);

#[derive(Debug, Default)]
pub struct CorrectionState {
    pub active: bool,
    /// Set on exit; used to swallow one stale PLACE event.
    pub just_exited: bool,
}

impl CorrectionState {
    pub fn enter(&mut self) {
        self.active = true;
        self.just_exited = false;
        warn!("Correction: entered");
    }

    pub fn exit(&mut self) {
        self.active = false;
        self.just_exited = true;
        warn!("Correction: exited");
    }

    pub fn clear_exit_flag(&mut self) {
        self.just_exited = false;
    }
}

/// Squares that differ between the physical and expected states.
pub fn diff_states(current: &[u8; 64], expected: &[u8; 64]) -> (Vec<u8>, Vec<u8>) {
    let mut missing = Vec::new();
    let mut extra = Vec::new();
    for i in 0..64u8 {
        let idx = usize::from(i);
        if expected[idx] == 1 && current[idx] == 0 {
            missing.push(i);
        } else if expected[idx] == 0 && current[idx] == 1 {
            extra.push(i);
        }
    }
    (missing, extra)
}

fn manhattan(a: u8, b: u8) -> i64 {
    let (ar, ac) = (i64::from(a / 8), i64::from(a % 8));
    let (br, bc) = (i64::from(b / 8), i64::from(b % 8));
    (ar - br).abs() + (ac - bc).abs()
}

/// Light guidance for the current divergence. One `from→to` arrow when both
/// extra and missing squares exist; otherwise flash the whole set.
pub async fn provide_guidance(
    board: &BoardController,
    current: &[u8; 64],
    expected: &[u8; 64],
) {
    let (missing, extra) = diff_states(current, expected);

    if missing.is_empty() && extra.is_empty() {
        let _ = board.leds_off().await;
        return;
    }
    warn!(
        "Correction: {} extra piece(s), {} missing square(s)",
        extra.len(),
        missing.len()
    );

    if !extra.is_empty() && !missing.is_empty() {
        let (from, to) = best_pair(&extra, &missing);
        let _ = board.leds_off().await;
        let _ = board.led_from_to(from, to, 5, 3, 0).await;
        info!(
            "Correction: guiding {} -> {}",
            boardlink_types::square_name(from),
            boardlink_types::square_name(to)
        );
    } else if !missing.is_empty() {
        let _ = board.leds_off().await;
        for sq in &missing {
            let _ = board.led(*sq, 5, 3, 0).await;
        }
    } else {
        let _ = board.leds_off().await;
        for sq in &extra {
            let _ = board.led(*sq, 5, 3, 0).await;
        }
    }
}

/// The extra→missing pair in the minimum-total-cost assignment.
fn best_pair(extra: &[u8], missing: &[u8]) -> (u8, u8) {
    if extra.len() == 1 && missing.len() == 1 {
        return (extra[0], missing[0]);
    }
    let costs: Vec<Vec<i64>> = extra
        .iter()
        .map(|e| missing.iter().map(|m| manhattan(*e, *m)).collect())
        .collect();
    let assignment = min_cost_assignment(&costs);
    for (row, col) in assignment.iter().enumerate() {
        if let Some(col) = col {
            return (extra[row], missing[*col]);
        }
    }
    (extra[0], missing[0])
}

/// Hungarian algorithm (potentials form). `cost[i][j]` is the cost of
/// assigning row i to column j. Rows in excess of columns stay unassigned
/// (`None`). O(rows² · cols).
pub fn min_cost_assignment(cost: &[Vec<i64>]) -> Vec<Option<usize>> {
    let rows = cost.len();
    if rows == 0 {
        return Vec::new();
    }
    let cols = cost[0].len();
    if cols == 0 {
        return vec![None; rows];
    }

    // The classic formulation needs rows <= cols; transpose if not.
    if rows > cols {
        let transposed: Vec<Vec<i64>> = (0..cols)
            .map(|j| (0..rows).map(|i| cost[i][j]).collect())
            .collect();
        let col_assignment = min_cost_assignment(&transposed);
        let mut result = vec![None; rows];
        for (col, row) in col_assignment.iter().enumerate() {
            if let Some(row) = row {
                result[*row] = Some(col);
            }
        }
        return result;
    }

    const INF: i64 = i64::MAX / 2;
    let mut u = vec![0i64; rows + 1];
    let mut v = vec![0i64; cols + 1];
    // p[j] = 1-based row matched to column j; 0 = free.
    let mut p = vec![0usize; cols + 1];
    let mut way = vec![0usize; cols + 1];

    for i in 1..=rows {
        p[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![INF; cols + 1];
        let mut used = vec![false; cols + 1];
        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = INF;
            let mut j1 = 0usize;
            for j in 1..=cols {
                if used[j] {
                    continue;
                }
                let cur = cost[i0 - 1][j - 1] - u[i0] - v[j];
                if cur < minv[j] {
                    minv[j] = cur;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            for j in 0..=cols {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut result = vec![None; rows];
    for j in 1..=cols {
        if p[j] > 0 {
            result[p[j] - 1] = Some(j - 1);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn total(cost: &[Vec<i64>], assignment: &[Option<usize>]) -> i64 {
        assignment
            .iter()
            .enumerate()
            .filter_map(|(i, j)| j.map(|j| cost[i][j]))
            .sum()
    }

    #[test]
    fn manhattan_distance() {
        assert_eq!(manhattan(0, 0), 0);
        assert_eq!(manhattan(0, 63), 14); // a1 -> h8
        assert_eq!(manhattan(28, 12), 2); // e4 -> e2
    }

    #[test]
    fn diff_finds_missing_and_extra() {
        let mut expected = [0u8; 64];
        let mut current = [0u8; 64];
        expected[12] = 1; // e2 should be occupied
        current[28] = 1; // e4 is occupied instead
        let (missing, extra) = diff_states(&current, &expected);
        assert_eq!(missing, vec![12]);
        assert_eq!(extra, vec![28]);
    }

    #[test]
    fn assignment_square_matrix() {
        let cost = vec![vec![4, 1, 3], vec![2, 0, 5], vec![3, 2, 2]];
        let assignment = min_cost_assignment(&cost);
        // Optimal: 0->1 (1), 1->0 (2), 2->2 (2) = 5.
        assert_eq!(total(&cost, &assignment), 5);
        let mut cols: Vec<usize> = assignment.iter().map(|c| c.unwrap()).collect();
        cols.sort_unstable();
        assert_eq!(cols, vec![0, 1, 2]);
    }

    #[test]
    fn assignment_rectangular_wide() {
        let cost = vec![vec![10, 1, 10, 10], vec![10, 10, 10, 2]];
        let assignment = min_cost_assignment(&cost);
        assert_eq!(assignment, vec![Some(1), Some(3)]);
    }

    #[test]
    fn assignment_rectangular_tall() {
        let cost = vec![vec![5], vec![1], vec![3]];
        let assignment = min_cost_assignment(&cost);
        // Only one column; the cheapest row gets it.
        assert_eq!(assignment, vec![None, Some(0), None]);
    }

    #[test]
    fn best_pair_prefers_nearest_consistent_assignment() {
        // Extra on e4 (28) and b7 (49); missing on e2 (12) and b8 (57).
        // Optimal pairing: e4->e2, b7->b8.
        let extra = vec![28, 49];
        let missing = vec![12, 57];
        let (from, to) = best_pair(&extra, &missing);
        assert_eq!((from, to), (28, 12));
    }
}
