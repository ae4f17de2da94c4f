//! Ingestion cursor: tracks the next position and the producer frontier.

use serde::{Deserialize, Serialize};

/// A drop in the producer's reported frontier.
///
/// Written data is never rolled back; the regression is only reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrontierRegression {
    pub previous: u64,
    pub current: u64,
}

/// The stream's position relative to the producer.
///
/// The cursor knows:
/// - Which position is processed next
/// - The finality lag (how many positions behind the frontier are withheld)
/// - The highest frontier observed so far
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursor {
    /// Next position to fetch.
    pub next_position: u64,
    /// Positions newer than `frontier - finality_lag` are not processed.
    pub finality_lag: u64,
    /// Last frontier reported by the producer.
    pub last_frontier: Option<u64>,
}

impl Cursor {
    pub fn new(next_position: u64, finality_lag: u64) -> Self {
        Self {
            next_position,
            finality_lag,
            last_frontier: None,
        }
    }

    /// Advance past `position`.
    pub fn advance(&mut self, position: u64) {
        self.next_position = position + 1;
    }

    /// Highest position eligible at `frontier`, or `None` if the frontier is
    /// still inside the lag window.
    pub fn eligible_frontier(&self, frontier: u64) -> Option<u64> {
        frontier.checked_sub(self.finality_lag)
    }

    /// Returns `true` if `target` is at least `finality_lag` behind `frontier`.
    pub fn is_final(&self, target: u64, frontier: u64) -> bool {
        target <= frontier && frontier - target >= self.finality_lag
    }

    /// Records a new frontier, reporting a regression if it went backwards.
    pub fn observe_frontier(&mut self, frontier: u64) -> Option<FrontierRegression> {
        let regression = match self.last_frontier {
            Some(previous) if frontier < previous => Some(FrontierRegression {
                previous,
                current: frontier,
            }),
            _ => None,
        };
        self.last_frontier = Some(frontier);
        regression
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_advance() {
        let mut cursor = Cursor::new(100, 2);
        cursor.advance(100);
        assert_eq!(cursor.next_position, 101);
    }

    #[test]
    fn finality_lag_window() {
        let cursor = Cursor::new(0, 2);
        assert_eq!(cursor.eligible_frontier(10), Some(8));
        assert_eq!(cursor.eligible_frontier(1), None);
        assert!(cursor.is_final(8, 10)); // 10 - 8 = 2 ≥ 2
        assert!(!cursor.is_final(9, 10)); // 10 - 9 = 1 < 2
        assert!(!cursor.is_final(11, 10));

        let no_lag = Cursor::new(0, 0);
        assert_eq!(no_lag.eligible_frontier(0), Some(0));
        assert!(no_lag.is_final(10, 10));
    }

    #[test]
    fn frontier_regression_is_reported_once() {
        let mut cursor = Cursor::new(0, 0);
        assert_eq!(cursor.observe_frontier(100), None);
        assert_eq!(cursor.observe_frontier(101), None);
        assert_eq!(
            cursor.observe_frontier(99),
            Some(FrontierRegression {
                previous: 101,
                current: 99
            })
        );
        assert_eq!(cursor.observe_frontier(99), None);
    }
}
