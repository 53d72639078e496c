//! ELO rating updates, per spec §4.4.
//!
//! Default rating and K-factor are configurable per [`EloConfig`] rather than
//! hard-coded, per the Open Question in spec §9 ("Default ELO and K-factor
//! are hard-coded... Consider making them configuration").

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EloConfig {
    pub default_rating: f64,
    pub k_factor: f64,
}

impl Default for EloConfig {
    fn default() -> Self {
        EloConfig {
            default_rating: 1200.0,
            k_factor: 32.0,
        }
    }
}

/// The outcome of a single game from one player's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Score {
    Win,
    Draw,
    Loss,
}

impl Score {
    pub fn as_f64(self) -> f64 {
        match self {
            Score::Win => 1.0,
            Score::Draw => 0.5,
            Score::Loss => 0.0,
        }
    }

    pub fn opponent(self) -> Score {
        match self {
            Score::Win => Score::Loss,
            Score::Draw => Score::Draw,
            Score::Loss => Score::Win,
        }
    }
}

fn expected_score(rating: f64, opponent_rating: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf((opponent_rating - rating) / 400.0))
}

/// Updates a single player's rating given the opponent's rating and the
/// game's outcome for that player. Call once per player per game; symmetric
/// under swapping (rating, opponent_rating, score.opponent()).
pub fn update_rating(rating: f64, opponent_rating: f64, score: Score, k_factor: f64) -> f64 {
    let expected = expected_score(rating, opponent_rating);
    rating + k_factor * (score.as_f64() - expected)
}

/// Applies the update to both sides of a single game and returns
/// `(new_black, new_white)`, matching spec §4.4's "call this once for the
/// (Black, White) pair and persist both new ratings".
pub fn update_pair(
    black_rating: f64,
    white_rating: f64,
    black_score: Score,
    config: &EloConfig,
) -> (f64, f64) {
    let new_black = update_rating(black_rating, white_rating, black_score, config.k_factor);
    let new_white = update_rating(
        white_rating,
        black_rating,
        black_score.opponent(),
        config.k_factor,
    );
    (new_black, new_white)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_ratings_k32_white_wins_gives_plus_minus_16() {
        let config = EloConfig::default();
        let (new_black, new_white) = update_pair(1200.0, 1200.0, Score::Loss, &config);
        assert!((new_white - 1216.0).abs() < 1e-9);
        assert!((new_black - 1184.0).abs() < 1e-9);
    }

    #[test]
    fn symmetric_delta_for_constant_k() {
        let config = EloConfig::default();
        let (new_black, new_white) = update_pair(1400.0, 1300.0, Score::Win, &config);
        let delta_black = new_black - 1400.0;
        let delta_white = new_white - 1300.0;
        assert!((delta_black + delta_white).abs() < 1e-9);
    }

    #[test]
    fn draw_between_equals_is_a_no_op() {
        let config = EloConfig::default();
        let (new_black, new_white) = update_pair(1500.0, 1500.0, Score::Draw, &config);
        assert!((new_black - 1500.0).abs() < 1e-9);
        assert!((new_white - 1500.0).abs() < 1e-9);
    }
}
