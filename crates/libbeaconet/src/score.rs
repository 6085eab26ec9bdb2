use std::sync::atomic::{AtomicI32, Ordering};

pub const SCORE_LOW_LIMIT: i32 = 0;
pub const SCORE_HIGH_LIMIT: i32 = 1000;
/// Starting score of a peer seen for the first time.
pub const NEW_PEER_SCORE: i32 = 200;

/// Everything that moves a peer's score, with its delta.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScoreAction {
    /// Status exchange succeeded and the peer is on a viable head.
    GoodStatus,
    /// A response carried useful, valid data.
    GoodValues,
    /// The peer had nothing for a request it advertised.
    NoValues,
    /// The peer's status is behind what it already told us.
    StaleStatus,
    /// Benign request failure: timeout, connection drop, early EOF.
    PoorRequest,
    /// The peer follows a fork we consider non-viable.
    UnviableFork,
    /// A response decoded but its content was invalid.
    BadValues,
    /// Protocol violation in framing or encoding.
    InvalidRequest,
}

impl ScoreAction {
    pub fn delta(&self) -> i32 {
        match self {
            ScoreAction::GoodStatus => 50,
            ScoreAction::GoodValues => 100,
            ScoreAction::NoValues => -10,
            ScoreAction::StaleStatus => -50,
            ScoreAction::PoorRequest => -50,
            ScoreAction::UnviableFork => -200,
            ScoreAction::BadValues => -500,
            ScoreAction::InvalidRequest => -500,
        }
    }
}

/// Outcome of one score update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScoreUpdate {
    pub new_score: i32,
    /// This update moved the score from above the low limit to at/below it.
    /// The caller schedules a PeerScoreLow disconnect exactly when set.
    pub crossed_low: bool,
}

/// Additive integer score clamped to `[SCORE_LOW_LIMIT, SCORE_HIGH_LIMIT]`.
#[derive(Debug)]
pub struct PeerScoreCell(AtomicI32);

impl PeerScoreCell {
    pub fn new(initial: i32) -> Self {
        PeerScoreCell(AtomicI32::new(initial.clamp(SCORE_LOW_LIMIT, SCORE_HIGH_LIMIT)))
    }

    pub fn get(&self) -> i32 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self, value: i32) {
        self.0
            .store(value.clamp(SCORE_LOW_LIMIT, SCORE_HIGH_LIMIT), Ordering::Relaxed);
    }

    pub fn apply(&self, action: ScoreAction) -> ScoreUpdate {
        let delta = action.delta();
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let new = current
                .saturating_add(delta)
                .clamp(SCORE_LOW_LIMIT, SCORE_HIGH_LIMIT);
            match self
                .0
                .compare_exchange_weak(current, new, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => {
                    return ScoreUpdate {
                        new_score: new,
                        crossed_low: current > SCORE_LOW_LIMIT && new <= SCORE_LOW_LIMIT,
                    }
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for PeerScoreCell {
    fn default() -> Self {
        PeerScoreCell::new(NEW_PEER_SCORE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamped_high() {
        let cell = PeerScoreCell::new(SCORE_HIGH_LIMIT - 10);
        let u = cell.apply(ScoreAction::GoodValues);
        assert_eq!(u.new_score, SCORE_HIGH_LIMIT);
        assert!(!u.crossed_low);
        // Stays clamped.
        assert_eq!(cell.apply(ScoreAction::GoodStatus).new_score, SCORE_HIGH_LIMIT);
    }

    #[test]
    fn test_crossing_low_fires_once() {
        let cell = PeerScoreCell::new(40);
        let u = cell.apply(ScoreAction::PoorRequest);
        assert_eq!(u.new_score, SCORE_LOW_LIMIT);
        assert!(u.crossed_low);
        // Already at the floor: no second trigger.
        let u = cell.apply(ScoreAction::PoorRequest);
        assert_eq!(u.new_score, SCORE_LOW_LIMIT);
        assert!(!u.crossed_low);
    }

    #[test]
    fn test_score_stays_in_bounds_under_any_sequence() {
        let actions = [
            ScoreAction::GoodStatus,
            ScoreAction::GoodValues,
            ScoreAction::NoValues,
            ScoreAction::StaleStatus,
            ScoreAction::PoorRequest,
            ScoreAction::UnviableFork,
            ScoreAction::BadValues,
            ScoreAction::InvalidRequest,
        ];
        let cell = PeerScoreCell::default();
        // Deterministic pseudo-random walk over all actions.
        let mut x: u32 = 0x12345678;
        for _ in 0..10_000 {
            x = x.wrapping_mul(1664525).wrapping_add(1013904223);
            let a = actions[(x >> 16) as usize % actions.len()];
            let u = cell.apply(a);
            assert!((SCORE_LOW_LIMIT..=SCORE_HIGH_LIMIT).contains(&u.new_score));
        }
    }
}
