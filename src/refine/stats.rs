use std::ops::{AddAssign, Sub};
use std::time::Duration;

/// Counters collected while refining cards.
///
/// Each mutator queue and each refinement thread accumulates its own copy. They are summed
/// up and reset at pauses through `get_and_reset_refinement_stats`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RefinementStats {
    refinement_time: Duration,
    refined_cards: usize,
    precleaned_cards: usize,
    dirtied_cards: usize,
}

impl RefinementStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time spent performing concurrent refinement.
    pub fn refinement_time(&self) -> Duration {
        self.refinement_time
    }

    /// Number of refined cards.
    pub fn refined_cards(&self) -> usize {
        self.refined_cards
    }

    /// Refinement rate, in cards per ms.
    pub fn refinement_rate_ms(&self) -> f64 {
        let ms = self.refinement_time.as_secs_f64() * 1000.0;
        if ms > 0.0 {
            self.refined_cards as f64 / ms
        } else {
            0.0
        }
    }

    /// Number of cards for which refinement was skipped because some other thread had
    /// already refined them.
    pub fn precleaned_cards(&self) -> usize {
        self.precleaned_cards
    }

    /// Number of cards marked dirty and in need of refinement.
    pub fn dirtied_cards(&self) -> usize {
        self.dirtied_cards
    }

    pub fn inc_refinement_time(&mut self, t: Duration) {
        self.refinement_time += t;
    }

    pub fn inc_refined_cards(&mut self, cards: usize) {
        self.refined_cards += cards;
    }

    pub fn inc_precleaned_cards(&mut self, cards: usize) {
        self.precleaned_cards += cards;
    }

    pub fn inc_dirtied_cards(&mut self, cards: usize) {
        self.dirtied_cards += cards;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl AddAssign for RefinementStats {
    fn add_assign(&mut self, other: Self) {
        self.refinement_time += other.refinement_time;
        self.refined_cards += other.refined_cards;
        self.precleaned_cards += other.precleaned_cards;
        self.dirtied_cards += other.dirtied_cards;
    }
}

impl Sub for RefinementStats {
    type Output = RefinementStats;

    fn sub(self, other: Self) -> Self {
        Self {
            refinement_time: self.refinement_time.saturating_sub(other.refinement_time),
            refined_cards: self.refined_cards - other.refined_cards,
            precleaned_cards: self.precleaned_cards - other.precleaned_cards,
            dirtied_cards: self.dirtied_cards - other.dirtied_cards,
        }
    }
}

/// Refinement stats collected at a pause, split by who did the refining.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RefinementStatsSummary {
    /// Mutators refining their own buffers, attached and detached.
    pub mutator: RefinementStats,
    /// The concurrent refinement threads.
    pub concurrent: RefinementStats,
}

impl RefinementStatsSummary {
    pub fn total(&self) -> RefinementStats {
        let mut total = self.mutator;
        total += self.concurrent;
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_and_diff() {
        let mut a = RefinementStats::new();
        a.inc_refined_cards(10);
        a.inc_precleaned_cards(3);
        a.inc_dirtied_cards(7);
        a.inc_refinement_time(Duration::from_millis(2));
        let baseline = a;

        a.inc_refined_cards(5);
        let delta = a - baseline;
        assert_eq!(delta.refined_cards(), 5);
        assert_eq!(delta.precleaned_cards(), 0);

        let mut total = RefinementStats::new();
        total += a;
        total += delta;
        assert_eq!(total.refined_cards(), 20);
        assert_eq!(total.dirtied_cards(), 7);
        assert!((a.refinement_rate_ms() - 7.5).abs() < 1e-9);

        total.reset();
        assert_eq!(total, RefinementStats::default());
    }
}
