use rand::Rng;

use crate::mutator::MutationOp;

/// Exploration rate of the epsilon-greedy policy.
const EPSILON: f64 = 0.1;
/// A crash is worth this many newly covered edges when scoring.
const CRASH_WEIGHT: u64 = 10;

/// Running tally for one mutation operator.
#[derive(Debug, Default, Clone, Copy)]
pub struct OperatorStats {
    /// How many mutants this operator produced.
    pub uses: u64,
    /// Sum of new edges attributed to this operator.
    pub coverage_reward: u64,
    /// How many of its mutants crashed the target.
    pub crashes: u64,
}

impl OperatorStats {
    fn score(&self) -> f64 {
        (self.coverage_reward + CRASH_WEIGHT * self.crashes) as f64 / self.uses.max(1) as f64
    }
}

/// Epsilon-greedy selection between the two top-level operators, rewarded
/// by coverage discoveries and crashes.
#[derive(Debug, Default)]
pub struct MutationStrategy {
    havoc: OperatorStats,
    splice: OperatorStats,
}

impl MutationStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks the operator for the next mutant: explore uniformly with
    /// probability epsilon, otherwise exploit the best average score.
    /// Ties go to havoc.
    pub fn select_operator<R: Rng>(&self, rng: &mut R) -> MutationOp {
        if rng.random_bool(EPSILON) {
            return if rng.random_bool(0.5) {
                MutationOp::Havoc
            } else {
                MutationOp::Splice
            };
        }
        if self.havoc.score() >= self.splice.score() {
            MutationOp::Havoc
        } else {
            MutationOp::Splice
        }
    }

    /// Credits the operator that produced the last mutant. `new_edges` is
    /// counted against the global set before it absorbs the observation.
    pub fn update_rewards(&mut self, op: MutationOp, new_edges: usize, crashed: bool) {
        let stats = self.stats_mut(op);
        stats.uses += 1;
        stats.coverage_reward += new_edges as u64;
        if crashed {
            stats.crashes += 1;
        }
    }

    pub fn stats(&self, op: MutationOp) -> &OperatorStats {
        match op {
            MutationOp::Havoc => &self.havoc,
            MutationOp::Splice => &self.splice,
        }
    }

    fn stats_mut(&mut self, op: MutationOp) -> &mut OperatorStats {
        match op {
            MutationOp::Havoc => &mut self.havoc,
            MutationOp::Splice => &mut self.splice,
        }
    }

    /// One-line summary for the shutdown log.
    pub fn summary(&self) -> String {
        format!(
            "havoc: {} uses / {} edges / {} crashes, splice: {} uses / {} edges / {} crashes",
            self.havoc.uses,
            self.havoc.coverage_reward,
            self.havoc.crashes,
            self.splice.uses,
            self.splice.coverage_reward,
            self.splice.crashes,
        )
    }
}
