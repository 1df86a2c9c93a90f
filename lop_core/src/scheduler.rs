use std::collections::HashSet;

use rand::Rng;
use thiserror::Error;

use crate::corpus::{Corpus, Seed};

/// Probability of picking from the favoured subset when it is non-empty.
const FAVOURED_BIAS: f64 = 0.9;

/// Baseline performance score before the time and coverage factors.
const BASE_PERF: f64 = 100.0;
/// Hard bounds on the number of mutants derived from one seed visit.
const MIN_ENERGY: u32 = 1;
const MAX_ENERGY: u32 = 1000;

/// Errors that can occur during scheduler operations.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The queue is empty, so no seed can be scheduled.
    #[error("Queue is empty, cannot select a seed")]
    QueueEmpty,
}

/// Result of one scheduling step.
#[derive(Debug, Clone, Copy)]
pub struct NextSeed {
    pub id: usize,
    /// True when this selection opened a fresh cycle over the queue.
    pub new_cycle: bool,
}

/// Walks the queue in cycles, selecting every seed at most once per cycle
/// and biasing selection towards favoured seeds.
#[derive(Debug, Default)]
pub struct CycleScheduler {
    used_in_cycle: HashSet<usize>,
    cycle: u64,
}

impl CycleScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed cycles over the queue so far.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Selects the next seed for this cycle.
    ///
    /// When every seed in the current queue has been used, the cycle ends:
    /// the used set clears, the counter increments, and selection restarts
    /// over the whole queue. With probability 0.9 an unused favoured seed is
    /// picked (when any exists), otherwise any unused seed, uniformly.
    pub fn select_next<R: Rng>(
        &mut self,
        corpus: &Corpus,
        rng: &mut R,
    ) -> Result<NextSeed, SchedulerError> {
        if corpus.is_empty() {
            return Err(SchedulerError::QueueEmpty);
        }

        let mut new_cycle = false;
        if self.used_in_cycle.len() >= corpus.len() {
            self.used_in_cycle.clear();
            self.cycle += 1;
            new_cycle = true;
        }

        let unused: Vec<usize> = corpus
            .seeds()
            .iter()
            .map(|s| s.id)
            .filter(|id| !self.used_in_cycle.contains(id))
            .collect();
        let favoured: Vec<usize> = unused
            .iter()
            .copied()
            .filter(|id| corpus.seeds()[*id].favoured)
            .collect();

        let id = if !favoured.is_empty() && rng.random_bool(FAVOURED_BIAS) {
            favoured[rng.random_range(0..favoured.len())]
        } else {
            unused[rng.random_range(0..unused.len())]
        };

        self.used_in_cycle.insert(id);
        Ok(NextSeed { id, new_cycle })
    }
}

/// Recomputes the favoured flags: for every covered edge, the seed with the
/// smallest `size * exec_time` among its coverers wins; a seed that wins any
/// edge is favoured, everything else is not. Ties go to the lowest id.
pub fn refresh_favoured(corpus: &mut Corpus) {
    let mut winners = HashSet::new();
    for ids in corpus.edge_index().values() {
        let best = ids.iter().copied().min_by(|a, b| {
            let va = corpus.seeds()[*a].valuation();
            let vb = corpus.seeds()[*b].valuation();
            va.total_cmp(&vb)
        });
        if let Some(id) = best {
            winners.insert(id);
        }
    }
    corpus.set_favoured(&winners);
}

/// Number of mutants to derive from `seed` on this visit.
///
/// Faster-than-average seeds and seeds with more coverage get more energy.
/// The time factor is clamped to [0.1, 3.0] and the result to [1, 1000].
pub fn energy(seed: &Seed, avg_exec_time: f64) -> u32 {
    let mut perf = BASE_PERF;

    if seed.exec_time > 0.0 && avg_exec_time > 0.0 {
        perf *= (avg_exec_time / seed.exec_time).clamp(0.1, 3.0);
    }
    perf *= 1.0 + seed.coverage.len() as f64 / 100.0;

    (perf.round() as u32).clamp(MIN_ENERGY, MAX_ENERGY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn seed_with(id: usize, coverage_len: usize, exec_time: f64, size: u64) -> Seed {
        Seed {
            id,
            path: PathBuf::from(format!("queue/id_{id}")),
            coverage: (0..coverage_len).collect(),
            exec_time,
            size,
            favoured: false,
        }
    }

    fn corpus_with_seeds(dir: &std::path::Path, coverages: &[HashSet<usize>]) -> Corpus {
        let mut corpus = Corpus::new(dir.join("queue"), dir.join("crashes")).unwrap();
        for (i, coverage) in coverages.iter().enumerate() {
            let bytes = vec![b'a' + (i as u8 % 26); 4 + i];
            let id = corpus
                .admit(&bytes, coverage.clone(), 0.01 * (i + 1) as f64)
                .unwrap()
                .expect("test coverages must be novel");
            assert_eq!(id, i);
        }
        corpus
    }

    #[test]
    fn select_next_on_empty_queue_errors() {
        let dir = tempdir().unwrap();
        let corpus = Corpus::new(dir.path().join("q"), dir.path().join("c")).unwrap();
        let mut scheduler = CycleScheduler::new();
        let mut rng = ChaCha8Rng::from_seed([0; 32]);
        assert!(matches!(
            scheduler.select_next(&corpus, &mut rng),
            Err(SchedulerError::QueueEmpty)
        ));
    }

    #[test]
    fn one_cycle_selects_every_seed_exactly_once() {
        let dir = tempdir().unwrap();
        let coverages: Vec<HashSet<usize>> = (0..10).map(|i| HashSet::from([i])).collect();
        let corpus = corpus_with_seeds(dir.path(), &coverages);
        let mut scheduler = CycleScheduler::new();
        let mut rng = ChaCha8Rng::from_seed([1; 32]);

        let mut selected = HashSet::new();
        for _ in 0..10 {
            let next = scheduler.select_next(&corpus, &mut rng).unwrap();
            assert!(!next.new_cycle, "cycle ended early");
            assert!(selected.insert(next.id), "seed {} selected twice", next.id);
        }
        assert_eq!(selected.len(), 10);
        assert_eq!(scheduler.cycle(), 0);

        // The eleventh selection opens cycle 1.
        let next = scheduler.select_next(&corpus, &mut rng).unwrap();
        assert!(next.new_cycle);
        assert_eq!(scheduler.cycle(), 1);
    }

    #[test]
    fn favoured_seeds_dominate_selection() {
        let dir = tempdir().unwrap();
        let coverages: Vec<HashSet<usize>> = (0..4).map(|i| HashSet::from([i])).collect();
        let mut corpus = corpus_with_seeds(dir.path(), &coverages);
        corpus.set_favoured(&HashSet::from([2]));

        let mut rng = ChaCha8Rng::from_seed([2; 32]);
        let mut hits = 0;
        for _ in 0..100 {
            let mut scheduler = CycleScheduler::new();
            if scheduler.select_next(&corpus, &mut rng).unwrap().id == 2 {
                hits += 1;
            }
        }
        // First pick of each run should land on the single favoured seed
        // about 90 percent of the time.
        assert!(hits > 80, "favoured seed picked only {hits}/100 times");
    }

    #[test]
    fn refresh_favoured_covers_every_indexed_edge() {
        let dir = tempdir().unwrap();
        let coverages = vec![
            HashSet::from([1, 2]),
            HashSet::from([2, 3]),
            HashSet::from([3, 4, 5]),
        ];
        let mut corpus = corpus_with_seeds(dir.path(), &coverages);
        refresh_favoured(&mut corpus);

        for (edge, ids) in corpus.edge_index() {
            assert!(
                ids.iter().any(|id| corpus.seeds()[*id].favoured),
                "edge {edge} has no favoured coverer"
            );
        }
        // Every favoured seed is the minimiser for at least one edge.
        for seed in corpus.seeds().iter().filter(|s| s.favoured) {
            let wins_some_edge = seed.coverage.iter().any(|edge| {
                corpus.edge_index()[edge]
                    .iter()
                    .all(|other| {
                        corpus.seeds()[*other].valuation() >= seed.valuation() || *other == seed.id
                    })
            });
            assert!(wins_some_edge, "seed {} is favoured but wins no edge", seed.id);
        }
    }

    #[test]
    fn refresh_favoured_picks_cheapest_coverer() {
        let dir = tempdir().unwrap();
        // Seed 0 is admitted first with the smaller input and the shorter
        // exec time, so it wins the shared edge.
        let coverages = vec![HashSet::from([7]), HashSet::from([7, 8])];
        let mut corpus = corpus_with_seeds(dir.path(), &coverages);
        refresh_favoured(&mut corpus);

        assert!(corpus.seed(0).unwrap().favoured, "cheapest coverer of edge 7");
        assert!(corpus.seed(1).unwrap().favoured, "sole coverer of edge 8");

        // Re-running after a queue change keeps the pass idempotent.
        refresh_favoured(&mut corpus);
        assert!(corpus.seed(0).unwrap().favoured);
    }

    #[test]
    fn energy_stays_within_bounds() {
        let avg = 0.01;
        for coverage_len in [0, 1, 100, 1000, 65536] {
            for exec_time in [0.000001, 0.001, 0.01, 1.0, 100.0] {
                let seed = seed_with(0, coverage_len, exec_time, 128);
                let e = energy(&seed, avg);
                assert!((MIN_ENERGY..=MAX_ENERGY).contains(&e));
            }
        }
    }

    #[test]
    fn energy_rewards_fast_and_covering_seeds() {
        let avg = 0.01;
        let baseline = seed_with(0, 0, 0.01, 128);
        assert_eq!(energy(&baseline, avg), 100);

        let fast = seed_with(1, 0, 0.005, 128);
        let slow = seed_with(2, 0, 0.02, 128);
        assert!(energy(&fast, avg) > energy(&baseline, avg));
        assert!(energy(&slow, avg) < energy(&baseline, avg));

        let covering = seed_with(3, 200, 0.01, 128);
        assert_eq!(energy(&covering, avg), 300);

        // The time factor saturates at 3x.
        let very_fast = seed_with(4, 0, 0.0000001, 128);
        assert_eq!(energy(&very_fast, avg), 300);
    }

    #[test]
    fn energy_handles_degenerate_timings() {
        let seed = seed_with(0, 50, 0.0, 128);
        assert_eq!(energy(&seed, 0.01), 150);
        let seed = seed_with(1, 0, 0.01, 128);
        assert_eq!(energy(&seed, 0.0), 100);
    }
}
