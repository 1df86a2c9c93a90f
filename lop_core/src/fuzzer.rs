use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use thiserror::Error;

use crate::config::LopConfig;
use crate::corpus::{Corpus, CorpusError};
use crate::executor::{ExecutorError, ForkserverExecutor};
use crate::feedback::{classify_status, observe_coverage, ExecutionStatus};
use crate::mutator::{mutate_havoc, mutate_splice, Dictionary, MutationOp};
use crate::scheduler::{energy, refresh_favoured, CycleScheduler, SchedulerError};
use crate::shmem::TraceMap;
use crate::strategy::MutationStrategy;

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

fn stop_requested() -> bool {
    STOP_REQUESTED.load(Ordering::SeqCst)
}

#[derive(Error, Debug)]
pub enum FuzzerError {
    /// Anything that goes wrong before the first scheduled execution:
    /// missing folders, shared-memory allocation, forkserver spawn or
    /// handshake, or a dry run that admits nothing.
    #[error("initialization failed: {0}")]
    Init(String),

    #[error(transparent)]
    Corpus(#[from] CorpusError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl FuzzerError {
    /// Process exit code for this failure: 1 for init errors, 2 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            FuzzerError::Init(_) => 1,
            _ => 2,
        }
    }
}

/// The whole fuzzing session, bundled into one explicitly passed value:
/// harness, seed store, scheduler, bandit, RNG, and timing stats.
pub struct Fuzzer {
    executor: ForkserverExecutor,
    corpus: Corpus,
    scheduler: CycleScheduler,
    strategy: MutationStrategy,
    dictionary: Dictionary,
    rng: ChaCha8Rng,
    seeds_folder: PathBuf,
    max_execs: Option<u64>,
    total_exec_time: f64,
    execs: u64,
    crashes_found: u64,
}

impl Fuzzer {
    /// Builds the session: allocates shared memory, spawns the forkserver,
    /// runs the dry run over the initial corpus, and marks favoured seeds.
    pub fn new(config: &LopConfig) -> Result<Self, FuzzerError> {
        if !config.seeds_folder.is_dir() {
            return Err(FuzzerError::Init(format!(
                "seeds folder {:?} does not exist",
                config.seeds_folder
            )));
        }

        let corpus = Corpus::new(config.queue_folder.clone(), config.crashes_folder.clone())
            .map_err(|e| FuzzerError::Init(e.to_string()))?;

        let dictionary = match &config.dictionary {
            Some(path) => Dictionary::load(path)
                .map_err(|e| FuzzerError::Init(format!("cannot load dictionary {path:?}: {e}")))?,
            None => Dictionary::empty(),
        };

        let shm = TraceMap::new()
            .map_err(|e| FuzzerError::Init(format!("cannot allocate shared memory: {e}")))?;
        log::debug!("allocated trace map, shm id {}", shm.id());

        let executor = ForkserverExecutor::spawn(
            &config.target,
            &config.target_args,
            &config.current_input,
            config.timeout(),
            shm,
        )
        .map_err(|e| FuzzerError::Init(e.to_string()))?;

        let rng = match config.rng_seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_os_rng(),
        };

        let mut fuzzer = Self {
            executor,
            corpus,
            scheduler: CycleScheduler::new(),
            strategy: MutationStrategy::new(),
            dictionary,
            rng,
            seeds_folder: config.seeds_folder.clone(),
            max_execs: config.max_execs,
            total_exec_time: 0.0,
            execs: 0,
            crashes_found: 0,
        };

        fuzzer.dry_run()?;
        refresh_favoured(&mut fuzzer.corpus);
        Ok(fuzzer)
    }

    /// Executes every initial seed once and admits the ones that bring
    /// coverage. Timeouts and crashes in the corpus are skipped with a
    /// warning; an empty outcome fails initialization.
    fn dry_run(&mut self) -> Result<(), FuzzerError> {
        let mut entries: Vec<PathBuf> = fs::read_dir(&self.seeds_folder)
            .map_err(|e| {
                FuzzerError::Init(format!("cannot read seeds folder {:?}: {e}", self.seeds_folder))
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect();
        entries.sort();

        for path in entries {
            let bytes = fs::read(&path)
                .map_err(|e| FuzzerError::Init(format!("cannot read seed {path:?}: {e}")))?;
            self.executor
                .stage_input(&bytes)
                .map_err(|e| FuzzerError::Init(e.to_string()))?;
            let result = self
                .executor
                .run_once()
                .map_err(|e| FuzzerError::Init(e.to_string()))?;
            self.record_exec(result.elapsed.as_secs_f64());

            match classify_status(result.status) {
                ExecutionStatus::Timeout => {
                    log::warn!("seed {path:?} timed out during the dry run, skipping");
                    continue;
                }
                ExecutionStatus::Crash => {
                    log::warn!("seed {path:?} crashed the target during the dry run, skipping");
                    continue;
                }
                ExecutionStatus::Ok => {}
            }

            let observation =
                observe_coverage(self.executor.trace_bits(), self.corpus.global_coverage());
            if let Some(id) = self.corpus.admit(
                &bytes,
                observation.edges,
                result.elapsed.as_secs_f64(),
            )? {
                log::debug!("dry run admitted {path:?} as seed {id}");
            }
        }

        if self.corpus.is_empty() {
            return Err(FuzzerError::Init(
                "dry run admitted no seeds; is the target instrumented?".into(),
            ));
        }
        log::info!(
            "dry run finished: {} seeds, {} edges",
            self.corpus.len(),
            self.corpus.global_coverage().len()
        );
        Ok(())
    }

    /// The fuzzing loop. Returns cleanly on SIGINT or when the configured
    /// execution budget is exhausted.
    pub fn run(&mut self) -> Result<(), FuzzerError> {
        install_sigint_handler()?;
        log::info!("starting fuzz loop over {} seeds", self.corpus.len());

        'outer: while !self.budget_exhausted() && !stop_requested() {
            let next = self.scheduler.select_next(&self.corpus, &mut self.rng)?;
            if next.new_cycle {
                refresh_favoured(&mut self.corpus);
                log::info!(
                    "starting cycle {} ({} seeds, {} edges)",
                    self.scheduler.cycle(),
                    self.corpus.len(),
                    self.corpus.global_coverage().len()
                );
            }

            let seed_path = self.corpus.seed(next.id)?.path.clone();
            let budget = energy(self.corpus.seed(next.id)?, self.avg_exec_time());

            for _ in 0..budget {
                if self.budget_exhausted() || stop_requested() {
                    break 'outer;
                }

                let op = self.strategy.select_operator(&mut self.rng);
                let data = match op {
                    MutationOp::Havoc => {
                        mutate_havoc(&self.corpus, next.id, &self.dictionary, &mut self.rng)?
                    }
                    MutationOp::Splice => {
                        mutate_splice(&self.corpus, next.id, &self.dictionary, &mut self.rng)?
                    }
                };

                self.executor.stage_input(&data)?;
                let result = self.executor.run_once()?;
                self.record_exec(result.elapsed.as_secs_f64());

                match classify_status(result.status) {
                    ExecutionStatus::Timeout => {
                        self.strategy.update_rewards(op, 0, false);
                    }
                    ExecutionStatus::Crash => {
                        self.corpus.save_crash(&data, Some(&seed_path))?;
                        self.crashes_found += 1;
                        self.strategy.update_rewards(op, 0, true);
                    }
                    ExecutionStatus::Ok => {
                        let observation = observe_coverage(
                            self.executor.trace_bits(),
                            self.corpus.global_coverage(),
                        );
                        if observation.found_new_edge() {
                            let new_edges = observation.new_edges;
                            if let Some(id) = self.corpus.admit(
                                &data,
                                observation.edges,
                                result.elapsed.as_secs_f64(),
                            )? {
                                log::info!(
                                    "new coverage via {op}: seed {id}, {} edges total",
                                    self.corpus.global_coverage().len()
                                );
                            }
                            self.strategy.update_rewards(op, new_edges, false);
                            refresh_favoured(&mut self.corpus);
                        } else {
                            self.strategy.update_rewards(op, 0, false);
                        }
                    }
                }
            }
        }

        if stop_requested() {
            log::info!("interrupt received, ending the fuzzing session");
        }
        log::info!(
            "session summary: {} execs, {} seeds, {} edges, {} crashes, cycle {}",
            self.execs,
            self.corpus.len(),
            self.corpus.global_coverage().len(),
            self.crashes_found,
            self.scheduler.cycle()
        );
        log::info!("operator stats: {}", self.strategy.summary());
        Ok(())
    }

    fn budget_exhausted(&self) -> bool {
        self.max_execs.is_some_and(|max| self.execs >= max)
    }

    fn record_exec(&mut self, elapsed_secs: f64) {
        self.total_exec_time += elapsed_secs;
        self.execs += 1;
    }

    /// Running mean over every harness execution so far.
    fn avg_exec_time(&self) -> f64 {
        if self.execs == 0 {
            return 0.0;
        }
        self.total_exec_time / self.execs as f64
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn executions(&self) -> u64 {
        self.execs
    }

    pub fn crashes_found(&self) -> u64 {
        self.crashes_found
    }
}

fn install_sigint_handler() -> Result<(), FuzzerError> {
    let action = SigAction::new(
        SigHandler::Handler(handle_sigint),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGINT, &action) }
        .map_err(|e| FuzzerError::Init(format!("cannot install SIGINT handler: {e}")))?;
    Ok(())
}
