pub mod config;
pub mod corpus;
pub mod executor;
pub mod feedback;
pub mod fuzzer;
pub mod mutator;
pub mod scheduler;
pub mod shmem;
pub mod strategy;

pub use config::{ConfigError, LopConfig};
pub use corpus::{Corpus, CorpusError, Seed};
pub use executor::{ExecResult, ExecutorError, ForkserverExecutor, TIMEOUT_STATUS};
pub use feedback::{classify_status, observe_coverage, CoverageObservation, ExecutionStatus};
pub use fuzzer::{Fuzzer, FuzzerError};
pub use mutator::{Dictionary, MutationOp};
pub use scheduler::{energy, refresh_favoured, CycleScheduler, SchedulerError};
pub use shmem::{TraceMap, MAP_SIZE, SHM_ENV_VAR};
pub use strategy::{MutationStrategy, OperatorStats};
