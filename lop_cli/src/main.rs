use clap::Parser;
use lop_core::config::{
    default_crashes_folder, default_current_input, default_queue_folder, default_timeout_ms,
};
use lop_core::{Fuzzer, LopConfig};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[clap(name = "lop", author, version, about = "A lightweight coverage-guided grey-box fuzzer", long_about = None)]
struct Cli {
    /// TOML configuration file; flags below override its values.
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,

    /// Instrumented target binary.
    #[clap(long)]
    target: Option<PathBuf>,

    /// Folder with the initial corpus.
    #[clap(long)]
    seeds: Option<PathBuf>,

    /// Folder where admitted seeds are written.
    #[clap(long)]
    queue: Option<PathBuf>,

    /// Folder where crashing inputs are written.
    #[clap(long)]
    crashes: Option<PathBuf>,

    /// Path of the staged-input file the target reads.
    #[clap(long)]
    current_input: Option<PathBuf>,

    /// Per-execution timeout in milliseconds.
    #[clap(long)]
    timeout_ms: Option<u64>,

    /// AFL-format dictionary file.
    #[clap(long)]
    dictionary: Option<PathBuf>,

    /// Fixed RNG seed for reproducible runs.
    #[clap(long)]
    rng_seed: Option<u64>,

    /// Stop after this many target executions.
    #[clap(long)]
    max_execs: Option<u64>,

    /// Arguments passed to the target binary (after --).
    #[clap(last = true)]
    target_args: Vec<String>,
}

fn build_config(cli: Cli) -> Result<LopConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(path) => LopConfig::load_from_file(path)?,
        None => {
            let target = cli
                .target
                .clone()
                .ok_or_else(|| anyhow::anyhow!("--target is required without a config file"))?;
            let seeds = cli
                .seeds
                .clone()
                .ok_or_else(|| anyhow::anyhow!("--seeds is required without a config file"))?;
            LopConfig {
                target,
                target_args: Vec::new(),
                seeds_folder: seeds,
                queue_folder: default_queue_folder(),
                crashes_folder: default_crashes_folder(),
                current_input: default_current_input(),
                timeout_ms: default_timeout_ms(),
                dictionary: None,
                rng_seed: None,
                max_execs: None,
            }
        }
    };

    if let Some(target) = cli.target {
        config.target = target;
    }
    if let Some(seeds) = cli.seeds {
        config.seeds_folder = seeds;
    }
    if let Some(queue) = cli.queue {
        config.queue_folder = queue;
    }
    if let Some(crashes) = cli.crashes {
        config.crashes_folder = crashes;
    }
    if let Some(current_input) = cli.current_input {
        config.current_input = current_input;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.timeout_ms = timeout_ms;
    }
    if let Some(dictionary) = cli.dictionary {
        config.dictionary = Some(dictionary);
    }
    if let Some(rng_seed) = cli.rng_seed {
        config.rng_seed = Some(rng_seed);
    }
    if let Some(max_execs) = cli.max_execs {
        config.max_execs = Some(max_execs);
    }
    if !cli.target_args.is_empty() {
        config.target_args = cli.target_args;
    }

    Ok(config)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match build_config(cli) {
        Ok(config) => config,
        Err(err) => {
            log::error!("{err}");
            return ExitCode::from(1);
        }
    };
    log::debug!("effective configuration: {config:#?}");

    let mut fuzzer = match Fuzzer::new(&config) {
        Ok(fuzzer) => fuzzer,
        Err(err) => {
            log::error!("{err}");
            return ExitCode::from(err.exit_code() as u8);
        }
    };

    match fuzzer.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}
