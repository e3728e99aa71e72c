//! lmm: eigen-rotated linear mixed model association testing.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Crates whose events `-v` turns up; dependencies stay at `warn`.
const LOG_TARGETS: &[&str] = &["lmm", "lmm_core", "lmm_geno", "lmm_linalg"];

#[derive(Parser)]
#[command(
    name = "lmm",
    version,
    about = "Linear mixed model GWAS with a rotated kinship spectrum",
    long_about = "Single-marker likelihood-ratio tests under a linear mixed model.\n\
                   The kinship is eigendecomposed once per chromosome and every\n\
                   likelihood is evaluated in its eigenbasis."
)]
struct Cli {
    /// Worker threads for marker batches (0 = one per core)
    #[arg(long, default_value = "1", global = true)]
    threads: usize,

    /// Verbosity: -v progress, -vv per-candidate h2 search (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Test every marker against every phenotype
    Assoc(commands::assoc::AssocArgs),
}

/// Filter directive for `-v` count `verbose`, scoped to the lmm crates.
fn log_directive(verbose: u8) -> String {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    std::iter::once("warn".to_string())
        .chain(LOG_TARGETS.iter().map(|t| format!("{}={}", t, level)))
        .collect::<Vec<_>>()
        .join(",")
}

fn init_logging(verbose: u8) {
    let filter = EnvFilter::try_from_env("LMM_LOG")
        .unwrap_or_else(|_| EnvFilter::new(log_directive(verbose)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 2)
        .with_writer(std::io::stderr)
        .init();
}

/// Size the global rayon pool; marker batches are rotated and tested on it.
fn init_thread_pool(threads: usize) -> usize {
    match rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("lmm-batch-{}", i))
        .build_global()
    {
        Ok(()) => {}
        Err(e) => warn!("Could not configure thread pool: {}", e),
    }
    rayon::current_num_threads()
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let n_threads = init_thread_pool(cli.threads);
    info!("lmm v{} ({} threads)", env!("CARGO_PKG_VERSION"), n_threads);

    match cli.command {
        Commands::Assoc(args) => commands::assoc::run(args),
    }
}
