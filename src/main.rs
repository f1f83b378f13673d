use clap::Parser;
use seglower::config::{AtomicsTable, LowerConfig};
use seglower::error::{self, ErrorReported};
use std::fs;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Lower a descriptor file of segmented operations and print the resulting kernels
#[derive(Parser)]
#[command(version, author = "The seglower developers")]
struct Opts {
    /// Path to the descriptor file
    source_file: String,
    /// Output file; the program is written to stdout otherwise
    #[arg(short, long)]
    output: Option<String>,
    /// Default group size of built-in kernels
    #[arg(long)]
    group_size: Option<i64>,
    /// Native atomics of the target (`cuda` or `opencl`)
    #[arg(long)]
    atomics: Option<AtomicsTable>,
    /// Upper bound on the length of histogram lock arrays
    #[arg(long)]
    max_locks: Option<i64>,
    /// Log every emitted kernel
    #[arg(short, long)]
    verbose: bool,
}

fn config(opts: &Opts) -> Result<LowerConfig, ErrorReported> {
    let mut config = LowerConfig::from_env().map_err(|err| error::emit_message(&err.to_string()))?;
    if let Some(group_size) = opts.group_size {
        if group_size <= 0 {
            return Err(error::emit_message("--group-size must be positive"));
        }
        config.size_classes.default_group_size = group_size;
    }
    if let Some(atomics) = opts.atomics {
        config.atomics = atomics;
    }
    if let Some(max_locks) = opts.max_locks {
        if max_locks <= 0 {
            return Err(error::emit_message("--max-locks must be positive"));
        }
        config.max_locks = max_locks;
    }
    Ok(config)
}

fn run(opts: &Opts) -> Result<(), ErrorReported> {
    let config = config(opts)?;
    let lowered = seglower::compile_with(&opts.source_file, &config)?;
    match &opts.output {
        Some(path) => fs::write(path, lowered).map_err(|err| {
            error::emit_message(&format!("couldn't write {}: {}", path, err))
        }),
        None => {
            print!("{}", lowered);
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    let opts = Opts::parse();
    let default_level = if opts.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    match run(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(ErrorReported) => ExitCode::FAILURE,
    }
}
