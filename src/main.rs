//! Purpose: `pmstage` administrative CLI: create, inspect, and sweep
//! staging-cache directory files offline.
//! Role: Binary crate root; parses args, runs one command, emits JSON on
//! stdout for machine-readable output.
//! Invariants: Must not run against a directory a live process has open;
//! the advisory lock taken on open enforces this (`Busy`).
//! Invariants: Process exit code is derived from `to_exit_code`.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pmstage::{to_exit_code, Directory, Error};

#[derive(Parser)]
#[command(
    name = "pmstage",
    version,
    about = "Persistent-memory staging caches for append-only files",
    long_about = None,
    after_help = r#"EXAMPLES
  $ pmstage create /mnt/pmem/cache.pmstage --size 16777216 --slots 8
  $ pmstage info /mnt/pmem/cache.pmstage
  $ pmstage sweep /mnt/pmem/cache.pmstage   # after an unclean shutdown
"#
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new directory file (refuses to overwrite)
    Create {
        path: PathBuf,
        /// Total size of the directory file in bytes
        #[arg(long)]
        size: u64,
        /// Number of cache slots
        #[arg(long)]
        slots: u64,
    },
    /// Print directory geometry and per-slot state as JSON
    Info { path: PathBuf },
    /// Replay unflushed slot tails into their target files and free the slots
    Sweep { path: PathBuf },
}

fn main() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();

    let cli = Cli::parse();
    let exit_code = match run(cli.command) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("pmstage: {err}");
            if let Some(hint) = err.hint() {
                eprintln!("hint: {hint}");
            }
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run(command: Command) -> Result<(), Error> {
    match command {
        Command::Create { path, size, slots } => {
            let dir = Directory::create(&path, size, slots)?;
            print_info(&dir)
        }
        Command::Info { path } => {
            let dir = Directory::open(&path)?;
            print_info(&dir)
        }
        Command::Sweep { path } => {
            let dir = Directory::open(&path)?;
            dir.sweep()?;
            print_info(&dir)
        }
    }
}

fn print_info(dir: &Directory) -> Result<(), Error> {
    let info = dir.info()?;
    let rendered = serde_json::to_string_pretty(&info).map_err(|err| {
        Error::new(pmstage::ErrorKind::Internal)
            .with_message("failed to render directory info")
            .with_source(err)
    })?;
    println!("{rendered}");
    Ok(())
}
