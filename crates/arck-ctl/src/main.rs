//! # arckctl
//!
//! Command-line driver for the arck coherence core.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use arck_config::logging::{init_logging, LogLevel};
use arck_config::{log_ctl_error, log_ctl_info, AdmissionMode, Config, LockMode};
use arck_ctl::{run_lease_stress, run_table_stress, LeaseStress, TableStress};
use clap::{Parser, Subcommand};

/// arck - lease coherence core and concurrent chained hash table
#[derive(Parser)]
#[command(name = "arckctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Project root whose `.arck/config.toml` is layered over the global one
    #[arg(long, env = "ARCK_PROJECT", global = true)]
    project: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as TOML
    Config {
        /// Print the built-in defaults instead
        #[arg(long)]
        default: bool,
    },

    /// Hammer one table from many threads and verify its contents afterwards
    StressTable {
        #[arg(short = 'j', long, default_value_t = 4)]
        threads: usize,

        /// Keys inserted per thread
        #[arg(short, long, default_value_t = 10_000)]
        keys: usize,

        /// `spin` or `rw-lock`; defaults to the configured mode
        #[arg(long)]
        lock_mode: Option<LockMode>,
    },

    /// Let trust groups race for leases and check critical sections never clash
    StressLease {
        #[arg(short, long, default_value_t = 4)]
        groups: u32,

        #[arg(short, long, default_value_t = 8)]
        inodes: u32,

        /// Acquire attempts per group
        #[arg(short, long, default_value_t = 20_000)]
        rounds: usize,

        /// `plain-bit` or `sentinel`; defaults to the configured mode
        #[arg(long)]
        admission: Option<AdmissionMode>,

        /// Lease period in milliseconds
        #[arg(long)]
        period_ms: Option<u64>,
    },
}

fn load_config(project: Option<&PathBuf>) -> Result<Config> {
    match project {
        Some(root) => Config::load_from(root),
        None => Config::load(),
    }
    .context("loading configuration")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(LogLevel::from_verbosity(cli.verbose));

    match cli.command {
        Commands::Config { default } => {
            if default {
                print!("{}", Config::default_toml());
            } else {
                print!("{}", load_config(cli.project.as_ref())?.to_toml());
            }
        }

        Commands::StressTable {
            threads,
            keys,
            lock_mode,
        } => {
            let config = load_config(cli.project.as_ref())?;
            let opts = TableStress {
                threads,
                keys,
                lock_mode: lock_mode.unwrap_or(config.table.lock_mode),
                table: config.table,
            };
            let report = run_table_stress(&opts)?;
            println!("{report}");
            if !report.is_clean() {
                log_ctl_error!("Table stress failed", violations = report.violations.len());
                bail!("table stress found {} violations", report.violations.len());
            }
        }

        Commands::StressLease {
            groups,
            inodes,
            rounds,
            admission,
            period_ms,
        } => {
            let config = load_config(cli.project.as_ref())?;
            let mut lease = config.lease;
            if let Some(mode) = admission {
                lease.admission = mode;
            }
            if let Some(period_ms) = period_ms {
                lease.period_ms = period_ms;
            }
            let opts = LeaseStress {
                groups,
                inodes,
                rounds,
                lease,
                table: config.table,
            };
            let report = run_lease_stress(&opts)?;
            println!("{report}");
            if report.overlaps > 0 && opts.lease.admission == AdmissionMode::PlainBit {
                log_ctl_info!(
                    "Plain-bit admission let conflicting sections overlap",
                    overlaps = report.overlaps,
                );
            }
            if !report.is_clean() {
                log_ctl_error!("Lease stress failed", violations = report.violations.len());
                bail!("lease stress found {} violations", report.violations.len());
            }
        }
    }
    Ok(())
}
