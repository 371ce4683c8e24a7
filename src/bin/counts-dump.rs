//! Prints the contents of a counts file.
#![forbid(unsafe_code)]

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use graphcounts::admin::dump;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "counts-dump",
    version,
    about = "Dump the highest gap-free transaction id and every stored count of a counts file"
)]
struct Cli {
    #[arg(value_name = "FILE", help = "Counts file to dump")]
    path: PathBuf,

    #[arg(long, help = "Print a summary line to stderr after the dump")]
    summary: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match dump(&cli.path, &mut out) {
        Ok(report) => {
            if cli.summary {
                let _ = out.flush();
                eprintln!(
                    "{} entries, highest gap-free txId {}, {} stray txIds",
                    report.entries,
                    report.highest_gap_free,
                    report.stray_tx_ids.len()
                );
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("counts-dump: {err}");
            ExitCode::FAILURE
        }
    }
}
