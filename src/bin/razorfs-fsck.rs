//! Offline checker CLI.
//!
//! Exit codes: 0 clean, 1 errors found, 2 unrepairable, 3 internal error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use razorfs::fsck::{check, CheckOptions};

#[derive(Parser)]
#[command(name = "razorfs-fsck", about = "Check and repair a razorfs data directory")]
struct Args {
    /// Report findings without touching anything (default).
    #[arg(long)]
    dry_run: bool,

    /// Apply repairs: reconnect orphans, drop broken links, truncate
    /// corrupted payload tails.
    #[arg(long, conflicts_with = "dry_run")]
    auto_repair: bool,

    /// Print each finding as it is discovered.
    #[arg(long, short)]
    verbose: bool,

    /// The filesystem's data directory.
    data_dir: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if args.verbose { "info" } else { "warn" }),
    )
    .init();

    let options = CheckOptions {
        repair: args.auto_repair && !args.dry_run,
        verbose: args.verbose,
    };

    match check(&args.data_dir, options) {
        Ok(summary) => {
            for finding in &summary.findings {
                eprintln!("phase {}: {}", finding.phase, finding.message);
            }
            if summary.unclean_shutdown {
                eprintln!("note: unclean shutdown; recovery will run at next mount");
            }
            match summary.exit_code() {
                0 => println!("clean"),
                code => {
                    println!(
                        "{} finding(s), {} repaired{}",
                        summary.errors_found(),
                        summary.repaired,
                        if summary.unrepairable() { ", unrepairable issues remain" } else { "" }
                    );
                    return ExitCode::from(code as u8);
                }
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("razorfs-fsck: {err}");
            ExitCode::from(3)
        }
    }
}
