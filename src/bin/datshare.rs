//! # datshare CLI
//!
//! Shares a directory and prints what the engine reports.
//!
//! ## Usage
//! ```bash
//! # Share the current directory and follow changes
//! datshare .
//!
//! # Share a frozen copy
//! datshare ~/datasets/weather --snapshot
//!
//! # Skip scratch files and batch changes for a second
//! datshare ~/datasets/weather --ignore '*.tmp' --debounce 1s
//! ```

use clap::Parser;
use colored::*;
use datshare::{
    EntryKind, IdentityKey, RelPath, Report, ReportListener, ShareBuilder, ShareError, Warning,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Share a directory under a stable, content-derived key
#[derive(Parser)]
#[command(name = "datshare")]
#[command(version)]
#[command(about = "Share a directory under a stable, content-derived key")]
#[command(long_about = None)]
struct Cli {
    /// Directory to share
    #[arg(default_value = ".")]
    dir: PathBuf,

    /// Share a frozen copy instead of following changes
    #[arg(short, long)]
    snapshot: bool,

    /// Name of the control directory inside the shared directory
    #[arg(long, default_value = datshare::DEFAULT_CONTROL_DIR)]
    control_dir: String,

    /// Quiet period before changes are committed (e.g. "250ms", "2s")
    #[arg(long, value_parser = humantime::parse_duration)]
    debounce: Option<Duration>,

    /// Hashing threads (defaults to the number of CPUs)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Glob patterns to leave out of the share
    #[arg(short, long)]
    ignore: Vec<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Set up logging
    let default_level = if cli.verbose { "datshare=debug" } else { "datshare=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        eprintln!("{}: {}", "Error".red().bold(), e.user_message());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> datshare::Result<()> {
    let dir = match cli.dir.canonicalize() {
        Ok(dir) => dir,
        Err(_) => return Err(ShareError::PathNotFound(cli.dir)),
    };
    println!("Initializing Dat in {}", dir.display().to_string().bold());

    let printer = Arc::new(Printer::new());
    let mut builder = ShareBuilder::new(&dir)
        .control_dir_name(cli.control_dir)
        .ignore_patterns(cli.ignore)
        .listener(printer.clone());
    if let Some(debounce) = cli.debounce {
        builder = builder.debounce(debounce);
    }
    if let Some(workers) = cli.workers {
        builder = builder.hash_workers(workers);
    }
    let share = builder.build()?;

    if cli.snapshot {
        let outcome = share.snapshot()?;
        printer.finish();
        println!(
            "{} {}",
            "Sharing Snapshot".green().bold(),
            format!("({:.2?})", outcome.duration).dimmed()
        );
        return Ok(());
    }

    let mut session = share.live().await?;
    printer.finish();
    println!("{}", "Sharing".green().bold());

    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            None
        }
        result = session.wait() => Some(result),
    };
    let report = match finished {
        Some(result) => result?,
        None => session.stop().await?,
    };
    println!(
        "Stopped. Items: {}  Size: {}",
        report.item_count,
        report.display_size()
    );
    Ok(())
}

/// Prints engine facts the way users expect them
struct Printer {
    spinner: ProgressBar,
}

impl Printer {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.set_message("Indexing files...");
        spinner.enable_steady_tick(Duration::from_millis(100));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }

    fn line(&self, line: String) {
        self.spinner.suspend(|| println!("{}", line));
    }
}

impl ReportListener for Printer {
    fn identity_key_announced(&self, key: &IdentityKey) {
        self.line(format!("Link {}", key.to_hex().yellow().bold()));
    }

    fn entry_indexed(&self, path: &RelPath, kind: &EntryKind) {
        if !matches!(kind, EntryKind::Directory) {
            self.spinner.set_message(format!("Indexing {}", path));
            self.line(format!("{} {}", "[DONE]".green(), path));
        }
    }

    fn report_ready(&self, report: &Report) {
        self.line(format!(
            "Items: {}  Size: {}",
            report.item_count.to_string().bold(),
            report.display_size().bold()
        ));
    }

    fn warning(&self, warning: &Warning) {
        self.spinner
            .suspend(|| eprintln!("{}: {}", "Warning".yellow().bold(), warning));
    }
}
