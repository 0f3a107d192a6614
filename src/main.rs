//! CLI entry point for `mboxstore`.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::{CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use mboxstore::config::{self, Config};
use mboxstore::index::fsck::{fsck_mailbox, FsckReport};
use mboxstore::index::persist;
use mboxstore::index::store::{LockMode, MailIndex};
use mboxstore::model::flags::{HeaderFlags, MailFlags};

#[derive(Parser)]
#[command(
    name = "mboxstore",
    version,
    about = "Keep an MBOX file and its binary index in agreement"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the index with the mailbox file
    Fsck {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Build the index of an MBOX file
    Index {
        path: PathBuf,
        /// Discard any existing index and index every message again
        #[arg(short, long)]
        force: bool,
    },
    /// List indexed messages
    List {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Set the flags of one message in the index (letters RAFDT)
    Flag {
        path: PathBuf,
        seq: u32,
        flags: String,
    },
    /// Show index statistics
    Stats {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Show or initialize the configuration
    Config {
        /// Write the default configuration file
        #[arg(long)]
        init: bool,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::load_config();

    // Configure logging: stderr + optional log file
    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    match cli.command {
        Commands::Fsck { path, json } => cmd_fsck(&path, json, &config),
        Commands::Index { path, force } => cmd_index(&path, force, &config),
        Commands::List { path, json } => cmd_list(&path, json, &config),
        Commands::Flag { path, seq, flags } => cmd_flag(&path, seq, &flags, &config),
        Commands::Stats { path, json } => cmd_stats(&path, json, &config),
        Commands::Config { init } => cmd_config(init, &config),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    // Try to set up file logging
    let log_path = config::log_file_path(config);
    let log_dir = config::cache_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_name = log_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "mboxstore.log".into());
        let file_appender = tracing_appender::rolling::never(&log_dir, file_name);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        // Fall back to stderr only
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg} ({elapsed})")
    {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn require_file(path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }
    Ok(())
}

/// Reconcile, save, and print what the pass did.
fn cmd_fsck(path: &Path, json: bool, config: &Config) -> anyhow::Result<()> {
    require_file(path)?;

    let mut index = persist::load_index(path, config)?.unwrap_or_else(|| {
        let mut index = MailIndex::new(path);
        index.set_header_flags(HeaderFlags::FSCK);
        index
    });

    let pb = spinner("Checking index");
    let start = Instant::now();
    let result = fsck_mailbox(&mut index, config);
    pb.finish_and_clear();
    let report = result?;
    let elapsed = start.elapsed();
    let idx_path = persist::save_index(&index, config)?;

    if json {
        let output = serde_json::json!({
            "file": path.to_string_lossy(),
            "index": idx_path.to_string_lossy(),
            "messages": index.len(),
            "report": report,
            "elapsed_ms": elapsed.as_millis(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_report(path, &index, &report, elapsed);
    }
    Ok(())
}

fn print_report(path: &Path, index: &MailIndex, report: &FsckReport, elapsed: Duration) {
    println!();
    println!("  {:<20} {}", "File", path.display());
    println!("  {:<20} {}", "Messages", index.len());
    println!("  {:<20} {}", "Matched", report.matched);
    println!("  {:<20} {}", "Updated", report.updated);
    println!("  {:<20} {}", "Relocated", report.relocated);
    println!("  {:<20} {}", "Resized", report.resized);
    println!("  {:<20} {}", "Expunged", report.expunged);
    println!("  {:<20} {}", "Appended", report.appended);
    if report.dirty {
        println!("  {:<20} yes", "Unsynced flags");
    }
    println!("  {:<20} {:.2?}", "Time", elapsed);
    if report.is_noop() {
        println!("  Index was already consistent.");
    }
    println!();
}

/// Build an index, from scratch when forced.
fn cmd_index(path: &Path, force: bool, config: &Config) -> anyhow::Result<()> {
    require_file(path)?;

    let pb = spinner("Indexing");
    let start = Instant::now();
    let result = if force {
        let mut index = MailIndex::new(path);
        fsck_mailbox(&mut index, config)
            .map(|_| index)
            .map_err(anyhow::Error::from)
    } else {
        persist::open_index(path, config)
    };
    pb.finish_and_clear();
    let index = result?;
    let elapsed = start.elapsed();
    persist::save_index(&index, config)?;

    print_stats_table(path, &index, elapsed, config)?;
    Ok(())
}

/// Print every record of the index.
fn cmd_list(path: &Path, json: bool, config: &Config) -> anyhow::Result<()> {
    require_file(path)?;
    let index = persist::open_index(path, config)?;
    persist::save_index(&index, config)?;

    if json {
        let items: Vec<serde_json::Value> = index
            .records()
            .iter()
            .enumerate()
            .map(|(i, rec)| {
                serde_json::json!({
                    "seq": i + 1,
                    "uid": rec.uid,
                    "offset": rec.location(),
                    "header_size": rec.header_size,
                    "body_size": rec.body_size,
                    "flags": rec.msg_flags.to_letters(),
                    "dirty": rec.is_dirty(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    println!(
        "  {:>6} {:>6} {:>12} {:>8} {:>10} {:<6}",
        "Seq", "UID", "Offset", "Header", "Body", "Flags"
    );
    println!("  {}", "-".repeat(54));
    for (i, rec) in index.records().iter().enumerate() {
        let offset = rec
            .location()
            .map(|o| o.to_string())
            .unwrap_or_else(|| "-".to_string());
        let mut flags = rec.msg_flags.to_letters();
        if rec.is_dirty() {
            flags.push('*');
        }
        println!(
            "  {:>6} {:>6} {:>12} {:>8} {:>10} {:<6}",
            i + 1,
            rec.uid,
            offset,
            rec.header_size,
            rec.body_size,
            flags
        );
    }
    Ok(())
}

/// Locally set the flags of one message.
fn cmd_flag(path: &Path, seq: u32, letters: &str, config: &Config) -> anyhow::Result<()> {
    require_file(path)?;
    if !letters
        .chars()
        .all(|c| "RAFDT".contains(c.to_ascii_uppercase()))
    {
        anyhow::bail!("Unknown flag letters in '{letters}'. Supported: RAFDT");
    }
    let flags = MailFlags::from_letters(letters.as_bytes());

    let mut index = persist::open_index(path, config)?;
    index.set_lock(LockMode::Exclusive)?;
    let result = index.update_flags(seq, flags);
    index.set_lock(LockMode::Unlocked)?;
    result?;
    persist::save_index(&index, config)?;

    println!("  Message {seq}: flags set to '{}'", flags.to_letters());
    Ok(())
}

/// Show statistics for an indexed MBOX file.
fn cmd_stats(path: &Path, json: bool, config: &Config) -> anyhow::Result<()> {
    require_file(path)?;

    let pb = spinner("Loading index");
    let start = Instant::now();
    let result = persist::open_index(path, config);
    pb.finish_and_clear();
    let index = result?;
    let elapsed = start.elapsed();
    persist::save_index(&index, config)?;

    if json {
        print_stats_json(path, &index, elapsed, config)
    } else {
        print_stats_table(path, &index, elapsed, config)
    }
}

/// Print statistics in a human-readable table.
fn print_stats_table(
    path: &Path,
    index: &MailIndex,
    elapsed: Duration,
    config: &Config,
) -> anyhow::Result<()> {
    use humansize::{format_size, BINARY};

    let file_size = std::fs::metadata(path)?.len();
    let idx_size = persist::index_file_size(path, config);
    let header = index.header();

    println!();
    println!("  {:<20} {}", "File", path.display());
    println!("  {:<20} {}", "File size", format_size(file_size, BINARY));
    println!("  {:<20} {}", "Messages", header.messages_count);
    println!("  {:<20} {}", "Seen", header.seen_messages_count);
    println!("  {:<20} {}", "Deleted", header.deleted_messages_count);
    println!("  {:<20} {}", "Next UID", header.next_uid);
    if idx_size > 0 {
        println!("  {:<20} {}", "Index size", format_size(idx_size, BINARY));
    }
    if header.flags.contains(HeaderFlags::DIRTY_MESSAGES) {
        println!("  {:<20} yes", "Unsynced flags");
    }
    println!("  {:<20} {:.2?}", "Load time", elapsed);
    println!();
    Ok(())
}

/// Print statistics as JSON.
fn print_stats_json(
    path: &Path,
    index: &MailIndex,
    elapsed: Duration,
    config: &Config,
) -> anyhow::Result<()> {
    let header = index.header();
    let stats = serde_json::json!({
        "file": path.to_string_lossy(),
        "file_size": std::fs::metadata(path)?.len(),
        "message_count": header.messages_count,
        "seen_count": header.seen_messages_count,
        "deleted_count": header.deleted_messages_count,
        "next_uid": header.next_uid,
        "dirty": header.flags.contains(HeaderFlags::DIRTY_MESSAGES),
        "index_size": persist::index_file_size(path, config),
        "load_time_ms": elapsed.as_millis(),
    });

    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// Print the effective configuration, or write the defaults.
fn cmd_config(init: bool, config: &Config) -> anyhow::Result<()> {
    if init {
        let path = config::save_config(&Config::default())?;
        println!("  Configuration written to {}", path.display());
        return Ok(());
    }
    if let Some(path) = config::config_file_path() {
        println!("# {}", path.display());
    }
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "mboxstore", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}
