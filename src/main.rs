use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::LevelFilter;

use mobilecombackup::import::{self, ImportOptions, RecordFilter};
use mobilecombackup::info;
use mobilecombackup::repo::{self, contacts, Repository};
use mobilecombackup::utils::{error_to_string, Result};
use mobilecombackup::validate::{self, autofix, ValidationScope};

#[derive(Parser)]
#[command(name = "mobilecombackup", version,
          about = "Consolidates phone backup dumps into a deduplicated, year-partitioned repository")]
struct Cli {
    /// Repository root (falls back to MB_REPO_ROOT, then the current directory)
    #[arg(long, global = true, env = "MB_REPO_ROOT", value_name = "PATH")]
    repo_root: Option<PathBuf>,

    /// Only log warnings and errors
    #[arg(long, global = true)]
    quiet: bool,

    /// Log debug details
    #[arg(long, global = true)]
    verbose: bool,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Console)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
enum LogFormat {
    Console,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LogFormat::Console => "console",
            LogFormat::Json => "json",
        })
    }
}

#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
enum FilterArg {
    Calls,
    Sms,
}

#[derive(Subcommand)]
enum Command {
    /// Create an empty repository skeleton
    Init {
        #[arg(long)]
        dry_run: bool,
    },
    /// Import backup dumps into the repository
    Import {
        /// Files or directories to scan for calls*.xml / sms*.xml
        paths: Vec<PathBuf>,
        #[arg(long)]
        dry_run: bool,
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
        /// Import only one record kind
        #[arg(long, value_enum)]
        filter: Option<FilterArg>,
        /// Exit 0 even when records were rejected
        #[arg(long)]
        no_error_on_rejects: bool,
    },
    /// Check repository integrity
    Validate {
        #[arg(long)]
        output_json: bool,
        /// Delete attachment blobs no message references
        #[arg(long)]
        remove_orphan_attachments: bool,
        #[arg(long)]
        dry_run: bool,
        /// Apply safe, reversible fixes for a whitelisted set of violations
        #[arg(long)]
        autofix: bool,
    },
    /// Show repository statistics
    Info {
        #[arg(long)]
        json: bool,
    },
    /// Re-harvest contact names from the repository's own records
    ReprocessContacts {
        #[arg(long)]
        dry_run: bool,
    },
    /// Print a shell completion script
    Completion {
        /// One of: bash, zsh, fish, powershell
        shell: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    let code = match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{}", error_to_string(&e));
            2
        }
    };
    ExitCode::from(code)
}

fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        LevelFilter::Warn
    } else if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut builder = env_logger::Builder::new();
    builder.filter(None, level);
    if cli.log_format == LogFormat::Json {
        builder.format(|buf, record| {
            let line = serde_json::json!({
                "ts": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                "level": record.level().to_string().to_lowercase(),
                "target": record.target(),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{line}")
        });
    }
    builder.init();
}

fn repo_root(cli: &Cli) -> PathBuf {
    cli.repo_root.clone().unwrap_or_else(|| PathBuf::from("."))
}

fn run(cli: &Cli) -> Result<u8> {
    match &cli.command {
        Command::Init { dry_run } => run_init(cli, *dry_run),
        Command::Import { paths, dry_run, json, filter, no_error_on_rejects } =>
            run_import(cli, paths, *dry_run, *json, *filter, *no_error_on_rejects),
        Command::Validate { output_json, remove_orphan_attachments, dry_run, autofix } =>
            run_validate(cli, *output_json, *remove_orphan_attachments, *dry_run, *autofix),
        Command::Info { json } => run_info(cli, *json),
        Command::ReprocessContacts { dry_run } => run_reprocess_contacts(cli, *dry_run),
        Command::Completion { shell } => Ok(run_completion(shell)),
    }
}

fn run_init(cli: &Cli, dry_run: bool) -> Result<u8> {
    let target = repo_root(cli);
    if target.join(repo::MARKER_FILENAME).exists() {
        log::error!("{} is already a repository", target.to_string_lossy());
        return Ok(1);
    }
    if target.is_dir() {
        let occupied = std::fs::read_dir(&target)?.next().is_some();
        if occupied {
            log::error!("{} is not empty", target.to_string_lossy());
            return Ok(1);
        }
    }
    if dry_run {
        log::info!("Would initialize an empty repository at {}", target.to_string_lossy());
        return Ok(0);
    }
    Repository::init(&target)?;
    Ok(0)
}

fn run_import(cli: &Cli,
              paths: &[PathBuf],
              dry_run: bool,
              json: bool,
              filter: Option<FilterArg>,
              no_error_on_rejects: bool) -> Result<u8> {
    let repo = Repository::open(&repo_root(cli))?;
    repo.check_marker()?;

    let options = ImportOptions {
        paths: paths.to_vec(),
        dry_run,
        filter: filter.map(|f| match f {
            FilterArg::Calls => RecordFilter::Calls,
            FilterArg::Sms => RecordFilter::Sms,
        }),
        cancel: None,
        limits: Default::default(),
    };
    let summary = import::import(&repo, &options)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_import_summary(&summary);
    }

    if summary.total_rejected() > 0 && !no_error_on_rejects {
        return Ok(1);
    }
    Ok(0)
}

fn print_import_summary(summary: &import::ImportSummary) {
    let row = |name: &str, k: &import::KindSummary| {
        log::info!("{name}: {} existing, {} added, {} duplicate(s), {} rejected",
                   k.initial, k.added, k.duplicates, k.rejected);
    };
    log::info!("Processed {} file(s), {} failed", summary.files_processed, summary.files_failed);
    row("Calls", &summary.calls);
    row("Messages", &summary.sms);
    if summary.attachments_extracted > 0 {
        log::info!("Extracted {} attachment(s)", summary.attachments_extracted);
    }
    for file in &summary.rejection_files {
        log::warn!("Rejections written to {file}");
    }
}

fn run_validate(cli: &Cli,
                output_json: bool,
                remove_orphans: bool,
                dry_run: bool,
                apply_autofix: bool) -> Result<u8> {
    let repo = Repository::open(&repo_root(cli))?;
    let mutating = (remove_orphans || apply_autofix) && !dry_run;
    let _lock = if mutating { Some(repo.lock()?) } else { None };

    let mut report = validate::validate(&repo, ValidationScope::Full)?;

    if apply_autofix {
        let outcome = match autofix::autofix(&repo, &report, dry_run) {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Autofix failed: {}", error_to_string(&e));
                return Ok(3);
            }
        };
        if !outcome.errors.is_empty() {
            return Ok(2);
        }
        if !dry_run {
            report = validate::validate(&repo, ValidationScope::Full)?;
        }
    }

    if remove_orphans {
        validate::remove_orphan_attachments(&repo, dry_run)?;
        if !dry_run {
            report = validate::validate(&repo, ValidationScope::Full)?;
        }
    }

    if output_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for violation in &report.violations {
            match violation.severity {
                validate::Severity::Error => log::error!("{}", violation.message),
                validate::Severity::Warning => log::warn!("{}", violation.message),
            }
        }
        log::info!("Repository is {}",
                   if report.violations.is_empty() { "valid" } else { "invalid" });
    }

    if report.violations.is_empty() {
        Ok(0)
    } else {
        Ok(1)
    }
}

fn run_info(cli: &Cli, json: bool) -> Result<u8> {
    let repo = Repository::open(&repo_root(cli))?;
    let info = info::gather_info(&repo)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        print_info(&info);
    }
    Ok(0)
}

fn print_info(info: &info::RepositoryInfo) {
    log::info!("Repository structure version {}, created {}",
               info.repository_structure_version, info.created_at);
    let total = |m: &std::collections::BTreeMap<i32, u64>| m.values().sum::<u64>();
    log::info!("Calls: {} across {} year(s)", total(&info.counts.calls), info.counts.calls.len());
    log::info!("Messages: {} across {} year(s)", total(&info.counts.sms), info.counts.sms.len());
    if let (Some(earliest), Some(latest)) = (&info.earliest, &info.latest) {
        log::info!("Date range: {earliest} .. {latest}");
    }
    log::info!("Attachments: {} ({} bytes)",
               info.attachments.count, info.attachments.total_size_bytes);
    for (family, stats) in &info.attachments.by_family {
        log::info!("  {family}: {} ({} bytes)", stats.count, stats.size_bytes);
    }
    log::info!("Contacts: {} known, {} unprocessed", info.contacts.known, info.contacts.unprocessed);
    if info.rejections.calls + info.rejections.sms > 0 {
        log::info!("Rejection files: {} calls, {} sms", info.rejections.calls, info.rejections.sms);
    }
}

fn run_reprocess_contacts(cli: &Cli, dry_run: bool) -> Result<u8> {
    let repo = Repository::open(&repo_root(cli))?;
    repo.check_marker()?;
    let _lock = if dry_run { None } else { Some(repo.lock()?) };
    let summary = contacts::reprocess_contacts(&repo, dry_run)?;
    log::info!("Scanned {} record(s), skipped {}, unprocessed {} -> {}",
               summary.records_scanned, summary.records_skipped,
               summary.unprocessed_before, summary.unprocessed_after);
    Ok(0)
}

fn run_completion(shell: &str) -> u8 {
    let shell = match shell.to_ascii_lowercase().as_str() {
        "bash" => Shell::Bash,
        "zsh" => Shell::Zsh,
        "fish" => Shell::Fish,
        "powershell" => Shell::PowerShell,
        etc => {
            eprintln!("Unsupported shell: {etc}");
            return 1;
        }
    };
    clap_complete::generate(shell, &mut Cli::command(), "mobilecombackup", &mut std::io::stdout());
    0
}
