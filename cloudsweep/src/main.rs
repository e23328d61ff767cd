/*!
cloudsweep command line: daemon, one-shot passes, quarantine recovery and
nosync management
*/

use std::error::Error;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Arg, ArgAction, ArgMatches, Command, crate_version};
use fdlimit::Outcome;
use fs2::FileExt;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use cloudsweep::core::{
    config::{LoggingConfig, SweepConfig},
    detection_engine::{DetectedArtifact, ModuleRegistry},
    nosync::NosyncGuardian,
    quarantine::{ArtifactRemover, QuarantineEngine},
    report::{ReportFormat, render, render_stats},
    tracker::SweepDaemon,
};

const LOCK_FILE_NAME: &str = "cloudsweep.lock";

fn cli() -> Command {
    Command::new("cloudsweep")
        .version(crate_version!())
        .about("Cleans up cloud-sync conflict copies, stale fragments and caches")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Path to the configuration file")
                .value_name("PATH")
                .global(true),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print results as JSON")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(
            Command::new("run")
                .about("Run the cleanup daemon")
                .arg(
                    Arg::new("once")
                        .long("once")
                        .help("Run a single pass and exit")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("dry-run")
                        .long("dry-run")
                        .help("Report what would be removed without touching anything")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("scan")
                .about("List artifacts the modules would clean")
                .arg(dir_arg("Scan this directory instead of the watch roots")),
        )
        .subcommand(
            Command::new("config")
                .about("Create or show the configuration")
                .arg(
                    Arg::new("init")
                        .long("init")
                        .help("Write a default configuration file")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("show")
                        .long("show")
                        .help("Print the effective configuration")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("recovery")
                .about("Inspect and restore quarantined files")
                .arg(
                    Arg::new("list")
                        .long("list")
                        .help("List quarantined files, newest first")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("restore")
                        .long("restore")
                        .help("Copy a quarantined file back out")
                        .value_name("PATH"),
                )
                .arg(
                    Arg::new("to")
                        .long("to")
                        .help("Destination for --restore")
                        .value_name("DEST")
                        .requires("restore"),
                )
                .arg(
                    Arg::new("cleanup")
                        .long("cleanup")
                        .help("Remove buckets past the retention period")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("nosync")
                .about("Keep dependency directories out of sync")
                .arg(
                    Arg::new("scan")
                        .long("scan")
                        .help("List directories that should become .nosync")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("apply")
                        .long("apply")
                        .help("Convert every candidate")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("repair")
                        .long("repair")
                        .help("Verify and repair .nosync symlinks")
                        .action(ArgAction::SetTrue),
                )
                .arg(dir_arg("Work on this directory instead of the watch roots")),
        )
}

fn dir_arg(help: &'static str) -> Arg {
    Arg::new("dir")
        .short('d')
        .long("dir")
        .help(help)
        .value_name("DIR")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<String>("config").map(PathBuf::from);
    let format = if matches.get_flag("json") {
        ReportFormat::Json
    } else {
        ReportFormat::Plain
    };

    let config = SweepConfig::load(config_path.as_deref())?;
    init_tracing(&config.logging)?;

    match matches.subcommand() {
        Some(("run", sub)) => run(config, sub, format).await,
        Some(("scan", sub)) => scan(&config, sub, format).await,
        Some(("config", sub)) => show_config(config, config_path, sub, format),
        Some(("recovery", sub)) => recovery(&config, sub, format),
        Some(("nosync", sub)) => nosync(&config, sub, format).await,
        _ => Ok(()),
    }
}

fn init_tracing(logging: &LoggingConfig) -> Result<(), Box<dyn Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let file_layer = match &logging.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()?;
    Ok(())
}

async fn run(
    config: SweepConfig,
    matches: &ArgMatches,
    format: ReportFormat,
) -> Result<(), Box<dyn Error>> {
    let mut daemon = SweepDaemon::new(config)?;

    if matches.get_flag("dry-run") {
        let plan = daemon.dry_run().await;
        println!("{}", render(&plan, format));
        return Ok(());
    }

    let handle = daemon.shutdown_handle();
    tokio::spawn(async move {
        wait_for_signal().await;
        handle.shutdown();
    });

    if matches.get_flag("once") {
        let processed = daemon.run_once().await;
        println!("{}", render(&processed, format));
        if format == ReportFormat::Plain {
            println!("{}", render_stats(daemon.stats(), format));
        }
        return Ok(());
    }

    let _lock = acquire_lock()?;
    match fdlimit::raise_fd_limit() {
        Ok(Outcome::LimitRaised { from, to }) => {
            debug!("Raised file descriptor limit from {} to {}", from, to)
        }
        Ok(Outcome::Unsupported) => debug!("Raising the file descriptor limit is unsupported here"),
        Err(e) => warn!("Could not raise file descriptor limit: {}", e),
    }
    daemon.run_daemon().await?;
    Ok(())
}

/// Hold an exclusive lock so only one daemon runs per user.
fn acquire_lock() -> Result<File, Box<dyn Error>> {
    let path = SweepConfig::default_path().with_file_name(LOCK_FILE_NAME);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).truncate(false).write(true).open(&path)?;
    file.try_lock_exclusive()
        .map_err(|e| format!("another cloudsweep daemon holds {}: {}", path.display(), e))?;
    Ok(file)
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut terminate) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
            return;
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

async fn scan(
    config: &SweepConfig,
    matches: &ArgMatches,
    format: ReportFormat,
) -> Result<(), Box<dyn Error>> {
    config.validate()?;
    let registry = ModuleRegistry::from_config(config)?;
    let dir = matches.get_one::<String>("dir").map(PathBuf::from);

    let progress = ProgressBar::new_spinner();
    progress.set_style(
        ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?,
    );
    progress.set_message("Scanning...");
    progress.enable_steady_tick(Duration::from_millis(100));

    let detected: Vec<DetectedArtifact> = tokio::task::spawn_blocking(move || match dir {
        Some(dir) => registry.scan_directory(&dir),
        None => registry.scan_all(),
    })
    .await?;

    progress.finish_with_message(format!("Found {} artifacts", detected.len()));
    println!("{}", render(&detected, format));
    Ok(())
}

fn show_config(
    config: SweepConfig,
    config_path: Option<PathBuf>,
    matches: &ArgMatches,
    format: ReportFormat,
) -> Result<(), Box<dyn Error>> {
    let path = config_path.unwrap_or_else(SweepConfig::default_path);

    if matches.get_flag("init") {
        if path.exists() {
            return Err(format!("config already exists: {}", path.display()).into());
        }
        config.save(&path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    if matches.get_flag("show") {
        match format {
            ReportFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
            ReportFormat::Plain => println!("{}", toml::to_string_pretty(&config)?),
        }
        return Ok(());
    }

    println!("{}", path.display());
    Ok(())
}

fn recovery(
    config: &SweepConfig,
    matches: &ArgMatches,
    format: ReportFormat,
) -> Result<(), Box<dyn Error>> {
    let engine = QuarantineEngine::new(&config.recovery);

    if let Some(entry) = matches.get_one::<String>("restore") {
        let destination = matches.get_one::<String>("to").map(PathBuf::from);
        let restored = engine.restore(Path::new(entry), destination.as_deref())?;
        println!("Restored to {}", restored.display());
        return Ok(());
    }

    if matches.get_flag("cleanup") {
        let removed = engine.sweep_expired();
        println!("Removed {removed} expired quarantine buckets");
        return Ok(());
    }

    let entries = engine.list_entries();
    if entries.is_empty() && format == ReportFormat::Plain {
        println!("Quarantine at {} is empty", engine.root().display());
    } else {
        println!("{}", render(&entries, format));
    }
    Ok(())
}

async fn nosync(
    config: &SweepConfig,
    matches: &ArgMatches,
    format: ReportFormat,
) -> Result<(), Box<dyn Error>> {
    let guardian = Arc::new(NosyncGuardian::new(config));
    let roots = match matches.get_one::<String>("dir") {
        Some(dir) => vec![PathBuf::from(dir)],
        None => config.watch_directories.clone(),
    };

    if matches.get_flag("repair") {
        let worker = Arc::clone(&guardian);
        let results = tokio::task::spawn_blocking(move || {
            roots.iter().flat_map(|root| worker.repair_tree(root)).collect::<Vec<_>>()
        })
        .await?;
        info!("Repair produced {} results", results.len());
        println!("{}", render(&results, format));
        return Ok(());
    }

    let worker = Arc::clone(&guardian);
    let candidates = tokio::task::spawn_blocking(move || {
        roots.iter().flat_map(|root| worker.scan_candidates(root)).collect::<Vec<_>>()
    })
    .await?;

    if matches.get_flag("apply") {
        let outcomes: Vec<_> = candidates.iter().map(|path| guardian.convert(path)).collect();
        let converted = outcomes.iter().filter(|o| o.success()).count();
        println!("{}", render(&outcomes, format));
        if format == ReportFormat::Plain {
            println!("Converted {converted}/{} directories", candidates.len());
        }
        return Ok(());
    }

    match format {
        ReportFormat::Json => println!("{}", serde_json::to_string_pretty(&candidates)?),
        ReportFormat::Plain => {
            for path in &candidates {
                println!("{}", path.display());
            }
        }
    }
    Ok(())
}
