//! glacier-backup - upload an archive to cold storage and keep the last N
//!
//! Exit status: 0 on success, 1 on a usage or fatal error, 130 on Ctrl-C.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use crossterm::style::{Color, Stylize};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use glacier_backup::backup::{BackupOptions, BackupService};
use glacier_backup::cli::{Cli, Command, DeleteInventoryArgs, UploadArgs};
use glacier_backup::config::{BackendSettings, Settings};
use glacier_backup::logger::{Logger, NoopLogger, TextLogger};
use glacier_backup::service;
use glacier_backup::upload::UploadOptions;

fn main() -> ExitCode {
    // No graceful cancellation: an interrupted run abandons its multipart upload
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        std::process::exit(130);
    }) {
        eprintln!("warning: could not install Ctrl-C handler: {e}");
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // --help and --version land here too
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".with(Color::Red).bold(), e);
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let Cli {
        config,
        log_file,
        local,
        verbose,
        command,
    } = cli;

    // Choose logger once; NoopLogger costs nothing in the workers
    let logger: Arc<dyn Logger> = match log_file {
        Some(ref p) => match TextLogger::new(p) {
            Ok(l) => Arc::new(l),
            Err(e) => {
                eprintln!("warning: cannot open log file {}: {e}", p.display());
                Arc::new(NoopLogger)
            }
        },
        None => Arc::new(NoopLogger),
    };

    let mut settings = Settings::load(config.as_deref())?;
    if let Some(root) = local {
        settings.backend = local_backend(&settings.backend, root);
    }

    match command {
        Command::Upload(args) => upload(settings, args, verbose, logger.as_ref()),
        Command::List => list(&settings, logger.as_ref()),
        Command::DeleteInventory(args) => delete_inventory(&settings, args, logger.as_ref()),
    }
}

/// Same vault and domain names, stored under `root`
fn local_backend(current: &BackendSettings, root: PathBuf) -> BackendSettings {
    let (vault, domain) = match current {
        BackendSettings::Aws { vault, domain, .. } | BackendSettings::Local { vault, domain, .. } => {
            (vault.clone(), domain.clone())
        }
    };
    BackendSettings::Local {
        root,
        vault,
        domain,
    }
}

fn upload(mut settings: Settings, args: UploadArgs, verbose: bool, logger: &dyn Logger) -> Result<()> {
    if let Some(n) = args.parallel {
        settings.parallelism = n;
    }
    if let Some(mib) = args.part_size_mib {
        settings.part_size_mib = mib;
    }
    if let Some(n) = args.max_retention {
        settings.max_retention = n;
    }
    settings.validate()?;

    let options = BackupOptions {
        upload: UploadOptions {
            part_size: settings.part_size()?,
            parallelism: settings.effective_parallelism(),
            retry_delay: settings.retry_delay(),
            description: format!("backup {}", Utc::now().to_rfc3339()),
        },
        max_retention: settings.max_retention,
        show_progress: !args.no_progress && std::io::stderr().is_terminal(),
    };

    if args.try_run {
        println!("DRY RUN MODE - nothing will be changed remotely");
    }
    if verbose {
        println!("Archive: {}", args.archive_file.display());
        println!("Backend: {:?}", settings.backend);
        println!(
            "Part size: {} MiB, parallelism: {}, keep: {}",
            settings.part_size_mib, options.upload.parallelism, options.max_retention
        );
    }

    let (archives, store) = service::open(&settings.backend)?;
    let service = BackupService::new(archives.as_ref(), store.as_ref(), logger);
    let report = service.upload_backup(&args.archive_file, &options, args.try_run)?;

    let created = if report.dry_run { "Would create" } else { "Created new" };
    if report.created_vault {
        println!("{created} vault {}", archives.vault());
    }
    if report.created_domain {
        println!("{created} domain {}", store.domain());
    }
    for record in &report.pruned {
        println!("Deleted old backup from {}", record.created_local());
    }
    if report.dry_run {
        println!("Would upload {} bytes in {} parts", report.size, report.parts);
    } else {
        println!(
            "{} {}",
            "Uploaded archive".with(Color::Green).bold(),
            report.archive_id
        );
    }
    if verbose {
        println!("Tree hash: {}", report.checksum);
    }
    println!("Spent {}", report.elapsed_ms());
    Ok(())
}

fn list(settings: &Settings, logger: &dyn Logger) -> Result<()> {
    let (archives, store) = service::open(&settings.backend)?;
    let service = BackupService::new(archives.as_ref(), store.as_ref(), logger);
    let records = service.list()?;
    if records.is_empty() {
        println!("No backups recorded");
    }
    for r in records {
        println!("{}  {}", r.created_local(), r.archive_id);
    }
    Ok(())
}

fn delete_inventory(settings: &Settings, args: DeleteInventoryArgs, logger: &dyn Logger) -> Result<()> {
    let start = Instant::now();
    let (archives, store) = service::open(&settings.backend)?;
    let service = BackupService::new(archives.as_ref(), store.as_ref(), logger);
    let ids = service
        .delete_inventory(&args.inventory, args.try_run)
        .context("Inventory purge stopped")?;
    let verb = if args.try_run { "Would delete" } else { "Deleted" };
    for id in &ids {
        println!("{verb} archive {id}");
    }
    println!("{} {} archives", verb, ids.len());
    println!("Spent {}", start.elapsed().as_millis());
    Ok(())
}
