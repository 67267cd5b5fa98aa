//! Command-line arguments

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "glacier-backup - chunked, checksum-verified archive uploads with a rolling retention ledger"
)]
pub struct Cli {
    /// Settings file (default: ~/.config/glacier-backup/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Append event lines to this file
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,

    /// Use a directory instead of AWS as vault and ledger store
    #[arg(long, global = true, value_name = "DIR")]
    pub local: Option<PathBuf>,

    /// Print extra detail (settings, checksum, pruned records)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Upload an archive file and prune old backups
    Upload(UploadArgs),
    /// Show the archives recorded in the retention ledger
    List,
    /// Delete every archive listed in a vault inventory (JSON)
    DeleteInventory(DeleteInventoryArgs),
}

#[derive(Debug, Args)]
pub struct UploadArgs {
    /// Archive file to upload
    pub archive_file: PathBuf,

    /// Plan and hash everything but make no changes remotely
    #[arg(long)]
    pub try_run: bool,

    /// Concurrent part uploads (0 = one per CPU)
    #[arg(long)]
    pub parallel: Option<usize>,

    /// Part size in MiB (power of two, 1..=2048)
    #[arg(long)]
    pub part_size_mib: Option<u32>,

    /// Archives to keep, including the new one
    #[arg(long)]
    pub max_retention: Option<usize>,

    /// Hide the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

#[derive(Debug, Args)]
pub struct DeleteInventoryArgs {
    /// Inventory document retrieved from the vault
    pub inventory: PathBuf,

    /// List what would be deleted without deleting
    #[arg(long)]
    pub try_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_upload_with_overrides() {
        let cli = Cli::try_parse_from([
            "glacier-backup",
            "--local",
            "/tmp/store",
            "upload",
            "backup.tar",
            "--try-run",
            "--parallel",
            "2",
            "--part-size-mib",
            "64",
        ])
        .unwrap();
        assert_eq!(cli.local, Some(PathBuf::from("/tmp/store")));
        match cli.command {
            Command::Upload(args) => {
                assert_eq!(args.archive_file, PathBuf::from("backup.tar"));
                assert!(args.try_run);
                assert_eq!(args.parallel, Some(2));
                assert_eq!(args.part_size_mib, Some(64));
                assert_eq!(args.max_retention, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn upload_requires_archive_file() {
        assert!(Cli::try_parse_from(["glacier-backup", "upload"]).is_err());
    }

    #[test]
    fn parses_delete_inventory() {
        let cli = Cli::try_parse_from(["glacier-backup", "delete-inventory", "inv.json"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::DeleteInventory(DeleteInventoryArgs { try_run: false, .. })
        ));
    }
}
