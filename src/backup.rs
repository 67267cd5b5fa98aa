//! One backup run: prune the ledger, upload the archive, record it

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::checksum::TreeHash;
use crate::ledger::{ArchiveRecord, RetentionLedger};
use crate::logger::Logger;
use crate::service::{
    domain_exists, ensure_domain, ensure_vault, vault_exists, ArchiveService, AttributeStore,
};
use crate::upload::{ArchiveUploader, MultipartUploader, UploadOptions};

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub upload: UploadOptions,
    pub max_retention: usize,
    pub show_progress: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            upload: UploadOptions::default(),
            max_retention: 3,
            show_progress: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupReport {
    /// Placeholder id on a dry run
    pub archive_id: String,
    pub checksum: TreeHash,
    pub size: u64,
    pub parts: usize,
    pub pruned: Vec<ArchiveRecord>,
    /// On a dry run: the vault is missing and a real run would create it
    pub created_vault: bool,
    /// On a dry run: the domain is missing and a real run would create it
    pub created_domain: bool,
    pub dry_run: bool,
    pub elapsed: Duration,
}

impl BackupReport {
    pub fn elapsed_ms(&self) -> u128 {
        self.elapsed.as_millis()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Inventory {
    archive_list: Vec<InventoryArchive>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InventoryArchive {
    archive_id: String,
}

pub struct BackupService<'a> {
    archives: &'a dyn ArchiveService,
    store: &'a dyn AttributeStore,
    logger: &'a dyn Logger,
}

impl<'a> BackupService<'a> {
    pub fn new(
        archives: &'a dyn ArchiveService,
        store: &'a dyn AttributeStore,
        logger: &'a dyn Logger,
    ) -> Self {
        Self {
            archives,
            store,
            logger,
        }
    }

    /// Create the vault and the ledger domain if missing. Returns what was created.
    pub fn bootstrap(&self) -> Result<(bool, bool)> {
        let vault = ensure_vault(self.archives)
            .with_context(|| format!("Failed to prepare vault {}", self.archives.vault()))?;
        let domain = ensure_domain(self.store)
            .with_context(|| format!("Failed to prepare domain {}", self.store.domain()))?;
        Ok((vault, domain))
    }

    /// Which of the vault and the domain are missing, without creating them
    fn missing_containers(&self) -> Result<(bool, bool)> {
        let vault = vault_exists(self.archives)
            .with_context(|| format!("Failed to look up vault {}", self.archives.vault()))?;
        let domain = domain_exists(self.store)
            .with_context(|| format!("Failed to look up domain {}", self.store.domain()))?;
        Ok((!vault, !domain))
    }

    /// The stored ledger; empty when the domain was never created
    fn read_ledger(&self, domain_missing: bool) -> Result<RetentionLedger<'a>> {
        if domain_missing {
            return Ok(RetentionLedger::empty(self.store));
        }
        RetentionLedger::load(self.store).context("Failed to read retention ledger")
    }

    pub fn upload_backup(
        &self,
        file: &Path,
        options: &BackupOptions,
        dry_run: bool,
    ) -> Result<BackupReport> {
        let started = Instant::now();
        // A dry run only looks; nothing is created remotely
        let (created_vault, created_domain) = if dry_run {
            self.missing_containers()?
        } else {
            self.bootstrap()?
        };

        let mut ledger = self.read_ledger(dry_run && created_domain)?;
        let pruned = ledger
            .enforce_retention(self.archives, options.max_retention, dry_run, self.logger)
            .context("Failed to prune old backups")?;

        let uploader = MultipartUploader::new(self.archives, options.upload.clone(), self.logger)
            .with_progress(options.show_progress);
        let outcome = match uploader.upload_archive(file, dry_run) {
            Ok(o) => o,
            Err(e) => {
                self.logger.error("upload", &e.to_string());
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to upload {}", file.display())));
            }
        };

        if !dry_run {
            ledger
                .append(ArchiveRecord::new(outcome.archive_id.clone(), Utc::now()))
                .context("Failed to record new backup")?;
        }

        let elapsed = started.elapsed();
        self.logger
            .done(&outcome.archive_id, outcome.size, elapsed.as_secs_f64());
        Ok(BackupReport {
            archive_id: outcome.archive_id,
            checksum: outcome.checksum,
            size: outcome.size,
            parts: outcome.parts,
            pruned,
            created_vault,
            created_domain,
            dry_run,
            elapsed,
        })
    }

    /// Ledger contents, oldest first
    pub fn list(&self) -> Result<Vec<ArchiveRecord>> {
        let domain_missing = !domain_exists(self.store)
            .with_context(|| format!("Failed to look up domain {}", self.store.domain()))?;
        let ledger = self.read_ledger(domain_missing)?;
        Ok(ledger.records().to_vec())
    }

    /// Delete every archive listed in a vault inventory document.
    /// Returns the listed archive ids; nothing is deleted on a dry run.
    pub fn delete_inventory(&self, inventory: &Path, dry_run: bool) -> Result<Vec<String>> {
        let text = std::fs::read_to_string(inventory)
            .with_context(|| format!("Failed to read inventory {}", inventory.display()))?;
        let parsed: Inventory = serde_json::from_str(&text)
            .with_context(|| format!("Invalid inventory {}", inventory.display()))?;

        let mut ids = Vec::with_capacity(parsed.archive_list.len());
        for entry in parsed.archive_list {
            if !dry_run {
                self.archives
                    .delete_archive(&entry.archive_id)
                    .with_context(|| format!("Failed to delete archive {}", entry.archive_id))?;
                self.logger.archive_deleted(&entry.archive_id);
            }
            ids.push(entry.archive_id);
        }
        Ok(ids)
    }
}
