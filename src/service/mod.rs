//! Remote collaborators: the cold-storage archive service and the attribute store
//!
//! The engine only talks to these traits. Implementations:
//! - [`glacier::GlacierClient`] / [`simpledb::SimpleDbClient`]: the AWS endpoints
//! - [`local::LocalVault`] / [`local::LocalAttributeStore`]: a directory on disk
//! - [`memory::MemoryArchiveService`] / [`memory::MemoryAttributeStore`]: in-process, for tests

pub mod aws;
pub mod glacier;
pub mod local;
pub mod memory;
pub mod simpledb;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;

use crate::checksum::{combine, PartDigest, TreeHash};
use crate::config::BackendSettings;
use crate::error::ServiceError;
use crate::plan::ChunkDescriptor;

/// Streamed body of one part
pub type PartBody = Box<dyn Read + Send>;

/// Opaque acknowledgement returned for an accepted part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartReceipt(pub String);

/// Multipart archive storage bound to one vault
pub trait ArchiveService: Send + Sync {
    fn vault(&self) -> &str;
    fn list_vaults(&self) -> Result<Vec<String>, ServiceError>;
    fn create_vault(&self, name: &str) -> Result<(), ServiceError>;
    /// Start a multipart session, returning its upload id
    fn initiate_multipart_upload(
        &self,
        part_size: u32,
        description: &str,
    ) -> Result<String, ServiceError>;
    /// Send one part. The service recomputes the tree hash and rejects a mismatch.
    fn upload_part(
        &self,
        upload_id: &str,
        chunk: &ChunkDescriptor,
        digest: &PartDigest,
        body: PartBody,
    ) -> Result<PartReceipt, ServiceError>;
    /// Assemble the parts into an archive, returning its archive id
    fn complete_multipart_upload(
        &self,
        upload_id: &str,
        archive_size: u64,
        checksum: &TreeHash,
    ) -> Result<String, ServiceError>;
    fn delete_archive(&self, archive_id: &str) -> Result<(), ServiceError>;
}

/// A named value stored under an item key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Key/attribute store bound to one domain
pub trait AttributeStore: Send + Sync {
    fn domain(&self) -> &str;
    fn list_domains(&self) -> Result<Vec<String>, ServiceError>;
    fn create_domain(&self, name: &str) -> Result<(), ServiceError>;
    /// All attributes of `key`; empty when the key was never written
    fn get(&self, key: &str) -> Result<Vec<Attribute>, ServiceError>;
    /// Replace every attribute of `key` with `attributes`
    fn set(&self, key: &str, attributes: &[Attribute]) -> Result<(), ServiceError>;
}

pub fn vault_exists(service: &dyn ArchiveService) -> Result<bool, ServiceError> {
    let name = service.vault();
    Ok(service.list_vaults()?.iter().any(|v| v == name))
}

pub fn domain_exists(store: &dyn AttributeStore) -> Result<bool, ServiceError> {
    let name = store.domain();
    Ok(store.list_domains()?.iter().any(|d| d == name))
}

/// Create the bound vault unless it already exists. Returns true when created.
pub fn ensure_vault(service: &dyn ArchiveService) -> Result<bool, ServiceError> {
    if vault_exists(service)? {
        return Ok(false);
    }
    service.create_vault(service.vault())?;
    Ok(true)
}

/// Create the bound domain unless it already exists. Returns true when created.
pub fn ensure_domain(store: &dyn AttributeStore) -> Result<bool, ServiceError> {
    if domain_exists(store)? {
        return Ok(false);
    }
    store.create_domain(store.domain())?;
    Ok(true)
}

/// Build the configured collaborators
pub fn open(
    backend: &BackendSettings,
) -> Result<(Box<dyn ArchiveService>, Box<dyn AttributeStore>)> {
    match backend {
        BackendSettings::Aws {
            glacier_region,
            vault,
            simpledb_region,
            domain,
            profile,
        } => {
            let creds = aws::Credentials::load(profile.as_deref())
                .context("Failed to load AWS credentials")?;
            let archives = glacier::GlacierClient::new(glacier_region, vault, creds.clone())
                .context("Failed to set up Glacier client")?;
            let store = simpledb::SimpleDbClient::new(simpledb_region, domain, creds)
                .context("Failed to set up SimpleDB client")?;
            Ok((Box::new(archives), Box::new(store)))
        }
        BackendSettings::Local {
            root,
            vault,
            domain,
        } => {
            let archives = local::LocalVault::new(root, vault);
            let store = local::LocalAttributeStore::new(root, domain);
            Ok((Box::new(archives), Box::new(store)))
        }
    }
}

/// Server-side validation of a received part, shared by the non-AWS backends
pub(crate) fn check_part(
    part_size: u32,
    chunk: &ChunkDescriptor,
    claimed: &PartDigest,
    received: &PartDigest,
) -> Result<(), ServiceError> {
    if chunk.start % u64::from(part_size) != 0 {
        return Err(ServiceError::Rejected(format!(
            "range {} is not aligned to part size {part_size}",
            chunk.content_range()
        )));
    }
    if chunk.length == 0 || chunk.length > part_size {
        return Err(ServiceError::Rejected(format!(
            "part length {} outside 1..={part_size}",
            chunk.length
        )));
    }
    if received.length != u64::from(chunk.length) {
        return Err(ServiceError::Rejected(format!(
            "body has {} bytes, range {} announces {}",
            received.length,
            chunk.content_range(),
            chunk.length
        )));
    }
    if received.tree != claimed.tree {
        return Err(ServiceError::ChecksumMismatch(format!(
            "part at {}: sent {}, computed {}",
            chunk.start, claimed.tree, received.tree
        )));
    }
    Ok(())
}

/// Server-side validation of a completion request. `parts` maps start offset to (length, tree hash).
pub(crate) fn check_completion(
    part_size: u32,
    parts: &BTreeMap<u64, (u64, TreeHash)>,
    archive_size: u64,
    claimed: &TreeHash,
) -> Result<(), ServiceError> {
    let mut expected_start = 0u64;
    let last = parts.len().saturating_sub(1);
    for (i, (&start, &(length, _))) in parts.iter().enumerate() {
        if start != expected_start {
            return Err(ServiceError::Rejected(format!(
                "missing part at offset {expected_start}"
            )));
        }
        if i < last && length != u64::from(part_size) {
            return Err(ServiceError::Rejected(format!(
                "part at {start} is {length} bytes, expected {part_size}"
            )));
        }
        expected_start += length;
    }
    if expected_start != archive_size {
        return Err(ServiceError::Rejected(format!(
            "parts cover {expected_start} bytes, archive size is {archive_size}"
        )));
    }
    let digests: Vec<TreeHash> = parts.values().map(|&(_, h)| h).collect();
    let computed = combine(&digests);
    if computed != *claimed {
        return Err(ServiceError::ChecksumMismatch(format!(
            "archive: sent {claimed}, computed {computed}"
        )));
    }
    Ok(())
}
