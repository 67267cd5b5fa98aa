//! Directory-backed vault and attribute store
//!
//! Layout under the configured root:
//!
//! ```text
//! vaults/<vault>/archives/<archive-id>
//! vaults/<vault>/uploads/<upload-id>/upload.json
//! vaults/<vault>/uploads/<upload-id>/<start-offset>.part
//! domains/<domain>/<key>.json
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use super::{
    check_completion, check_part, ArchiveService, Attribute, AttributeStore, PartBody, PartReceipt,
};
use crate::checksum::{hash_reader, PartDigest, TreeHash, TreeHasher};
use crate::error::ServiceError;
use crate::plan::ChunkDescriptor;

const COPY_BUFFER_SIZE: usize = 64 * 1024;
const UPLOAD_META: &str = "upload.json";
const PART_SUFFIX: &str = ".part";

#[derive(Serialize, Deserialize)]
struct UploadMeta {
    part_size: u32,
    description: String,
}

/// Ids and keys become file names; keep them to a safe alphabet.
fn check_name(kind: &str, name: &str) -> Result<(), ServiceError> {
    let ok = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(ServiceError::Rejected(format!("invalid {kind} '{name}'")))
    }
}

fn list_dirs(dir: &Path) -> Result<Vec<String>, ServiceError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Stream `reader` into `writer`, hashing on the way
fn copy_hashing(reader: &mut dyn Read, writer: &mut dyn Write) -> io::Result<PartDigest> {
    let mut hasher = TreeHasher::new();
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..n]);
        writer.write_all(&buffer[..n])?;
    }
    writer.flush()?;
    Ok(hasher.finish())
}

pub struct LocalVault {
    vaults_dir: PathBuf,
    vault: String,
}

impl LocalVault {
    pub fn new(root: &Path, vault: &str) -> Self {
        Self {
            vaults_dir: root.join("vaults"),
            vault: vault.to_string(),
        }
    }

    fn vault_dir(&self) -> PathBuf {
        self.vaults_dir.join(&self.vault)
    }

    /// Location of a completed archive
    pub fn archive_path(&self, archive_id: &str) -> PathBuf {
        self.vault_dir().join("archives").join(archive_id)
    }

    fn upload_dir(&self, upload_id: &str) -> Result<PathBuf, ServiceError> {
        check_name("upload id", upload_id)?;
        let dir = self.vault_dir().join("uploads").join(upload_id);
        if !dir.is_dir() {
            return Err(ServiceError::NotFound(format!("upload {upload_id}")));
        }
        Ok(dir)
    }

    fn read_meta(dir: &Path) -> Result<UploadMeta, ServiceError> {
        let data = fs::read(dir.join(UPLOAD_META))?;
        serde_json::from_slice(&data)
            .map_err(|e| ServiceError::Protocol(format!("{}: {e}", dir.display())))
    }

    /// Received parts keyed by start offset
    fn stored_parts(dir: &Path) -> Result<BTreeMap<u64, PathBuf>, ServiceError> {
        let mut parts = BTreeMap::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(start) = name.strip_suffix(PART_SUFFIX) {
                let start: u64 = start
                    .parse()
                    .map_err(|_| ServiceError::Protocol(format!("stray part file {name}")))?;
                parts.insert(start, entry.path());
            }
        }
        Ok(parts)
    }
}

impl ArchiveService for LocalVault {
    fn vault(&self) -> &str {
        &self.vault
    }

    fn list_vaults(&self) -> Result<Vec<String>, ServiceError> {
        list_dirs(&self.vaults_dir)
    }

    fn create_vault(&self, name: &str) -> Result<(), ServiceError> {
        check_name("vault", name)?;
        let dir = self.vaults_dir.join(name);
        fs::create_dir_all(dir.join("archives"))?;
        fs::create_dir_all(dir.join("uploads"))?;
        Ok(())
    }

    fn initiate_multipart_upload(
        &self,
        part_size: u32,
        description: &str,
    ) -> Result<String, ServiceError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let dir = self.vault_dir().join("uploads").join(&id);
        fs::create_dir_all(&dir)?;
        let meta = UploadMeta {
            part_size,
            description: description.to_string(),
        };
        let data = serde_json::to_vec(&meta).map_err(io::Error::from)?;
        fs::write(dir.join(UPLOAD_META), data)?;
        Ok(id)
    }

    fn upload_part(
        &self,
        upload_id: &str,
        chunk: &ChunkDescriptor,
        digest: &PartDigest,
        mut body: PartBody,
    ) -> Result<PartReceipt, ServiceError> {
        let dir = self.upload_dir(upload_id)?;
        let meta = Self::read_meta(&dir)?;

        // A rejected part never becomes visible: the temp file is dropped on error
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        let received = copy_hashing(&mut body, tmp.as_file_mut())?;
        check_part(meta.part_size, chunk, digest, &received)?;
        tmp.persist(dir.join(format!("{:020}{PART_SUFFIX}", chunk.start)))
            .map_err(|e| ServiceError::Io(e.error))?;
        Ok(PartReceipt(received.tree.to_hex()))
    }

    fn complete_multipart_upload(
        &self,
        upload_id: &str,
        archive_size: u64,
        checksum: &TreeHash,
    ) -> Result<String, ServiceError> {
        let dir = self.upload_dir(upload_id)?;
        let meta = Self::read_meta(&dir)?;
        let stored = Self::stored_parts(&dir)?;

        let mut parts = BTreeMap::new();
        for (&start, path) in &stored {
            let digest = hash_reader(File::open(path)?)?;
            parts.insert(start, (digest.length, digest.tree));
        }
        check_completion(meta.part_size, &parts, archive_size, checksum)?;

        let archives_dir = self.vault_dir().join("archives");
        fs::create_dir_all(&archives_dir)?;
        let archive_id = uuid::Uuid::new_v4().simple().to_string();
        let mut out = tempfile::NamedTempFile::new_in(&archives_dir)?;
        for path in stored.values() {
            io::copy(&mut File::open(path)?, out.as_file_mut())?;
        }
        out.as_file_mut().flush()?;
        out.persist(archives_dir.join(&archive_id))
            .map_err(|e| ServiceError::Io(e.error))?;
        fs::remove_dir_all(&dir)?;
        Ok(archive_id)
    }

    fn delete_archive(&self, archive_id: &str) -> Result<(), ServiceError> {
        check_name("archive id", archive_id)?;
        match fs::remove_file(self.archive_path(archive_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ServiceError::NotFound(format!("archive {archive_id}")))
            }
            Err(e) => Err(e.into()),
        }
    }
}

pub struct LocalAttributeStore {
    domains_dir: PathBuf,
    domain: String,
}

impl LocalAttributeStore {
    pub fn new(root: &Path, domain: &str) -> Self {
        Self {
            domains_dir: root.join("domains"),
            domain: domain.to_string(),
        }
    }

    fn item_path(&self, key: &str) -> Result<PathBuf, ServiceError> {
        check_name("key", key)?;
        Ok(self.domains_dir.join(&self.domain).join(format!("{key}.json")))
    }
}

impl AttributeStore for LocalAttributeStore {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn list_domains(&self) -> Result<Vec<String>, ServiceError> {
        list_dirs(&self.domains_dir)
    }

    fn create_domain(&self, name: &str) -> Result<(), ServiceError> {
        check_name("domain", name)?;
        fs::create_dir_all(self.domains_dir.join(name))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<Attribute>, ServiceError> {
        let path = self.item_path(key)?;
        let data = match fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data)
            .map_err(|e| ServiceError::Protocol(format!("{}: {e}", path.display())))
    }

    fn set(&self, key: &str, attributes: &[Attribute]) -> Result<(), ServiceError> {
        let path = self.item_path(key)?;
        let dir = self.domains_dir.join(&self.domain);
        fs::create_dir_all(&dir)?;
        let data = serde_json::to_vec_pretty(attributes).map_err(io::Error::from)?;
        // atomic write
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&data)?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| ServiceError::Io(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{combine, hash_bytes};
    use crate::plan::plan;
    use crate::service::ensure_vault;
    use std::io::Cursor;

    #[test]
    fn multipart_upload_reassembles_archive() {
        let root = tempfile::tempdir().unwrap();
        let vault = LocalVault::new(root.path(), "backups");
        assert!(ensure_vault(&vault).unwrap());
        assert!(!ensure_vault(&vault).unwrap());

        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();
        let part_size = 4096;
        let id = vault.initiate_multipart_upload(part_size, "test").unwrap();
        let mut digests = Vec::new();
        // Upload out of order; the vault orders by offset
        for chunk in plan(data.len() as u64, part_size).unwrap().into_iter().rev() {
            let bytes = &data[chunk.start as usize..][..chunk.length as usize];
            let digest = hash_bytes(bytes);
            vault
                .upload_part(&id, &chunk, &digest, Box::new(Cursor::new(bytes.to_vec())))
                .unwrap();
            digests.push((chunk.index, digest.tree));
        }
        digests.sort_by_key(|(i, _)| *i);
        let tree: Vec<TreeHash> = digests.into_iter().map(|(_, h)| h).collect();

        let archive_id = vault
            .complete_multipart_upload(&id, data.len() as u64, &combine(&tree))
            .unwrap();
        assert_eq!(fs::read(vault.archive_path(&archive_id)).unwrap(), data);

        vault.delete_archive(&archive_id).unwrap();
        assert!(matches!(
            vault.delete_archive(&archive_id),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn misaligned_part_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let vault = LocalVault::new(root.path(), "v");
        vault.create_vault("v").unwrap();
        let id = vault.initiate_multipart_upload(1024, "t").unwrap();
        let chunk = ChunkDescriptor {
            index: 0,
            start: 10,
            length: 4,
        };
        let digest = hash_bytes(b"abcd");
        let err = vault
            .upload_part(&id, &chunk, &digest, Box::new(&b"abcd"[..]))
            .unwrap_err();
        assert!(matches!(err, ServiceError::Rejected(_)));
    }

    #[test]
    fn attributes_survive_reopen() {
        let root = tempfile::tempdir().unwrap();
        let store = LocalAttributeStore::new(root.path(), "d");
        assert!(store.get("backupstate").unwrap().is_empty());
        store
            .set("backupstate", &[Attribute::new("json.000", "[]")])
            .unwrap();

        let reopened = LocalAttributeStore::new(root.path(), "d");
        assert_eq!(
            reopened.get("backupstate").unwrap(),
            vec![Attribute::new("json.000", "[]")]
        );
        assert!(reopened.get("../escape").is_err());
    }
}
