//! In-process collaborators with call accounting and fault injection
//!
//! These enforce the same part/completion validation as the real service so
//! the full pipeline can be exercised without a network.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};

use super::{
    check_completion, check_part, ArchiveService, Attribute, AttributeStore, PartBody, PartReceipt,
};
use crate::checksum::{hash_reader, PartDigest, TreeHash};
use crate::error::ServiceError;
use crate::plan::ChunkDescriptor;

/// Number of calls seen per operation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CallCounts {
    pub list_vaults: usize,
    pub create_vault: usize,
    pub initiate: usize,
    pub upload_part: usize,
    pub complete: usize,
    pub delete: usize,
}

impl CallCounts {
    /// Calls that change remote state
    pub fn mutating(&self) -> usize {
        self.create_vault + self.initiate + self.upload_part + self.complete + self.delete
    }
}

struct Upload {
    part_size: u32,
    parts: BTreeMap<u64, (u64, TreeHash)>,
}

#[derive(Default)]
struct ArchiveState {
    vaults: Vec<String>,
    uploads: HashMap<String, Upload>,
    archives: BTreeMap<String, (u64, TreeHash)>,
    next_id: u64,
    calls: CallCounts,
    part_attempts: HashMap<u32, usize>,
    transient_failures: HashMap<u32, usize>,
    fatal_failures: HashSet<u32>,
    completions: Vec<(u64, TreeHash)>,
}

pub struct MemoryArchiveService {
    vault: String,
    state: Mutex<ArchiveState>,
}

impl MemoryArchiveService {
    pub fn new(vault: &str) -> Self {
        Self {
            vault: vault.to_string(),
            state: Mutex::new(ArchiveState::default()),
        }
    }

    /// Pre-populate archives that already exist in the vault
    pub fn with_archives(vault: &str, ids: &[&str]) -> Self {
        let service = Self::new(vault);
        {
            let mut st = service.state.lock();
            st.vaults.push(vault.to_string());
            for id in ids {
                st.archives.insert(id.to_string(), (0, TreeHash::of_empty()));
            }
        }
        service
    }

    /// The next `times` attempts for chunk `index` fail with a transient error
    pub fn fail_part_transiently(&self, index: u32, times: usize) {
        self.state.lock().transient_failures.insert(index, times);
    }

    /// Every attempt for chunk `index` is rejected
    pub fn fail_part_fatally(&self, index: u32) {
        self.state.lock().fatal_failures.insert(index);
    }

    pub fn calls(&self) -> CallCounts {
        self.state.lock().calls.clone()
    }

    pub fn part_attempts(&self, index: u32) -> usize {
        self.state.lock().part_attempts.get(&index).copied().unwrap_or(0)
    }

    pub fn archive_ids(&self) -> Vec<String> {
        self.state.lock().archives.keys().cloned().collect()
    }

    /// Size and tree hash of a stored archive
    pub fn archive(&self, archive_id: &str) -> Option<(u64, TreeHash)> {
        self.state.lock().archives.get(archive_id).copied()
    }

    /// (size, checksum) of every accepted completion, in call order
    pub fn completions(&self) -> Vec<(u64, TreeHash)> {
        self.state.lock().completions.clone()
    }
}

impl ArchiveService for MemoryArchiveService {
    fn vault(&self) -> &str {
        &self.vault
    }

    fn list_vaults(&self) -> Result<Vec<String>, ServiceError> {
        let mut st = self.state.lock();
        st.calls.list_vaults += 1;
        Ok(st.vaults.clone())
    }

    fn create_vault(&self, name: &str) -> Result<(), ServiceError> {
        let mut st = self.state.lock();
        st.calls.create_vault += 1;
        if !st.vaults.iter().any(|v| v == name) {
            st.vaults.push(name.to_string());
        }
        Ok(())
    }

    fn initiate_multipart_upload(
        &self,
        part_size: u32,
        _description: &str,
    ) -> Result<String, ServiceError> {
        let mut st = self.state.lock();
        st.calls.initiate += 1;
        st.next_id += 1;
        let id = format!("upload-{:04}", st.next_id);
        st.uploads.insert(
            id.clone(),
            Upload {
                part_size,
                parts: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    fn upload_part(
        &self,
        upload_id: &str,
        chunk: &ChunkDescriptor,
        digest: &PartDigest,
        body: PartBody,
    ) -> Result<PartReceipt, ServiceError> {
        let part_size = {
            let mut st = self.state.lock();
            st.calls.upload_part += 1;
            *st.part_attempts.entry(chunk.index).or_insert(0) += 1;
            if let Some(left) = st.transient_failures.get_mut(&chunk.index) {
                if *left > 0 {
                    *left -= 1;
                    return Err(ServiceError::Transient(format!(
                        "injected timeout for part {}",
                        chunk.index
                    )));
                }
            }
            if st.fatal_failures.contains(&chunk.index) {
                return Err(ServiceError::Rejected(format!(
                    "injected rejection for part {}",
                    chunk.index
                )));
            }
            match st.uploads.get(upload_id) {
                Some(u) => u.part_size,
                None => return Err(ServiceError::NotFound(format!("upload {upload_id}"))),
            }
        };

        // Read outside the lock so parallel parts do not serialize
        let received = hash_reader(body)?;
        check_part(part_size, chunk, digest, &received)?;

        let mut st = self.state.lock();
        let upload = st
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| ServiceError::NotFound(format!("upload {upload_id}")))?;
        upload
            .parts
            .insert(chunk.start, (received.length, received.tree));
        Ok(PartReceipt(received.tree.to_hex()))
    }

    fn complete_multipart_upload(
        &self,
        upload_id: &str,
        archive_size: u64,
        checksum: &TreeHash,
    ) -> Result<String, ServiceError> {
        let mut st = self.state.lock();
        st.calls.complete += 1;
        let upload = st
            .uploads
            .get(upload_id)
            .ok_or_else(|| ServiceError::NotFound(format!("upload {upload_id}")))?;
        check_completion(upload.part_size, &upload.parts, archive_size, checksum)?;
        st.uploads.remove(upload_id);
        st.next_id += 1;
        let id = format!("archive-{:04}", st.next_id);
        st.archives.insert(id.clone(), (archive_size, *checksum));
        st.completions.push((archive_size, *checksum));
        Ok(id)
    }

    fn delete_archive(&self, archive_id: &str) -> Result<(), ServiceError> {
        let mut st = self.state.lock();
        st.calls.delete += 1;
        match st.archives.remove(archive_id) {
            Some(_) => Ok(()),
            None => Err(ServiceError::NotFound(format!("archive {archive_id}"))),
        }
    }
}

#[derive(Default)]
struct StoreState {
    domains: Vec<String>,
    items: HashMap<String, Vec<Attribute>>,
    gets: usize,
    sets: usize,
    creates: usize,
    /// Written by "another writer" between our next set and the get after it
    interleaved: Option<(String, Vec<Attribute>)>,
    interleave_armed: bool,
}

pub struct MemoryAttributeStore {
    domain: String,
    state: Mutex<StoreState>,
}

impl MemoryAttributeStore {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Seed an item without counting it as a write
    pub fn insert(&self, key: &str, attributes: Vec<Attribute>) {
        self.state.lock().items.insert(key.to_string(), attributes);
    }

    pub fn item(&self, key: &str) -> Vec<Attribute> {
        self.state.lock().items.get(key).cloned().unwrap_or_default()
    }

    pub fn get_count(&self) -> usize {
        self.state.lock().gets
    }

    pub fn set_count(&self) -> usize {
        self.state.lock().sets
    }

    pub fn create_count(&self) -> usize {
        self.state.lock().creates
    }

    /// Simulate a concurrent writer: once the next `set` lands, the first
    /// `get` that follows sees `attributes` stored under `key`.
    pub fn overwrite_after_next_set(&self, key: &str, attributes: Vec<Attribute>) {
        let mut st = self.state.lock();
        st.interleaved = Some((key.to_string(), attributes));
        st.interleave_armed = false;
    }
}

impl AttributeStore for MemoryAttributeStore {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn list_domains(&self) -> Result<Vec<String>, ServiceError> {
        Ok(self.state.lock().domains.clone())
    }

    fn create_domain(&self, name: &str) -> Result<(), ServiceError> {
        let mut st = self.state.lock();
        st.creates += 1;
        if !st.domains.iter().any(|d| d == name) {
            st.domains.push(name.to_string());
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<Attribute>, ServiceError> {
        let mut st = self.state.lock();
        st.gets += 1;
        if st.interleave_armed {
            st.interleave_armed = false;
            if let Some((k, attrs)) = st.interleaved.take() {
                st.items.insert(k, attrs);
            }
        }
        Ok(st.items.get(key).cloned().unwrap_or_default())
    }

    fn set(&self, key: &str, attributes: &[Attribute]) -> Result<(), ServiceError> {
        let mut st = self.state.lock();
        st.sets += 1;
        st.items.insert(key.to_string(), attributes.to_vec());
        if st.interleaved.is_some() {
            st.interleave_armed = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{combine, hash_bytes};
    use crate::plan::plan;
    use std::io::Cursor;

    #[test]
    fn rejects_part_with_wrong_checksum() {
        let svc = MemoryArchiveService::new("v");
        let id = svc.initiate_multipart_upload(1024, "t").unwrap();
        let chunk = plan(10, 1024).unwrap()[0];
        let wrong = hash_bytes(b"something else");
        let err = svc
            .upload_part(&id, &chunk, &wrong, Box::new(&b"0123456789"[..]))
            .unwrap_err();
        assert!(matches!(err, ServiceError::ChecksumMismatch(_)));
    }

    #[test]
    fn completion_requires_matching_archive_checksum() {
        let svc = MemoryArchiveService::new("v");
        let id = svc.initiate_multipart_upload(4, "t").unwrap();
        let data = b"abcdefghij";
        let mut parts = Vec::new();
        for chunk in plan(data.len() as u64, 4).unwrap() {
            let bytes = &data[chunk.start as usize..chunk.start as usize + chunk.length as usize];
            let digest = hash_bytes(bytes);
            svc.upload_part(&id, &chunk, &digest, Box::new(Cursor::new(bytes.to_vec())))
                .unwrap();
            parts.push(digest.tree);
        }
        let bad = svc.complete_multipart_upload(&id, 10, &TreeHash::of_empty());
        assert!(matches!(bad, Err(ServiceError::ChecksumMismatch(_))));
        let archive = svc
            .complete_multipart_upload(&id, 10, &combine(&parts))
            .unwrap();
        assert_eq!(svc.archive(&archive), Some((10, combine(&parts))));
    }

    #[test]
    fn store_set_replaces_all_attributes() {
        let store = MemoryAttributeStore::new("d");
        store
            .set("k", &[Attribute::new("a", "1"), Attribute::new("b", "2")])
            .unwrap();
        store.set("k", &[Attribute::new("c", "3")]).unwrap();
        assert_eq!(store.get("k").unwrap(), vec![Attribute::new("c", "3")]);
        assert_eq!(store.set_count(), 2);
    }

    #[test]
    fn interleaved_write_shows_up_on_the_get_after_a_set() {
        let store = MemoryAttributeStore::new("d");
        store.overwrite_after_next_set("k", vec![Attribute::new("x", "9")]);
        assert!(store.get("k").unwrap().is_empty());
        store.set("k", &[Attribute::new("a", "1")]).unwrap();
        assert_eq!(store.get("k").unwrap(), vec![Attribute::new("x", "9")]);
        store.set("k", &[Attribute::new("a", "2")]).unwrap();
        assert_eq!(store.get("k").unwrap(), vec![Attribute::new("a", "2")]);
    }

    #[test]
    fn container_creation_counts_as_mutation() {
        let svc = MemoryArchiveService::new("v");
        svc.create_vault("v").unwrap();
        assert_eq!(svc.calls().mutating(), 1);
        let store = MemoryAttributeStore::new("d");
        store.create_domain("d").unwrap();
        assert_eq!(store.create_count(), 1);
    }
}
