//! Multipart upload orchestration: initiate, upload parts in parallel, complete

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Take};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use crate::checksum::{combine_chunks, hash_reader, PartDigest, TreeHash};
use crate::error::UploadError;
use crate::logger::Logger;
use crate::plan::{plan, ChunkDescriptor};
use crate::pool::{self, ChunkResult, DEFAULT_RETRY_DELAY};
use crate::progress::UploadProgress;
use crate::service::{ArchiveService, PartReceipt};

/// Archive id reported for a dry run, where nothing is created remotely
pub const DRY_RUN_ARCHIVE_ID: &str = "dry-run";

pub const MIB: u32 = 1024 * 1024;

/// Largest part the archive service accepts, in MiB
pub const MAX_PART_SIZE_MIB: u32 = 2048;

/// Part sizes must be 1 MiB times a power of two so each part's tree hash is
/// a subtree of the archive's tree hash.
pub fn validate_part_size(part_size: u32) -> Result<(), UploadError> {
    let mib = part_size / MIB;
    if part_size % MIB != 0 || !mib.is_power_of_two() || mib > MAX_PART_SIZE_MIB {
        return Err(UploadError::InvalidConfig(format!(
            "part size {part_size} is not a power-of-two number of MiB between 1 and {MAX_PART_SIZE_MIB}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub part_size: u32,
    pub parallelism: usize,
    pub retry_delay: Duration,
    pub description: String,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            part_size: 128 * MIB,
            parallelism: 5,
            retry_delay: DEFAULT_RETRY_DELAY,
            description: "backup".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub archive_id: String,
    pub checksum: TreeHash,
    pub size: u64,
    pub parts: usize,
}

/// Uploads one local file as one remote archive
pub trait ArchiveUploader {
    fn upload_archive(&self, file: &Path, dry_run: bool) -> Result<UploadOutcome, UploadError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UploadState {
    Initiated,
    PartsUploading,
    PartsComplete,
    Finalized,
}

/// State of one multipart upload run. Never persisted.
pub struct UploadSession {
    upload_id: String,
    chunks: Vec<ChunkDescriptor>,
    digests: Vec<OnceLock<PartDigest>>,
    #[cfg(test)]
    hash_passes: AtomicUsize,
    completed: AtomicUsize,
    state: UploadState,
}

impl UploadSession {
    fn new(upload_id: String, chunks: Vec<ChunkDescriptor>) -> Self {
        Self {
            upload_id,
            digests: (0..chunks.len()).map(|_| OnceLock::new()).collect(),
            chunks,
            #[cfg(test)]
            hash_passes: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            state: UploadState::Initiated,
        }
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn chunks(&self) -> &[ChunkDescriptor] {
        &self.chunks
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    /// Chunks finished so far
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    fn advance(&mut self, next: UploadState) {
        debug_assert!(next > self.state, "{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Checksum of a chunk, read from disk on first use only
    fn digest(&self, file: &Path, chunk: &ChunkDescriptor) -> Result<PartDigest, UploadError> {
        let slot = &self.digests[chunk.index as usize];
        if let Some(digest) = slot.get() {
            return Ok(*digest);
        }
        #[cfg(test)]
        self.hash_passes.fetch_add(1, Ordering::Relaxed);
        let digest = hash_reader(open_chunk(file, chunk)?).map_err(UploadError::Source)?;
        if digest.length != u64::from(chunk.length) {
            return Err(UploadError::Source(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "could not read chunk {}: got {} of {} bytes",
                    chunk.index, digest.length, chunk.length
                ),
            )));
        }
        Ok(*slot.get_or_init(|| digest))
    }

    /// One attempt at one chunk
    fn upload_chunk(
        &self,
        service: &dyn ArchiveService,
        file: &Path,
        chunk: &ChunkDescriptor,
        dry_run: bool,
    ) -> Result<ChunkResult, UploadError> {
        let digest = self.digest(file, chunk)?;
        let receipt = if dry_run {
            PartReceipt(digest.tree.to_hex())
        } else {
            let body = open_chunk(file, chunk)?;
            service
                .upload_part(&self.upload_id, chunk, &digest, Box::new(body))
                .map_err(|e| UploadError::service("upload part", e))?
        };
        self.completed.fetch_add(1, Ordering::AcqRel);
        Ok(ChunkResult {
            index: chunk.index,
            checksum: digest.tree,
            receipt,
        })
    }
}

/// Fresh handle positioned at the chunk, limited to its length
fn open_chunk(file: &Path, chunk: &ChunkDescriptor) -> Result<Take<File>, UploadError> {
    let mut f = File::open(file).map_err(UploadError::Source)?;
    f.seek(SeekFrom::Start(chunk.start))
        .map_err(UploadError::Source)?;
    Ok(f.take(u64::from(chunk.length)))
}

/// Multipart upload with client-computed tree hashes
pub struct MultipartUploader<'a> {
    service: &'a dyn ArchiveService,
    options: UploadOptions,
    logger: &'a dyn Logger,
    show_progress: bool,
}

impl<'a> MultipartUploader<'a> {
    pub fn new(service: &'a dyn ArchiveService, options: UploadOptions, logger: &'a dyn Logger) -> Self {
        Self {
            service,
            options,
            logger,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    fn initiate(&self, file: &Path, dry_run: bool) -> Result<UploadSession, UploadError> {
        validate_part_size(self.options.part_size)?;
        if self.options.parallelism == 0 {
            return Err(UploadError::InvalidConfig(
                "parallelism must be at least 1".into(),
            ));
        }
        let size = fs::metadata(file).map_err(UploadError::Source)?.len();
        let chunks = plan(size, self.options.part_size)?;
        self.logger.start(file, size, chunks.len());

        let upload_id = if dry_run {
            DRY_RUN_ARCHIVE_ID.to_string()
        } else {
            self.service
                .initiate_multipart_upload(self.options.part_size, &self.options.description)
                .map_err(|e| UploadError::service("initiate multipart upload", e))?
        };
        Ok(UploadSession::new(upload_id, chunks))
    }

    fn upload_parts(
        &self,
        session: &UploadSession,
        file: &Path,
        dry_run: bool,
    ) -> Result<Vec<ChunkResult>, UploadError> {
        let progress = UploadProgress::new(session.chunks.len() as u64, self.show_progress);
        let results = pool::run(
            &session.chunks,
            self.options.parallelism,
            self.options.retry_delay,
            self.logger,
            &progress,
            |chunk| session.upload_chunk(self.service, file, chunk, dry_run),
        );
        match &results {
            Ok(_) => progress.finish_success(session.chunks.iter().map(|c| u64::from(c.length)).sum()),
            Err(e) => progress.finish_error(&e.to_string()),
        }
        results
    }
}

impl ArchiveUploader for MultipartUploader<'_> {
    fn upload_archive(&self, file: &Path, dry_run: bool) -> Result<UploadOutcome, UploadError> {
        let mut session = self.initiate(file, dry_run)?;
        let size: u64 = session.chunks.iter().map(|c| u64::from(c.length)).sum();

        session.advance(UploadState::PartsUploading);
        let results = self.upload_parts(&session, file, dry_run)?;
        session.advance(UploadState::PartsComplete);

        let checksum = combine_chunks(&results);
        let archive_id = if dry_run {
            DRY_RUN_ARCHIVE_ID.to_string()
        } else {
            self.service
                .complete_multipart_upload(&session.upload_id, size, &checksum)
                .map_err(|e| UploadError::service("complete multipart upload", e))?
        };
        session.advance(UploadState::Finalized);

        Ok(UploadOutcome {
            archive_id,
            checksum,
            size,
            parts: results.len(),
        })
    }
}
