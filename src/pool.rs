//! Fixed-size worker pool driving chunk uploads
//!
//! `parallelism` threads drain a shared queue of chunks. Each result lands in
//! the slot of its chunk, so callers never depend on completion order.
//! Transient failures are retried after a fixed delay without limit; any other
//! failure stops every worker and is returned to the caller.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use crate::checksum::TreeHash;
use crate::error::UploadError;
use crate::logger::Logger;
use crate::plan::ChunkDescriptor;
use crate::progress::UploadProgress;
use crate::service::PartReceipt;

/// Delay between attempts of a chunk that failed transiently
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Longest uninterrupted sleep, so waiting workers notice an abort
const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// Outcome of one successfully uploaded (or, in dry-run, hashed) chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResult {
    pub index: u32,
    pub checksum: TreeHash,
    pub receipt: PartReceipt,
}

struct Shared<'a, F> {
    queue: Mutex<VecDeque<(usize, &'a ChunkDescriptor)>>,
    slots: Vec<OnceLock<ChunkResult>>,
    abort: AtomicBool,
    failure: Mutex<Option<UploadError>>,
    retry_delay: Duration,
    logger: &'a dyn Logger,
    progress: &'a UploadProgress,
    attempt: &'a F,
}

/// Run `attempt` once per chunk to success on `parallelism` workers.
///
/// Blocks until every chunk has a result or a fatal error stopped the run.
/// Results are returned in chunk order.
pub fn run<F>(
    chunks: &[ChunkDescriptor],
    parallelism: usize,
    retry_delay: Duration,
    logger: &dyn Logger,
    progress: &UploadProgress,
    attempt: F,
) -> Result<Vec<ChunkResult>, UploadError>
where
    F: Fn(&ChunkDescriptor) -> Result<ChunkResult, UploadError> + Sync,
{
    if parallelism == 0 {
        return Err(UploadError::InvalidConfig(
            "parallelism must be at least 1".into(),
        ));
    }
    if chunks.is_empty() {
        return Ok(Vec::new());
    }

    let shared = Shared {
        queue: Mutex::new(chunks.iter().enumerate().collect()),
        slots: (0..chunks.len()).map(|_| OnceLock::new()).collect(),
        abort: AtomicBool::new(false),
        failure: Mutex::new(None),
        retry_delay,
        logger,
        progress,
        attempt: &attempt,
    };

    let workers = parallelism.min(chunks.len());
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| worker(&shared));
        }
    });

    if let Some(err) = shared.failure.into_inner() {
        return Err(err);
    }
    shared
        .slots
        .into_iter()
        .map(|slot| slot.into_inner().ok_or(UploadError::Aborted))
        .collect()
}

fn worker<F>(shared: &Shared<'_, F>)
where
    F: Fn(&ChunkDescriptor) -> Result<ChunkResult, UploadError> + Sync,
{
    loop {
        if shared.abort.load(Ordering::Acquire) {
            break;
        }
        let next = shared.queue.lock().pop_front();
        let Some((slot, chunk)) = next else {
            break;
        };

        match attempt_until_done(shared, chunk) {
            Ok(result) => {
                // Each slot is written exactly once: chunks leave the queue once
                let _ = shared.slots[slot].set(result);
                shared.logger.part_done(chunk.index, chunk.length);
                shared.progress.chunk_done();
            }
            Err(UploadError::Aborted) => break,
            Err(err) => {
                shared.logger.error("upload part", &err.to_string());
                shared.abort.store(true, Ordering::Release);
                shared.failure.lock().get_or_insert(err);
                break;
            }
        }
    }
}

fn attempt_until_done<F>(
    shared: &Shared<'_, F>,
    chunk: &ChunkDescriptor,
) -> Result<ChunkResult, UploadError>
where
    F: Fn(&ChunkDescriptor) -> Result<ChunkResult, UploadError> + Sync,
{
    let mut attempts: u32 = 0;
    loop {
        if shared.abort.load(Ordering::Acquire) {
            return Err(UploadError::Aborted);
        }
        attempts += 1;
        match (shared.attempt)(chunk) {
            Ok(result) => return Ok(result),
            Err(err) if err.is_transient() => {
                shared.logger.retry(chunk.index, attempts, &err.to_string());
                shared.progress.note(&format!(
                    "Part {} failed ({}), retrying in {}s",
                    chunk.index,
                    err,
                    shared.retry_delay.as_secs_f64()
                ));
                sleep_unless_aborted(shared.retry_delay, &shared.abort)?;
            }
            Err(err) => return Err(err),
        }
    }
}

fn sleep_unless_aborted(delay: Duration, abort: &AtomicBool) -> Result<(), UploadError> {
    let deadline = Instant::now() + delay;
    loop {
        if abort.load(Ordering::Acquire) {
            return Err(UploadError::Aborted);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}
