//! Bulk prefetch of every regular file in a layer.
//!
//! # Architecture
//!
//! ```text
//! Blocking walker                 Dispatcher (async)              Blocking pool
//! ───────────────                 ──────────────────              ─────────────
//! depth-bounded DFS ─ChunkJob──►  bounded mpsc ─► permit ──spawn─► fetch, verify, cache
//!        ▲                             │                                 │
//!        └──── CancellationToken ◄─────┴───────── first error ◄──────────┘
//! ```
//!
//! Concurrency is bounded by a semaphore sized from [`ReaderOptions`]. The
//! first failure cancels the shared token: the walker stops, queued jobs
//! return without fetching, and the error is reported once everything has
//! drained.
//!
//! [`ReaderOptions`]: crate::ReaderOptions

use std::sync::Arc;

use lazylayer_model::{ChildEntry, ChunkEntry, ChunkedFile, EntryAttr, EntryId, MetadataReader};
use lazylayer_storage::{CacheOptions, ChunkKey};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::ReaderError;
use crate::options::PrefetchOptions;
use crate::reader::LayerReader;
use crate::stats::StatsCollector;
use crate::verify::ChunkTrust;

/// One chunk to fetch.
struct ChunkJob {
    file_id: EntryId,
    path: Arc<str>,
    file: Arc<dyn ChunkedFile>,
    chunk: ChunkEntry,
}

/// Walk the layer and fetch every uncached chunk of every eligible file.
pub(crate) async fn prefetch(
    reader: Arc<LayerReader>,
    options: PrefetchOptions,
) -> Result<(), ReaderError> {
    reader.ensure_open()?;

    let metadata: Arc<dyn MetadataReader> = match &options.blob {
        Some(blob) => reader.metadata.clone_with_blob(blob.clone())?,
        None => reader.metadata.clone(),
    };
    let external: Option<CancellationToken> = options.cancellation.clone();
    let token: CancellationToken = external
        .as_ref()
        .map(CancellationToken::child_token)
        .unwrap_or_else(CancellationToken::new);
    let cache_options: CacheOptions = options.cache_options;
    let concurrency: usize = reader.options.effective_prefetch_concurrency();
    let max_depth: usize = reader.options.max_walk_depth;

    let (job_tx, mut job_rx) = mpsc::channel::<ChunkJob>(concurrency * 2);
    let walker = tokio::task::spawn_blocking({
        let token: CancellationToken = token.clone();
        move || walk(metadata.as_ref(), &options, max_depth, &token, &job_tx)
    });

    let limiter = Arc::new(Semaphore::new(concurrency));
    let mut running: JoinSet<Result<(), ReaderError>> = JoinSet::new();
    let mut first_error: Option<ReaderError> = None;

    loop {
        let job: ChunkJob = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            job = job_rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        while let Some(result) = running.try_join_next() {
            record(&mut first_error, &token, flatten(result));
        }
        if first_error.is_some() {
            break;
        }

        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            permit = limiter.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let reader: Arc<LayerReader> = reader.clone();
        let token: CancellationToken = token.clone();
        running.spawn_blocking(move || {
            let _permit = permit;
            if token.is_cancelled() {
                return Ok(());
            }
            reader.prefetch_chunk(&job, cache_options)
        });
    }

    // Unblock the walker if it is waiting on a full channel.
    drop(job_rx);
    let walked: Result<(), ReaderError> = match walker.await {
        Ok(result) => result,
        Err(e) => Err(task_failed(e)),
    };
    record(&mut first_error, &token, walked);

    while let Some(result) = running.join_next().await {
        record(&mut first_error, &token, flatten(result));
    }

    if let Some(e) = first_error {
        tracing::warn!("Prefetch failed: {}", e);
        return Err(e);
    }
    if external.is_some_and(|t| t.is_cancelled()) {
        tracing::debug!("Prefetch cancelled");
        return Err(ReaderError::Cancelled);
    }

    let stats = reader.stats();
    tracing::info!(
        fetched = stats.prefetch_fetches,
        skipped = stats.prefetch_skips,
        "Prefetch complete"
    );
    Ok(())
}

/// Keep the first error and cancel outstanding work.
fn record(
    first_error: &mut Option<ReaderError>,
    token: &CancellationToken,
    result: Result<(), ReaderError>,
) {
    if let Err(e) = result {
        token.cancel();
        if first_error.is_none() {
            *first_error = Some(e);
        }
    }
}

fn flatten(result: Result<Result<(), ReaderError>, JoinError>) -> Result<(), ReaderError> {
    result.map_err(task_failed)?
}

fn task_failed(e: JoinError) -> ReaderError {
    ReaderError::TaskFailed(e.to_string())
}

/// Depth-first walk from the root, queueing chunk jobs.
///
/// Uses an explicit stack so deep trees cannot exhaust the thread's stack
/// before the depth bound trips.
fn walk(
    metadata: &dyn MetadataReader,
    options: &PrefetchOptions,
    max_depth: usize,
    token: &CancellationToken,
    jobs: &mpsc::Sender<ChunkJob>,
) -> Result<(), ReaderError> {
    let mut stack: Vec<(EntryId, String, usize)> = vec![(metadata.root_id(), String::new(), 0)];

    while let Some((dir, dir_path, depth)) = stack.pop() {
        if token.is_cancelled() {
            return Ok(());
        }
        if depth > max_depth {
            return Err(ReaderError::TreeTooDeep {
                depth,
                max: max_depth,
            });
        }

        let mut children: Vec<ChildEntry> = Vec::new();
        metadata.foreach_child(dir, &mut |child| {
            children.push(child.clone());
            true
        })?;

        for child in children {
            if child.is_toc {
                continue;
            }
            let path: String = if dir_path.is_empty() {
                child.name.clone()
            } else {
                format!("{}/{}", dir_path, child.name)
            };

            if child.kind.is_dir() {
                stack.push((child.id, path, depth + 1));
            } else if child.kind.is_regular() && !queue_file(metadata, options, child.id, path, jobs)? {
                // Dispatcher has gone away.
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Queue every chunk of one file. Returns false once the receiver is gone.
fn queue_file(
    metadata: &dyn MetadataReader,
    options: &PrefetchOptions,
    id: EntryId,
    path: String,
    jobs: &mpsc::Sender<ChunkJob>,
) -> Result<bool, ReaderError> {
    let attr: EntryAttr = metadata.get_attr(id)?;
    if attr.size == 0 {
        return Ok(true);
    }
    if !options.accepts(metadata.get_offset(id)?) {
        return Ok(true);
    }

    let file: Arc<dyn ChunkedFile> = metadata.open_file(id, None)?;
    let path: Arc<str> = Arc::from(path);
    let mut offset: u64 = 0;
    while offset < attr.size {
        let Some(chunk) = file.chunk_entry_for_offset(offset) else {
            break;
        };
        if chunk.end() <= offset {
            break;
        }
        offset = chunk.end();

        let job = ChunkJob {
            file_id: id,
            path: path.clone(),
            file: file.clone(),
            chunk,
        };
        if jobs.blocking_send(job).is_err() {
            return Ok(false);
        }
    }
    Ok(true)
}

impl LayerReader {
    /// Fetch, verify and cache one chunk unless it is already cached.
    fn prefetch_chunk(&self, job: &ChunkJob, opts: CacheOptions) -> Result<(), ReaderError> {
        let chunk: &ChunkEntry = &job.chunk;
        let key = ChunkKey::new(job.file_id, chunk.offset, chunk.size);
        if self.is_cached(&key, opts) {
            StatsCollector::incr(&self.stats.prefetch_skips);
            return Ok(());
        }

        let mut buf = self.buffers.acquire(chunk.size as usize);
        self.fetch_chunk(job.file.as_ref(), &job.path, chunk, &mut buf)?;
        StatsCollector::incr(&self.stats.prefetch_fetches);

        if self.check_chunk(job.file_id, chunk, &buf)? == ChunkTrust::Verified {
            self.store_chunk(&key, &buf, opts)?;
        }
        Ok(())
    }
}
