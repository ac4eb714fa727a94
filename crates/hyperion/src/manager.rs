//! The search manager: owns the buffer pool, file queues, and scheduler,
//! launches I/O workers, and drives the consume/score loop until the end
//! signal.

use crate::config::SearchParameters;
use crate::error::{EngineError, Result};
use crate::exchange::{merge_staged, BatchMeta, StageRing};
use crate::index::FragmentIndex;
use crate::kernel::{CpuBackend, ScoringBackend};
use crate::ms2::{ExtractParams, Ms2Reader};
use crate::msquery::{assign_batch_numbers, FileQueue, QueryFile};
use crate::pool::BufferPool;
use crate::scheduler::{Directive, Scheduler, STALL_PENALTY};
use crate::sink::OutputSink;
use crate::spectrum::QCHUNK;
use log::{error, info};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Buffers in the pool and the ready-queue watermarks the scheduler
/// steers by.
const POOL_CAPACITY: usize = 20;
const POOL_LOW_WATER: usize = 5;
const POOL_HIGH_WATER: usize = 15;

/// Consumer poll interval on an empty ready queue.
const POLL: Duration = Duration::from_millis(100);

/// Shared state threaded through the manager, the I/O workers, and the
/// scoring kernel; its lifecycle brackets the whole search.
pub struct SearchContext {
    pub params: SearchParameters,
    pub index: FragmentIndex,
    pub pool: BufferPool,
    /// Unstarted input files
    pub pending: FileQueue,
    /// Files parked by preempted workers, resumed by the next worker
    pub parked: FileQueue,
    pub scheduler: Scheduler,
    /// Every batch published to the ready queue
    pub batches: Mutex<Vec<BatchMeta>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchSummary {
    pub files: usize,
    pub batches: usize,
    pub spectra: usize,
    pub reported: usize,
}

/// Run the full search pipeline: stream batches off disk, score them
/// against the index, and report PSMs (or stage shard results and merge).
pub fn run_search(
    params: SearchParameters,
    index: FragmentIndex,
    sink: Arc<dyn OutputSink>,
) -> Result<SearchSummary> {
    let extract = ExtractParams {
        scale: params.scale,
        min_mass: params.min_mass,
        max_mass: params.max_mass,
    };

    let mut files: Vec<QueryFile> = params
        .query_paths
        .par_iter()
        .enumerate()
        .filter_map(|(file_index, path)| {
            match Ms2Reader::open(path, file_index, QCHUNK, extract) {
                Ok(reader) => Some(QueryFile::new(Box::new(reader), path.clone(), file_index)),
                Err(e) => {
                    // Fatal for this file only
                    error!("- {}: {}", path, e);
                    None
                }
            }
        })
        .collect();
    files.sort_by_key(|f| f.file_index);
    let n_files = files.len();

    let (total_spectra, total_batches) = assign_batch_numbers(&mut files);
    info!(
        "queued {} spectra in {} batches across {} files",
        total_spectra, total_batches, n_files
    );

    let ctx = Arc::new(SearchContext {
        pool: BufferPool::new(POOL_CAPACITY, POOL_LOW_WATER, POOL_HIGH_WATER),
        pending: FileQueue::new(),
        parked: FileQueue::new(),
        scheduler: Scheduler::new(params.prep_threads),
        batches: Mutex::new(Vec::with_capacity(total_batches)),
        index,
        params,
    });
    for file in files {
        ctx.pending.push(file);
    }

    let mut exchange = if ctx.params.nodes > 1 {
        Some(StageRing::new(
            ctx.params.workspace.clone(),
            ctx.params.rank,
        )?)
    } else {
        None
    };

    let backend = CpuBackend {
        index: &ctx.index,
        params: &ctx.params,
        sink: Arc::clone(&sink),
    };

    let mut io_handles = Vec::new();
    if ctx.scheduler.reserve_io_slot() {
        spawn_io(&ctx, &mut io_handles)?;
    }

    let outcome = consume_loop(&ctx, &backend, exchange.as_mut(), &mut io_handles);
    if outcome.is_err() {
        ctx.scheduler.request_exit();
    }

    // Orderly teardown regardless of how the loop ended
    for handle in io_handles {
        let _ = handle.join();
    }
    ctx.pool.drain();

    let mut reported = outcome?;
    if let Some(ring) = exchange {
        ring.finish()?;
        // The transport collaborator has barriered all shards here; fold
        // their staged results into globally correct e-values.
        if ctx.params.rank == 0 {
            let batches = ctx.batches.lock();
            reported += merge_staged(
                &ctx.params.workspace,
                ctx.params.nodes,
                &batches,
                ctx.params.min_cpsm,
                ctx.params.expect_max,
                sink.as_ref(),
            )?;
        }
    }

    let batches = ctx.batches.lock();
    let spectra = batches.iter().map(|b| b.num_specs).sum();
    Ok(SearchSummary {
        files: n_files,
        batches: batches.len(),
        spectra,
        reported,
    })
}

/// The main query loop: wait for a ready batch (accumulating the stall
/// penalty), let the scheduler rebalance threads, score, replenish.
fn consume_loop(
    ctx: &Arc<SearchContext>,
    backend: &dyn ScoringBackend,
    mut exchange: Option<&mut StageRing>,
    io_handles: &mut Vec<JoinHandle<()>>,
) -> Result<usize> {
    let mut spectrum_id = 0usize;
    let mut reported = 0usize;

    loop {
        let wait_start = Instant::now();
        let batch = loop {
            if let Some(batch) = ctx.pool.take_ready() {
                break batch;
            }
            if ctx.scheduler.check_signal() || ctx.scheduler.should_exit() {
                return Ok(reported);
            }
            // Every worker may have parked on a momentarily full pool;
            // revive one so the remaining input keeps flowing.
            if wait_start.elapsed() >= STALL_PENALTY
                && ctx.scheduler.active_io() == 0
                && !ctx.scheduler.is_io_complete()
                && ctx.scheduler.reserve_io_slot()
            {
                spawn_io(ctx, io_handles)?;
            }
            std::thread::sleep(POLL);
        };

        let penalty = wait_start.elapsed();
        let level = ctx.pool.ready_level();
        if ctx.scheduler.run_manager(penalty, level) == Directive::SpawnIo {
            spawn_io(ctx, io_handles)?;
        }

        let threads = compute_width(&ctx.params, &ctx.scheduler);
        match exchange.as_mut() {
            Some(ring) => {
                let mut slot = ring.begin_batch(batch.batch_num);
                if let Err(e) =
                    backend.score_batch(&batch, spectrum_id, threads, Some(&mut slot))
                {
                    // Free the slot so the writer can still be joined
                    slot.done = true;
                    return Err(e);
                }
                drop(slot);
                ring.post()?;
            }
            None => {
                reported += backend.score_batch(&batch, spectrum_id, threads, None)?;
            }
        }

        spectrum_id += batch.num_specs;
        ctx.pool.replenish(batch);
    }
}

/// Compute team width: configured threads minus active I/O workers, but
/// never below 75% of the configured maximum.
fn compute_width(params: &SearchParameters, scheduler: &Scheduler) -> usize {
    let floor = ((params.threads * 3) / 4).max(1);
    params
        .threads
        .saturating_sub(scheduler.active_io())
        .max(floor)
}

/// Launch one I/O worker; the scheduler slot must already be reserved.
fn spawn_io(ctx: &Arc<SearchContext>, handles: &mut Vec<JoinHandle<()>>) -> Result<()> {
    let ctx = Arc::clone(ctx);
    let handle = std::thread::Builder::new()
        .name("hyperion-io".into())
        .spawn(move || io_worker(&ctx))
        .map_err(|_| EngineError::BadAlloc("io worker thread"))?;
    handles.push(handle);
    Ok(())
}

/// I/O worker: pull a file (parked first), extract chunks into wait
/// buffers, and publish them ready. Parks its file and yields on
/// scheduler preempt or an empty wait queue.
fn io_worker(ctx: &SearchContext) {
    let mut current: Option<QueryFile> = None;

    loop {
        if ctx.scheduler.should_exit() {
            break;
        }
        if current.is_none() {
            current = ctx.parked.pop().or_else(|| ctx.pending.pop());
            if current.is_none() {
                ctx.scheduler.io_complete();
                break;
            }
        }
        if ctx.scheduler.check_preempt() {
            ctx.parked.push(current.take().unwrap());
            ctx.scheduler.io_parked();
            break;
        }
        let mut batch = match ctx.pool.take_empty() {
            Some(batch) => batch,
            None => {
                ctx.parked.push(current.take().unwrap());
                ctx.scheduler.io_parked();
                break;
            }
        };

        let file = current.as_mut().unwrap();
        batch.reset();
        match file.extract(QCHUNK, &mut batch) {
            Ok(0) => {
                ctx.pool.replenish(batch);
            }
            Ok(num_specs) => {
                ctx.batches.lock().push(BatchMeta {
                    batch_num: batch.batch_num,
                    num_specs,
                    file_index: file.file_index,
                });
                ctx.pool.publish(batch);
            }
            Err(e) => {
                error!("- {}: {}", file.path, e);
                ctx.pool.replenish(batch);
                file.remaining = 0;
            }
        }

        if file.is_drained() {
            current = None;
        }
    }

    ctx.scheduler.take_control();
}
