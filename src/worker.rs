//! The worker pool which drives [FetchMachine]s.
//!
//! Workers block on a priority queue of runnable requests. A worker owns a request from the moment it pops it until
//! the machine either completes or parks waiting for an HTTP slot; the `queued` flag on the request guarantees no
//! two workers hold the same request. Completed outcomes go back to the manager over a channel which the main thread
//! drains in [crate::TextureFetchManager::update].
//!
//! Priority updates do not touch the heap in place. They push a fresh entry, and whichever entry is popped first runs
//! the request; the rest are discarded when popped. The heap is rebuilt once stale entries dominate it.
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::Sender;

use crate::request::FetchRequest;
use crate::state_machine::{Effect, FetchOutcome, StepInput};
use crate::throttle::NetworkQueue;
use crate::*;

/// Sent from a worker when a request reaches a terminal state.
pub(crate) struct Completion {
    pub id: AssetId,
    pub serial: u64,
    pub outcome: FetchOutcome,
}

struct QueueEntry {
    priority: f32,
    seq: u64,
    request: Arc<FetchRequest>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then older entries first.
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct PendingQueue {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
}

impl PendingQueue {
    fn push(&mut self, request: Arc<FetchRequest>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueueEntry {
            priority: request.priority(),
            seq,
            request,
        });
    }

    /// Drop stale entries, keeping one per queued request at its current priority.
    fn compact(&mut self) {
        let mut seen = HashSet::new();
        let entries = std::mem::take(&mut self.heap).into_vec();
        for mut entry in entries {
            if entry.request.is_queued() && seen.insert(entry.request.serial) {
                entry.priority = entry.request.priority();
                self.heap.push(entry);
            }
        }
    }
}

/// Everything workers and the manager share.
pub(crate) struct FetchShared<C, H, D> {
    pub config: FetchConfig,
    pub cache: C,
    pub http: H,
    pub decoder: D,
    pub stats: FetchStats,
    pub network: Mutex<NetworkQueue>,
    pending: Mutex<PendingQueue>,
    wakeup: Condvar,
    completions: Sender<Completion>,
    shutdown: AtomicBool,
}

impl<C: DiskCache, H: HttpFetcher, D: TextureDecoder> FetchShared<C, H, D> {
    pub fn new(
        config: FetchConfig,
        cache: C,
        http: H,
        decoder: D,
        completions: Sender<Completion>,
    ) -> FetchShared<C, H, D> {
        FetchShared {
            network: Mutex::new(NetworkQueue::new(config.http_low_water, config.http_high_water)),
            config,
            cache,
            http,
            decoder,
            stats: FetchStats::default(),
            pending: Mutex::new(PendingQueue::default()),
            wakeup: Condvar::new(),
            completions,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        // Take the lock so no worker misses the wakeup between checking the flag and waiting.
        let _guard = self.pending.lock().unwrap();
        self.wakeup.notify_all();
    }

    /// Make a request runnable. Does nothing if it is already queued.
    pub fn enqueue(&self, request: Arc<FetchRequest>) {
        if !request.try_mark_queued() {
            return;
        }
        self.pending.lock().unwrap().push(request);
        self.wakeup.notify_one();
    }

    /// Reorder a queued request after its priority changed.
    pub fn reprioritize(&self, request: &Arc<FetchRequest>) {
        if !request.is_queued() {
            return;
        }
        let mut pending = self.pending.lock().unwrap();
        pending.push(request.clone());
        let live = self.config.max_requests_in_queue.max(64);
        if pending.heap.len() > live * 2 {
            pending.compact();
        }
    }

    fn next_job(&self) -> Option<Arc<FetchRequest>> {
        let mut pending = self.pending.lock().unwrap();
        loop {
            if self.is_shutting_down() {
                return None;
            }
            while let Some(entry) = pending.heap.pop() {
                if entry.request.take_queued() && !entry.request.is_deleted() {
                    return Some(entry.request);
                }
            }
            pending = self.wakeup.wait(pending).unwrap();
        }
    }

    /// Give `request` an HTTP slot, or park it. A parked request is re-queued when a slot is handed to it.
    fn acquire_http_slot(&self, request: &Arc<FetchRequest>) -> bool {
        self.network.lock().unwrap().acquire_or_park(request)
    }

    /// Return the slot `request` holds, if any, and queue whichever parked requests received the freed slots.
    pub fn release_http_slot(&self, request: &FetchRequest) {
        if !request.take_http_slot() {
            return;
        }
        let granted = self.network.lock().unwrap().release();
        for r in granted {
            self.enqueue(r);
        }
    }

    /// Detach a request the manager has given up on from the network bookkeeping.
    pub fn abandon(&self, request: &FetchRequest) {
        self.network.lock().unwrap().remove_waiting(request);
        self.release_http_slot(request);
    }

    /// Advance one request until it completes or parks.
    fn run(&self, request: &Arc<FetchRequest>) {
        let id = request.id;
        let mut input = if request.holds_http_slot() {
            StepInput::HttpSlotGranted
        } else {
            StepInput::Resume
        };

        loop {
            if request.is_deleted() {
                tracing::trace!(%id, "dropping cancelled request");
                self.release_http_slot(request);
                return;
            }

            let effect = {
                let mut progress = request.progress.lock().unwrap();
                let ctx = request.step_context(&progress, &self.config, self.http.is_available());
                let before = progress.machine.state();
                let effect = progress.machine.step(input, &ctx);
                let after = progress.machine.state();
                if before != after {
                    progress.set_state_entered(Instant::now());
                    tracing::trace!(%id, ?before, ?after, "fetch state change");
                    if before == FetchState::WaitHttpReply && after == FetchState::SendHttpRequest {
                        self.stats.inc_http_retries();
                    }
                }
                if let Effect::Complete = effect {
                    let outcome = progress.machine.take_outcome();
                    drop(progress);
                    self.release_http_slot(request);
                    self.complete(request, outcome);
                    return;
                }
                effect
            };

            input = match effect {
                Effect::ReadCache { discard } => {
                    let hit = self.cache.read(id, discard);
                    if hit.is_some() {
                        self.stats.inc_cache_hits();
                    } else {
                        self.stats.inc_cache_misses();
                    }
                    StepInput::CacheRead(hit)
                }
                Effect::PurgeCache => {
                    tracing::debug!(%id, "removing undecodable cache entry");
                    self.cache.remove(id);
                    StepInput::Resume
                }
                Effect::AcquireHttpSlot => {
                    if request.holds_http_slot() || self.acquire_http_slot(request) {
                        StepInput::HttpSlotGranted
                    } else {
                        tracing::trace!(%id, "waiting for an HTTP slot");
                        return;
                    }
                }
                Effect::SendHttp { discard } => StepInput::HttpReply(self.send_http(request, discard)),
                Effect::Decode {
                    bytes,
                    discard,
                    needs_aux,
                } => {
                    self.stats.inc_decodes();
                    StepInput::Decoded(self.decoder.decode(&bytes, discard, needs_aux))
                }
                Effect::WriteCache { bytes, discard } => {
                    StepInput::CacheWritten(self.cache.write(id, &bytes, discard))
                }
                Effect::Complete => unreachable!("handled above"),
            };
        }
    }

    fn send_http(&self, request: &FetchRequest, discard: i32) -> Result<HttpResponse, TransportError> {
        let started = Instant::now();
        {
            let mut progress = request.progress.lock().unwrap();
            progress.http_started = Some(started);
            progress.last_packet_time = started;
        }
        self.stats.inc_http_requests();

        let http_request = HttpRequest {
            id: request.id,
            ftype: request.ftype,
            url: request.url.as_deref(),
            host: request.host.as_deref(),
            discard,
        };
        let reply = self
            .http
            .fetch(&http_request, &TransferProgress::new(request, &self.stats));

        request.progress.lock().unwrap().fetch_delta_time = Some(started.elapsed());
        // Other requests may use the slot while this one decodes or retries.
        self.release_http_slot(request);

        match &reply {
            Ok(r) if r.is_success() => {}
            Ok(r) => {
                self.stats.inc_http_failures();
                tracing::debug!(id = %request.id, status = r.status, "texture HTTP request failed");
            }
            Err(e) => {
                self.stats.inc_http_failures();
                tracing::debug!(id = %request.id, error = %e, "texture HTTP request failed");
            }
        }
        reply
    }

    fn complete(&self, request: &FetchRequest, outcome: FetchOutcome) {
        tracing::trace!(id = %request.id, state = ?outcome.state, error = ?outcome.error, "fetch finished");
        let completion = Completion {
            id: request.id,
            serial: request.serial,
            outcome,
        };
        if self.completions.send(completion).is_err() {
            tracing::trace!(id = %request.id, "fetch manager is gone; dropping result");
        }
    }
}

/// The worker threads. Dropping the pool does not stop them; call [FetchWorkerPool::join] after
/// [FetchShared::begin_shutdown].
pub(crate) struct FetchWorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl FetchWorkerPool {
    pub fn spawn<C: DiskCache, H: HttpFetcher, D: TextureDecoder>(
        shared: &Arc<FetchShared<C, H, D>>,
    ) -> std::io::Result<FetchWorkerPool> {
        let mut pool = FetchWorkerPool { handles: vec![] };
        for i in 0..shared.config.worker_count {
            let worker_shared = shared.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("texture-fetch-{}", i))
                .spawn(move || {
                    while let Some(request) = worker_shared.next_job() {
                        worker_shared.run(&request);
                    }
                });
            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    // Don't leave the workers we already started blocked forever.
                    shared.begin_shutdown();
                    pool.join();
                    return Err(e);
                }
            }
        }
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn join(&mut self) {
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("texture fetch worker panicked");
            }
        }
    }
}
