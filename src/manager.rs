//! The [TextureFetchManager]: the façade the rest of the client uses to get texture pixels.
//!
//! The main thread creates, reprioritizes and cancels requests, and calls [TextureFetchManager::update] once per
//! frame. `update` is the only place results cross back from the workers: it drains their completions into a mailbox
//! which [TextureFetchManager::get_request_finished] reads, and it enforces the idle and zero-priority timeouts.
//!
//! Locking is narrow. The request map and the network bookkeeping have their own locks, each request has its own lock
//! for its progress, and none of them is held across I/O.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ahash::RandomState;
use crossbeam_channel::{unbounded, Receiver};

use crate::request::FetchRequest;
use crate::worker::{Completion, FetchShared, FetchWorkerPool};
use crate::*;

#[derive(Debug, Clone, derive_builder::Builder)]
#[builder(default, build_fn(validate = "Self::validate"))]
pub struct FetchConfig {
    /// Number of worker threads.
    pub worker_count: usize,
    /// Admission control cap on live requests.
    pub max_requests_in_queue: usize,
    /// Parked requests are released once fewer than this many hold HTTP slots.
    pub http_low_water: usize,
    /// No more requests get an HTTP slot once this many hold one.
    pub http_high_water: usize,
    /// Transient HTTP failures tolerated per request before it fails with a network error.
    pub max_http_retries: u32,
    /// A request waiting on HTTP this long without receiving anything is cancelled.
    pub http_idle_timeout: Duration,
    /// A request whose priority stays below [MIN_FETCH_PRIORITY] this long is cancelled.
    pub zero_priority_timeout: Duration,
    /// Whether a zero-priority timeout marks the asset missing. Only applies when the priority is exactly 0 and
    /// neither the request nor its caller has any data for the asset.
    pub zero_priority_marks_missing: bool,
    /// Decoded images wider or taller than this are rejected as malformed.
    pub max_image_dimension: u32,
    /// How many finished requests [TextureFetchManager::get_fetch_state] remembers.
    pub outcome_history: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            worker_count: 4,
            max_requests_in_queue: 2048,
            http_low_water: 16,
            http_high_water: 32,
            max_http_retries: 3,
            http_idle_timeout: Duration::from_secs(15),
            zero_priority_timeout: Duration::from_secs(30),
            zero_priority_marks_missing: true,
            max_image_dimension: 2048,
            outcome_history: 256,
        }
    }
}

impl FetchConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(0) = self.worker_count {
            return Err("worker_count must be positive".into());
        }
        if let Some(0) = self.http_high_water {
            return Err("http_high_water must be positive".into());
        }
        let defaults = FetchConfig::default();
        let low = self.http_low_water.unwrap_or(defaults.http_low_water);
        let high = self.http_high_water.unwrap_or(defaults.http_high_water);
        if low > high {
            return Err(format!(
                "http_low_water ({}) must not exceed http_high_water ({})",
                low, high
            ));
        }
        Ok(())
    }
}

/// How [TextureFetchManager::create_request] admitted a request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Admission {
    Created,
    /// An in-flight request for the same asset now targets the finer discard level.
    Updated,
}

/// The result of a finished request, handed out once by [TextureFetchManager::get_request_finished].
#[derive(Debug, Clone)]
pub struct FinishedFetch {
    /// The discard level of `image`.
    pub discard: Option<i32>,
    pub image: Option<RawImageBuffer>,
    pub aux_image: Option<AuxRawImageBuffer>,
    pub http_status: Option<u16>,
    /// Set when the request failed, and also when it degraded to coarser data after a network error.
    pub error: Option<FetchError>,
    pub from_local_cache: bool,
}

impl FinishedFetch {
    fn without_pixels(error: FetchError) -> FinishedFetch {
        FinishedFetch {
            discard: None,
            image: None,
            aux_image: None,
            http_status: None,
            error: Some(error),
            from_local_cache: false,
        }
    }

    pub fn has_pixels(&self) -> bool {
        self.image.is_some()
    }
}

/// What a [crate::Texture] needs from a fetcher. Implemented by [TextureFetchManager].
pub trait TextureFetcher {
    fn create_request(&self, params: FetchRequestParams) -> Result<Admission, AdmissionError>;
    fn delete_request(&self, id: AssetId, force: bool) -> bool;
    fn update_request_priority(&self, id: AssetId, priority: f32) -> bool;
    fn get_request_finished(&self, id: AssetId) -> Option<FinishedFetch>;
    /// Whether a request for `id` is live or has an unclaimed result.
    fn has_request(&self, id: AssetId) -> bool;
    fn is_missing_asset(&self, id: AssetId) -> bool;
    fn force_refetch(&self, id: AssetId);
}

type RequestMap = HashMap<AssetId, Arc<FetchRequest>, RandomState>;

/// Results waiting to be picked up by the main thread, plus what the manager remembers about finished requests.
struct Mailbox {
    finished: HashMap<AssetId, FinishedFetch, RandomState>,
    missing: HashSet<AssetId, RandomState>,
    history: CostBasedLru<AssetId, FetchDiagnostics>,
}

pub struct TextureFetchManager<C: DiskCache, H: HttpFetcher, D: TextureDecoder> {
    shared: Arc<FetchShared<C, H, D>>,
    requests: Mutex<RequestMap>,
    mailbox: Mutex<Mailbox>,
    completions: Receiver<Completion>,
    workers: Mutex<FetchWorkerPool>,
    next_serial: AtomicU64,
}

impl<C: DiskCache, H: HttpFetcher, D: TextureDecoder> TextureFetchManager<C, H, D> {
    /// Start the workers. Fails only if a thread could not be spawned.
    pub fn new(
        config: FetchConfig,
        cache: C,
        http: H,
        decoder: D,
    ) -> std::io::Result<TextureFetchManager<C, H, D>> {
        let (tx, rx) = unbounded();
        let history = config.outcome_history as u64;
        let shared = Arc::new(FetchShared::new(config, cache, http, decoder, tx));
        let workers = FetchWorkerPool::spawn(&shared)?;
        tracing::debug!(workers = workers.len(), "texture fetch manager started");
        Ok(TextureFetchManager {
            shared,
            requests: Mutex::new(Default::default()),
            mailbox: Mutex::new(Mailbox {
                finished: Default::default(),
                missing: Default::default(),
                history: CostBasedLru::new(history),
            }),
            completions: rx,
            workers: Mutex::new(workers),
            next_serial: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.shared.config
    }

    pub fn cache(&self) -> &C {
        &self.shared.cache
    }

    /// Ask for `params.id` at `params.desired_discard`.
    ///
    /// If a request for the asset is already live, this only updates its priority, and retargets it when the new
    /// discard level is finer; no second request is ever created for the same asset.
    pub fn create_request(&self, params: FetchRequestParams) -> Result<Admission, AdmissionError> {
        if self.shared.is_shutting_down() {
            return Err(AdmissionError::ShuttingDown);
        }
        let id = params.id;
        let now = Instant::now();

        {
            let mailbox = self.mailbox.lock().unwrap();
            if mailbox.missing.contains(&id) {
                return Err(AdmissionError::AssetMissing(id));
            }
            // An unclaimed result that is good enough counts as in flight.
            if let Some(f) = mailbox.finished.get(&id) {
                if f.discard.map_or(false, |d| d <= params.desired_discard) {
                    return Err(AdmissionError::InFlight(id));
                }
            }
        }

        let mut requests = self.requests.lock().unwrap();
        if let Some(existing) = requests.get(&id).cloned() {
            drop(requests);
            return self.retarget(&existing, params, now);
        }

        if requests.len() >= self.shared.config.max_requests_in_queue {
            tracing::debug!(%id, queued = requests.len(), "texture request rejected, queue full");
            return Err(AdmissionError::QueueFull);
        }

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let request = Arc::new(FetchRequest::new(params, serial, now));
        requests.insert(id, request.clone());
        drop(requests);

        // A stale result for a coarser level is superseded by the new request.
        self.mailbox.lock().unwrap().finished.remove(&id);
        self.shared.stats.inc_created();
        tracing::trace!(%id, serial, "texture request created");
        self.shared.enqueue(request);
        Ok(Admission::Created)
    }

    fn retarget(
        &self,
        existing: &Arc<FetchRequest>,
        params: FetchRequestParams,
        now: Instant,
    ) -> Result<Admission, AdmissionError> {
        let updated = {
            let mut progress = existing.progress.lock().unwrap();
            if params.current_discard.is_some() {
                progress.caller_discard = params.current_discard;
            }
            if progress.machine.state().is_terminal() || progress.requested_discard <= params.desired_discard {
                false
            } else {
                tracing::debug!(
                    id = %existing.id,
                    from = progress.requested_discard,
                    to = params.desired_discard,
                    "retargeting in-flight texture request"
                );
                progress.requested_discard = params.desired_discard;
                progress.desired_discard = params.desired_discard;
                true
            }
        };
        existing.set_priority(params.priority, now);
        self.shared.reprioritize(existing);
        if updated {
            Ok(Admission::Updated)
        } else {
            Err(AdmissionError::InFlight(existing.id))
        }
    }

    /// Cancel the request for `id`.
    ///
    /// Without `force`, a request whose result is already on its way back is left alone so the result still gets
    /// delivered. With `force`, any unclaimed result is thrown away too. Returns whether anything was cancelled.
    pub fn delete_request(&self, id: AssetId, force: bool) -> bool {
        let request = {
            let mut requests = self.requests.lock().unwrap();
            match requests.get(&id) {
                None => None,
                Some(r) if !force && r.state().is_terminal() => return false,
                Some(_) => requests.remove(&id),
            }
        };

        let dropped_result = force && self.mailbox.lock().unwrap().finished.remove(&id).is_some();
        match request {
            Some(request) => {
                self.cancel(&request);
                tracing::debug!(%id, force, "texture request cancelled");
                true
            }
            None => dropped_result,
        }
    }

    /// Mark a request removed from the map as cancelled and detach it from the network.
    fn cancel(&self, request: &FetchRequest) {
        if request.mark_deleted() {
            self.shared.stats.inc_cancelled();
        }
        self.shared.abandon(request);
    }

    /// Returns false if there is no live request for `id`.
    pub fn update_request_priority(&self, id: AssetId, priority: f32) -> bool {
        let request = match self.requests.lock().unwrap().get(&id) {
            Some(r) => r.clone(),
            None => return false,
        };
        request.set_priority(priority, Instant::now());
        self.shared.reprioritize(&request);
        true
    }

    /// Take the result for `id`, if [Self::update] has collected one. Each result is handed out once.
    pub fn get_request_finished(&self, id: AssetId) -> Option<FinishedFetch> {
        self.mailbox.lock().unwrap().finished.remove(&id)
    }

    /// Collect finished work from the workers and enforce timeouts. Returns the number of live requests.
    pub fn update(&self) -> usize {
        let now = Instant::now();
        while let Ok(completion) = self.completions.try_recv() {
            self.finish(completion, now);
        }
        self.check_timeouts(now);
        self.num_requests()
    }

    fn finish(&self, completion: Completion, now: Instant) {
        let id = completion.id;
        let request = {
            let mut requests = self.requests.lock().unwrap();
            match requests.get(&id) {
                Some(r) if r.serial == completion.serial && !r.is_deleted() => requests.remove(&id),
                _ => None,
            }
        };
        let request = match request {
            Some(r) => r,
            None => {
                tracing::trace!(%id, "ignoring result for a cancelled request");
                return;
            }
        };

        let outcome = completion.outcome;
        let mut diagnostics = request.diagnostics(now);
        diagnostics.active = false;
        diagnostics.decoded_discard = outcome.decoded.as_ref().map(|d| d.discard);

        let (discard, image, aux_image) = match outcome.decoded {
            Some(d) => (Some(d.discard), Some(d.image), d.aux),
            None => (None, None, None),
        };
        let finished = FinishedFetch {
            discard,
            image,
            aux_image,
            http_status: outcome.http_status,
            error: outcome.error,
            from_local_cache: outcome.from_local_cache,
        };

        if finished.has_pixels() {
            self.shared.stats.inc_completed();
        } else {
            self.shared.stats.inc_failed();
        }
        match finished.error {
            Some(e) if e.is_sticky() => tracing::info!(%id, error = %e, "texture is unavailable"),
            Some(e) => tracing::debug!(%id, error = %e, degraded = finished.has_pixels(), "texture fetch failed"),
            None => tracing::trace!(%id, discard = ?finished.discard, "texture fetch done"),
        }
        self.post(id, finished, diagnostics);
    }

    /// Publish a result and remember it for diagnostics.
    fn post(&self, id: AssetId, finished: FinishedFetch, diagnostics: FetchDiagnostics) {
        let mut mailbox = self.mailbox.lock().unwrap();
        if finished.error.map_or(false, FetchError::is_sticky) {
            mailbox.missing.insert(id);
        }
        mailbox.history.insert(id, diagnostics, 1);
        mailbox.finished.insert(id, finished);
    }

    fn check_timeouts(&self, now: Instant) {
        let config = &self.shared.config;
        let live = self
            .requests
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect::<Vec<_>>();

        for request in live {
            let verdict = {
                let progress = request.progress.lock().unwrap();
                let state = progress.machine.state();
                let idle = now.saturating_duration_since(progress.last_packet_time);
                let low_for = progress
                    .low_priority_since
                    .map(|t| now.saturating_duration_since(t));
                if state.is_terminal() {
                    None
                } else if state == FetchState::WaitHttpReply && idle > config.http_idle_timeout {
                    tracing::debug!(id = %request.id, ?idle, "texture request idle, cancelling");
                    Some(FetchError::Cancelled)
                } else if low_for.map_or(false, |d| d >= config.zero_priority_timeout) {
                    // Only a request nobody wants at all, for an asset nobody has any data for, counts as missing.
                    // A caller which is merely satisfied with what it holds just loses the request.
                    let never_fetched =
                        progress.machine.fetched_discard().is_none() && progress.caller_discard.is_none();
                    let unwanted = request.priority() <= 0.0;
                    tracing::debug!(
                        id = %request.id,
                        never_fetched,
                        unwanted,
                        "texture request ignored too long, cancelling"
                    );
                    if never_fetched && unwanted && config.zero_priority_marks_missing {
                        Some(FetchError::AssetMissing)
                    } else {
                        Some(FetchError::Cancelled)
                    }
                } else {
                    None
                }
            };

            if let Some(error) = verdict {
                self.time_out(&request, error, now);
            }
        }
    }

    fn time_out(&self, request: &Arc<FetchRequest>, error: FetchError, now: Instant) {
        let removed = {
            let mut requests = self.requests.lock().unwrap();
            match requests.get(&request.id) {
                Some(r) if Arc::ptr_eq(r, request) => requests.remove(&request.id).is_some(),
                _ => false,
            }
        };
        if !removed {
            return;
        }
        self.shared.stats.inc_timeouts();
        self.cancel(request);

        let mut diagnostics = request.diagnostics(now);
        diagnostics.active = false;
        diagnostics.error = Some(error);
        self.post(request.id, FinishedFetch::without_pixels(error), diagnostics);
    }

    /// Whether the data for `id` came from the local cache. Looks at the live request, then recent history.
    pub fn is_from_local_cache(&self, id: AssetId) -> bool {
        if let Some(r) = self.requests.lock().unwrap().get(&id) {
            return r.progress.lock().unwrap().machine.from_local_cache();
        }
        let mailbox = self.mailbox.lock().unwrap();
        if let Some(f) = mailbox.finished.get(&id) {
            return f.from_local_cache;
        }
        mailbox
            .history
            .peek(&id)
            .map_or(false, |d| d.from_local_cache)
    }

    /// Read-only progress report for `id`, from the live request or, failing that, recent history.
    pub fn get_fetch_state(&self, id: AssetId) -> Option<FetchDiagnostics> {
        let live = self.requests.lock().unwrap().get(&id).cloned();
        if let Some(r) = live {
            return Some(r.diagnostics(Instant::now()));
        }
        self.mailbox
            .lock()
            .unwrap()
            .history
            .peek(&id)
            .map(|d| (*d).clone())
    }

    pub fn is_missing_asset(&self, id: AssetId) -> bool {
        self.mailbox.lock().unwrap().missing.contains(&id)
    }

    /// Forget that `id` is missing so it can be requested again.
    pub fn force_refetch(&self, id: AssetId) {
        let mut mailbox = self.mailbox.lock().unwrap();
        if mailbox.missing.remove(&id) {
            tracing::debug!(%id, "cleared missing texture");
        }
        mailbox.finished.remove(&id);
    }

    pub fn has_request(&self, id: AssetId) -> bool {
        self.requests.lock().unwrap().contains_key(&id)
            || self.mailbox.lock().unwrap().finished.contains_key(&id)
    }

    /// Live requests, in any state.
    pub fn num_requests(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Requests currently holding an HTTP slot.
    pub fn num_http_requests(&self) -> usize {
        self.shared.network.lock().unwrap().in_flight()
    }

    /// Requests parked waiting for an HTTP slot.
    pub fn num_waiting_http(&self) -> usize {
        self.shared.network.lock().unwrap().num_waiting()
    }

    pub fn stats(&self) -> FetchStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Cancel every live request. Unclaimed results are kept.
    pub fn delete_all_requests(&self) {
        let drained = self
            .requests
            .lock()
            .unwrap()
            .drain()
            .map(|(_, r)| r)
            .collect::<Vec<_>>();
        for r in drained.iter() {
            self.cancel(r);
        }
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "cancelled all texture requests");
        }
    }

    /// Cancel everything and stop the workers. Waits for workers to finish whatever blocking call they are in.
    pub fn shutdown(&self) {
        self.shared.begin_shutdown();
        self.delete_all_requests();
        self.workers.lock().unwrap().join();
    }
}

impl<C: DiskCache, H: HttpFetcher, D: TextureDecoder> Drop for TextureFetchManager<C, H, D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<C: DiskCache, H: HttpFetcher, D: TextureDecoder> TextureFetcher for TextureFetchManager<C, H, D> {
    fn create_request(&self, params: FetchRequestParams) -> Result<Admission, AdmissionError> {
        TextureFetchManager::create_request(self, params)
    }

    fn delete_request(&self, id: AssetId, force: bool) -> bool {
        TextureFetchManager::delete_request(self, id, force)
    }

    fn update_request_priority(&self, id: AssetId, priority: f32) -> bool {
        TextureFetchManager::update_request_priority(self, id, priority)
    }

    fn get_request_finished(&self, id: AssetId) -> Option<FinishedFetch> {
        TextureFetchManager::get_request_finished(self, id)
    }

    fn has_request(&self, id: AssetId) -> bool {
        TextureFetchManager::has_request(self, id)
    }

    fn is_missing_asset(&self, id: AssetId) -> bool {
        TextureFetchManager::is_missing_asset(self, id)
    }

    fn force_refetch(&self, id: AssetId) {
        TextureFetchManager::force_refetch(self, id)
    }
}
