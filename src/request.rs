//! The per-texture fetch record owned by the manager, and what callers use to create one.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::state_machine::{FetchMachine, StepContext};
use crate::*;

/// Where a texture comes from, which decides which tiers are consulted.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum FetchType {
    #[default]
    Default,
    /// Freshly baked server-side; the cache is written but never read.
    ServerBake,
    /// Baked by a legacy host. Usually comes with `can_use_http = false`.
    HostBake,
    MapTile,
    /// Only ever read from the local cache.
    LocalFile,
}

impl FetchType {
    pub fn reads_cache(self) -> bool {
        !matches!(self, FetchType::ServerBake)
    }

    pub fn uses_network(self) -> bool {
        !matches!(self, FetchType::LocalFile)
    }
}

/// Arguments to [crate::TextureFetchManager::create_request].
#[derive(Debug, Clone, derive_builder::Builder)]
#[builder(setter(into))]
pub struct FetchRequestParams {
    pub id: AssetId,
    #[builder(default)]
    pub ftype: FetchType,
    #[builder(default, setter(strip_option))]
    pub url: Option<String>,
    #[builder(default, setter(strip_option))]
    pub host: Option<String>,
    #[builder(default = "MIN_FETCH_PRIORITY")]
    pub priority: f32,
    /// Full size if known, else 0.
    #[builder(default)]
    pub width: u32,
    #[builder(default)]
    pub height: u32,
    /// Expected component count; 0 accepts anything.
    #[builder(default)]
    pub components: u8,
    #[builder(default)]
    pub desired_discard: i32,
    #[builder(default)]
    pub needs_aux: bool,
    /// Finest discard level the caller already has, if any.
    #[builder(default, setter(strip_option))]
    pub current_discard: Option<i32>,
    #[builder(default = "true")]
    pub can_use_http: bool,
}

impl FetchRequestParams {
    /// The common case: fetch `id` over HTTP from `url`.
    pub fn new(id: AssetId, url: impl Into<String>, desired_discard: i32, priority: f32) -> Self {
        FetchRequestParams {
            id,
            ftype: FetchType::Default,
            url: Some(url.into()),
            host: None,
            priority,
            width: 0,
            height: 0,
            components: 0,
            desired_discard,
            needs_aux: false,
            current_discard: None,
            can_use_http: true,
        }
    }
}

/// Mutable bookkeeping for one request, behind the request's own lock.
pub(crate) struct FetchProgress {
    pub machine: FetchMachine,
    pub desired_discard: i32,
    pub requested_discard: i32,
    /// Finest level the caller held when it last asked.
    pub caller_discard: Option<i32>,
    pub created: Instant,
    pub state_entered: Instant,
    /// Last time any bytes arrived, or the request was (re)sent.
    pub last_packet_time: Instant,
    pub http_started: Option<Instant>,
    /// Duration of the last completed HTTP round trip.
    pub fetch_delta_time: Option<Duration>,
    pub bytes_received: u64,
    /// When the priority last dropped below the fetch threshold, if it is still there.
    pub low_priority_since: Option<Instant>,
}

impl FetchProgress {
    pub fn set_state_entered(&mut self, now: Instant) {
        self.state_entered = now;
    }
}

pub(crate) struct FetchRequest {
    pub id: AssetId,
    /// Distinguishes this request from earlier ones for the same id.
    pub serial: u64,
    pub ftype: FetchType,
    pub url: Option<String>,
    pub host: Option<String>,
    pub width: u32,
    pub height: u32,
    pub components: u8,
    pub needs_aux: bool,
    pub can_use_http: bool,
    priority: AtomicU32,
    deleted: AtomicBool,
    queued: AtomicBool,
    http_slot: AtomicBool,
    pub progress: Mutex<FetchProgress>,
}

impl FetchRequest {
    pub fn new(params: FetchRequestParams, serial: u64, now: Instant) -> FetchRequest {
        FetchRequest {
            id: params.id,
            serial,
            ftype: params.ftype,
            url: params.url,
            host: params.host,
            width: params.width,
            height: params.height,
            components: params.components,
            needs_aux: params.needs_aux,
            can_use_http: params.can_use_http,
            priority: AtomicU32::new(params.priority.to_bits()),
            deleted: AtomicBool::new(false),
            queued: AtomicBool::new(false),
            http_slot: AtomicBool::new(false),
            progress: Mutex::new(FetchProgress {
                machine: FetchMachine::new(),
                desired_discard: params.desired_discard,
                requested_discard: params.desired_discard,
                caller_discard: params.current_discard,
                created: now,
                state_entered: now,
                last_packet_time: now,
                http_started: None,
                fetch_delta_time: None,
                bytes_received: 0,
                low_priority_since: if is_fetch_worthy(params.priority) {
                    None
                } else {
                    Some(now)
                },
            }),
        }
    }

    pub fn priority(&self) -> f32 {
        f32::from_bits(self.priority.load(Ordering::Relaxed))
    }

    pub fn set_priority(&self, priority: f32, now: Instant) {
        self.priority.store(priority.to_bits(), Ordering::Relaxed);
        let mut progress = self.progress.lock().unwrap();
        if is_fetch_worthy(priority) {
            progress.low_priority_since = None;
        } else if progress.low_priority_since.is_none() {
            progress.low_priority_since = Some(now);
        }
    }

    /// Returns true the first time only.
    pub fn mark_deleted(&self) -> bool {
        !self.deleted.swap(true, Ordering::AcqRel)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Claim the right to sit in the worker queue. False if it is already there.
    pub fn try_mark_queued(&self) -> bool {
        !self.queued.swap(true, Ordering::AcqRel)
    }

    /// Claim the right to run. False if another queue entry already claimed it.
    pub fn take_queued(&self) -> bool {
        self.queued.swap(false, Ordering::AcqRel)
    }

    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    pub fn grant_http_slot(&self) {
        self.http_slot.store(true, Ordering::Release);
    }

    /// Give up the HTTP slot. True if this call is the one that released it.
    pub fn take_http_slot(&self) -> bool {
        self.http_slot.swap(false, Ordering::AcqRel)
    }

    pub fn holds_http_slot(&self) -> bool {
        self.http_slot.load(Ordering::Acquire)
    }

    pub fn state(&self) -> FetchState {
        self.progress.lock().unwrap().machine.state()
    }

    pub fn step_context(&self, progress: &FetchProgress, config: &FetchConfig, http_available: bool) -> StepContext {
        StepContext {
            requested_discard: progress.requested_discard,
            reads_cache: self.ftype.reads_cache(),
            network_allowed: self.can_use_http && self.ftype.uses_network() && http_available,
            needs_aux: self.needs_aux,
            expected_components: self.components,
            max_retries: config.max_http_retries,
            max_image_dimension: config.max_image_dimension,
        }
    }

    pub fn diagnostics(&self, now: Instant) -> FetchDiagnostics {
        let progress = self.progress.lock().unwrap();
        let machine = &progress.machine;
        FetchDiagnostics {
            id: self.id,
            active: true,
            state: machine.state(),
            error: machine.error(),
            desired_discard: progress.desired_discard,
            requested_discard: progress.requested_discard,
            full_width: self.width,
            full_height: self.height,
            fetched_discard: machine.fetched_discard(),
            decoded_discard: machine.decoded_discard(),
            priority: self.priority(),
            http_status: machine.http_status(),
            retries: machine.retries(),
            bytes_received: progress.bytes_received,
            from_local_cache: machine.from_local_cache(),
            age: Some(now.saturating_duration_since(progress.created)),
            time_in_state: Some(now.saturating_duration_since(progress.state_entered)),
            idle_for: Some(now.saturating_duration_since(progress.last_packet_time)),
            fetch_delta_time: progress.fetch_delta_time,
        }
    }
}

/// Handed to [HttpFetcher::fetch] to report transfer progress.
pub struct TransferProgress<'a> {
    request: &'a FetchRequest,
    stats: &'a FetchStats,
}

impl<'a> TransferProgress<'a> {
    pub(crate) fn new(request: &'a FetchRequest, stats: &'a FetchStats) -> Self {
        TransferProgress { request, stats }
    }

    /// Record that `bytes` more bytes arrived.
    pub fn received(&self, bytes: usize) {
        let mut progress = self.request.progress.lock().unwrap();
        progress.last_packet_time = Instant::now();
        progress.bytes_received += bytes as u64;
        self.stats.add_bytes_received(bytes as u64);
    }

    /// The request was cancelled; the fetcher may stop early.
    pub fn is_cancelled(&self) -> bool {
        self.request.is_deleted()
    }
}

/// Read-only view of a request for debugging overlays.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchDiagnostics {
    pub id: AssetId,
    /// False when this describes a request that already finished.
    pub active: bool,
    pub state: FetchState,
    pub error: Option<FetchError>,
    pub desired_discard: i32,
    pub requested_discard: i32,
    /// The full size the caller gave, 0 if unknown.
    pub full_width: u32,
    pub full_height: u32,
    pub fetched_discard: Option<i32>,
    pub decoded_discard: Option<i32>,
    pub priority: f32,
    pub http_status: Option<u16>,
    pub retries: u32,
    pub bytes_received: u64,
    pub from_local_cache: bool,
    pub age: Option<Duration>,
    pub time_in_state: Option<Duration>,
    pub idle_for: Option<Duration>,
    pub fetch_delta_time: Option<Duration>,
}
