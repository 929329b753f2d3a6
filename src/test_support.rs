//! Fake collaborators shared by the unit tests.
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Error as IoError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::*;

#[derive(Default)]
pub(crate) struct MemoryDiskCache {
    entries: Mutex<HashMap<AssetId, CachedTexture>>,
    writes: AtomicUsize,
}

impl MemoryDiskCache {
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn get(&self, id: AssetId) -> Option<CachedTexture> {
        self.entries.lock().unwrap().get(&id).cloned()
    }
}

impl DiskCache for MemoryDiskCache {
    fn read(&self, id: AssetId, _discard_hint: i32) -> Option<CachedTexture> {
        self.get(id)
    }

    fn write(&self, id: AssetId, bytes: &[u8], discard: i32) -> Result<(), IoError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().unwrap().insert(
            id,
            CachedTexture {
                bytes: bytes.to_vec(),
                discard,
            },
        );
        Ok(())
    }

    fn remove(&self, id: AssetId) {
        self.entries.lock().unwrap().remove(&id);
    }
}

/// Serialize an image the way [RawDecoder] expects: width, height and components, then the pixels.
pub(crate) fn encode_raw(image: &RawImageBuffer) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + image.byte_len());
    out.extend_from_slice(&image.width().to_le_bytes());
    out.extend_from_slice(&image.height().to_le_bytes());
    out.push(image.components());
    out.extend_from_slice(image.data());
    out
}

pub(crate) fn encode_blank(width: u32, height: u32, components: u8) -> Vec<u8> {
    encode_raw(&RawImageBuffer::blank(width, height, components).unwrap())
}

/// Decodes [encode_raw] payloads. Payloads are treated as full resolution and box filtered down to the target.
#[derive(Default)]
pub(crate) struct RawDecoder {
    decodes: AtomicUsize,
}

impl RawDecoder {
    pub fn decodes(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }
}

impl TextureDecoder for RawDecoder {
    fn decode(
        &self,
        bytes: &[u8],
        target_discard: i32,
        needs_aux: bool,
    ) -> Result<DecodedImage, DecodeError> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        if bytes.len() < 9 {
            return Err(DecodeError::Corrupt("short header".into()));
        }
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[0..4]);
        let width = u32::from_le_bytes(word);
        word.copy_from_slice(&bytes[4..8]);
        let height = u32::from_le_bytes(word);
        let image = RawImageBuffer::new(width, height, bytes[8], bytes[9..].to_vec())?;
        let levels = target_discard.max(0) as u32;
        let image = if levels > 0 { image.downsample(levels) } else { image };
        let aux = if needs_aux {
            Some(RawImageBuffer::blank(image.width(), image.height(), 1)?)
        } else {
            None
        };
        Ok(DecodedImage {
            image,
            aux,
            discard: target_discard,
        })
    }
}

#[derive(Clone, Debug)]
pub(crate) enum Script {
    /// 200 with an image of this size, at discard 0.
    Image { width: u32, height: u32, components: u8 },
    Status(u16),
    Fail,
}

struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

/// An HTTP fake which answers from a per-id script, falling back to a default.
///
/// While the gate is closed every fetch blocks, which is how tests hold requests in flight. Blocked fetches give up
/// when their request is cancelled, so dropping a manager never hangs.
pub(crate) struct ScriptedHttp {
    scripts: Mutex<HashMap<AssetId, VecDeque<Script>>>,
    default: Script,
    gate: Gate,
    calls: Mutex<Vec<AssetId>>,
    finished: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedHttp {
    pub fn new(default: Script) -> ScriptedHttp {
        ScriptedHttp {
            scripts: Default::default(),
            default,
            gate: Gate {
                open: Mutex::new(true),
                cond: Condvar::new(),
            },
            calls: Default::default(),
            finished: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn script(&self, id: AssetId, replies: impl IntoIterator<Item = Script>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(id)
            .or_default()
            .extend(replies);
    }

    pub fn close_gate(&self) {
        *self.gate.open.lock().unwrap() = false;
    }

    pub fn open_gate(&self) {
        *self.gate.open.lock().unwrap() = true;
        self.gate.cond.notify_all();
    }

    /// Ids in the order fetches started.
    pub fn calls(&self) -> Vec<AssetId> {
        self.calls.lock().unwrap().clone()
    }

    pub fn num_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn num_finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Block until `n` fetches have started, or panic after a while.
    pub fn wait_for_calls(&self, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.num_calls() < n {
            assert!(Instant::now() < deadline, "timed out waiting for {} HTTP calls", n);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn wait_at_gate(&self, progress: &TransferProgress<'_>) -> bool {
        let mut open = self.gate.open.lock().unwrap();
        while !*open {
            if progress.is_cancelled() {
                return false;
            }
            open = self
                .gate
                .cond
                .wait_timeout(open, Duration::from_millis(5))
                .unwrap()
                .0;
        }
        true
    }

    fn answer(&self, id: AssetId, progress: &TransferProgress<'_>) -> Result<HttpResponse, TransportError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&id)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| self.default.clone());
        match script {
            Script::Image {
                width,
                height,
                components,
            } => {
                let body = encode_blank(width, height, components);
                progress.received(body.len());
                Ok(HttpResponse {
                    status: 200,
                    body,
                    discard: 0,
                })
            }
            Script::Status(status) => Ok(HttpResponse {
                status,
                body: vec![],
                discard: 0,
            }),
            Script::Fail => Err(TransportError::TimedOut),
        }
    }
}

impl HttpFetcher for ScriptedHttp {
    fn fetch(
        &self,
        request: &HttpRequest<'_>,
        progress: &TransferProgress<'_>,
    ) -> Result<HttpResponse, TransportError> {
        self.calls.lock().unwrap().push(request.id);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        let result = if self.wait_at_gate(progress) {
            self.answer(request.id, progress)
        } else {
            Err(TransportError::Connection("cancelled".into()))
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
        result
    }
}

/// A single-threaded [TextureFetcher] which only records what it was asked and hands back results the test posts.
#[derive(Default)]
pub(crate) struct FakeFetcher {
    pub live: RefCell<HashMap<AssetId, FetchRequestParams>>,
    pub finished: RefCell<HashMap<AssetId, FinishedFetch>>,
    pub missing: RefCell<HashSet<AssetId>>,
    pub created: Cell<usize>,
    pub deleted: RefCell<Vec<(AssetId, bool)>>,
    pub priorities: RefCell<HashMap<AssetId, f32>>,
    pub refetched: RefCell<Vec<AssetId>>,
    /// When set, `create_request` is rejected with this.
    pub reject: Cell<Option<AdmissionError>>,
}

impl FakeFetcher {
    /// Complete the live request for `id` with `result`.
    pub fn finish(&self, id: AssetId, result: FinishedFetch) {
        self.live.borrow_mut().remove(&id);
        if result.error.map_or(false, FetchError::is_sticky) {
            self.missing.borrow_mut().insert(id);
        }
        self.finished.borrow_mut().insert(id, result);
    }

    pub fn requested_discard(&self, id: AssetId) -> Option<i32> {
        self.live.borrow().get(&id).map(|p| p.desired_discard)
    }
}

impl TextureFetcher for FakeFetcher {
    fn create_request(&self, params: FetchRequestParams) -> Result<Admission, AdmissionError> {
        if let Some(e) = self.reject.get() {
            return Err(e);
        }
        if self.missing.borrow().contains(&params.id) {
            return Err(AdmissionError::AssetMissing(params.id));
        }
        if let Some(live) = self.live.borrow_mut().get_mut(&params.id) {
            self.priorities.borrow_mut().insert(params.id, params.priority);
            if params.desired_discard < live.desired_discard {
                live.desired_discard = params.desired_discard;
                return Ok(Admission::Updated);
            }
            return Err(AdmissionError::InFlight(params.id));
        }
        self.created.set(self.created.get() + 1);
        self.priorities.borrow_mut().insert(params.id, params.priority);
        self.live.borrow_mut().insert(params.id, params);
        Ok(Admission::Created)
    }

    fn delete_request(&self, id: AssetId, force: bool) -> bool {
        self.deleted.borrow_mut().push((id, force));
        if force {
            self.finished.borrow_mut().remove(&id);
        }
        self.live.borrow_mut().remove(&id).is_some()
    }

    fn update_request_priority(&self, id: AssetId, priority: f32) -> bool {
        if !self.live.borrow().contains_key(&id) {
            return false;
        }
        self.priorities.borrow_mut().insert(id, priority);
        true
    }

    fn get_request_finished(&self, id: AssetId) -> Option<FinishedFetch> {
        self.finished.borrow_mut().remove(&id)
    }

    fn has_request(&self, id: AssetId) -> bool {
        self.live.borrow().contains_key(&id) || self.finished.borrow().contains_key(&id)
    }

    fn is_missing_asset(&self, id: AssetId) -> bool {
        self.missing.borrow().contains(&id)
    }

    fn force_refetch(&self, id: AssetId) {
        self.missing.borrow_mut().remove(&id);
        self.refetched.borrow_mut().push(id);
    }
}

/// A successful result carrying a blank image.
pub(crate) fn pixels(width: u32, height: u32, discard: i32) -> FinishedFetch {
    FinishedFetch {
        discard: Some(discard),
        image: Some(RawImageBuffer::blank(width, height, 4).unwrap()),
        aux_image: None,
        http_status: Some(200),
        error: None,
        from_local_cache: false,
    }
}

pub(crate) fn failure(error: FetchError) -> FinishedFetch {
    FinishedFetch {
        discard: None,
        image: None,
        aux_image: None,
        http_status: None,
        error: Some(error),
        from_local_cache: false,
    }
}

/// Records uploads; refuses them while `refuse` is set.
#[derive(Default)]
pub(crate) struct RecordingUploader {
    pub uploads: Vec<(AssetId, u32, u32, i32)>,
    pub refuse: bool,
}

impl TextureUploader for RecordingUploader {
    fn upload(&mut self, id: AssetId, image: &RawImageBuffer, discard: i32) -> bool {
        if self.refuse {
            return false;
        }
        self.uploads.push((id, image.width(), image.height(), discard));
        true
    }
}
