//! The resident [Texture]: one per asset in use, driving fetches for itself every tick.
//!
//! A texture holds up to three images, each with a single owner:
//!
//! - the raw image, fetched and not yet uploaded,
//! - the cached raw image, a small copy kept so the texture can come back at low resolution without a refetch,
//! - the saved raw image, kept after upload for consumers that need the pixels.
//!
//! It only ever talks to the fetch pipeline through a [TextureFetcher], and never touches GPU state itself; uploads
//! go through a [TextureUploader].
use std::time::{Duration, Instant};

use crate::*;

#[derive(Debug, Clone, derive_builder::Builder)]
#[builder(default)]
pub struct TextureConfig {
    /// Cached raw copies are downsampled until neither side exceeds this.
    pub cached_raw_max_dimension: u32,
    /// Whether new textures keep their pixels after upload.
    pub keep_raw_for_callbacks: bool,
    /// After a network error, wait this long before asking again.
    pub network_retry_delay: Duration,
}

impl Default for TextureConfig {
    fn default() -> Self {
        TextureConfig {
            cached_raw_max_dimension: 64,
            keep_raw_for_callbacks: false,
            network_retry_delay: Duration::from_secs(2),
        }
    }
}

/// Shared inputs for one tick of texture updates.
#[derive(Debug, Clone, Copy)]
pub struct TextureTick<'a> {
    pub discard: &'a DiscardPolicy,
    pub priority: &'a DecodePriorityCalculator,
    pub memory_bias: f32,
    pub now: Instant,
}

#[derive(Debug)]
pub struct Texture {
    id: AssetId,
    config: TextureConfig,

    ftype: FetchType,
    url: Option<String>,
    host: Option<String>,
    needs_aux: bool,

    full_width: u32,
    full_height: u32,
    components: u8,

    raw_image: Option<RawImageBuffer>,
    raw_aux: Option<AuxRawImageBuffer>,
    raw_discard: i32,
    cached_raw_image: Option<RawImageBuffer>,
    cached_raw_discard: i32,
    saved_raw_image: Option<RawImageBuffer>,
    saved_raw_discard: i32,
    keep_raw_for_callbacks: bool,

    /// What the GPU proxy holds, if anything.
    current_discard: Option<i32>,
    desired_discard: i32,
    min_desired_discard: i32,
    boost: BoostClass,
    is_missing_asset: bool,
    was_deleted: bool,
    max_virtual_size: f32,
    additional_priority: f32,
    known_draw_area: Option<f32>,
    decode_priority: f32,

    fetch_active: bool,
    requested_discard: Option<i32>,
    last_error: Option<FetchError>,
    retry_after: Option<Instant>,
}

impl Texture {
    pub fn new(id: AssetId, config: TextureConfig) -> Texture {
        Texture {
            id,
            ftype: FetchType::Default,
            url: None,
            host: None,
            needs_aux: false,
            full_width: 0,
            full_height: 0,
            components: 0,
            raw_image: None,
            raw_aux: None,
            raw_discard: 0,
            cached_raw_image: None,
            cached_raw_discard: 0,
            saved_raw_image: None,
            saved_raw_discard: 0,
            keep_raw_for_callbacks: config.keep_raw_for_callbacks,
            current_discard: None,
            desired_discard: 0,
            min_desired_discard: 0,
            boost: BoostClass::Normal,
            is_missing_asset: false,
            was_deleted: false,
            max_virtual_size: 0.0,
            additional_priority: 0.0,
            known_draw_area: None,
            decode_priority: 0.0,
            fetch_active: false,
            requested_discard: None,
            last_error: None,
            retry_after: None,
            config,
        }
    }

    pub fn id(&self) -> AssetId {
        self.id
    }

    pub fn set_url(&mut self, url: impl Into<String>) {
        self.url = Some(url.into());
    }

    /// Bind the texture to a legacy host. Such textures never use HTTP.
    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = Some(host.into());
    }

    pub fn set_fetch_type(&mut self, ftype: FetchType) {
        self.ftype = ftype;
    }

    pub fn set_needs_aux(&mut self, needs_aux: bool) {
        self.needs_aux = needs_aux;
    }

    /// Record the full resolution size, when it is known ahead of the first fetch.
    pub fn set_full_size(&mut self, width: u32, height: u32, components: u8) {
        self.full_width = width;
        self.full_height = height;
        self.components = components;
    }

    pub fn full_size(&self) -> (u32, u32) {
        (self.full_width, self.full_height)
    }

    pub fn components(&self) -> u8 {
        self.components
    }

    pub fn boost(&self) -> BoostClass {
        self.boost
    }

    pub fn set_boost(&mut self, boost: BoostClass) {
        self.boost = boost;
    }

    pub fn min_desired_discard(&self) -> i32 {
        self.min_desired_discard
    }

    /// Never ask for anything finer than `discard`.
    pub fn set_min_discard_level(&mut self, discard: i32) {
        self.min_desired_discard = discard.max(0);
    }

    pub fn set_known_draw_area(&mut self, area: Option<f32>) {
        self.known_draw_area = area;
    }

    /// Report an estimated on-screen size. Only the largest since the last reset counts.
    pub fn add_virtual_size(&mut self, size: f32) {
        self.max_virtual_size = self.max_virtual_size.max(size);
    }

    pub fn max_virtual_size(&self) -> f32 {
        self.max_virtual_size
    }

    pub fn reset_max_virtual_size(&mut self) {
        self.max_virtual_size = 0.0;
    }

    /// Render-time importance. Accumulates by maximum until [Texture::reset_tick].
    pub fn add_additional_priority(&mut self, priority: f32) {
        self.additional_priority = self.additional_priority.max(priority);
    }

    pub fn additional_priority(&self) -> f32 {
        self.additional_priority
    }

    /// Clear the per-tick terms. Call once per tick after [Texture::update_fetch].
    pub fn reset_tick(&mut self) {
        self.additional_priority = 0.0;
    }

    pub fn set_keep_raw_for_callbacks(&mut self, keep: bool) {
        self.keep_raw_for_callbacks = keep;
        if !keep {
            self.saved_raw_image = None;
        }
    }

    pub fn current_discard(&self) -> Option<i32> {
        self.current_discard
    }

    pub fn desired_discard(&self) -> i32 {
        self.desired_discard
    }

    pub fn decode_priority(&self) -> f32 {
        self.decode_priority
    }

    pub fn is_missing_asset(&self) -> bool {
        self.is_missing_asset
    }

    pub fn was_deleted(&self) -> bool {
        self.was_deleted
    }

    pub fn is_fetching(&self) -> bool {
        self.fetch_active
    }

    /// The discard level of the last request this texture made.
    pub fn requested_discard(&self) -> Option<i32> {
        self.requested_discard
    }

    pub fn last_error(&self) -> Option<FetchError> {
        self.last_error
    }

    /// The fetched image waiting for upload.
    pub fn raw_image(&self) -> Option<(&RawImageBuffer, i32)> {
        self.raw_image.as_ref().map(|i| (i, self.raw_discard))
    }

    pub fn raw_aux_image(&self) -> Option<&AuxRawImageBuffer> {
        self.raw_aux.as_ref()
    }

    pub fn cached_raw_image(&self) -> Option<(&RawImageBuffer, i32)> {
        self.cached_raw_image.as_ref().map(|i| (i, self.cached_raw_discard))
    }

    pub fn saved_raw_image(&self) -> Option<(&RawImageBuffer, i32)> {
        self.saved_raw_image.as_ref().map(|i| (i, self.saved_raw_discard))
    }

    /// Bytes of pixel data held by this texture outside the GPU.
    pub fn raw_memory_bytes(&self) -> usize {
        [
            &self.raw_image,
            &self.raw_aux,
            &self.cached_raw_image,
            &self.saved_raw_image,
        ]
        .into_iter()
        .flatten()
        .map(RawImageBuffer::byte_len)
        .sum()
    }

    /// Finest level this texture has, on the GPU or waiting for upload.
    fn best_discard(&self) -> Option<i32> {
        let raw = self.raw_image.as_ref().map(|_| self.raw_discard);
        match (self.current_discard, raw) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn priority_inputs(&self) -> PriorityInputs {
        PriorityInputs {
            is_missing_asset: self.is_missing_asset,
            was_deleted: self.was_deleted,
            current_discard: self.best_discard(),
            desired_discard: self.desired_discard,
            full_width: self.full_width,
            full_height: self.full_height,
            boost: self.boost,
            max_virtual_size: self.max_virtual_size,
            additional_priority: self.additional_priority,
            cached_raw_pixels: self
                .cached_raw_image
                .as_ref()
                .map_or(0, RawImageBuffer::pixel_count),
        }
    }

    /// Run one tick: recompute the desired discard and priority, collect any finished fetch, and start, reprioritize
    /// or stop fetching. Returns whether a fetch is active afterwards.
    pub fn update_fetch<F: TextureFetcher + ?Sized>(&mut self, fetcher: &F, tick: &TextureTick<'_>) -> bool {
        if self.was_deleted {
            return false;
        }

        self.desired_discard = tick.discard.desired_discard(&DiscardInputs {
            full_width: self.full_width,
            full_height: self.full_height,
            known_draw_area: self.known_draw_area,
            max_virtual_size: self.max_virtual_size,
            boost: self.boost,
            memory_bias: tick.memory_bias,
            min_discard: self.min_desired_discard,
        });

        if self.fetch_active {
            if let Some(finished) = fetcher.get_request_finished(self.id) {
                self.fetch_active = false;
                self.apply_finished(finished, tick.now);
            } else if !fetcher.has_request(self.id) {
                tracing::debug!(id = %self.id, "texture request disappeared");
                self.fetch_active = false;
            }
        }

        if self.is_missing_asset {
            if self.fetch_active {
                fetcher.delete_request(self.id, true);
                self.fetch_active = false;
            }
            self.decode_priority = 0.0;
            return false;
        }

        self.use_cached_raw();
        self.decode_priority = tick.priority.priority(&self.priority_inputs());

        if self.fetch_active {
            if self.requested_discard.map_or(false, |r| self.desired_discard < r) {
                self.refine_fetch(fetcher);
            } else {
                fetcher.update_request_priority(self.id, self.decode_priority);
            }
        } else if is_fetch_worthy(self.decode_priority)
            && self.retry_after.map_or(true, |t| tick.now >= t)
        {
            self.start_fetch(fetcher);
        }
        self.fetch_active
    }

    fn fetch_params(&self) -> FetchRequestParams {
        FetchRequestParams {
            id: self.id,
            ftype: self.ftype,
            url: self.url.clone(),
            host: self.host.clone(),
            priority: self.decode_priority,
            width: self.full_width,
            height: self.full_height,
            components: self.components,
            desired_discard: self.desired_discard,
            needs_aux: self.needs_aux,
            current_discard: self.best_discard(),
            can_use_http: self.host.is_none(),
        }
    }

    fn start_fetch<F: TextureFetcher + ?Sized>(&mut self, fetcher: &F) {
        match fetcher.create_request(self.fetch_params()) {
            Ok(_) | Err(AdmissionError::InFlight(_)) => {
                self.fetch_active = true;
                self.requested_discard = Some(self.desired_discard);
                self.retry_after = None;
            }
            Err(AdmissionError::AssetMissing(_)) => {
                self.is_missing_asset = true;
                self.last_error = Some(FetchError::AssetMissing);
            }
            Err(e) => {
                tracing::trace!(id = %self.id, error = %e, "texture request not admitted");
            }
        }
    }

    /// Ask the in-flight request for the finer level this texture now wants. Also carries the new priority.
    fn refine_fetch<F: TextureFetcher + ?Sized>(&mut self, fetcher: &F) {
        match fetcher.create_request(self.fetch_params()) {
            Ok(_) => {
                tracing::trace!(id = %self.id, discard = self.desired_discard, "refined texture request");
                self.requested_discard = Some(self.desired_discard);
            }
            Err(AdmissionError::AssetMissing(_)) => {
                fetcher.delete_request(self.id, true);
                self.fetch_active = false;
                self.is_missing_asset = true;
                self.last_error = Some(FetchError::AssetMissing);
                self.decode_priority = 0.0;
            }
            // Already finishing; the finer level gets its own request once this result is in.
            Err(_) => {}
        }
    }

    /// Take in a finished fetch. Returns whether it brought new pixels.
    ///
    /// Errors are recorded, sticky ones mark the texture missing, and pixels coarser than what the texture already has
    /// are ignored.
    pub fn apply_finished(&mut self, finished: FinishedFetch, now: Instant) -> bool {
        if let Some(error) = finished.error {
            self.last_error = Some(error);
            if error.is_sticky() {
                tracing::debug!(id = %self.id, %error, "texture marked missing");
                self.is_missing_asset = true;
            } else if error == FetchError::NetworkError {
                self.retry_after = Some(now + self.config.network_retry_delay);
            }
        } else {
            self.last_error = None;
        }

        let (image, discard) = match (finished.image, finished.discard) {
            (Some(image), Some(discard)) => (image, discard),
            _ => return false,
        };
        if let Some(best) = self.best_discard() {
            if discard >= best {
                tracing::trace!(id = %self.id, discard, best, "ignoring coarser texture data");
                return false;
            }
        }

        if self.full_width == 0 || self.full_height == 0 {
            let scale = 1u32 << discard.clamp(0, 16);
            self.full_width = image.width().saturating_mul(scale);
            self.full_height = image.height().saturating_mul(scale);
        }
        self.components = image.components();
        self.update_cached_raw(&image, discard);
        self.raw_image = Some(image);
        self.raw_aux = finished.aux_image;
        self.raw_discard = discard;
        true
    }

    /// Keep a small copy of `image` if it is finer than the one held.
    fn update_cached_raw(&mut self, image: &RawImageBuffer, discard: i32) {
        let max_dim = self.config.cached_raw_max_dimension.max(1);
        let (mut w, mut h) = (image.width(), image.height());
        let mut levels = 0;
        while w.max(h) > max_dim && (w > 1 || h > 1) {
            w = (w / 2).max(1);
            h = (h / 2).max(1);
            levels += 1;
        }
        let cached_discard = discard + levels as i32;
        if self.cached_raw_image.is_none() || cached_discard < self.cached_raw_discard {
            self.cached_raw_image = Some(image.downsample(levels));
            self.cached_raw_discard = cached_discard;
        }
    }

    /// Reuse the cached copy when it is all the texture needs and nothing better is around.
    fn use_cached_raw(&mut self) {
        if self.raw_image.is_some() {
            return;
        }
        let cached = match &self.cached_raw_image {
            Some(c) if self.cached_raw_discard <= self.desired_discard => c,
            _ => return,
        };
        if self.current_discard.map_or(true, |c| c > self.cached_raw_discard) {
            tracing::trace!(id = %self.id, discard = self.cached_raw_discard, "reusing cached raw image");
            self.raw_image = Some(cached.clone());
            self.raw_discard = self.cached_raw_discard;
        }
    }

    /// Hand the raw image to the GPU proxy. Returns whether anything was uploaded.
    pub fn upload_to<U: TextureUploader + ?Sized>(&mut self, uploader: &mut U) -> bool {
        let image = match self.raw_image.take() {
            Some(i) => i,
            None => return false,
        };
        if !uploader.upload(self.id, &image, self.raw_discard) {
            self.raw_image = Some(image);
            return false;
        }
        self.current_discard = Some(self.raw_discard);
        self.raw_aux = None;
        if self.keep_raw_for_callbacks {
            self.saved_raw_image = Some(image);
            self.saved_raw_discard = self.raw_discard;
        }
        true
    }

    /// The GPU proxy dropped its data, for example to free memory.
    pub fn on_proxy_discarded(&mut self) {
        self.current_discard = None;
    }

    /// Forget everything, including a missing mark, and fetch from scratch.
    pub fn force_refetch<F: TextureFetcher + ?Sized>(&mut self, fetcher: &F) {
        fetcher.force_refetch(self.id);
        if self.fetch_active {
            fetcher.delete_request(self.id, true);
        }
        self.fetch_active = false;
        self.is_missing_asset = false;
        self.last_error = None;
        self.retry_after = None;
        self.current_discard = None;
        self.raw_image = None;
        self.raw_aux = None;
        self.cached_raw_image = None;
        self.saved_raw_image = None;
    }

    /// Stop fetching for good; the texture is going away.
    pub fn cancel_fetch<F: TextureFetcher + ?Sized>(&mut self, fetcher: &F) {
        if self.fetch_active {
            fetcher.delete_request(self.id, true);
            self.fetch_active = false;
        }
        self.was_deleted = true;
    }
}
