//! The registry of resident textures, and the per-tick loop that drives them.
use std::collections::HashMap;
use std::time::Instant;

use ahash::RandomState;

use crate::*;

#[derive(Debug)]
struct ListEntry {
    texture: Texture,
    refs: usize,
}

/// What one [TextureList::update] did.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TickSummary {
    pub textures: usize,
    /// Textures with a fetch in flight after the tick.
    pub fetching: usize,
    pub missing: usize,
    pub memory_bias: f32,
}

/// Resident textures keyed by id, with explicit reference counts.
///
/// A texture lives for as long as someone holds a reference from [TextureList::acquire]. The last
/// [TextureList::release] cancels any fetch it has running and drops it.
#[derive(Debug)]
pub struct TextureList {
    entries: HashMap<AssetId, ListEntry, RandomState>,
    bias: MemoryBiasController,
    discard: DiscardPolicy,
    priority: DecodePriorityCalculator,
    texture_config: TextureConfig,
}

impl TextureList {
    pub fn new(
        discard: DiscardConfig,
        priority: PriorityConfig,
        bias: MemoryBiasConfig,
        texture_config: TextureConfig,
    ) -> TextureList {
        TextureList {
            entries: Default::default(),
            bias: MemoryBiasController::new(bias),
            discard: DiscardPolicy::new(discard),
            priority: DecodePriorityCalculator::new(priority),
            texture_config,
        }
    }

    /// Take a reference to the texture for `id`, creating it if needed.
    pub fn acquire(&mut self, id: AssetId) -> &mut Texture {
        let config = &self.texture_config;
        let entry = self.entries.entry(id).or_insert_with(|| ListEntry {
            texture: Texture::new(id, config.clone()),
            refs: 0,
        });
        entry.refs += 1;
        &mut entry.texture
    }

    /// Drop a reference. Returns whether this was the last one, in which case the texture is gone.
    pub fn release<F: TextureFetcher + ?Sized>(&mut self, id: AssetId, fetcher: &F) -> bool {
        let entry = match self.entries.get_mut(&id) {
            Some(e) => e,
            None => return false,
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return false;
        }
        if let Some(mut entry) = self.entries.remove(&id) {
            entry.texture.cancel_fetch(fetcher);
        }
        tracing::trace!(%id, "released texture");
        true
    }

    pub fn get(&self, id: AssetId) -> Option<&Texture> {
        self.entries.get(&id).map(|e| &e.texture)
    }

    pub fn get_mut(&mut self, id: AssetId) -> Option<&mut Texture> {
        self.entries.get_mut(&id).map(|e| &mut e.texture)
    }

    pub fn ref_count(&self, id: AssetId) -> usize {
        self.entries.get(&id).map_or(0, |e| e.refs)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Texture> {
        self.entries.values().map(|e| &e.texture)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Texture> {
        self.entries.values_mut().map(|e| &mut e.texture)
    }

    pub fn memory_bias(&self) -> f32 {
        self.bias.bias()
    }

    pub fn discard_policy(&self) -> &DiscardPolicy {
        &self.discard
    }

    pub fn priority_calculator(&self) -> &DecodePriorityCalculator {
        &self.priority
    }

    /// Pixel bytes held by all textures outside the GPU.
    pub fn raw_memory_bytes(&self) -> usize {
        self.iter().map(Texture::raw_memory_bytes).sum()
    }

    /// Run one tick: update the memory bias from `pressure`, then drive every texture's fetch and reset its per-tick
    /// terms.
    pub fn update<F: TextureFetcher + ?Sized>(
        &mut self,
        fetcher: &F,
        pressure: MemoryPressure,
        now: Instant,
    ) -> TickSummary {
        let memory_bias = self.bias.update(now, pressure);
        let tick = TextureTick {
            discard: &self.discard,
            priority: &self.priority,
            memory_bias,
            now,
        };

        let mut summary = TickSummary {
            textures: self.entries.len(),
            memory_bias,
            ..Default::default()
        };
        for entry in self.entries.values_mut() {
            let texture = &mut entry.texture;
            if texture.update_fetch(fetcher, &tick) {
                summary.fetching += 1;
            }
            if texture.is_missing_asset() {
                summary.missing += 1;
            }
            texture.reset_tick();
        }
        summary
    }

    /// Upload every texture with a raw image waiting. Returns how many were uploaded.
    pub fn upload_all<U: TextureUploader + ?Sized>(&mut self, uploader: &mut U) -> usize {
        self.iter_mut()
            .filter(|t| t.raw_image().is_some())
            .map(|t| t.upload_to(uploader))
            .filter(|uploaded| *uploaded)
            .count()
    }
}

impl Default for TextureList {
    fn default() -> Self {
        TextureList::new(
            Default::default(),
            Default::default(),
            Default::default(),
            Default::default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use std::time::Duration;

    fn id(n: u128) -> AssetId {
        AssetId::from_u128(n)
    }

    fn busy() -> MemoryPressure {
        MemoryPressure {
            vram_used: 95,
            vram_budget: 100,
            ..Default::default()
        }
    }

    #[test]
    fn reference_counts() {
        let fetcher = FakeFetcher::default();
        let mut list = TextureList::default();
        list.acquire(id(1));
        list.acquire(id(1));
        assert_eq!(list.len(), 1);
        assert_eq!(list.ref_count(id(1)), 2);

        list.update(&fetcher, MemoryPressure::default(), Instant::now());
        assert!(list.get(id(1)).unwrap().is_fetching());

        assert!(!list.release(id(1), &fetcher));
        assert!(fetcher.deleted.borrow().is_empty());
        assert!(list.release(id(1), &fetcher));
        assert!(list.is_empty());
        assert_eq!(*fetcher.deleted.borrow(), vec![(id(1), true)]);
        assert!(!list.release(id(1), &fetcher));
    }

    #[test]
    fn tick_drives_fetches_and_uploads() {
        let fetcher = FakeFetcher::default();
        let mut uploader = RecordingUploader::default();
        let mut list = TextureList::default();
        for n in 1..=3 {
            list.acquire(id(n)).add_additional_priority(1.0);
        }
        let now = Instant::now();
        let summary = list.update(&fetcher, MemoryPressure::default(), now);
        assert_eq!(summary.textures, 3);
        assert_eq!(summary.fetching, 3);
        assert!(list.iter().all(|t| t.additional_priority() == 0.0));

        fetcher.finish(id(1), pixels(32, 32, 5));
        fetcher.finish(id(2), failure(FetchError::AssetMissing));
        let summary = list.update(&fetcher, MemoryPressure::default(), now);
        assert_eq!(summary.missing, 1);
        assert_eq!(summary.fetching, 1);

        assert_eq!(list.upload_all(&mut uploader), 1);
        assert_eq!(uploader.uploads, vec![(id(1), 32, 32, 5)]);
        assert_eq!(list.raw_memory_bytes(), 32 * 32 * 4);
        assert_eq!(list.upload_all(&mut uploader), 0);
    }

    #[test]
    fn memory_pressure_coarsens_unboosted_textures() {
        let fetcher = FakeFetcher::default();
        let mut list = TextureList::default();
        for (n, boost) in [(1, BoostClass::Normal), (2, BoostClass::SuperHigh)] {
            let t = list.acquire(id(n));
            t.set_full_size(1024, 1024, 4);
            t.set_known_draw_area(Some(256.0 * 256.0));
            t.set_boost(boost);
        }

        let start = Instant::now();
        let summary = list.update(&fetcher, busy(), start);
        assert_eq!(summary.memory_bias, 0.5);
        assert_eq!(list.get(id(1)).unwrap().desired_discard(), 2);

        let summary = list.update(&fetcher, busy(), start + Duration::from_secs(3));
        assert_eq!(summary.memory_bias, 1.0);
        assert_eq!(list.get(id(1)).unwrap().desired_discard(), 3);
        assert_eq!(list.get(id(2)).unwrap().desired_discard(), 2);
    }
}
