//! The [TieredTextureCache] puts a RAM tier of compressed bytes in front of any [DiskCache].
//!
//! Reads check, in order:
//!
//! - pinned entries, which are never evicted (default and placeholder textures, typically),
//! - the RAM tier, a [CostBasedLru] bounded by total bytes,
//! - the backing disk cache, promoting what it returns into the RAM tier if it is small enough.
//!
//! Writes go through to both tiers. An entry is only replaced by one which decodes at least as finely, so that a late
//! coarse write can never clobber a finer one.
use std::io::Error as IoError;
use std::sync::{Arc, Mutex, RwLock};

use crate::*;

type PinnedMap = std::collections::HashMap<AssetId, Arc<CachedTexture>, ahash::RandomState>;

#[derive(Debug, Clone, derive_builder::Builder)]
#[builder(default)]
pub struct TieredCacheConfig {
    /// Maximum total bytes held in the RAM tier.
    pub max_ram_bytes: u64,
    /// Entries larger than this skip the RAM tier.
    pub max_single_entry_bytes: u64,
}

impl Default for TieredCacheConfig {
    fn default() -> Self {
        TieredCacheConfig {
            max_ram_bytes: 64 * 1024 * 1024,
            max_single_entry_bytes: 4 * 1024 * 1024,
        }
    }
}

pub struct TieredTextureCache<Backing: DiskCache> {
    config: TieredCacheConfig,
    pinned: RwLock<PinnedMap>,
    ram: Mutex<CostBasedLru<AssetId, CachedTexture>>,
    backing: Backing,
}

impl<Backing: DiskCache> TieredTextureCache<Backing> {
    pub fn new(backing: Backing, config: TieredCacheConfig) -> TieredTextureCache<Backing> {
        TieredTextureCache {
            ram: Mutex::new(CostBasedLru::new(config.max_ram_bytes)),
            pinned: RwLock::new(Default::default()),
            backing,
            config,
        }
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    /// Bytes currently held by the RAM tier.
    pub fn ram_bytes(&self) -> u64 {
        self.ram.lock().unwrap().current_cost()
    }

    /// Keep an entry resident forever. Only [DiskCache::remove] takes it out again.
    pub fn pin(&self, id: AssetId, bytes: Vec<u8>, discard: i32) {
        self.pinned
            .write()
            .unwrap()
            .insert(id, Arc::new(CachedTexture { bytes, discard }));
    }

    /// Find an item in memory, returning `None` if neither the pinned set nor the RAM tier has it.
    fn search_memory(&self, id: AssetId) -> Option<Arc<CachedTexture>> {
        if let Some(x) = self.pinned.read().unwrap().get(&id) {
            return Some(x.clone());
        }
        self.ram.lock().unwrap().get(&id)
    }

    fn promote(&self, id: AssetId, entry: CachedTexture) {
        let cost = entry.bytes.len() as u64;
        if cost > self.config.max_single_entry_bytes {
            return;
        }
        let mut ram = self.ram.lock().unwrap();
        if let Some(existing) = ram.peek(&id) {
            if existing.discard < entry.discard {
                return;
            }
        }
        ram.insert(id, entry, cost);
    }
}

impl<Backing: DiskCache> DiskCache for TieredTextureCache<Backing> {
    fn read(&self, id: AssetId, discard_hint: i32) -> Option<CachedTexture> {
        if let Some(hit) = self.search_memory(id) {
            // A coarse RAM entry should not hide finer data on disk.
            if hit.discard <= discard_hint {
                return Some((*hit).clone());
            }
            return match self.backing.read(id, discard_hint) {
                Some(disk) if disk.discard < hit.discard => {
                    self.promote(id, disk.clone());
                    Some(disk)
                }
                _ => Some((*hit).clone()),
            };
        }

        let disk = self.backing.read(id, discard_hint)?;
        self.promote(id, disk.clone());
        Some(disk)
    }

    fn write(&self, id: AssetId, bytes: &[u8], discard: i32) -> Result<(), IoError> {
        if let Some(existing) = self.search_memory(id) {
            if existing.discard < discard {
                tracing::trace!(%id, discard, existing = existing.discard, "skipping coarser cache write");
                return Ok(());
            }
        }
        self.promote(
            id,
            CachedTexture {
                bytes: bytes.to_vec(),
                discard,
            },
        );
        self.backing.write(id, bytes, discard)
    }

    fn remove(&self, id: AssetId) {
        self.pinned.write().unwrap().remove(&id);
        self.ram.lock().unwrap().remove(&id);
        self.backing.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryDiskCache;

    fn build_cache() -> (Arc<MemoryDiskCache>, TieredTextureCache<Arc<MemoryDiskCache>>) {
        let cfg = TieredCacheConfigBuilder::default()
            .max_ram_bytes(50)
            .max_single_entry_bytes(10)
            .build()
            .expect("Should build");
        let disk = Arc::new(MemoryDiskCache::default());
        (disk.clone(), TieredTextureCache::new(disk, cfg))
    }

    fn id(n: u128) -> AssetId {
        AssetId::from_u128(n)
    }

    #[test]
    fn basic_ops() {
        let (disk, cache) = build_cache();
        cache.write(id(1), b"abc", 0).unwrap();
        cache.write(id(2), b"def", 1).unwrap();

        assert_eq!(cache.read(id(1), 0).unwrap().bytes, b"abc".to_vec());
        assert_eq!(cache.read(id(2), 1).unwrap().discard, 1);
        assert_eq!(disk.len(), 2, "writes go through to disk");

        cache.remove(id(2));
        assert!(cache.read(id(2), 0).is_none());
        assert!(cache.read(id(1), 0).is_some());
    }

    #[test]
    fn disk_hits_are_promoted() {
        let (disk, cache) = build_cache();
        disk.write(id(1), b"small", 0).unwrap();
        disk.write(id(2), b"far too big for ram", 0).unwrap();

        cache.read(id(1), 0).unwrap();
        cache.read(id(2), 0).unwrap();
        assert_eq!(cache.ram_bytes(), 5);

        // With the disk copy gone, the RAM tier still answers for the small entry only.
        disk.remove(id(1));
        disk.remove(id(2));
        assert!(cache.read(id(1), 0).is_some());
        assert!(cache.read(id(2), 0).is_none());
    }

    #[test]
    fn coarse_writes_do_not_replace_fine_entries() {
        let (_disk, cache) = build_cache();
        cache.write(id(1), b"fine", 0).unwrap();
        cache.write(id(1), b"coarse", 3).unwrap();
        let entry = cache.read(id(1), 0).unwrap();
        assert_eq!(entry.discard, 0);
        assert_eq!(entry.bytes, b"fine".to_vec());
    }

    #[test]
    fn coarse_ram_entry_checks_disk_for_finer_data() {
        let (disk, cache) = build_cache();
        cache.write(id(1), b"coarse", 3).unwrap();
        // Something else wrote finer data straight to disk.
        disk.write(id(1), b"fine", 0).unwrap();
        assert_eq!(cache.read(id(1), 0).unwrap().discard, 0);
        // And the finer entry is now what RAM holds.
        disk.remove(id(1));
        assert_eq!(cache.read(id(1), 0).unwrap().discard, 0);
    }

    #[test]
    fn pinned_entries_survive_eviction() {
        let (_disk, cache) = build_cache();
        cache.pin(id(99), b"default".to_vec(), 0);
        for i in 0..100 {
            cache.write(id(i), b"0123456789", 0).unwrap();
        }
        assert!(cache.ram_bytes() <= 50);
        assert_eq!(cache.read(id(99), 0).unwrap().bytes, b"default".to_vec());
    }
}
