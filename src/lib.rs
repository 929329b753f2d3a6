//! Progressive texture streaming: fetch compressed textures from a local cache or the network, decode them at the
//! resolution they are actually needed at, and keep refining them as that changes.
//!
//! Textures are requested at a *discard level*: level 0 is full resolution and every level above halves both sides.
//! Most textures never need full resolution, and the ones that do usually need something on screen quickly first, so
//! everything in this crate is organised around asking for the coarsest level that will do and refining from there.
//!
//! The pieces, from the bottom up:
//!
//! - [DiscardPolicy] turns on-screen size, boost class and memory pressure into a desired discard level, and
//!   [DecodePriorityCalculator] turns that into a fetch priority. [MemoryBiasController] raises the discard of
//!   unimportant textures when texture memory runs short, and lowers it again slowly.
//! - [TextureFetchManager] owns the requests. A pool of worker threads runs each request through a small state
//!   machine: read the cache, fetch over HTTP if the cache can't satisfy the request, decode, and post the result back
//!   for the main thread to pick up. HTTP is throttled with a high/low water gate ([HttpThrottle]).
//! - [Texture] is the client side of one asset. It drives its own request every tick and keeps a small cached copy
//!   around so that it can come back at low resolution without a refetch. [TextureList] holds the resident textures
//!   and runs the tick.
//!
//! The cache, the network, the decoder and the GPU are collaborators: implement [DiskCache], [HttpFetcher],
//! [TextureDecoder] and [TextureUploader]. [FilesystemTextureCache] is a ready-made [DiskCache] on a directory, and
//! [TieredTextureCache] puts a cost-bounded RAM tier of compressed bytes in front of any other one, built on
//! [CostBasedLru].
//!
//! Nothing here installs a `tracing` subscriber; the crate only emits events.
mod asset_id;
mod bias;
mod boost;
mod cost_based_lru;
mod discard;
mod error;
mod filesystem_cache;
mod manager;
mod priority;
mod raw_image;
mod request;
mod state_machine;
mod stats;
#[cfg(test)]
mod test_support;
mod texture;
mod texture_list;
mod throttle;
mod tiered_cache;
mod traits;
mod worker;

pub use asset_id::*;
pub use bias::*;
pub use boost::*;
pub use cost_based_lru::*;
pub use discard::*;
pub use error::*;
pub use filesystem_cache::*;
pub use manager::*;
pub use priority::*;
pub use raw_image::*;
pub use request::*;
pub use state_machine::FetchState;
pub use stats::*;
pub use texture::*;
pub use texture_list::*;
pub use throttle::HttpThrottle;
pub use tiered_cache::*;
pub use traits::*;
