//! The collaborators the pipeline drives but does not implement.
//!
//! A [DiskCache] hands back compressed bytes for an asset, an [HttpFetcher] gets them from the network, and a
//! [TextureDecoder] turns them into a [RawImageBuffer] at some discard level. Workers call all three off the main
//! thread, so they must be `Send + Sync`. The [TextureUploader] is the GPU side and is only ever called from the main
//! thread.
use std::io::Error as IoError;
use std::sync::Arc;

use crate::*;

/// Compressed bytes read back from a cache, good down to `discard`.
#[derive(Clone, PartialEq, Eq)]
pub struct CachedTexture {
    pub bytes: Vec<u8>,
    pub discard: i32,
}

impl std::fmt::Debug for CachedTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedTexture")
            .field("bytes", &self.bytes.len())
            .field("discard", &self.discard)
            .finish()
    }
}

/// Local storage of compressed texture data.
///
/// Both operations are best effort: a miss is not an error, and a failed write only costs a refetch later.
pub trait DiskCache: Send + Sync + 'static {
    /// Read whatever is stored for `id`. `discard_hint` is the level the caller wants; implementations may return
    /// coarser data if that is all they have.
    fn read(&self, id: AssetId, discard_hint: i32) -> Option<CachedTexture>;

    /// Store `bytes`, which decode down to `discard`.
    fn write(&self, id: AssetId, bytes: &[u8], discard: i32) -> Result<(), IoError>;

    /// Drop anything stored for `id`, for example because it failed to decode.
    fn remove(&self, _id: AssetId) {}
}

impl<T: DiskCache> DiskCache for Arc<T> {
    fn read(&self, id: AssetId, discard_hint: i32) -> Option<CachedTexture> {
        (**self).read(id, discard_hint)
    }

    fn write(&self, id: AssetId, bytes: &[u8], discard: i32) -> Result<(), IoError> {
        (**self).write(id, bytes, discard)
    }

    fn remove(&self, id: AssetId) {
        (**self).remove(id)
    }
}

/// A cache which never has anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDiskCache;

impl DiskCache for NoDiskCache {
    fn read(&self, _id: AssetId, _discard_hint: i32) -> Option<CachedTexture> {
        None
    }

    fn write(&self, _id: AssetId, _bytes: &[u8], _discard: i32) -> Result<(), IoError> {
        Ok(())
    }
}

/// What a worker asks the network for.
#[derive(Debug, Clone, Copy)]
pub struct HttpRequest<'a> {
    pub id: AssetId,
    pub ftype: FetchType,
    /// Capability URL, when the caller has one.
    pub url: Option<&'a str>,
    /// Legacy host the asset is bound to, if any.
    pub host: Option<&'a str>,
    /// Coarsest discard level that satisfies the request.
    pub discard: i32,
}

#[derive(Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// Discard level `body` decodes down to.
    pub discard: i32,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("body", &self.body.len())
            .field("discard", &self.discard)
            .finish()
    }
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The server says the asset does not exist.
    pub fn is_not_found(&self) -> bool {
        self.status == 404 || self.status == 410
    }
}

/// Blocking network access, called from worker threads.
pub trait HttpFetcher: Send + Sync + 'static {
    /// Perform the request. Implementations should call [TransferProgress::received] as bytes arrive so that stalled
    /// transfers can be told apart from slow ones.
    fn fetch(
        &self,
        request: &HttpRequest<'_>,
        progress: &TransferProgress<'_>,
    ) -> Result<HttpResponse, TransportError>;

    /// Whether this fetcher can serve anything at all.
    fn is_available(&self) -> bool {
        true
    }
}

impl<T: HttpFetcher> HttpFetcher for Arc<T> {
    fn fetch(
        &self,
        request: &HttpRequest<'_>,
        progress: &TransferProgress<'_>,
    ) -> Result<HttpResponse, TransportError> {
        (**self).fetch(request, progress)
    }

    fn is_available(&self) -> bool {
        (**self).is_available()
    }
}

/// Stands in for a missing network layer: every request fails with [TransportError::NoCapability].
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHttp;

impl HttpFetcher for NoHttp {
    fn fetch(
        &self,
        _request: &HttpRequest<'_>,
        _progress: &TransferProgress<'_>,
    ) -> Result<HttpResponse, TransportError> {
        Err(TransportError::NoCapability)
    }

    fn is_available(&self) -> bool {
        false
    }
}

/// The output of a decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub image: RawImageBuffer,
    pub aux: Option<AuxRawImageBuffer>,
    /// The discard level actually decoded, which may be coarser than asked for when the bytes were partial.
    pub discard: i32,
}

/// Knows how to get from compressed bytes to pixels.
pub trait TextureDecoder: Send + Sync + 'static {
    /// Decode to `target_discard` or the finest level the bytes allow, whichever is coarser.
    fn decode(
        &self,
        bytes: &[u8],
        target_discard: i32,
        needs_aux: bool,
    ) -> Result<DecodedImage, DecodeError>;
}

impl<T: TextureDecoder> TextureDecoder for Arc<T> {
    fn decode(
        &self,
        bytes: &[u8],
        target_discard: i32,
        needs_aux: bool,
    ) -> Result<DecodedImage, DecodeError> {
        (**self).decode(bytes, target_discard, needs_aux)
    }
}

/// The GPU proxy: consumes pixels at a discard level to (re)build a resident texture.
pub trait TextureUploader {
    /// Returns false if the upload was refused, in which case the texture keeps its previous discard level.
    fn upload(&mut self, id: AssetId, image: &RawImageBuffer, discard: i32) -> bool;
}
