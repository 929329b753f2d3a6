//! The per-request fetch state machine.
//!
//! [FetchMachine::step] is a pure, synchronous function: it takes the result of the last effect and returns the next
//! [Effect] for the worker to perform. All I/O (cache reads, HTTP, decoding) happens in the worker between steps, so
//! the machine can be driven by hand in tests without any real collaborators.
//!
//! ```text
//! Init -> LoadFromCache -+-> Decode -> CacheHitDone
//!                        |
//!                        +-> SendHttpRequest <-> WaitHttpReply -> Decode -> WriteToCache -> Done
//!                                   (transient failures retry)
//! ```
//!
//! Any state may end in `Failed`.
use std::io::Error as IoError;
use std::sync::Arc;

use crate::*;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FetchState {
    Init,
    LoadFromCache,
    /// Finished with data that came from the local cache; nothing to write back.
    CacheHitDone,
    /// Waiting for an HTTP slot.
    SendHttpRequest,
    WaitHttpReply,
    Decode,
    WriteToCache,
    Done,
    Failed,
}

impl FetchState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FetchState::CacheHitDone | FetchState::Done | FetchState::Failed
        )
    }

    /// States in which the request holds, or is about to hold, a network slot.
    pub fn is_network(self) -> bool {
        matches!(self, FetchState::SendHttpRequest | FetchState::WaitHttpReply)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum DataSource {
    Cache,
    Http,
}

/// Compressed bytes the machine is holding on to.
#[derive(Clone)]
pub(crate) struct FetchedData {
    pub bytes: Arc<Vec<u8>>,
    pub discard: i32,
    pub source: DataSource,
}

/// Per-step view of the request, which may have changed since the last step.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StepContext {
    pub requested_discard: i32,
    pub reads_cache: bool,
    pub network_allowed: bool,
    pub needs_aux: bool,
    /// 0 when any component count is acceptable.
    pub expected_components: u8,
    pub max_retries: u32,
    pub max_image_dimension: u32,
}

pub(crate) enum Effect {
    ReadCache { discard: i32 },
    /// Remove a cache entry that failed to decode, then resume.
    PurgeCache,
    AcquireHttpSlot,
    SendHttp { discard: i32 },
    Decode {
        bytes: Arc<Vec<u8>>,
        discard: i32,
        needs_aux: bool,
    },
    WriteCache { bytes: Arc<Vec<u8>>, discard: i32 },
    /// Terminal; collect the outcome with [FetchMachine::take_outcome].
    Complete,
}

pub(crate) enum StepInput {
    Resume,
    CacheRead(Option<CachedTexture>),
    HttpSlotGranted,
    HttpReply(Result<HttpResponse, TransportError>),
    Decoded(Result<DecodedImage, DecodeError>),
    CacheWritten(Result<(), IoError>),
}

/// What a finished request hands back to the manager.
#[derive(Debug, Default)]
pub(crate) struct FetchOutcome {
    pub state: Option<FetchState>,
    pub error: Option<FetchError>,
    pub decoded: Option<DecodedImage>,
    pub http_status: Option<u16>,
    pub from_local_cache: bool,
}

pub(crate) struct FetchMachine {
    state: FetchState,
    data: Option<FetchedData>,
    fetched_discard: Option<i32>,
    decoded: Option<DecodedImage>,
    retries: u32,
    http_status: Option<u16>,
    error: Option<FetchError>,
}

impl Default for FetchMachine {
    fn default() -> Self {
        FetchMachine::new()
    }
}

impl FetchMachine {
    pub fn new() -> FetchMachine {
        FetchMachine {
            state: FetchState::Init,
            data: None,
            fetched_discard: None,
            decoded: None,
            retries: 0,
            http_status: None,
            error: None,
        }
    }

    pub fn state(&self) -> FetchState {
        self.state
    }

    /// Finest discard level for which compressed data has arrived. Never increases.
    pub fn fetched_discard(&self) -> Option<i32> {
        self.fetched_discard
    }

    pub fn decoded_discard(&self) -> Option<i32> {
        self.decoded.as_ref().map(|d| d.discard)
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn http_status(&self) -> Option<u16> {
        self.http_status
    }

    pub fn error(&self) -> Option<FetchError> {
        self.error
    }

    pub fn from_local_cache(&self) -> bool {
        matches!(
            self.data,
            Some(FetchedData {
                source: DataSource::Cache,
                ..
            })
        )
    }

    /// Advance by one transition.
    pub fn step(&mut self, input: StepInput, ctx: &StepContext) -> Effect {
        use FetchState::*;

        match (self.state, input) {
            (s, _) if s.is_terminal() => Effect::Complete,

            (Init, _) => {
                if ctx.reads_cache {
                    self.state = LoadFromCache;
                    Effect::ReadCache {
                        discard: ctx.requested_discard,
                    }
                } else {
                    self.go_http(ctx)
                }
            }

            (LoadFromCache, StepInput::CacheRead(Some(hit))) => {
                let discard = hit.discard;
                self.record(hit.bytes, discard, DataSource::Cache);
                if discard <= ctx.requested_discard {
                    self.decode(ctx)
                } else {
                    // Partial data; keep it as a fallback and try for better.
                    self.go_http(ctx)
                }
            }
            (LoadFromCache, StepInput::CacheRead(None)) => self.go_http(ctx),

            (SendHttpRequest, StepInput::HttpSlotGranted) => {
                self.state = WaitHttpReply;
                Effect::SendHttp {
                    discard: ctx.requested_discard,
                }
            }
            (SendHttpRequest, _) => Effect::AcquireHttpSlot,

            (WaitHttpReply, StepInput::HttpReply(reply)) => self.on_http_reply(reply, ctx),

            (Decode, StepInput::Decoded(result)) => self.on_decoded(result, ctx),

            (WriteToCache, StepInput::CacheWritten(result)) => {
                if let Err(e) = result {
                    tracing::debug!(error = %e, "texture cache write failed");
                }
                self.state = Done;
                Effect::Complete
            }

            // The worker always answers an effect with its matching input; anything else is a logic error upstream,
            // so fail the request rather than spin.
            (state, _) => {
                tracing::warn!(?state, "unexpected input for fetch state");
                self.fail(FetchError::NetworkError)
            }
        }
    }

    /// Hand the result to the manager. Only meaningful once [Effect::Complete] has been returned.
    pub fn take_outcome(&mut self) -> FetchOutcome {
        FetchOutcome {
            state: Some(self.state),
            error: self.error,
            decoded: self.decoded.take(),
            http_status: self.http_status,
            from_local_cache: self.from_local_cache(),
        }
    }

    /// Keep the finest data seen so far.
    fn record(&mut self, bytes: Vec<u8>, discard: i32, source: DataSource) {
        let better = self.data.as_ref().map_or(true, |d| discard < d.discard);
        if better {
            self.data = Some(FetchedData {
                bytes: Arc::new(bytes),
                discard,
                source,
            });
        }
        self.fetched_discard = Some(self.fetched_discard.map_or(discard, |d| d.min(discard)));
    }

    fn go_http(&mut self, ctx: &StepContext) -> Effect {
        if !ctx.network_allowed {
            return self.degrade_or_fail(FetchError::NetworkError, ctx);
        }
        self.state = FetchState::SendHttpRequest;
        Effect::AcquireHttpSlot
    }

    fn decode(&mut self, ctx: &StepContext) -> Effect {
        let data = match &self.data {
            Some(d) => d.clone(),
            None => return self.fail(FetchError::NetworkError),
        };
        self.state = FetchState::Decode;
        Effect::Decode {
            bytes: data.bytes,
            discard: ctx.requested_discard.max(data.discard),
            needs_aux: ctx.needs_aux,
        }
    }

    /// Deliver whatever coarser data is already here, or fail with `error` if there is none.
    fn degrade_or_fail(&mut self, error: FetchError, ctx: &StepContext) -> Effect {
        match self.data.clone() {
            Some(d) => {
                self.error = Some(error);
                self.state = FetchState::Decode;
                Effect::Decode {
                    bytes: d.bytes,
                    discard: d.discard,
                    needs_aux: ctx.needs_aux,
                }
            }
            None => self.fail(error),
        }
    }

    fn fail(&mut self, error: FetchError) -> Effect {
        self.state = FetchState::Failed;
        self.error = Some(error);
        Effect::Complete
    }

    fn on_http_reply(
        &mut self,
        reply: Result<HttpResponse, TransportError>,
        ctx: &StepContext,
    ) -> Effect {
        let transient = match reply {
            Ok(resp) => {
                self.http_status = Some(resp.status);
                if resp.is_not_found() {
                    return self.fail(FetchError::AssetMissing);
                }
                if resp.is_success() && !resp.body.is_empty() {
                    self.record(resp.body, resp.discard, DataSource::Http);
                    return self.decode(ctx);
                }
                format!("status {} with {} bytes", resp.status, resp.body.len())
            }
            Err(TransportError::NoCapability) => {
                return self.degrade_or_fail(FetchError::NetworkError, ctx);
            }
            Err(e) => e.to_string(),
        };

        self.retries += 1;
        if self.retries <= ctx.max_retries {
            tracing::debug!(retry = self.retries, reason = %transient, "retrying texture fetch");
            self.state = FetchState::SendHttpRequest;
            Effect::AcquireHttpSlot
        } else {
            tracing::warn!(retries = self.retries, reason = %transient, "texture fetch retries exhausted");
            self.degrade_or_fail(FetchError::NetworkError, ctx)
        }
    }

    fn on_decoded(
        &mut self,
        result: Result<DecodedImage, DecodeError>,
        ctx: &StepContext,
    ) -> Effect {
        let source = match &self.data {
            Some(d) => d.source,
            None => return self.fail(FetchError::NetworkError),
        };

        let decoded = match result {
            Ok(d) => d,
            Err(e) if source == DataSource::Cache => {
                // Bad bytes in the cache; forget them and go to the network unless it already failed us.
                tracing::debug!(error = %e, "cached texture failed to decode");
                self.data = None;
                self.fetched_discard = None;
                if self.error.is_none() {
                    self.go_http(ctx);
                } else {
                    self.state = FetchState::Failed;
                }
                return Effect::PurgeCache;
            }
            Err(e) => {
                tracing::debug!(error = %e, "texture failed to decode");
                return self.fail(FetchError::Malformed);
            }
        };

        let img = &decoded.image;
        let too_big = img.width() > ctx.max_image_dimension || img.height() > ctx.max_image_dimension;
        let wrong_components =
            ctx.expected_components != 0 && img.components() != ctx.expected_components;
        if too_big || wrong_components {
            tracing::debug!(
                width = img.width(),
                height = img.height(),
                components = img.components(),
                "rejecting decoded texture"
            );
            return self.fail(FetchError::Malformed);
        }

        self.decoded = Some(decoded);
        match (source, self.data.clone()) {
            (DataSource::Http, Some(d)) => {
                self.state = FetchState::WriteToCache;
                Effect::WriteCache {
                    bytes: d.bytes,
                    discard: d.discard,
                }
            }
            _ => {
                self.state = FetchState::CacheHitDone;
                Effect::Complete
            }
        }
    }
}
