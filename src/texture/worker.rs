//! Per-texture fetch worker: a 14-state extension of
//! `engine::StateMachine`, grounded on the `Request<Pending|Claimed|
//! Processing|Completed|Failed>` typestate chain generalized from a
//! 6-state HTTP-only lifecycle to the full cache/network/decode/cache
//! pipeline of spec.md §4.6.
//!
//! States are declared in total urgency order, reusing the same
//! "removed/timed-out" outranking convention `transport::request_sm` uses
//! (a clean completion must always be able to outrank a racing timeout).

use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use crate::accountant::Capability;
use crate::engine::{RunStateId, StateMachine, Step};
use crate::texture::cache::{TextureCache, TextureId};
use crate::texture::cache_policy::CacheWritePolicy;
use crate::texture::decode::{DecodedImage, ImageDecoder};
use crate::texture::udp::PacketReassembly;
use crate::transport::{HttpTransport, Responder};

/// The worker's totally-ordered run states, per spec.md §4.6 /
/// DESIGN NOTES §9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum WorkerRunState {
    Init = 0,
    LoadFromTextureCache = 1,
    CachePost = 2,
    LoadFromNetwork = 3,
    LoadFromSimulator = 4,
    SendUdpReq = 5,
    WaitUdpReq = 6,
    SendHttpReq = 7,
    WaitHttpReq = 8,
    DecodeImage = 9,
    DecodeImageUpdate = 10,
    WriteToCache = 11,
    WaitOnWrite = 12,
    Done = 13,
}

impl WorkerRunState {
    pub fn as_run_state_id(self) -> RunStateId {
        RunStateId::new(self as u32)
    }

    pub fn from_run_state_id(id: RunStateId) -> Option<Self> {
        const ALL: [WorkerRunState; 14] = [
            WorkerRunState::Init,
            WorkerRunState::LoadFromTextureCache,
            WorkerRunState::CachePost,
            WorkerRunState::LoadFromNetwork,
            WorkerRunState::LoadFromSimulator,
            WorkerRunState::SendUdpReq,
            WorkerRunState::WaitUdpReq,
            WorkerRunState::SendHttpReq,
            WorkerRunState::WaitHttpReq,
            WorkerRunState::DecodeImage,
            WorkerRunState::DecodeImageUpdate,
            WorkerRunState::WriteToCache,
            WorkerRunState::WaitOnWrite,
            WorkerRunState::Done,
        ];
        ALL.into_iter().find(|s| s.as_run_state_id() == id)
    }
}

/// How a failed HTTP fetch attempt should be treated, per the per-status
/// table in spec.md §4.6/§7: a 404 on an ordinary texture is a single
/// non-retryable failure, a 503 gets unlimited (externally-backed-off)
/// retries, and everything else goes through the bounded
/// `HTTP_MAX_RETRY_COUNT` ladder (with an immediate UDP-fallback shortcut
/// for the two blacklist-triggering transport errors).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpFailureKind {
    /// 404 on a texture with a cache-write policy: terminal, not retried.
    /// (A 404 on a *map tile*, which has no cache-write policy, is handled
    /// separately by `TextureWorker::is_map_tile` short-circuiting straight
    /// to `Done` before the retry-kind even matters.)
    NotRetryable,
    /// 503 Service Unavailable: retry with unlimited attempts: the origin
    /// already told us to back off, so the bounded ladder and blacklist
    /// both stay out of it (backoff is external, per spec.md §4.6).
    UnlimitedRetry,
    /// Any other failure: bounded retry ladder up to `HTTP_MAX_RETRY_COUNT`.
    /// `triggers_blacklist` mirrors `TransportError::triggers_blacklist()`
    /// at the moment the failure was observed (OperationTimedOut/LowSpeed):
    /// those skip straight to UDP fallback rather than exhausting the
    /// ladder against a host C3 has already blacklisted.
    BoundedRetry { triggers_blacklist: bool },
}

/// Asynchronous outcomes the worker is waiting on, posted back via its
/// `engine::StateMachineHandle` the same way `RequestEvent` drives
/// `HttpRequestStateMachine`.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    CacheReadDone { data: Option<Bytes> },
    HttpFetchDone { data: Bytes },
    HttpFetchFailed { kind: HttpFailureKind },
    UdpFetchDone { data: Bytes },
    UdpFetchTimedOut,
    DecodeDone { image: DecodedImage },
    WriteDone,
}

/// Where this worker is fetching a texture from over the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkSource {
    Http,
    Udp,
}

struct PendingFetch {
    source: NetworkSource,
    event: Option<WorkerEvent>,
}

/// One texture's fetch worker. Holds no transport/cache/decoder directly
/// -- those are injected per-call, the same "collaborator passed in,
/// state owned here" split `transport::request_sm` uses.
pub struct TextureWorker {
    pub texture_id: TextureId,
    pub url: Option<url::Url>,
    name: String,

    cache: Arc<dyn TextureCache>,
    decoder: Arc<dyn ImageDecoder>,

    reassembly: Option<PacketReassembly>,
    pending: Option<PendingFetch>,
    fetched_bytes: Option<Bytes>,
    decoded: Option<DecodedImage>,
    cache_read_count: u32,
    cache_write_count: u32,
    http_retries_used: u32,
    max_http_retries: u32,
    decode_disabled: bool,
    udp_available: bool,
    udp_fallback_used: bool,
    http_fallback_used: bool,
    /// True for map-tile-style textures, which have no cache-write policy:
    /// a 404 for one of these is not an error, it means the tile genuinely
    /// doesn't exist, and the worker goes straight to `Done` with an empty
    /// result rather than failing (spec.md §4.6).
    is_map_tile: bool,
    error: Option<String>,
}

impl TextureWorker {
    pub fn new(
        texture_id: TextureId,
        url: Option<url::Url>,
        cache: Arc<dyn TextureCache>,
        decoder: Arc<dyn ImageDecoder>,
        max_http_retries: u32,
        decode_disabled: bool,
        udp_available: bool,
        is_map_tile: bool,
    ) -> Self {
        Self {
            texture_id,
            url,
            name: format!("texture_worker:{texture_id}"),
            cache,
            decoder,
            reassembly: None,
            pending: None,
            fetched_bytes: None,
            decoded: None,
            cache_read_count: 0,
            cache_write_count: 0,
            http_retries_used: 0,
            max_http_retries,
            decode_disabled,
            udp_available,
            udp_fallback_used: false,
            http_fallback_used: false,
            is_map_tile,
            error: None,
        }
    }

    /// Feed an externally-observed event into the worker ahead of its
    /// next `multiplex_impl` call. The caller is expected to then post
    /// `advance_state` through the worker's `StateMachineHandle`.
    pub fn deliver(&mut self, event: WorkerEvent) {
        if let Some(pending) = self.pending.as_mut() {
            pending.event = Some(event);
        }
    }

    pub fn cache_read_count(&self) -> u32 {
        self.cache_read_count
    }

    pub fn cache_write_count(&self) -> u32 {
        self.cache_write_count
    }

    pub fn last_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Raw bytes fetched so far (from cache or network), if any. Exposed
    /// so an external driver can hand them to a decoder/cache-writer when
    /// reacting to `Step::Idle` at `DecodeImageUpdate`/`WaitOnWrite`.
    pub fn fetched_bytes(&self) -> Option<&Bytes> {
        self.fetched_bytes.as_ref()
    }

    /// The decoded image once `DecodeImageUpdate` has completed.
    pub fn decoded_image(&self) -> Option<&DecodedImage> {
        self.decoded.as_ref()
    }

    pub fn cache_write_policy(&self) -> CacheWritePolicy {
        match &self.decoded {
            Some(image) if image.is_partial => CacheWritePolicy::ShouldWrite { partial: true },
            Some(_) => CacheWritePolicy::ShouldWrite { partial: false },
            None => CacheWritePolicy::NotWrite,
        }
    }
}

impl StateMachine for TextureWorker {
    fn initialize_impl(&mut self) -> RunStateId {
        WorkerRunState::Init.as_run_state_id()
    }

    fn multiplex_impl(&mut self, run_state: RunStateId) -> Step {
        let Some(state) = WorkerRunState::from_run_state_id(run_state) else {
            warn!(machine = %self.name, "texture worker: unrecognized run state");
            return Step::Abort;
        };

        match state {
            WorkerRunState::Init => Step::Continue(WorkerRunState::LoadFromTextureCache.as_run_state_id()),

            WorkerRunState::LoadFromTextureCache => {
                self.pending = Some(PendingFetch { source: NetworkSource::Http, event: None });
                Step::Idle(WorkerRunState::CachePost.as_run_state_id())
            }

            WorkerRunState::CachePost => {
                let Some(pending) = self.pending.take() else {
                    return Step::Idle(WorkerRunState::CachePost.as_run_state_id());
                };
                match pending.event {
                    Some(WorkerEvent::CacheReadDone { data: Some(data) }) => {
                        self.cache_read_count += 1;
                        self.fetched_bytes = Some(data);
                        Step::Continue(WorkerRunState::DecodeImage.as_run_state_id())
                    }
                    Some(WorkerEvent::CacheReadDone { data: None }) => {
                        self.cache_read_count += 1;
                        Step::Continue(WorkerRunState::LoadFromNetwork.as_run_state_id())
                    }
                    _ => {
                        self.pending = Some(pending);
                        Step::Idle(WorkerRunState::CachePost.as_run_state_id())
                    }
                }
            }

            WorkerRunState::LoadFromNetwork => {
                if self.url.is_some() {
                    Step::Continue(WorkerRunState::SendHttpReq.as_run_state_id())
                } else {
                    Step::Continue(WorkerRunState::LoadFromSimulator.as_run_state_id())
                }
            }

            WorkerRunState::LoadFromSimulator => {
                Step::Continue(WorkerRunState::SendUdpReq.as_run_state_id())
            }

            WorkerRunState::SendUdpReq => {
                self.pending = Some(PendingFetch { source: NetworkSource::Udp, event: None });
                Step::Continue(WorkerRunState::WaitUdpReq.as_run_state_id())
            }

            WorkerRunState::WaitUdpReq => match self.pending.as_ref().and_then(|p| p.event.clone()) {
                Some(WorkerEvent::UdpFetchDone { data }) => {
                    self.pending = None;
                    self.fetched_bytes = Some(data);
                    Step::Continue(WorkerRunState::DecodeImage.as_run_state_id())
                }
                Some(WorkerEvent::UdpFetchTimedOut) => {
                    self.pending = None;
                    if self.url.is_some() && !self.http_fallback_used {
                        self.http_fallback_used = true;
                        Step::Continue(WorkerRunState::SendHttpReq.as_run_state_id())
                    } else {
                        self.error = Some("UDP fetch timed out and no HTTP fallback available".to_string());
                        Step::Abort
                    }
                }
                _ => Step::Idle(WorkerRunState::WaitUdpReq.as_run_state_id()),
            },

            WorkerRunState::SendHttpReq => {
                self.pending = Some(PendingFetch { source: NetworkSource::Http, event: None });
                Step::Continue(WorkerRunState::WaitHttpReq.as_run_state_id())
            }

            WorkerRunState::WaitHttpReq => match self.pending.as_ref().and_then(|p| p.event.clone()) {
                Some(WorkerEvent::HttpFetchDone { data }) => {
                    self.pending = None;
                    self.fetched_bytes = Some(data);
                    Step::Continue(WorkerRunState::DecodeImage.as_run_state_id())
                }
                Some(WorkerEvent::HttpFetchFailed { kind }) => {
                    self.pending = None;

                    match kind {
                        // 404: per spec.md §4.6, a map tile (no cache-write
                        // policy) silently finishes with an empty result;
                        // any other texture is a single non-retryable
                        // failure.
                        HttpFailureKind::NotRetryable => {
                            if self.is_map_tile {
                                self.fetched_bytes = None;
                                self.decoded = None;
                                Step::Continue(WorkerRunState::Done.as_run_state_id())
                            } else {
                                self.error = Some("HTTP 404: texture not found".to_string());
                                Step::Abort
                            }
                        }
                        // 503: retry with unlimited attempts, no bounded
                        // cap and no blacklist -- the origin's backoff is
                        // external, not ours to enforce.
                        HttpFailureKind::UnlimitedRetry => Step::Continue(WorkerRunState::SendHttpReq.as_run_state_id()),
                        HttpFailureKind::BoundedRetry { triggers_blacklist } => {
                            // CurlTimeout/LowSpeed blacklist the host via C3
                            // immediately -- retrying the same host is
                            // pointless, so skip straight to UDP if it's
                            // available rather than burning the retry ladder.
                            if triggers_blacklist && self.udp_available && !self.udp_fallback_used {
                                self.udp_fallback_used = true;
                                self.fetched_bytes = None;
                                return Step::Continue(WorkerRunState::LoadFromSimulator.as_run_state_id());
                            }
                            // Two-phase retry-then-best-effort-decode: a
                            // request that fails retries up to the
                            // configured limit, but whatever bytes were
                            // already fetched on a prior attempt are still
                            // worth decoding if retries are exhausted
                            // (preserved per the design ledger, not dropped
                            // as dead code).
                            if self.http_retries_used < self.max_http_retries {
                                self.http_retries_used += 1;
                                Step::Continue(WorkerRunState::SendHttpReq.as_run_state_id())
                            } else if self.udp_available && !self.udp_fallback_used {
                                self.udp_fallback_used = true;
                                self.fetched_bytes = None;
                                Step::Continue(WorkerRunState::LoadFromSimulator.as_run_state_id())
                            } else if self.fetched_bytes.is_some() {
                                Step::Continue(WorkerRunState::DecodeImage.as_run_state_id())
                            } else {
                                self.error = Some("HTTP fetch failed after retries exhausted".to_string());
                                Step::Abort
                            }
                        }
                    }
                }
                _ => Step::Idle(WorkerRunState::WaitHttpReq.as_run_state_id()),
            },

            WorkerRunState::DecodeImage => {
                if self.decode_disabled {
                    return Step::Continue(WorkerRunState::WriteToCache.as_run_state_id());
                }
                self.pending = Some(PendingFetch { source: NetworkSource::Http, event: None });
                Step::Continue(WorkerRunState::DecodeImageUpdate.as_run_state_id())
            }

            WorkerRunState::DecodeImageUpdate => match self.pending.as_ref().and_then(|p| p.event.clone()) {
                Some(WorkerEvent::DecodeDone { image }) => {
                    self.pending = None;
                    self.decoded = Some(image);
                    Step::Continue(WorkerRunState::WriteToCache.as_run_state_id())
                }
                _ => Step::Idle(WorkerRunState::DecodeImageUpdate.as_run_state_id()),
            },

            WorkerRunState::WriteToCache => {
                if self.cache_write_policy().should_write() {
                    self.pending = Some(PendingFetch { source: NetworkSource::Http, event: None });
                    Step::Continue(WorkerRunState::WaitOnWrite.as_run_state_id())
                } else {
                    Step::Continue(WorkerRunState::Done.as_run_state_id())
                }
            }

            WorkerRunState::WaitOnWrite => match self.pending.as_ref().and_then(|p| p.event.clone()) {
                Some(WorkerEvent::WriteDone) => {
                    self.pending = None;
                    self.cache_write_count += 1;
                    Step::Continue(WorkerRunState::Done.as_run_state_id())
                }
                _ => Step::Idle(WorkerRunState::WaitOnWrite.as_run_state_id()),
            },

            WorkerRunState::Done => Step::Finish,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A no-op responder used to drive the HTTP leg of a texture fetch; the
/// worker observes completion via `WorkerEvent`s delivered separately
/// rather than through `Responder` callbacks, since one `HttpTransport`
/// instance is shared across every worker.
pub struct TextureHttpResponder {
    handle: crate::engine::StateMachineHandle,
    run_state_on_done: RunStateId,
}

impl TextureHttpResponder {
    pub fn new(handle: crate::engine::StateMachineHandle, run_state_on_done: RunStateId) -> Self {
        Self { handle, run_state_on_done }
    }
}

impl Responder for TextureHttpResponder {
    fn http_success(&self, _status: u16) {
        self.handle.advance_state(self.run_state_on_done);
    }

    fn http_failure(&self, _error: &crate::error::TransportError) {
        self.handle.advance_state(self.run_state_on_done);
    }

    fn name(&self) -> &str {
        "texture_http_responder"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::assert_monotonic_urgency;
    use crate::texture::cache::InMemoryTextureCache;
    use crate::texture::decode::MockImageDecoder;

    fn worker(url: Option<url::Url>) -> TextureWorker {
        worker_with_udp(url, false)
    }

    fn worker_with_udp(url: Option<url::Url>, udp_available: bool) -> TextureWorker {
        worker_full(url, udp_available, false)
    }

    fn worker_full(url: Option<url::Url>, udp_available: bool, is_map_tile: bool) -> TextureWorker {
        TextureWorker::new(
            TextureId::new_v4(),
            url,
            Arc::new(InMemoryTextureCache::new()),
            Arc::new(MockImageDecoder::new()),
            3,
            false,
            udp_available,
            is_map_tile,
        )
    }

    #[test]
    fn run_states_are_strictly_increasing_in_urgency() {
        let all: Vec<_> = (0..14).map(|n| WorkerRunState::from_run_state_id(RunStateId::new(n)).unwrap().as_run_state_id()).collect();
        assert_monotonic_urgency(&all).unwrap();
    }

    #[test]
    fn cache_hit_skips_network_entirely() {
        let mut w = worker(None);
        assert_eq!(w.multiplex_impl(WorkerRunState::Init.as_run_state_id()), Step::Continue(WorkerRunState::LoadFromTextureCache.as_run_state_id()));
        assert_eq!(
            w.multiplex_impl(WorkerRunState::LoadFromTextureCache.as_run_state_id()),
            Step::Idle(WorkerRunState::CachePost.as_run_state_id())
        );

        w.deliver(WorkerEvent::CacheReadDone { data: Some(Bytes::from_static(b"cached")) });
        assert_eq!(
            w.multiplex_impl(WorkerRunState::CachePost.as_run_state_id()),
            Step::Continue(WorkerRunState::DecodeImage.as_run_state_id())
        );
        assert_eq!(w.cache_read_count(), 1);
    }

    #[test]
    fn cache_miss_without_http_url_falls_back_to_udp() {
        let mut w = worker(None);
        w.multiplex_impl(WorkerRunState::LoadFromTextureCache.as_run_state_id());
        w.deliver(WorkerEvent::CacheReadDone { data: None });
        let step = w.multiplex_impl(WorkerRunState::CachePost.as_run_state_id());
        assert_eq!(step, Step::Continue(WorkerRunState::LoadFromNetwork.as_run_state_id()));

        let step = w.multiplex_impl(WorkerRunState::LoadFromNetwork.as_run_state_id());
        assert_eq!(step, Step::Continue(WorkerRunState::LoadFromSimulator.as_run_state_id()));
    }

    #[test]
    fn http_retry_then_best_effort_decode_on_exhaustion() {
        let mut w = worker(Some(url::Url::parse("https://textures.example.com/t").unwrap()));
        w.http_retries_used = 3;
        w.max_http_retries = 3;
        w.fetched_bytes = Some(Bytes::from_static(b"partial"));
        w.pending = Some(PendingFetch {
            source: NetworkSource::Http,
            event: Some(WorkerEvent::HttpFetchFailed { kind: HttpFailureKind::BoundedRetry { triggers_blacklist: false } }),
        });

        let step = w.multiplex_impl(WorkerRunState::WaitHttpReq.as_run_state_id());
        assert_eq!(step, Step::Continue(WorkerRunState::DecodeImage.as_run_state_id()));
    }

    #[test]
    fn http_retry_aborts_when_no_bytes_and_retries_exhausted() {
        let mut w = worker(Some(url::Url::parse("https://textures.example.com/t").unwrap()));
        w.http_retries_used = 3;
        w.max_http_retries = 3;
        w.pending = Some(PendingFetch {
            source: NetworkSource::Http,
            event: Some(WorkerEvent::HttpFetchFailed { kind: HttpFailureKind::BoundedRetry { triggers_blacklist: false } }),
        });

        let step = w.multiplex_impl(WorkerRunState::WaitHttpReq.as_run_state_id());
        assert_eq!(step, Step::Abort);
        assert!(w.last_error().is_some());
    }

    #[test]
    fn timeout_with_udp_available_falls_back_to_simulator_immediately() {
        let mut w = worker_with_udp(Some(url::Url::parse("https://textures.example.com/t").unwrap()), true);
        w.fetched_bytes = Some(Bytes::from_static(b"stale"));
        w.pending = Some(PendingFetch {
            source: NetworkSource::Http,
            event: Some(WorkerEvent::HttpFetchFailed { kind: HttpFailureKind::BoundedRetry { triggers_blacklist: true } }),
        });

        let step = w.multiplex_impl(WorkerRunState::WaitHttpReq.as_run_state_id());
        assert_eq!(step, Step::Continue(WorkerRunState::LoadFromSimulator.as_run_state_id()));
        assert_eq!(w.http_retries_used, 0, "a blacklist-triggering timeout skips the retry ladder entirely");
        assert!(w.fetched_bytes.is_none(), "stale bytes from the abandoned HTTP attempt are discarded");
    }

    #[test]
    fn retries_exhausted_falls_back_to_udp_when_available_instead_of_aborting() {
        let mut w = worker_with_udp(Some(url::Url::parse("https://textures.example.com/t").unwrap()), true);
        w.http_retries_used = 3;
        w.max_http_retries = 3;
        w.pending = Some(PendingFetch {
            source: NetworkSource::Http,
            event: Some(WorkerEvent::HttpFetchFailed { kind: HttpFailureKind::BoundedRetry { triggers_blacklist: false } }),
        });

        let step = w.multiplex_impl(WorkerRunState::WaitHttpReq.as_run_state_id());
        assert_eq!(step, Step::Continue(WorkerRunState::LoadFromSimulator.as_run_state_id()));
        assert!(w.last_error().is_none());
    }

    #[test]
    fn udp_fallback_is_attempted_at_most_once() {
        let mut w = worker_with_udp(Some(url::Url::parse("https://textures.example.com/t").unwrap()), true);
        w.udp_fallback_used = true;
        w.http_retries_used = 3;
        w.max_http_retries = 3;
        w.pending = Some(PendingFetch {
            source: NetworkSource::Http,
            event: Some(WorkerEvent::HttpFetchFailed { kind: HttpFailureKind::BoundedRetry { triggers_blacklist: true } }),
        });

        let step = w.multiplex_impl(WorkerRunState::WaitHttpReq.as_run_state_id());
        assert_eq!(step, Step::Abort, "a second fallback attempt is not made once the UDP leg has already been tried");
    }

    #[test]
    fn not_retryable_404_aborts_on_an_ordinary_texture() {
        let mut w = worker(Some(url::Url::parse("https://textures.example.com/t").unwrap()));
        w.pending = Some(PendingFetch {
            source: NetworkSource::Http,
            event: Some(WorkerEvent::HttpFetchFailed { kind: HttpFailureKind::NotRetryable }),
        });

        let step = w.multiplex_impl(WorkerRunState::WaitHttpReq.as_run_state_id());
        assert_eq!(step, Step::Abort);
        assert!(w.last_error().is_some());
    }

    #[test]
    fn not_retryable_404_on_map_tile_finishes_done_with_empty_result() {
        let mut w = worker_full(Some(url::Url::parse("https://textures.example.com/t").unwrap()), false, true);
        w.pending = Some(PendingFetch {
            source: NetworkSource::Http,
            event: Some(WorkerEvent::HttpFetchFailed { kind: HttpFailureKind::NotRetryable }),
        });

        let step = w.multiplex_impl(WorkerRunState::WaitHttpReq.as_run_state_id());
        assert_eq!(step, Step::Continue(WorkerRunState::Done.as_run_state_id()));
        assert!(w.last_error().is_none());
        assert!(w.fetched_bytes().is_none());
        assert!(w.decoded_image().is_none());
    }

    #[test]
    fn unlimited_retry_on_503_never_exhausts_and_never_blacklists_via_worker() {
        let mut w = worker(Some(url::Url::parse("https://textures.example.com/t").unwrap()));
        // Already past what would be the bounded ladder's cap -- 503 must
        // not be affected by `max_http_retries` at all.
        w.http_retries_used = w.max_http_retries;
        w.pending = Some(PendingFetch {
            source: NetworkSource::Http,
            event: Some(WorkerEvent::HttpFetchFailed { kind: HttpFailureKind::UnlimitedRetry }),
        });

        let step = w.multiplex_impl(WorkerRunState::WaitHttpReq.as_run_state_id());
        assert_eq!(step, Step::Continue(WorkerRunState::SendHttpReq.as_run_state_id()));
        assert_eq!(w.http_retries_used, w.max_http_retries, "503 retries are not counted against the bounded ladder");
    }

    #[test]
    fn partial_decode_marks_should_write_with_size_plus_one() {
        let mut w = worker(None);
        w.decoded = Some(DecodedImage { width: 8, height: 8, components: 4, is_partial: true });
        assert_eq!(w.cache_write_policy(), CacheWritePolicy::ShouldWrite { partial: true });
    }
}
