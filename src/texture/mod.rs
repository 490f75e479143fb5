//! Texture fetch pipeline facade (C5, spec.md §4.6 / SPEC_FULL.md
//! `[MODULE: texture]`).
//!
//! `TextureWorker` (below, in `worker`) is a pure `engine::StateMachine`:
//! it only knows the sequence of run states and what event unblocks each
//! one, the same split `transport::request_sm::HttpRequestStateMachine`
//! uses between "what state am I in" and "who actually performs the I/O".
//! Unlike the single shared `transport::HttpTransport` dispatch task,
//! though, a texture fetch's steps are each a different async
//! collaborator (cache, HTTP, UDP, decoder) that must be *awaited*
//! between states -- a concern `engine::Engine::tick`'s synchronous,
//! budget-bounded pass can't express without blocking every other
//! registered machine. So `TextureFetch` drives each worker on its own
//! dedicated Tokio task (an "auxiliary engine" per spec.md §5, one per
//! in-flight texture rather than one shared thread), calling
//! `StateMachine::multiplex_impl` directly and performing the
//! corresponding async collaborator call whenever a step produces
//! `Step::Idle`. This is documented as an intentional deviation from
//! `engine::Engine` in DESIGN.md.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub mod cache;
pub mod cache_policy;
pub mod decode;
pub mod metrics;
pub mod udp;
pub mod worker;

use crate::accountant::Capability;
use crate::config::CoreConfig;
use crate::engine::{StateMachine, Step};
use crate::error::{CoreError, Result};
use crate::headers::HeaderMergeMode;
use crate::transport::{EasyRequest, HttpTransport, Responder};

use cache::{TextureCache, TextureId};
use decode::{DecodedImage, ImageDecoder};
use metrics::{TexturePurpose, TransportKind, ViewerMetrics};
use udp::{PacketReassembly, UdpImageBus};
use worker::{HttpFailureKind, TextureWorker, WorkerEvent, WorkerRunState};

pub type DiscardLevel = u8;

/// One desired texture, per spec.md §6.2 `TextureFetch::createRequest`.
#[derive(Debug, Clone)]
pub struct TextureRequestSpec {
    pub texture_id: TextureId,
    /// Region-provided texture-server URL; `None` disables the HTTP leg
    /// for this texture (UDP-only, or map-tile-style no-URL case).
    pub url: Option<url::Url>,
    /// Whether a simulator UDP host is available as a fallback/primary.
    pub udp_available: bool,
    pub priority: f32,
    pub desired_discard: DiscardLevel,
    pub desired_size: u64,
    pub purpose: TexturePurpose,
    /// Map tiles have no cache-write policy: a `404` means the tile simply
    /// doesn't exist at this zoom/coordinate, so the worker finishes at
    /// `Done` with an empty result instead of treating it as a failure.
    pub is_map_tile: bool,
}

/// Delivered to the requester once a worker reaches `Done` with a decoded
/// image, per spec.md §6.2 `getRequestFinished`.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub discard: DiscardLevel,
    pub image: DecodedImage,
    pub raw: Bytes,
}

/// Snapshot of one in-flight (or finished) worker's progress, per
/// spec.md §6.2 `getFetchState`.
#[derive(Debug, Clone)]
pub struct FetchStateInfo {
    pub run_state: WorkerRunState,
    pub http_fail_count: u32,
    pub priority: f32,
    pub desired_discard: DiscardLevel,
    pub cache_read_count: u32,
    pub cache_write_count: u32,
    pub last_error: Option<String>,
}

/// One texture's UDP header packet, per spec.md §4.6 "Packet 0 (header
/// packet) delivers `{codec, total_packets, file_size, first_chunk_bytes}`".
#[derive(Debug, Clone)]
pub struct ImageHeaderInfo {
    pub codec: u8,
    pub total_packets: usize,
    pub file_size: u64,
    pub first_chunk: Bytes,
}

enum UdpInbound {
    Header(ImageHeaderInfo),
    Packet { index: usize, payload: Bytes },
}

/// A fair, priority-ordered admission gate bounding how many workers may
/// be doing real cache/network/decode work concurrently. Unlike
/// `tokio::sync::Semaphore` (FIFO-only), a released slot is handed
/// directly to the highest-priority waiter rather than raced for, so
/// spec.md §8's "priority fairness" property holds even under contention.
struct AdmissionQueue {
    capacity: usize,
    in_use: Mutex<usize>,
    waiting: Mutex<BinaryHeap<Waiting>>,
    sequence: AtomicU64,
}

struct Waiting {
    priority: f32,
    /// Lower sequence = enqueued earlier; ties at equal priority resolve
    /// FIFO (spec.md §8: "FIFO by enqueue time within a jitter of one
    /// engine tick").
    sequence: u64,
    notify: oneshot::Sender<()>,
}

impl PartialEq for Waiting {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for Waiting {}
impl PartialOrd for Waiting {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Waiting {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl AdmissionQueue {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            in_use: Mutex::new(0),
            waiting: Mutex::new(BinaryHeap::new()),
            sequence: AtomicU64::new(0),
        })
    }

    async fn acquire(self: &Arc<Self>, priority: f32) -> AdmissionGuard {
        let rx = {
            let mut in_use = self.in_use.lock();
            if *in_use < self.capacity {
                *in_use += 1;
                None
            } else {
                let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
                let (tx, rx) = oneshot::channel();
                self.waiting.lock().push(Waiting { priority, sequence, notify: tx });
                Some(rx)
            }
        };
        if let Some(rx) = rx {
            let _ = rx.await;
        }
        AdmissionGuard { queue: self.clone() }
    }

    fn release(&self) {
        if let Some(next) = self.waiting.lock().pop() {
            let _ = next.notify.send(());
        } else {
            *self.in_use.lock() -= 1;
        }
    }
}

struct AdmissionGuard {
    queue: Arc<AdmissionQueue>,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.queue.release();
    }
}

struct Entry {
    priority: Mutex<f32>,
    desired_discard: Mutex<DiscardLevel>,
    state: Mutex<FetchStateInfo>,
    result: Mutex<Option<FetchResult>>,
    udp_inbound: Mutex<Option<mpsc::UnboundedSender<UdpInbound>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Top-level facade, per spec.md §6.2. Owns the worker pool's admission
/// gate and the collaborators every worker task needs (cache, decoder,
/// UDP bus, the shared `HttpTransport`), and is cheap to clone (every
/// field is itself `Arc`-backed).
#[derive(Clone)]
pub struct TextureFetch {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<CoreConfig>,
    cache: Arc<dyn TextureCache>,
    decoder: Arc<dyn ImageDecoder>,
    udp_bus: Arc<dyn UdpImageBus>,
    transport: HttpTransport,
    metrics: Arc<ViewerMetrics>,
    admission: Arc<AdmissionQueue>,
    entries: DashMap<TextureId, Arc<Entry>>,
}

impl TextureFetch {
    pub fn new(
        config: Arc<CoreConfig>,
        cache: Arc<dyn TextureCache>,
        decoder: Arc<dyn ImageDecoder>,
        udp_bus: Arc<dyn UdpImageBus>,
        transport: HttpTransport,
        metrics: Arc<ViewerMetrics>,
        max_concurrent_workers: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                cache,
                decoder,
                udp_bus,
                transport,
                metrics,
                admission: AdmissionQueue::new(max_concurrent_workers),
                entries: DashMap::new(),
            }),
        }
    }

    /// Register a desired texture, per spec.md §6.2 `createRequest`.
    /// Returns `true` if this call started a new fetch attempt (either no
    /// prior request for this id existed, or the prior attempt finished
    /// and the caller is now asking for better quality -- spec.md §8's
    /// "monotone worker state" invariant explicitly carves out this one
    /// path back to `Init`).
    pub fn create_request(&self, spec: TextureRequestSpec) -> bool {
        if let Some(entry) = self.inner.entries.get(&spec.texture_id) {
            let mut desired = entry.desired_discard.lock();
            *entry.priority.lock() = spec.priority;
            let is_done = entry.state.lock().run_state == WorkerRunState::Done;
            if is_done && spec.desired_discard < *desired {
                *desired = spec.desired_discard;
                drop(desired);
                self.spawn_worker(spec);
                return true;
            }
            // Same size but no new information: priority/desired-discard
            // metadata updated above, nothing else to do.
            if spec.desired_discard < *desired {
                *desired = spec.desired_discard;
            }
            return false;
        }

        self.spawn_worker(spec);
        true
    }

    fn spawn_worker(&self, spec: TextureRequestSpec) {
        let entry = Arc::new(Entry {
            priority: Mutex::new(spec.priority),
            desired_discard: Mutex::new(spec.desired_discard),
            state: Mutex::new(FetchStateInfo {
                run_state: WorkerRunState::Init,
                http_fail_count: 0,
                priority: spec.priority,
                desired_discard: spec.desired_discard,
                cache_read_count: 0,
                cache_write_count: 0,
                last_error: None,
            }),
            result: Mutex::new(None),
            udp_inbound: Mutex::new(None),
            task: Mutex::new(None),
        });

        let inner = self.inner.clone();
        let entry_for_task = entry.clone();
        let id = spec.texture_id;
        let handle = tokio::spawn(async move {
            run_worker(inner, entry_for_task, spec).await;
        });
        *entry.task.lock() = Some(handle);
        self.inner.entries.insert(id, entry);
    }

    /// spec.md §6.2 `updateRequestPriority`.
    pub fn update_request_priority(&self, id: TextureId, priority: f32) -> Result<()> {
        let entry = self.inner.entries.get(&id).ok_or_else(|| CoreError::UnknownRequest(id.to_string()))?;
        *entry.priority.lock() = priority;
        entry.state.lock().priority = priority;
        Ok(())
    }

    /// spec.md §6.2 `getRequestFinished`. Returns `None` until the worker
    /// reaches `Done` with a decoded image.
    pub fn get_request_finished(&self, id: TextureId) -> Option<FetchResult> {
        self.inner.entries.get(&id).and_then(|e| e.result.lock().clone())
    }

    /// spec.md §6.2 `getFetchState`.
    pub fn get_fetch_state(&self, id: TextureId) -> Option<FetchStateInfo> {
        self.inner.entries.get(&id).map(|e| e.state.lock().clone())
    }

    /// spec.md §6.2 `deleteRequest`. `cancel` aborts the in-flight task
    /// immediately rather than letting it run to completion unobserved.
    pub fn delete_request(&self, id: TextureId, cancel: bool) {
        if let Some((_, entry)) = self.inner.entries.remove(&id) {
            if cancel {
                if let Some(task) = entry.task.lock().take() {
                    task.abort();
                }
            }
        }
    }

    /// UDP receive path entry point: packet 0, per spec.md §4.6.
    pub fn receive_image_header(&self, id: TextureId, info: ImageHeaderInfo) {
        if let Some(entry) = self.inner.entries.get(&id) {
            if let Some(tx) = entry.udp_inbound.lock().as_ref() {
                let _ = tx.send(UdpInbound::Header(info));
            }
        }
    }

    /// UDP receive path entry point: packets 1..N, per spec.md §4.6.
    pub fn receive_image_packet(&self, id: TextureId, index: usize, payload: Bytes) {
        if let Some(entry) = self.inner.entries.get(&id) {
            if let Some(tx) = entry.udp_inbound.lock().as_ref() {
                let _ = tx.send(UdpInbound::Packet { index, payload });
            }
        }
    }

    pub fn metrics(&self) -> Arc<ViewerMetrics> {
        self.inner.metrics.clone()
    }
}

fn update_state(entry: &Entry, run_state: WorkerRunState, worker: &TextureWorker) {
    let mut state = entry.state.lock();
    state.run_state = run_state;
    state.cache_read_count = worker.cache_read_count();
    state.cache_write_count = worker.cache_write_count();
    state.last_error = worker.last_error().map(str::to_string);
}

/// Drives one `TextureWorker` from `Init` through to `Done`/abort,
/// performing the async collaborator call each `Step::Idle` implies. See
/// the module doc for why this bypasses `engine::Engine`.
async fn run_worker(inner: Arc<Inner>, entry: Arc<Entry>, spec: TextureRequestSpec) {
    let purpose = spec.purpose;
    let max_retries = inner.config.http_max_retry_count;
    let decode_disabled = inner.config.texture_decode_disabled;

    let mut worker = TextureWorker::new(
        spec.texture_id,
        spec.url.clone(),
        inner.cache.clone(),
        inner.decoder.clone(),
        max_retries,
        decode_disabled,
        spec.udp_available,
        spec.is_map_tile,
    );

    let priority = *entry.priority.lock();
    let _permit = inner.admission.acquire(priority).await;

    let mut state = WorkerRunState::from_run_state_id(worker.initialize_impl());
    let mut transport_kind = TransportKind::Udp;
    inner.metrics.record_start(TransportKind::Http, purpose);

    loop {
        let Some(current) = state else {
            warn!("texture worker: lost track of run state, aborting");
            break;
        };
        update_state(&entry, current, &worker);

        let step = worker.multiplex_impl(current.as_run_state_id());
        match step {
            Step::Continue(next) => {
                state = WorkerRunState::from_run_state_id(next);
            }
            Step::Abort => {
                worker.abort_impl();
                worker.finish_impl();
                update_state(&entry, current, &worker);
                inner.metrics.record_failure(transport_kind, purpose);
                debug!(texture = %spec.texture_id, "texture worker: aborted");
                return;
            }
            Step::Finish => {
                worker.finish_impl();
                break;
            }
            Step::Idle(next) => {
                perform_side_effect(&inner, &entry, &mut worker, current, &spec, &mut transport_kind).await;
                state = WorkerRunState::from_run_state_id(next);
            }
        }
    }

    if let (Some(bytes), Some(image)) = (worker.fetched_bytes().cloned(), worker.decoded_image().cloned()) {
        *entry.result.lock() = Some(FetchResult { discard: spec.desired_discard, image, raw: bytes });
    }
    let bytes_len = entry.result.lock().as_ref().map(|r| r.raw.len() as u64).unwrap_or(0);
    inner.metrics.record_done(transport_kind, purpose, bytes_len);
    update_state(&entry, WorkerRunState::Done, &worker);
}

/// Performs the async collaborator call implied by having just observed
/// `from_state` return `Step::Idle`. Mirrors the per-state table in
/// spec.md §4.6.
async fn perform_side_effect(
    inner: &Arc<Inner>,
    entry: &Arc<Entry>,
    worker: &mut TextureWorker,
    from_state: WorkerRunState,
    spec: &TextureRequestSpec,
    transport_kind: &mut TransportKind,
) {
    match from_state {
        WorkerRunState::LoadFromTextureCache => {
            let data = inner.cache.read(spec.texture_id).await.unwrap_or(None);
            worker.deliver(WorkerEvent::CacheReadDone { data });
        }
        WorkerRunState::WaitUdpReq => {
            *transport_kind = TransportKind::Udp;
            let event = run_udp_fetch(inner, entry, spec).await;
            worker.deliver(event);
        }
        WorkerRunState::WaitHttpReq => {
            *transport_kind = TransportKind::Http;
            let event = run_http_fetch(inner, spec).await;
            worker.deliver(event);
        }
        WorkerRunState::DecodeImageUpdate => {
            let bytes = worker.fetched_bytes().cloned().unwrap_or_default();
            match inner.decoder.decode(bytes, spec.desired_discard).await {
                Ok(image) => worker.deliver(WorkerEvent::DecodeDone { image }),
                Err(_) => worker.deliver(WorkerEvent::DecodeDone {
                    image: DecodedImage { width: 0, height: 0, components: 0, is_partial: true },
                }),
            }
        }
        WorkerRunState::WaitOnWrite => {
            if let Some(bytes) = worker.fetched_bytes().cloned() {
                if let Some(encoded_size) = worker.cache_write_policy().encoded_size(bytes.len() as u32) {
                    let _ = inner.cache.write(spec.texture_id, bytes, encoded_size).await;
                }
            }
            worker.deliver(WorkerEvent::WriteDone);
        }
        _ => {}
    }
}

/// HTTP leg of a texture fetch, per spec.md §4.6: range request with the
/// "shave one byte off the offset" server-quirk workaround, and the
/// 416/404/503/other retry ladder. Always fetches from byte 0 up to
/// `desired_size` (progressive refinement via `Range` re-requests at a
/// nonzero offset is a future worker capability this crate does not yet
/// need, since `TextureRequestSpec` only carries one desired size).
///
/// Per spec.md §4.6/T3: a `0`-based range is shaved one byte further back
/// than the actual desired start (formatted literally as `bytes=-1-N`,
/// the original's own quirk, preserved rather than normalized to a valid
/// `bytes=0-N`) so an edge cache that would otherwise answer a
/// from-the-start range with a full-body `200` is forced into a
/// partially-satisfiable `206`. The extra leading byte (`src_offset=1`)
/// is then dropped before the body is handed to the decoder.
async fn run_http_fetch(inner: &Arc<Inner>, spec: &TextureRequestSpec) -> WorkerEvent {
    let Some(url) = spec.url.clone() else {
        return WorkerEvent::HttpFetchFailed { kind: HttpFailureKind::BoundedRetry { triggers_blacklist: false } };
    };

    let last_byte = spec.desired_size.saturating_sub(1);

    let (tx, rx) = oneshot::channel();
    let responder = Arc::new(RangeResponder::new(tx));
    let mut request = EasyRequest::new(reqwest::Method::GET, url, Capability::Texture, responder);
    if request.add_header("Range", format!("bytes=-1-{last_byte}"), HeaderMergeMode::New).is_err() {
        return WorkerEvent::HttpFetchFailed { kind: HttpFailureKind::BoundedRetry { triggers_blacklist: false } };
    }

    if inner.transport.request(request).await.is_err() {
        return WorkerEvent::HttpFetchFailed { kind: HttpFailureKind::BoundedRetry { triggers_blacklist: false } };
    }

    match rx.await {
        Ok((Some(200), _, body)) | Ok((Some(206), _, body)) => {
            let data = if !body.is_empty() { body.slice(1..) } else { body };
            WorkerEvent::HttpFetchDone { data }
        }
        // 416: "we already have all data" -- treat as success-equivalent
        // with whatever bytes we already hold (spec.md §4.6/§7).
        Ok((Some(416), _, _)) => WorkerEvent::HttpFetchDone { data: Bytes::new() },
        // 404: a single non-retryable failure, except on a map tile (no
        // cache-write policy) which finishes at `Done` with an empty
        // result instead -- the worker's `is_map_tile` flag decides which.
        Ok((Some(404), _, _)) => WorkerEvent::HttpFetchFailed { kind: HttpFailureKind::NotRetryable },
        // 503: unlimited retries, backoff left to the origin/transport.
        Ok((Some(503), _, _)) => WorkerEvent::HttpFetchFailed { kind: HttpFailureKind::UnlimitedRetry },
        Ok((Some(_), _, _)) => WorkerEvent::HttpFetchFailed { kind: HttpFailureKind::BoundedRetry { triggers_blacklist: false } },
        // No HTTP status at all: the transport itself failed before a
        // response arrived. CurlTimeout/LowSpeed are the cases C3
        // blacklists the host for -- those are exactly the ones spec.md
        // §4.6 says should fall back to UDP rather than retry the same
        // now-blacklisted host.
        Ok((None, triggers_blacklist, _)) => {
            WorkerEvent::HttpFetchFailed { kind: HttpFailureKind::BoundedRetry { triggers_blacklist } }
        }
        Err(_) => WorkerEvent::HttpFetchFailed { kind: HttpFailureKind::BoundedRetry { triggers_blacklist: false } },
    }
}

struct RangeResponder {
    body: Mutex<Option<Bytes>>,
    tx: Mutex<Option<oneshot::Sender<(Option<u16>, bool, Bytes)>>>,
}

impl RangeResponder {
    fn new(tx: oneshot::Sender<(Option<u16>, bool, Bytes)>) -> Self {
        Self { body: Mutex::new(None), tx: Mutex::new(Some(tx)) }
    }

    fn finish(&self, status: Option<u16>, triggers_blacklist: bool) {
        let body = self.body.lock().take().unwrap_or_default();
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send((status, triggers_blacklist, body));
        }
    }
}

impl Responder for RangeResponder {
    fn completed_raw(&self, body: &Bytes) {
        *self.body.lock() = Some(body.clone());
    }

    fn http_success(&self, status: u16) {
        self.finish(Some(status), false);
    }

    fn http_failure(&self, error: &crate::error::TransportError) {
        match error {
            crate::error::TransportError::HttpStatus(s) => self.finish(Some(*s), false),
            other => self.finish(None, other.triggers_blacklist()),
        }
    }

    fn name(&self) -> &str {
        "texture_range_responder"
    }
}

/// UDP leg of a texture fetch, per spec.md §4.6: send `RequestImage`,
/// wait for the header packet and subsequent packets, reassembling until
/// complete or until rerequest attempts are exhausted.
async fn run_udp_fetch(inner: &Arc<Inner>, entry: &Arc<Entry>, spec: &TextureRequestSpec) -> WorkerEvent {
    let (tx, mut rx) = mpsc::unbounded_channel();
    *entry.udp_inbound.lock() = Some(tx);

    const MAX_REREQUESTS: u32 = 3;
    const REREQUEST_TIMEOUT: Duration = Duration::from_secs(5);

    let mut reassembly: Option<PacketReassembly> = None;
    let mut packets_already_sent = 0usize;

    for _attempt in 0..=MAX_REREQUESTS {
        if inner
            .udp_bus
            .send_request_image(spec.texture_id, spec.desired_discard, packets_already_sent)
            .await
            .is_err()
        {
            continue;
        }

        let deadline = tokio::time::Instant::now() + REREQUEST_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(UdpInbound::Header(info))) => {
                    reassembly = Some(PacketReassembly::new(info.total_packets));
                    if let Some(r) = reassembly.as_mut() {
                        let _ = r.receive(0, info.first_chunk);
                    }
                }
                Ok(Some(UdpInbound::Packet { index, payload })) => {
                    if let Some(r) = reassembly.as_mut() {
                        let _ = r.receive(index, payload);
                        if r.is_complete() {
                            *entry.udp_inbound.lock() = None;
                            return WorkerEvent::UdpFetchDone { data: r.assemble().unwrap_or_default() };
                        }
                        packets_already_sent = r.last_contiguous_packet();
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
    }

    *entry.udp_inbound.lock() = None;
    info!(texture = %spec.texture_id, "texture worker: UDP fetch timed out after rerequests exhausted");
    WorkerEvent::UdpFetchTimedOut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookies::CookieStore;
    use cache::InMemoryTextureCache;
    use decode::MockImageDecoder;
    use udp::InMemoryUdpImageBus;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport() -> HttpTransport {
        HttpTransport::new(
            reqwest::Client::new(),
            Arc::new(crate::accountant::ServiceAccountant::new(8, Default::default(), 20)),
            CookieStore::new(),
            Arc::new(CoreConfig::default()),
        )
    }


    fn facade(cache: Arc<dyn TextureCache>) -> TextureFetch {
        TextureFetch::new(
            Arc::new(CoreConfig::default()),
            cache,
            Arc::new(MockImageDecoder::new()),
            Arc::new(InMemoryUdpImageBus::new()),
            transport(),
            Arc::new(ViewerMetrics::new(None)),
            4,
        )
    }

    #[tokio::test]
    async fn cache_hit_reaches_done_without_network() {
        let cache = Arc::new(InMemoryTextureCache::new());
        let id = TextureId::new_v4();
        cache.write(id, Bytes::from_static(b"cached-bytes"), 12).await.unwrap();

        let fetch = facade(cache);
        fetch.create_request(TextureRequestSpec {
            texture_id: id,
            url: None,
            udp_available: false,
            priority: 1.0,
            desired_discard: 0,
            desired_size: 1024,
            purpose: TexturePurpose::Regular,
            is_map_tile: false,
        });

        let result = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(r) = fetch.get_request_finished(id) {
                    return r;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker should finish");

        assert_eq!(result.raw, Bytes::from_static(b"cached-bytes"));
    }

    #[tokio::test]
    async fn http_range_fetch_shaves_leading_byte_per_server_quirk() {
        let server = MockServer::start().await;
        let body = vec![0xAAu8; 16385];
        Mock::given(method("GET"))
            .and(path("/texture"))
            .and(header("Range", "bytes=-1-16383"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(body))
            .mount(&server)
            .await;

        let fetch = TextureFetch::new(
            Arc::new(CoreConfig::default()),
            Arc::new(InMemoryTextureCache::new()),
            Arc::new(MockImageDecoder::new()),
            Arc::new(InMemoryUdpImageBus::new()),
            transport(),
            Arc::new(ViewerMetrics::new(None)),
            4,
        );

        let id = TextureId::new_v4();
        fetch.create_request(TextureRequestSpec {
            texture_id: id,
            url: Some(url::Url::parse(&format!("{}/texture", server.uri())).unwrap()),
            udp_available: false,
            priority: 1.0,
            desired_discard: 0,
            desired_size: 16384,
            purpose: TexturePurpose::Regular,
            is_map_tile: false,
        });

        let result = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(r) = fetch.get_request_finished(id) {
                    return r;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker should finish");

        assert_eq!(result.raw.len(), 16384, "the leading shaved byte (src_offset=1) is dropped before decode");
    }

    #[tokio::test]
    async fn unknown_request_priority_update_errors() {
        let fetch = facade(Arc::new(InMemoryTextureCache::new()));
        assert!(fetch.update_request_priority(TextureId::new_v4(), 2.0).is_err());
    }

    #[tokio::test]
    async fn delete_request_with_cancel_aborts_task() {
        let cache = Arc::new(InMemoryTextureCache::new());
        let id = TextureId::new_v4();
        let fetch = facade(cache);
        fetch.create_request(TextureRequestSpec {
            texture_id: id,
            url: None,
            udp_available: true,
            priority: 0.5,
            desired_discard: 3,
            desired_size: 4096,
            purpose: TexturePurpose::Bake,
            is_map_tile: false,
        });

        fetch.delete_request(id, true);
        assert!(fetch.get_fetch_state(id).is_none());
    }

    #[tokio::test]
    async fn admission_queue_grants_higher_priority_waiter_first() {
        let queue = AdmissionQueue::new(1);
        let _held = queue.acquire(0.0).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let low_queue = queue.clone();
        let low_order = order.clone();
        let low = tokio::spawn(async move {
            let _g = low_queue.acquire(1.0).await;
            low_order.lock().push("low");
        });

        tokio::time::sleep(Duration::from_millis(20)).await;

        let high_queue = queue.clone();
        let high_order = order.clone();
        let high = tokio::spawn(async move {
            let _g = high_queue.acquire(9.0).await;
            high_order.lock().push("high");
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(_held);

        let _ = tokio::join!(low, high);
        assert_eq!(*order.lock(), vec!["high", "low"]);
    }
}
