//! Viewer-wide texture fetch metrics aggregation, grounded on the
//! `Daemon::run` pattern of a periodic spawned task -- here generalized
//! from "log an interval summary" to "accumulate a snapshot, then POST it
//! through `HttpTransport` on region-change or timer".

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::accountant::Capability;
use crate::transport::{HttpTransport, IgnoringResponder};

/// One texture's start/done timestamps, partitioned by transport and
/// purpose -- the two axes the original cross-tabulates fetch counts by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TexturePurpose {
    Regular,
    Bake,
}

#[derive(Debug, Default, Clone, Serialize)]
struct Bucket {
    started: u64,
    completed: u64,
    failed: u64,
    bytes_fetched: u64,
}

#[derive(Debug, Default, Serialize)]
struct Snapshot {
    http_regular: Bucket,
    http_bake: Bucket,
    udp_regular: Bucket,
    udp_bake: Bucket,
    /// Set whenever the previous periodic POST failed, so the next
    /// snapshot is flagged as following a gap rather than silently
    /// under-reporting.
    data_break: bool,
}

fn bucket_mut<'a>(snapshot: &'a mut Snapshot, transport: TransportKind, purpose: TexturePurpose) -> &'a mut Bucket {
    match (transport, purpose) {
        (TransportKind::Http, TexturePurpose::Regular) => &mut snapshot.http_regular,
        (TransportKind::Http, TexturePurpose::Bake) => &mut snapshot.http_bake,
        (TransportKind::Udp, TexturePurpose::Regular) => &mut snapshot.udp_regular,
        (TransportKind::Udp, TexturePurpose::Bake) => &mut snapshot.udp_bake,
    }
}

/// Aggregates fetch counters and periodically POSTs a snapshot through
/// `HttpTransport` to a metrics endpoint.
pub struct ViewerMetrics {
    snapshot: Mutex<Snapshot>,
    endpoint: Option<url::Url>,
}

impl ViewerMetrics {
    pub fn new(endpoint: Option<url::Url>) -> Self {
        Self {
            snapshot: Mutex::new(Snapshot::default()),
            endpoint,
        }
    }

    pub fn record_start(&self, transport: TransportKind, purpose: TexturePurpose) {
        bucket_mut(&mut self.snapshot.lock(), transport, purpose).started += 1;
    }

    pub fn record_done(&self, transport: TransportKind, purpose: TexturePurpose, bytes: u64) {
        let mut snapshot = self.snapshot.lock();
        let bucket = bucket_mut(&mut snapshot, transport, purpose);
        bucket.completed += 1;
        bucket.bytes_fetched += bytes;
    }

    pub fn record_failure(&self, transport: TransportKind, purpose: TexturePurpose) {
        bucket_mut(&mut self.snapshot.lock(), transport, purpose).failed += 1;
    }

    /// POST the current snapshot and reset counters, called on
    /// region-change or by the periodic task below. Sets `data_break` on
    /// the *next* snapshot if this POST fails, mirroring the original's
    /// "we know we dropped a report" bookkeeping.
    async fn flush(&self, transport: &HttpTransport) {
        let body = {
            let mut snapshot = self.snapshot.lock();
            let taken = std::mem::take(&mut *snapshot);
            serde_json::to_vec(&taken).unwrap_or_default()
        };

        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };

        let result = transport
            .post_raw(
                endpoint,
                bytes::Bytes::from(body),
                "application/json",
                Capability::Other,
                Arc::new(IgnoringResponder),
            )
            .await;

        if let Err(error) = result {
            warn!(%error, "metrics: snapshot POST failed, marking data_break");
            self.snapshot.lock().data_break = true;
        } else {
            debug!("metrics: snapshot POSTed");
        }
    }

    /// Spawn the periodic reporting task. Mirrors `Daemon::run`'s pattern
    /// of a single always-on background loop rather than a one-shot timer.
    pub fn spawn_periodic_report(self: Arc<Self>, transport: HttpTransport, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.flush(&transport).await;
            }
        })
    }
}
