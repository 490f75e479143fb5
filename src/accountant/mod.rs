//! Per-service, per-capability concurrency accounting and fairness.
//!
//! Generalizes `Daemon::get_semaphore`/`try_acquire_permit` (one global
//! `Semaphore` map keyed by model name) into a two-level map keyed by
//! `(ServiceKey, Capability)`, plus a FIFO of deferred waiters and a
//! blacklist for services that have been timing out or running slow.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::TransportError;

mod key;
pub use key::ServiceKey;

/// Resource class a request competes for concurrency on. Distinct
/// capabilities on the same service get independent limits: a saturated
/// texture fetch queue must not starve inventory calls to the same host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Texture,
    Mesh,
    Inventory,
    Other,
}

/// How long a service stays blacklisted after a timeout/low-speed failure.
const BLACKLIST_DURATION: Duration = Duration::from_secs(60);

struct Waiter {
    sequence: u64,
    wake: tokio::sync::oneshot::Sender<()>,
}

struct ServiceCapabilityState {
    semaphore: Arc<Semaphore>,
    waiters: VecDeque<Waiter>,
}

struct BlacklistEntry {
    until: Instant,
    reason: TransportError,
}

/// Per-service per-capability concurrency ledger, plus failure-driven
/// blacklisting. One instance is shared by every `HttpTransport` dispatch
/// loop in a process.
pub struct ServiceAccountant {
    default_concurrency: u32,
    overrides: HashMap<Capability, u32>,
    max_errorcount: u32,

    state: RwLock<HashMap<(ServiceKey, Capability), Arc<Mutex<ServiceCapabilityState>>>>,
    error_counts: RwLock<HashMap<ServiceKey, u32>>,
    blacklist: RwLock<HashMap<ServiceKey, BlacklistEntry>>,
    waiter_sequence: AtomicU64,
}

/// Proof that a slot has been reserved for one request against one
/// `(ServiceKey, Capability)` pair. Not `Clone`: the slot is released
/// either by handing the token to the transport layer (which holds it for
/// the lifetime of the in-flight request) or by dropping it, which
/// returns the permit immediately.
pub struct ApprovalToken {
    _permit: OwnedSemaphorePermit,
}

impl ServiceAccountant {
    pub fn new(default_concurrency: u32, overrides: HashMap<Capability, u32>, max_errorcount: u32) -> Self {
        Self {
            default_concurrency,
            overrides,
            max_errorcount,
            state: RwLock::new(HashMap::new()),
            error_counts: RwLock::new(HashMap::new()),
            blacklist: RwLock::new(HashMap::new()),
            waiter_sequence: AtomicU64::new(0),
        }
    }

    fn limit_for(&self, capability: Capability) -> u32 {
        self.overrides.get(&capability).copied().unwrap_or(self.default_concurrency)
    }

    fn entry(&self, service: &ServiceKey, capability: Capability) -> Arc<Mutex<ServiceCapabilityState>> {
        if let Some(existing) = self.state.read().get(&(service.clone(), capability)) {
            return existing.clone();
        }
        let mut state = self.state.write();
        state
            .entry((service.clone(), capability))
            .or_insert_with(|| {
                Arc::new(Mutex::new(ServiceCapabilityState {
                    semaphore: Arc::new(Semaphore::new(self.limit_for(capability) as usize)),
                    waiters: VecDeque::new(),
                }))
            })
            .clone()
    }

    /// True if `service` is currently blocked from new requests regardless
    /// of remaining concurrency (spec §4.3/§7: `CurlTimeout`/low-speed
    /// failures impose a cooldown window).
    pub fn is_blacklisted(&self, service: &ServiceKey) -> bool {
        let blacklist = self.blacklist.read();
        match blacklist.get(service) {
            Some(entry) => Instant::now() < entry.until,
            None => false,
        }
    }

    /// Attempt to reserve a concurrency slot without blocking. Returns
    /// `None` immediately if blacklisted or if the per-capability limit is
    /// already saturated -- callers that want to wait should use
    /// `approve_queued` instead.
    pub fn approve(&self, service: &ServiceKey, capability: Capability) -> Option<ApprovalToken> {
        if self.is_blacklisted(service) {
            debug!(%service, "accountant: rejecting, blacklisted");
            return None;
        }

        let cell = self.entry(service, capability);
        let semaphore = {
            let guard = cell.lock();
            guard.semaphore.clone()
        };
        semaphore
            .try_acquire_owned()
            .ok()
            .map(|permit| ApprovalToken { _permit: permit })
    }

    /// Reserve a slot, waiting in FIFO order (ties broken by a monotonic
    /// sequence number) if the capability is saturated. Fails fast if the
    /// service is blacklisted at call time -- callers should retry later
    /// rather than queue against a service that will not serve them.
    pub async fn approve_queued(&self, service: &ServiceKey, capability: Capability) -> crate::error::Result<ApprovalToken> {
        if self.is_blacklisted(service) {
            return Err(crate::error::CoreError::Blacklisted(service.clone()));
        }

        let cell = self.entry(service, capability);
        let semaphore = {
            let guard = cell.lock();
            guard.semaphore.clone()
        };

        if let Ok(permit) = semaphore.clone().try_acquire_owned() {
            return Ok(ApprovalToken { _permit: permit });
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        let sequence = self.waiter_sequence.fetch_add(1, Ordering::SeqCst);
        {
            let mut guard = cell.lock();
            guard.waiters.push_back(Waiter { sequence, wake: tx });
        }
        let _ = rx.await;

        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|e| crate::error::CoreError::Other(anyhow::anyhow!(e)))?;
        Ok(ApprovalToken { _permit: permit })
    }

    /// Wake the next FIFO waiter for `(service, capability)`, if any, so it
    /// can retry its non-blocking acquire. Called by the transport layer
    /// whenever an in-flight request for that pair completes.
    pub fn notify_one(&self, service: &ServiceKey, capability: Capability) {
        if let Some(cell) = self.state.read().get(&(service.clone(), capability)) {
            let mut guard = cell.lock();
            if let Some(waiter) = guard.waiters.pop_front() {
                let _ = waiter.wake.send(());
            }
        }
    }

    /// Record a failure. Per spec §4.3/§7: timeouts and low-speed failures
    /// blacklist the service for a cooldown window *and* count toward
    /// `MAX_ERRORCOUNT`; a 503 counts toward neither (the origin already
    /// told us to back off, a blacklist on top would be redundant); a
    /// bare HTTP status >= 400 counts toward `MAX_ERRORCOUNT` only.
    pub fn note_failure(&self, service: &ServiceKey, error: &TransportError) {
        if matches!(error, TransportError::HttpStatus(503)) {
            return;
        }

        if error.triggers_blacklist() {
            let mut blacklist = self.blacklist.write();
            blacklist.insert(
                service.clone(),
                BlacklistEntry {
                    until: Instant::now() + BLACKLIST_DURATION,
                    reason: error.clone(),
                },
            );
            warn!(%service, %error, "accountant: blacklisting service");
        }

        if matches!(error, TransportError::HttpStatus(404)) {
            // A 404 on a content-mapped tile is not evidence the service is
            // unhealthy; it means the asset genuinely doesn't exist there.
            return;
        }

        let mut counts = self.error_counts.write();
        let count = counts.entry(service.clone()).or_insert(0);
        *count += 1;
        if *count >= self.max_errorcount {
            let mut blacklist = self.blacklist.write();
            blacklist.insert(
                service.clone(),
                BlacklistEntry {
                    until: Instant::now() + BLACKLIST_DURATION,
                    reason: error.clone(),
                },
            );
            warn!(%service, count = *count, "accountant: blacklisting after MAX_ERRORCOUNT");
        }
    }

    /// Record a success, resetting the consecutive-error counter.
    pub fn note_success(&self, service: &ServiceKey) {
        self.error_counts.write().remove(service);
    }

    /// Snapshot of a blacklist entry's reason, for diagnostics.
    pub fn blacklist_reason(&self, service: &ServiceKey) -> Option<TransportError> {
        self.blacklist.read().get(service).map(|e| e.reason.clone())
    }

    /// Current outstanding (in-use) permits for `(service, capability)`.
    /// For tests asserting the `outstanding <= max_concurrent` invariant.
    pub fn outstanding(&self, service: &ServiceKey, capability: Capability) -> u32 {
        let limit = self.limit_for(capability);
        match self.state.read().get(&(service.clone(), capability)) {
            Some(cell) => {
                let guard = cell.lock();
                limit - guard.semaphore.available_permits() as u32
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ServiceKey {
        ServiceKey::parse("https://texture.example.com").unwrap()
    }

    #[test]
    fn approve_respects_capacity_limit() {
        let accountant = ServiceAccountant::new(2, HashMap::new(), 20);
        let svc = service();

        let t1 = accountant.approve(&svc, Capability::Texture);
        let t2 = accountant.approve(&svc, Capability::Texture);
        let t3 = accountant.approve(&svc, Capability::Texture);

        assert!(t1.is_some());
        assert!(t2.is_some());
        assert!(t3.is_none());
        assert_eq!(accountant.outstanding(&svc, Capability::Texture), 2);
    }

    #[test]
    fn capabilities_are_independent() {
        let mut overrides = HashMap::new();
        overrides.insert(Capability::Texture, 1);
        let accountant = ServiceAccountant::new(4, overrides, 20);
        let svc = service();

        let texture_token = accountant.approve(&svc, Capability::Texture);
        let inventory_token = accountant.approve(&svc, Capability::Inventory);

        assert!(texture_token.is_some());
        assert!(inventory_token.is_some());
        assert!(accountant.approve(&svc, Capability::Texture).is_none());
    }

    #[test]
    fn timeout_failure_blacklists_service() {
        let accountant = ServiceAccountant::new(4, HashMap::new(), 20);
        let svc = service();

        assert!(!accountant.is_blacklisted(&svc));
        accountant.note_failure(&svc, &TransportError::OperationTimedOut);
        assert!(accountant.is_blacklisted(&svc));
        assert!(accountant.approve(&svc, Capability::Texture).is_none());
    }

    #[test]
    fn not_found_does_not_count_toward_errorcount_or_blacklist() {
        let accountant = ServiceAccountant::new(4, HashMap::new(), 1);
        let svc = service();

        accountant.note_failure(&svc, &TransportError::HttpStatus(404));
        assert!(!accountant.is_blacklisted(&svc));
        assert!(accountant.approve(&svc, Capability::Texture).is_some());
    }

    #[test]
    fn service_unavailable_does_not_blacklist() {
        let accountant = ServiceAccountant::new(4, HashMap::new(), 1);
        let svc = service();

        accountant.note_failure(&svc, &TransportError::HttpStatus(503));
        assert!(!accountant.is_blacklisted(&svc));
    }

    #[test]
    fn errorcount_blacklists_after_threshold() {
        let accountant = ServiceAccountant::new(4, HashMap::new(), 2);
        let svc = service();

        accountant.note_failure(&svc, &TransportError::HttpStatus(500));
        assert!(!accountant.is_blacklisted(&svc));
        accountant.note_failure(&svc, &TransportError::HttpStatus(500));
        assert!(accountant.is_blacklisted(&svc));
    }

    #[test]
    fn success_resets_error_count() {
        let accountant = ServiceAccountant::new(4, HashMap::new(), 2);
        let svc = service();

        accountant.note_failure(&svc, &TransportError::HttpStatus(500));
        accountant.note_success(&svc);
        accountant.note_failure(&svc, &TransportError::HttpStatus(500));
        assert!(!accountant.is_blacklisted(&svc));
    }

    #[tokio::test]
    async fn approve_queued_waits_for_release() {
        let accountant = Arc::new(ServiceAccountant::new(1, HashMap::new(), 20));
        let svc = service();

        let held = accountant.approve(&svc, Capability::Texture).unwrap();

        let accountant2 = accountant.clone();
        let svc2 = svc.clone();
        let waiter = tokio::spawn(async move {
            accountant2.approve_queued(&svc2, Capability::Texture).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        accountant.notify_one(&svc, Capability::Texture);

        let result = tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter should resolve")
            .expect("task should not panic");
        assert!(result.is_ok());
    }
}
