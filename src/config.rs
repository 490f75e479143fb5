//! Explicit configuration, passed at construction instead of read from a
//! global settings object (DESIGN NOTES §9: "Implicit coupling via global
//! `gSavedSettings`"). Covers every name in spec §6.3.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::watch;

/// A config value the original marks live-reconfigurable (log flags,
/// `CurlRequestTimeOut`). Wraps a `tokio::sync::watch` pair so a running
/// pipeline observes updates without restart, without exposing a global.
#[derive(Debug, Clone)]
pub struct ObservableSetting<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone + PartialEq + Send + Sync + 'static> ObservableSetting<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    pub fn set(&self, value: T) {
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });
    }

    /// Subscribe to future changes (does not replay the current value as a
    /// change; callers should `get()` once up front).
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

/// Named HTTP timeout policy (spec §4.4).
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    /// Extra connect-timeout grace on first contact with a host.
    pub dns_lookup_grace: Duration,
    pub max_connect: Duration,
    /// Time allowed between request sent and first response byte.
    pub max_reply_delay: Duration,
    pub low_speed_limit_bytes_per_sec: u32,
    pub low_speed_time: Duration,
    /// Total transaction time, once transmission has started.
    pub max_transaction: Duration,
    /// Total time including time spent queued awaiting an approvement token.
    pub max_total_delay: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            dns_lookup_grace: Duration::from_secs(5),
            max_connect: Duration::from_secs(30),
            max_reply_delay: Duration::from_secs(30),
            low_speed_limit_bytes_per_sec: 100,
            low_speed_time: Duration::from_secs(20),
            max_transaction: Duration::from_secs(600),
            max_total_delay: Duration::from_secs(900),
        }
    }
}

/// What to do with a crash report found at next start (spec §6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrashSubmitBehavior {
    #[default]
    Ask = 0,
    AlwaysSend = 1,
    NeverSend = 2,
}

/// Every configuration name the HTTP + texture-fetch core recognizes,
/// per spec §6.3.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Prefer HTTP over UDP when a region texture-server URL is available.
    pub image_pipeline_use_http: bool,
    /// Skip decode entirely (debug only).
    pub texture_decode_disabled: bool,
    pub cookies_enabled: bool,

    /// Inactivity timer for HTTP-request state machines. Live-reconfigurable.
    pub curl_request_timeout: ObservableSetting<Duration>,

    pub log_texture_downloads_to_viewer_log: ObservableSetting<bool>,
    pub log_texture_downloads_to_simulator: ObservableSetting<bool>,
    pub log_texture_network_traffic: ObservableSetting<bool>,
    pub texture_logging_threshold: u64,

    pub crash_host_url: Option<url::Url>,
    pub crash_submit_behavior: CrashSubmitBehavior,
    pub crash_report_id: Option<String>,

    /// Named timeout policies (e.g. "texture", "inventory", "default").
    pub timeout_policies: HashMap<String, TimeoutPolicy>,

    /// Per-capability concurrency caps, applied per service (accountant).
    pub default_capability_concurrency: u32,
    pub capability_concurrency_overrides: HashMap<crate::accountant::Capability, u32>,

    /// Consecutive failures before a service is blacklisted (original: 20).
    pub max_errorcount: u32,

    pub http_max_retry_count: u32,
    pub max_img_packet_size: usize,
    pub images_per_request: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let mut timeout_policies = HashMap::new();
        timeout_policies.insert("default".to_string(), TimeoutPolicy::default());
        timeout_policies.insert(
            "texture".to_string(),
            TimeoutPolicy {
                max_total_delay: Duration::from_secs(120),
                ..TimeoutPolicy::default()
            },
        );

        Self {
            image_pipeline_use_http: true,
            texture_decode_disabled: false,
            cookies_enabled: true,
            curl_request_timeout: ObservableSetting::new(Duration::from_secs(120)),
            log_texture_downloads_to_viewer_log: ObservableSetting::new(false),
            log_texture_downloads_to_simulator: ObservableSetting::new(false),
            log_texture_network_traffic: ObservableSetting::new(false),
            texture_logging_threshold: 100 * 1024,
            crash_host_url: None,
            crash_submit_behavior: CrashSubmitBehavior::default(),
            crash_report_id: None,
            timeout_policies,
            default_capability_concurrency: 8,
            capability_concurrency_overrides: HashMap::new(),
            max_errorcount: 20,
            http_max_retry_count: 3,
            max_img_packet_size: 1000,
            images_per_request: 50,
        }
    }
}

impl CoreConfig {
    pub fn timeout_policy(&self, name: &str) -> crate::error::Result<TimeoutPolicy> {
        self.timeout_policies
            .get(name)
            .copied()
            .ok_or_else(|| crate::error::CoreError::UnknownTimeoutPolicy(name.to_string()))
    }

    pub fn capability_concurrency(&self, capability: crate::accountant::Capability) -> u32 {
        self.capability_concurrency_overrides
            .get(&capability)
            .copied()
            .unwrap_or(self.default_capability_concurrency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observable_setting_round_trips() {
        let setting = ObservableSetting::new(Duration::from_secs(1));
        assert_eq!(setting.get(), Duration::from_secs(1));
        setting.set(Duration::from_secs(2));
        assert_eq!(setting.get(), Duration::from_secs(2));
    }

    #[test]
    fn observable_setting_notifies_subscribers() {
        let setting = ObservableSetting::new(0i32);
        let mut rx = setting.subscribe();
        setting.set(42);
        rx.changed_now_or_panic_in_test();
    }

    trait ChangedNowOrPanic {
        fn changed_now_or_panic_in_test(&mut self);
    }

    impl<T> ChangedNowOrPanic for watch::Receiver<T> {
        fn changed_now_or_panic_in_test(&mut self) {
            assert!(self.has_changed().unwrap_or(false));
        }
    }

    #[test]
    fn default_config_has_texture_policy() {
        let config = CoreConfig::default();
        assert!(config.timeout_policy("texture").is_ok());
        assert!(config.timeout_policy("nonexistent").is_err());
    }
}
