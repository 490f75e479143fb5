//! Networking and asset-fetch core of a virtual-world client.
//!
//! Four tightly coupled subsystems, leaves first:
//!
//! - [`engine`] -- the cooperative state-machine runtime (C1) that
//!   [`transport::request_sm`] and [`texture::worker`] are both built on.
//! - [`headers`] / [`cookies`] -- the HTTP header containers (C2) and the
//!   cookie jar shared by every outbound request.
//! - [`accountant`] -- per-service, per-capability concurrency accounting
//!   and fairness (C3).
//! - [`transport`] -- the multiplexed HTTP transport (C4): request
//!   submission, dispatch, responder completion.
//! - [`texture`] -- the texture fetch pipeline (C5): per-image worker
//!   state machines coordinating a local cache, HTTP, UDP, and an image
//!   decoder.
//! - [`crash`] -- crash report assembly and submission, a thin consumer
//!   of [`transport`].
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use viewer_http_core::{
//!     accountant::{Capability, ServiceAccountant},
//!     config::CoreConfig,
//!     cookies::CookieStore,
//!     transport::{HttpTransport, IgnoringResponder},
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(CoreConfig::default());
//!     let accountant = Arc::new(ServiceAccountant::new(
//!         config.default_capability_concurrency,
//!         config.capability_concurrency_overrides.clone(),
//!         config.max_errorcount,
//!     ));
//!     let transport = HttpTransport::new(
//!         reqwest::Client::new(),
//!         accountant,
//!         CookieStore::new(),
//!         config,
//!     );
//!
//!     let handle = transport
//!         .get(
//!             url::Url::parse("https://example.test/hello")?,
//!             Capability::Other,
//!             Arc::new(IgnoringResponder),
//!         )
//!         .await?;
//!     let _ = handle;
//!     Ok(())
//! }
//! ```

pub mod accountant;
pub mod config;
pub mod cookies;
pub mod crash;
pub mod engine;
pub mod error;
pub mod headers;
pub mod texture;
pub mod transport;

pub use accountant::{Capability, ServiceAccountant, ServiceKey};
pub use config::CoreConfig;
pub use cookies::CookieStore;
pub use engine::{BaseState, Engine, RunStateId, StateMachine, Step};
pub use error::{CoreError, Result, TransportError};
pub use headers::{HeaderMergeMode, ReceivedHeaders, RequestHeaders};
pub use transport::{EasyRequest, HttpTransport, Responder};
