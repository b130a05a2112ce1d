//! Fair-share reverse proxy for a single rate-limited upstream API.
//!
//! Many callers share one upstream that enforces a global request budget. The proxy
//! divides that budget evenly among the callers that are currently active and, when
//! the upstream pushes back, parks every caller behind one shared cooldown instead of
//! letting each of them hammer the upstream with its own retry loop.
//!
//! # Request flow
//! 1. **Identity**: the caller key comes from `x-connection-id`, or `remote_addr|user_agent`.
//! 2. **Admission**: the caller may dispatch while its consumption over the last minute
//!    is below `limit_per_minute / active_callers`; otherwise it waits.
//! 3. **Dispatch**: the request is forwarded over a bounded `reqwest` pool.
//! 4. **Backoff**: `429`/`503` responses install or extend a process-wide pause; every
//!    suspended request re-enters admission once the pause elapses.
//!
//! # Basic Usage
//! ```no_run
//! use fair_share_proxy::fair_share::{FairShareSettings, server::ProxyServer};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = FairShareSettings::builder()
//!     .upstream_base_url("https://api.example.com".parse()?)
//!     .limit_per_minute(200)
//!     .build();
//! let server = ProxyServer::new(settings)?;
//! server.run("0.0.0.0:8000".parse()?).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//! See [`fair_share::FairShareSettings`] for every tunable and its environment variable.
pub mod fair_share;
pub mod logging;

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
