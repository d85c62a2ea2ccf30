//! Proxy module: the request relay engine and its collaborators.
//!
//! - **Service**: inbound router, dispatching by exact path
//! - **Relay**: buffered and streaming forwarding with terminal records
//! - **Upstream**: mTLS client and exclusive-checkout connection pool
//! - **SSE**: chunk decoding/re-encoding for streamed completions
//! - **Ledger**: bounded record ring + aggregate stats for the dashboard

pub mod error_response;
pub mod ledger;
pub mod relay;
pub mod service;
pub mod sse;
pub mod types;
pub mod upstream;

pub use ledger::{Ledger, RequestRecord, StatsAggregate};
pub use relay::{RelayEngine, RelaySettings};
pub use service::{AppState, ProxyService};
pub use types::{ChatCompletionRequest, ErrorKind, RelayError, RelayResult, RequestId};
pub use upstream::{UpstreamPool, UpstreamTls};
