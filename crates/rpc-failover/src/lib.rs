//! RPC endpoint health tracking and failover selection.
//!
//! Keeps a pool of candidate endpoints per chain, probes them on a fixed
//! interval, and publishes the best primary and secondary endpoint that the
//! rest of an application should send its calls to.
//!
//! # Pieces
//!
//! - [`Prober`]: one timed, cancellable JSON-RPC round trip per candidate
//! - [`selector::select`]: pure scoring with future-height and lag rejection
//! - [`StateStore`]: per-chain selection and last-usage stamps
//! - [`Scheduler`]: idle-aware periodic probing, persistence, notifications
//! - [`RpcFailover`]: the query, subscription and lifecycle surface
//!
//! # Quick example
//!
//! ```no_run
//! use rpc_failover::{CandidateEndpoint, ChainConfig, FailoverConfig, RpcFailover};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = FailoverConfig::new(vec![ChainConfig::new(
//!     "mainnet",
//!     vec![
//!         CandidateEndpoint::public("https://rpc-a.example"),
//!         CandidateEndpoint::public("https://rpc-b.example"),
//!     ],
//!     "https://rpc-fallback.example",
//! )]);
//!
//! let failover = RpcFailover::http(config).unwrap();
//! failover.start();
//!
//! let endpoints = failover.current_endpoints("mainnet");
//! println!("primary={} secondary={}", endpoints.primary, endpoints.secondary);
//!
//! failover.stop().await;
//! # }
//! ```

pub mod api;
pub mod clock;
pub mod config;
pub mod constants;
pub mod endpoint;
pub mod error;
pub mod metrics;
pub mod notify;
pub mod prober;
pub mod report;
pub mod scheduler;
pub mod selector;
pub mod state;
pub mod storage;
pub mod transport;

// Re-exports
pub use api::{FailoverBuilder, RpcFailover};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ChainConfig, FailoverConfig, ProbeQuery};
pub use endpoint::{CandidateEndpoint, Endpoints, ProbeResult};
pub use error::{FailoverError, Result};
pub use notify::{ChangeEvent, Subscription};
pub use prober::Prober;
pub use report::{ErrorReporter, TracingReporter, WebhookReporter};
pub use scheduler::{CycleReport, Scheduler};
pub use selector::{Selection, SelectorPolicy};
pub use state::{ChainSnapshot, StateStore};
pub use storage::{InMemoryStorage, SelectionRecord, SqliteStorage, Storage};
pub use transport::{HttpTransport, RpcTransport};
