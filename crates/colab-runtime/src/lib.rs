//! Runtime Session Core: assignment negotiation, kernel sessions, and
//! execution dispatch against Google Colab hosted compute.
//!
//! Component map (letters match the component design in the spec this
//! crate implements):
//!
//! - [`http`] (A) authenticated HTTP transport
//! - [`colab_api`] (B) typed Colab API client
//! - [`proxy_cache`] (C) per-endpoint proxy token cache
//! - [`assignment`] (D) assignment negotiation
//! - [`jupyter_codec`] (E) Jupyter wire protocol
//! - [`session`] (F) kernel session / WebSocket pumps
//! - [`dispatcher`] (G) execution dispatch
//! - `colab_history` (H), a separate crate, is the execution history log
//! - [`manager`] (I) the façade tying the above together

pub mod access_token;
pub mod assignment;
pub mod colab_api;
pub mod dispatcher;
pub mod drive;
pub mod error;
pub mod http;
pub mod jupyter_codec;
pub mod manager;
pub mod memory;
pub mod proxy_cache;
pub mod session;
pub mod types;

pub use access_token::{AccessTokenSource, StaticTokenSource};
pub use colab_api::ColabApiClient;
pub use dispatcher::{CancelHandle, ExecuteOptions, ExecutionResult, ExecutionTiming};
pub use error::{Result, RuntimeError};
pub use http::HttpTransport;
pub use manager::RuntimeManager;
pub use memory::{calculate_memory_usage, format_memory};
pub use session::{KernelSession, SessionEvent};
pub use types::{Assignment, MachineShape, Outcome, ProxyInfo, SubscriptionTier, Variant};
