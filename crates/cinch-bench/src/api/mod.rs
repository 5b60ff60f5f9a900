//! Model request layer: retry policy, request execution, and cost tracking.
//!
//! These modules handle everything between the
//! [`Controller`](crate::agent::controller::Controller) and the chat
//! completions endpoint:
//!
//! - [`retry`] — failure classification (auth, rate limit, transient,
//!   context overflow, fatal) and exponential backoff with jitter.
//! - [`executor`] — [`RequestExecutor`] sends one turn with retries and
//!   credential rotation and classifies the result into a [`ResponseKind`].
//! - [`tracing`] — session IDs, per-model pricing tables, and the cumulative
//!   [`CostTracker`] persisted with each run.

pub mod executor;
pub mod retry;
pub mod tracing;

pub use executor::{CredentialPool, ModelResponse, RequestExecutor, ResponseKind};
pub use retry::RetryConfig;
pub use tracing::{CostTracker, ModelPricing, generate_session_id, pricing_for_model};
