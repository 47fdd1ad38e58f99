//! The reveal pipeline: throttled batch submission to the enrichment
//! provider, correlation of its asynchronous callbacks, and deduplicating
//! merge of the results into a [`ContactStore`](reveal_core::store::ContactStore).
//!
//! ```text
//! Submitter ─► RateLimiter ─► RetryPolicy ─► RevealProvider ─► RequestTracker
//!                                                                   ▲
//! POST /callback ─► CallbackReceiver ─► payload::parse ─────────────┘
//!                          └─► MergeEngine ─► ContactStore
//! ```

pub mod callback;
pub mod config;
pub mod merge;
pub mod payload;
pub mod provider;
pub mod rate_limit;
pub mod retry;
pub mod submitter;
pub mod tracker;

pub use callback::{CallbackReceiver, HandleOutcome};
pub use config::PipelineConfig;
pub use merge::{MergeEngine, MergeError};
pub use provider::{HttpProvider, ProviderError, RevealProvider};
pub use rate_limit::{RateLimitError, RateLimiter};
pub use retry::{Classify, ErrorKind, RetryPolicy};
pub use submitter::{SubmissionSummary, SubmitError, Submitter};
pub use tracker::{RequestTracker, ResolveOutcome, TrackerError};
