//! The router core: server lifecycle, aggregation, rate limiting, and the
//! request pipeline.
//!
//! Components here never hold back-pointers to each other; the registry is
//! keyed by server id and everyone resolves through it. The pipeline is the
//! only path a tool/resource/prompt call can take, and every terminal
//! outcome it produces writes exactly one audit event.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod aggregator;
mod builtin;
mod error;
mod manager;
mod pipeline;
mod rate_limit;
mod registry;

pub use aggregator::{Aggregator, NamespacedPrompt, NamespacedResource, NamespacedTool};
pub use builtin::{BUILTIN_SLUG, BuiltinTools};
pub use error::{RouterError, RouterResult};
pub use manager::{ManagerRestartHandler, ServerManager, ServerStatusView};
pub use pipeline::{CallRequest, CallTarget, Pipeline, PipelineConfig};
pub use rate_limit::{BucketConfig, RateDecision, RateLimiter};
pub use registry::ClientRegistry;
