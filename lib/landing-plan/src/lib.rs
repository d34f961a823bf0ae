//! Plan rendering and materialization for a validated landing zone network
//!
//! This library provides:
//! - Plan rendering in the provisioning engine's resource address vocabulary
//! - Materializer trait with a dry-run implementation
//! - Retry with exponential backoff and jitter
//! - Prometheus metrics for resolution and apply

pub mod error;
pub mod materializer;
pub mod metrics;
pub mod plan;

pub use error::{PlanError, Result};
pub use materializer::{apply_plan, ApplyReport, DryRunMaterializer, Materializer, RetryPolicy, RetryingMaterializer};
pub use metrics::PlanMetrics;
pub use plan::{ApplyGroup, Plan, PlannedResource};
