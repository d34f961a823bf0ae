//! Plan materialization
//!
//! Shared hub resources apply first and in plan order. Spoke groups then
//! apply concurrently, each group in order, followed by organization policy
//! attachments. The first failure stops the apply.

use crate::metrics::PlanMetrics;
use crate::plan::{ApplyGroup, Plan, PlannedResource};
use crate::{PlanError, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Creates or updates one planned resource
#[async_trait]
pub trait Materializer: Send + Sync {
    fn name(&self) -> &'static str {
        "UnnamedMaterializer"
    }

    async fn apply(&self, resource: &PlannedResource) -> Result<()>;
}

/// Records applied addresses without calling any cloud API
#[derive(Clone, Default)]
pub struct DryRunMaterializer {
    applied: Arc<Mutex<Vec<String>>>,
}

impl DryRunMaterializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Addresses in the order they were applied
    pub async fn applied(&self) -> Vec<String> {
        self.applied.lock().await.clone()
    }
}

#[async_trait]
impl Materializer for DryRunMaterializer {
    fn name(&self) -> &'static str {
        "DryRunMaterializer"
    }

    async fn apply(&self, resource: &PlannedResource) -> Result<()> {
        debug!("Dry run: {}", resource.address);
        self.applied.lock().await.push(resource.address.clone());
        Ok(())
    }
}

/// Retry policy for failed apply calls
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Fraction of the backoff randomly added or removed
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Calculate backoff duration for the given retry count
    pub fn backoff_duration(&self, retry_count: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as u64;
        let exponential = 2u64.saturating_pow(retry_count);
        let backoff_ms = base
            .saturating_mul(exponential)
            .min(self.max_backoff.as_millis() as u64);
        Duration::from_millis(backoff_ms)
    }

    /// Backoff with random jitter, never above the maximum
    pub fn jittered_backoff(&self, retry_count: u32) -> Duration {
        let backoff = self.backoff_duration(retry_count);
        if self.jitter <= 0.0 {
            return backoff;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        backoff.mul_f64(factor.max(0.0)).min(self.max_backoff)
    }
}

/// Wraps a materializer with retry on retryable failures
pub struct RetryingMaterializer<M> {
    inner: M,
    policy: RetryPolicy,
    metrics: Option<PlanMetrics>,
}

impl<M: Materializer> RetryingMaterializer<M> {
    pub fn new(inner: M, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: PlanMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }
}

#[async_trait]
impl<M: Materializer> Materializer for RetryingMaterializer<M> {
    fn name(&self) -> &'static str {
        "RetryingMaterializer"
    }

    async fn apply(&self, resource: &PlannedResource) -> Result<()> {
        let mut retries = 0;
        loop {
            match self.inner.apply(resource).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && retries < self.policy.max_retries => {
                    let backoff = self.policy.jittered_backoff(retries);
                    warn!(
                        "Apply of {} failed ({}), retrying in {:?}",
                        resource.address, e, backoff
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.apply_retries_total.inc();
                    }
                    tokio::time::sleep(backoff).await;
                    retries += 1;
                }
                Err(e) if e.is_retryable() => {
                    return Err(PlanError::RetriesExhausted {
                        address: resource.address.clone(),
                        attempts: retries + 1,
                        message: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Summary of an apply
#[derive(Clone, Debug, PartialEq)]
pub struct ApplyReport {
    pub plan_id: Uuid,
    pub applied: usize,
    /// Applied resource count per spoke
    pub spokes: BTreeMap<String, usize>,
}

/// Apply a plan through a materializer
pub async fn apply_plan<M>(plan: &Plan, materializer: &M, metrics: Option<&PlanMetrics>) -> Result<ApplyReport>
where
    M: Materializer + ?Sized,
{
    info!("Applying plan {} through {}", plan.id, materializer.name());

    let groups = plan.groups();
    let mut report = ApplyReport {
        plan_id: plan.id,
        applied: 0,
        spokes: BTreeMap::new(),
    };

    if let Some(shared) = groups.get(&ApplyGroup::Shared) {
        report.applied += apply_in_order(shared, materializer, metrics).await?;
    }

    let spoke_groups: Vec<(&String, &Vec<&PlannedResource>)> = groups
        .iter()
        .filter_map(|(group, resources)| match group {
            ApplyGroup::Spoke(name) => Some((name, resources)),
            _ => None,
        })
        .collect();
    let applied = try_join_all(spoke_groups.into_iter().map(|(name, resources)| async move {
        let count = apply_in_order(resources, materializer, metrics).await?;
        debug!("Applied {} resource(s) for spoke {}", count, name);
        Ok::<_, PlanError>((name.clone(), count))
    }))
    .await?;
    for (name, count) in applied {
        report.applied += count;
        report.spokes.insert(name, count);
    }

    if let Some(governance) = groups.get(&ApplyGroup::Governance) {
        report.applied += apply_in_order(governance, materializer, metrics).await?;
    }

    info!("Applied {} resource(s) from plan {}", report.applied, plan.id);
    Ok(report)
}

async fn apply_in_order<M>(
    resources: &[&PlannedResource],
    materializer: &M,
    metrics: Option<&PlanMetrics>,
) -> Result<usize>
where
    M: Materializer + ?Sized,
{
    for resource in resources {
        materializer.apply(resource).await?;
        if let Some(metrics) = metrics {
            metrics
                .applied_resources_total
                .with_label_values(&[&resource.resource_type])
                .inc();
        }
    }
    Ok(resources.len())
}
