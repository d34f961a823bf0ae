use anyhow::{bail, Context, Result};
use clap::Parser;
use landing_api::NetworkingInputs;
use landing_core::{resolve, PolicyAttachmentStore};
use landing_plan::{apply_plan, DryRunMaterializer, Plan, PlanMetrics, RetryPolicy, RetryingMaterializer};
use std::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod settings;

use settings::{LogFormat, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::parse();
    init_tracing(settings.log_format);

    if settings.schema {
        println!("{}", serde_json::to_string_pretty(&NetworkingInputs::json_schema())?);
        return Ok(());
    }

    let path = settings.config_path.clone().with_context(|| {
        format!(
            "no network declaration given: pass a path or set {}",
            settings::CONFIG_ENV
        )
    })?;
    info!("Starting landing-resolver with {}", path.display());

    let inputs =
        NetworkingInputs::from_path(&path).with_context(|| format!("failed to load {}", path.display()))?;

    let metrics = PlanMetrics::new()?;
    let policies = PolicyAttachmentStore::new();
    policies.load(&inputs.ou_policy_attachments).await?;
    info!("Loaded policy attachments for {} OU(s)", policies.count().await);

    let started = Instant::now();
    let resolution = match resolve(&inputs) {
        Ok(resolution) => {
            metrics.record_resolution(&resolution, started.elapsed());
            resolution
        }
        Err(e) => {
            metrics.record_failure(&e, started.elapsed());
            for diagnostic in e.diagnostics() {
                error!("{}", diagnostic);
            }
            emit_metrics(&settings, &metrics)?;
            return Err(e).context("network resolution halted");
        }
    };

    for diagnostic in &resolution.diagnostics {
        if diagnostic.is_error() {
            error!("{}", diagnostic);
        } else {
            warn!("{}", diagnostic);
        }
    }
    println!("{}", serde_json::to_string_pretty(&resolution.outputs())?);

    let has_errors = resolution.has_errors();
    if settings.apply && !has_errors {
        let validated = resolution.into_validated()?;
        let plan = Plan::build(&validated, &policies.snapshot().await)?;
        debug!("Plan {}: {}", plan.id, plan.to_json()?);
        let materializer =
            RetryingMaterializer::new(DryRunMaterializer::new(), RetryPolicy::default()).with_metrics(metrics.clone());

        let report = apply_plan(&plan, &materializer, Some(&metrics)).await?;
        info!(
            "Plan {} applied: {} resource(s), {} spoke(s)",
            report.plan_id,
            report.applied,
            report.spokes.len()
        );
    }

    emit_metrics(&settings, &metrics)?;

    if has_errors {
        if settings.apply {
            error!("Refusing to apply a network with validation errors");
        }
        bail!("network resolution reported errors");
    }
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if format == LogFormat::Json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn emit_metrics(settings: &Settings, metrics: &PlanMetrics) -> Result<()> {
    if settings.metrics {
        eprintln!("{}", metrics.gather()?);
    }
    Ok(())
}
