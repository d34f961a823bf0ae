//! Command line and environment settings

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, ValueEnum};
use std::path::PathBuf;

pub const CONFIG_ENV: &str = "LANDING_ZONE_CONFIG";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Resolve a landing zone network declaration and print its outputs
#[derive(Clone, Debug, Parser)]
#[command(name = "landing-resolver", version)]
pub struct Settings {
    /// Network declaration (YAML or JSON)
    #[arg(env = "LANDING_ZONE_CONFIG")]
    pub config_path: Option<PathBuf>,

    /// Render the plan and apply it when validation passes
    #[arg(long, env = "LANDING_ZONE_APPLY", action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    pub apply: bool,

    /// Write Prometheus metrics to stderr before exiting
    #[arg(long, env = "LANDING_METRICS", action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    pub metrics: bool,

    /// Print the JSON schema of the declaration and exit
    #[arg(long)]
    pub schema: bool,

    #[arg(long, value_enum, env = "LANDING_LOG_FORMAT", default_value_t = LogFormat::Text, ignore_case = true)]
    pub log_format: LogFormat,
}
