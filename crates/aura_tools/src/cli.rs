#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use aura_engines::{ConfigurationError, UxBudgetsConfig};
use aura_os::duty_sim::{self, parse_timeline, DutySimConfig, DutySimError, DutySimReport};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_TIMELINE: &str = "10:idle,5:active,10:idle,5:active";

#[derive(Parser, Debug)]
#[command(
    name = "aura",
    version,
    about = "Wearable connection-lifecycle tools",
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Inspect a ux_budgets.yaml file.
    #[command(subcommand)]
    Budgets(BudgetsCommand),

    /// Simulate an idle/active timeline against the duty-cycle scheduler.
    DutySim(DutySimArgs),
}

#[derive(Subcommand, Debug)]
pub enum BudgetsCommand {
    /// Validate the file and print the parsed budgets as JSON.
    Check {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct DutySimArgs {
    /// Idle-segment admission rate (0 = unlimited).
    #[arg(long, default_value_t = 2.0)]
    pub idle_hz: f64,

    /// Active-segment admission rate (0 = unlimited).
    #[arg(long, default_value_t = 0.0)]
    pub active_hz: f64,

    /// Interval between simulated requests.
    #[arg(long, default_value_t = 100)]
    pub tick_ms: u64,

    /// Comma-separated `<seconds>:<idle|active>` segments.
    #[arg(long, default_value = DEFAULT_TIMELINE)]
    pub timeline: String,

    /// Also run with duty cycling off and report the admitted ratio.
    #[arg(long)]
    pub baseline: bool,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Simulation(#[from] DutySimError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Runs one command and returns the text to print on stdout.
pub fn execute(cli: &Cli) -> Result<String, ToolError> {
    let value = match &cli.command {
        Commands::Budgets(BudgetsCommand::Check { path }) => check_budgets(path)?,
        Commands::DutySim(args) => run_duty_sim(args)?,
    };
    Ok(serde_json::to_string_pretty(&value)?)
}

pub fn check_budgets(path: &Path) -> Result<Value, ToolError> {
    let cfg = UxBudgetsConfig::load(path)?;
    let hs = cfg.handshake;
    let gesture = cfg.gesture_detection.map(|g| {
        json!({
            "false_positive_cap": g.false_positive_cap,
            "false_negative_cap": g.false_negative_cap,
        })
    });
    Ok(json!({
        "path": path.display().to_string(),
        "handshake": {
            "degrade_p50_s": hs.degrade_p50().as_secs_f64(),
            "degrade_p95_s": hs.degrade_p95().as_secs_f64(),
            "reconnect_p50_s": hs.reconnect_p50().as_secs_f64(),
            "reconnect_p95_s": hs.reconnect_p95().as_secs_f64(),
        },
        "gesture_detection": gesture,
    }))
}

pub fn run_duty_sim(args: &DutySimArgs) -> Result<Value, ToolError> {
    let config = DutySimConfig {
        idle_hz: args.idle_hz,
        active_hz: args.active_hz,
        tick_ms: args.tick_ms,
        timeline: parse_timeline(&args.timeline)?,
    };
    debug!(segments = config.timeline.len(), "running duty-cycle simulation");
    let report = duty_sim::run(&config)?;
    if !args.baseline {
        return Ok(json!({ "config": config, "report": report }));
    }
    let baseline = duty_sim::run(&DutySimConfig {
        idle_hz: 0.0,
        active_hz: 0.0,
        ..config.clone()
    })?;
    Ok(json!({
        "config": config,
        "report": report,
        "baseline": baseline,
        "admitted_vs_baseline": ratio(&report, &baseline),
    }))
}

fn ratio(report: &DutySimReport, baseline: &DutySimReport) -> f64 {
    if baseline.admitted == 0 {
        return 0.0;
    }
    report.admitted as f64 / baseline.admitted as f64
}
