use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use crate::advisory::{AdvisoryCheck, HttpAdvisory};
use crate::runner::{RunReport, SessionRunner};
use crate::session::SessionStatus;
use crate::submission::{ResourceRequest, Submission};

#[derive(Args)]
pub struct RunArgs {
    /// Script file to execute ("-" reads stdin)
    pub file: String,

    /// CPU limit as a percentage of one core
    #[arg(long, default_value_t = 50)]
    pub cpu: u32,

    /// Memory limit in megabytes
    #[arg(long, default_value_t = 256)]
    pub memory: u32,

    /// Wall-clock budget in seconds
    #[arg(long, default_value_t = 30)]
    pub time_limit: u64,

    /// Emit the full run report as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: RunArgs, config_path: Option<&str>, policy_path: Option<&str>) -> Result<()> {
    let config = Arc::new(super::load_config(config_path)?);
    let store = super::load_policy_store(policy_path)?;
    let policy = store.snapshot();

    let source = read_source(&args.file)?;
    let submission = Submission::new(
        source,
        ResourceRequest {
            cpu_percent: args.cpu,
            memory_mb: args.memory,
            time_limit: Duration::from_secs(args.time_limit),
        },
    );

    let advisory: Option<Arc<dyn AdvisoryCheck>> = if config.advisory.enabled {
        Some(Arc::new(HttpAdvisory::new(&config.advisory)?))
    } else {
        None
    };

    let report = SessionRunner::new(config)
        .run(submission, policy, advisory)
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    std::process::exit(exit_code(&report));
}

fn read_source(file: &str) -> Result<String> {
    if file == "-" {
        let mut source = String::new();
        std::io::stdin()
            .read_to_string(&mut source)
            .context("read script from stdin")?;
        Ok(source)
    } else {
        std::fs::read_to_string(file).with_context(|| format!("read script {}", file))
    }
}

fn print_report(report: &RunReport) {
    if !report.verdict.allowed {
        println!("blocked: {}", report.verdict.reason);
        if let Some(rule) = &report.verdict.matched_rule {
            println!("matched rule: {}", rule);
        }
        return;
    }

    for line in &report.output {
        println!("{}", line.text);
    }

    match report.final_status {
        Some(SessionStatus::Completed) => println!("status: completed"),
        Some(SessionStatus::Terminated) => println!(
            "status: terminated ({})",
            report.termination_reason.as_deref().unwrap_or("no reason")
        ),
        Some(SessionStatus::Failed) => println!(
            "status: failed ({})",
            report.failure_cause.as_deref().unwrap_or("unknown cause")
        ),
        other => println!("status: {:?}", other),
    }

    if let Some(limits) = report.final_limits {
        println!(
            "final limits: cpu {}%, memory {} MB",
            limits.cpu_percent, limits.memory_mb
        );
    }
    if let Some(profile) = &report.profile {
        println!(
            "last classification: {:?}{}",
            profile.decision,
            profile
                .detected_pattern
                .as_deref()
                .map(|p| format!(" ({})", p))
                .unwrap_or_default()
        );
    }
}

fn exit_code(report: &RunReport) -> i32 {
    if !report.verdict.allowed {
        return 2;
    }
    match report.final_status {
        Some(SessionStatus::Completed) => 0,
        Some(SessionStatus::Terminated) => 3,
        Some(SessionStatus::Failed) => 4,
        _ => 1,
    }
}
