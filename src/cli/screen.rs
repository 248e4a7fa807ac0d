use std::io::Read;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use crate::screen::screen;
use crate::submission::{ResourceRequest, Submission};

#[derive(Args)]
pub struct ScreenArgs {
    /// Script file to screen ("-" reads stdin)
    pub file: String,
}

pub async fn run(args: ScreenArgs, policy_path: Option<&str>) -> Result<()> {
    let store = super::load_policy_store(policy_path)?;
    let policy = store.snapshot();

    let source = if args.file == "-" {
        let mut source = String::new();
        std::io::stdin()
            .read_to_string(&mut source)
            .context("read script from stdin")?;
        source
    } else {
        std::fs::read_to_string(&args.file).with_context(|| format!("read script {}", args.file))?
    };

    // Screening only looks at the source; the budget is a placeholder.
    let submission = Submission::new(
        source,
        ResourceRequest {
            cpu_percent: 50,
            memory_mb: 256,
            time_limit: Duration::from_secs(30),
        },
    );

    let verdict = screen(&submission, &policy)?;
    println!("{}", serde_json::to_string_pretty(&verdict)?);

    std::process::exit(if verdict.allowed { 0 } else { 2 });
}
