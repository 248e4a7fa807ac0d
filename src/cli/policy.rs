use anyhow::Result;
use clap::{Args, Subcommand};

use crate::policy::Policy;

#[derive(Args)]
pub struct PolicyArgs {
    #[command(subcommand)]
    pub command: PolicyCommands,
}

#[derive(Subcommand)]
pub enum PolicyCommands {
    /// Validate a policy document and report its version
    Validate { file: String },

    /// Print the active policy as JSON
    Show,
}

pub async fn run(args: PolicyArgs, policy_path: Option<&str>) -> Result<()> {
    match args.command {
        PolicyCommands::Validate { file } => {
            let policy = Policy::load(std::path::Path::new(&file))?;
            println!(
                "ok: version {}, {} signature rules",
                policy.version,
                policy.rules().len()
            );
            Ok(())
        }
        PolicyCommands::Show => {
            let store = super::load_policy_store(policy_path)?;
            println!("{}", store.snapshot().to_json()?);
            Ok(())
        }
    }
}
