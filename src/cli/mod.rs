pub mod policy;
pub mod run;
pub mod screen;

use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::policy::PolicyStore;

#[derive(Parser)]
#[command(name = "watchbox")]
#[command(author, version, about = "Sandboxed script execution with adaptive resource governance")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "WATCHBOX_CONFIG")]
    pub config: Option<String>,

    /// Path to the policy document (defaults to the built-in rule set)
    #[arg(short, long, global = true, env = "WATCHBOX_POLICY")]
    pub policy: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Screen a script and execute it in the sandbox
    Run(run::RunArgs),

    /// Screen a script without executing it
    Screen(screen::ScreenArgs),

    /// Policy management
    Policy(policy::PolicyArgs),
}

pub fn load_config(path: Option<&str>) -> Result<Config> {
    Config::load(path.map(Path::new))
}

pub fn load_policy_store(path: Option<&str>) -> Result<PolicyStore> {
    match path {
        Some(path) => Ok(PolicyStore::load(path)?),
        None => Ok(PolicyStore::builtin()),
    }
}
