use anyhow::Result;
use clap::Parser;

use watchbox::cli::{self, Cli, Commands};

fn main() -> Result<()> {
    // argv[0] dispatch: if re-exec'd as "watchbox-sandbox", enter the sandbox
    // child path immediately — before Tokio, Clap, or any other
    // initialization.
    #[cfg(unix)]
    if let Some(arg0) = std::env::args_os().next()
        && arg0
            .to_string_lossy()
            .ends_with(watchbox::sandbox::CHILD_SENTINEL)
    {
        watchbox::sandbox::sandbox_child_main();
    }

    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let config_path = cli.config.clone();
    let policy_path = cli.policy.clone();

    match cli.command {
        Commands::Run(args) => {
            cli::run::run(args, config_path.as_deref(), policy_path.as_deref()).await
        }
        Commands::Screen(args) => cli::screen::run(args, policy_path.as_deref()).await,
        Commands::Policy(args) => cli::policy::run(args, policy_path.as_deref()).await,
    }
}
