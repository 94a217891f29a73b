//! Conveyor command-line runner.
//!
//! Binary name: `conveyor`
//!
//! Loads engine configuration, installs the tracing subscriber and runs one
//! of the bundled demo workflows, printing the resulting context.

mod cli;

use clap::Parser;
use clap_complete::generate;
use tokio_util::sync::CancellationToken;

use cli::{Cli, Commands};
use conveyor_core::config::load_engine_config;
use conveyor_observe::tracing_setup::{init_tracing, shutdown_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions need neither config nor tracing
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "conveyor", &mut std::io::stdout());
        return Ok(());
    }

    let mut config = load_engine_config(&cli.config).await;
    match (cli.verbose, cli.quiet) {
        (0, true) => config.log.level = "error".to_string(),
        (0, false) => {}
        (1, _) => config.log.level = "info,conveyor_core=debug".to_string(),
        _ => config.log.level = "trace".to_string(),
    }
    init_tracing(&config.log).map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let result = match cli.command {
        Commands::Demo { which } => cli::demo::run(which, &config, &cancel, cli.json, cli.quiet).await,
        Commands::Completions { .. } => Ok(()),
    };

    shutdown_tracing();
    result
}
