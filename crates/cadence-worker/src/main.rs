//! Cadence CLI and worker entry point.
//!
//! Binary name: `cadence`
//!
//! Parses CLI arguments, loads configuration, initializes logging and the
//! database, then dispatches to the command handler or starts the worker.

mod cli;
mod state;

use clap::Parser;

use cadence_observe::tracing_setup::{LogFormat, init_tracing, shutdown_tracing};
use cli::{Cli, Commands};
use state::{AppState, load_config};

/// Default log filter for the given verbosity, used when `RUST_LOG` is unset.
fn default_filter(verbose: u8, quiet: bool) -> &'static str {
    match verbose {
        0 if quiet => "error",
        0 => "warn,cadence=info",
        1 => "info,cadence_core=debug,cadence_infra=debug,cadence=debug",
        _ => "trace",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.clone()).await?;
    let format = if config.telemetry.json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    if let Err(e) = init_tracing(
        default_filter(cli.verbose, cli.quiet),
        format,
        config.telemetry.otel,
    ) {
        eprintln!("Warning: failed to initialize logging: {e}");
    }

    let state = AppState::from_config(config).await?;

    let result = match cli.command {
        Commands::Flow { command } => cli::flow::handle_flow_command(command, &state, cli.json).await,
        Commands::Start {
            flow,
            subject,
            trigger,
            vars,
        } => {
            cli::execution::handle_start(&flow, &subject, &trigger, vars.as_deref(), &state, cli.json)
                .await
        }
        Commands::Status {
            execution_id,
            limit,
        } => cli::execution::handle_status(execution_id.as_deref(), limit, &state, cli.json).await,
        Commands::Logs { execution_id } => {
            cli::execution::handle_logs(&execution_id, &state, cli.json).await
        }
        Commands::Run {
            consumers,
            no_stdin,
        } => cli::run::handle_run(&state, consumers, !no_stdin).await,
    };

    shutdown_tracing();
    result
}
