//! CLI command definitions and dispatch for the `cadence` binary.
//!
//! Uses clap derive macros for argument parsing. One-shot commands talk to
//! the database directly; `cadence run` starts the worker.

pub mod execution;
pub mod flow;
pub mod run;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use flow::FlowCommand;

/// Durable conversational flow engine.
#[derive(Parser)]
#[command(name = "cadence", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the config file (default: {data_dir}/config.toml).
    #[arg(long, global = true, env = "CADENCE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage flow definitions.
    Flow {
        #[command(subcommand)]
        command: FlowCommand,
    },

    /// Start an execution of a flow for a subject.
    Start {
        /// Flow name or UUID.
        flow: String,

        /// Subject (conversation or contact) the execution acts for.
        subject: String,

        /// How the execution is started; `manual` and `keyword` supersede a
        /// running execution of the same flow.
        #[arg(long, default_value = "manual")]
        trigger: String,

        /// Initial context variables as a JSON object.
        #[arg(long)]
        vars: Option<String>,
    },

    /// Show an execution, or the most recent executions.
    Status {
        /// Execution UUID (omit to list recent executions).
        execution_id: Option<String>,

        /// Maximum number of executions to list.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show the step log of an execution.
    Logs {
        /// Execution UUID.
        execution_id: String,
    },

    /// Run the worker: consumer pool, schedulers and stdin input.
    Run {
        /// Number of queue consumer tasks (overrides config).
        #[arg(long)]
        consumers: Option<usize>,

        /// Do not read worker input from stdin.
        #[arg(long)]
        no_stdin: bool,
    },
}
