use crate::pm::rpc::Response;
use clap::ValueEnum;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

/// Daemon arguments.
#[derive(Debug, Parser)]
#[command(name = "pipemaster", version, about = "pipemaster build/test/start supervisor")]
pub struct Args {
    /// Path to master config YAML
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    pub config: PathBuf,
}

/// Pipeline commands given on the command line. Unset flags keep their current value on update.
#[derive(Debug, Clone, Default, ClapArgs)]
pub struct CommandArgs {
    /// Long-lived helper started on hard restarts only
    #[arg(long)]
    pub init: Option<String>,
    /// Runs to completion before anything else; a failure aborts the restart
    #[arg(long)]
    pub build: Option<String>,
    #[arg(long)]
    pub test: Option<String>,
    #[arg(long)]
    pub start: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Register an application
    Create {
        id: String,
        /// Working directory (`local::remote` selects `remote`)
        path: String,
        #[command(flatten)]
        commands: CommandArgs,
        /// Enabled plugin (repeatable)
        #[arg(long = "plugin")]
        plugins: Vec<String>,
        /// Run a hard restart with command reset right after creating
        #[arg(long)]
        restart: bool,
    },
    /// Change an application's commands (applied on the next restart with --reset)
    Update {
        id: String,
        #[command(flatten)]
        commands: CommandArgs,
    },
    /// Kill everything an application runs and forget it
    Delete { id: String },
    /// Show one application
    Get {
        id: String,
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Show every application (default)
    List {
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Tear down and relaunch the pipeline
    Restart {
        id: String,
        /// Also relaunch init
        #[arg(long)]
        hard: bool,
        /// Take the current commands instead of the last committed ones
        #[arg(long)]
        reset: bool,
    },
    /// Kill build/test/start (and init with --include-init)
    Kill {
        id: String,
        #[arg(long = "include-init")]
        include_init: bool,
    },
    /// Listening sockets owned by the application, and those nobody owns
    Network {
        id: String,
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Show recent daemon events ("what happened")
    Events {
        /// Optional app id filter
        id: Option<String>,
        /// Number of events to show
        #[arg(short = 'n', default_value_t = 200)]
        n: usize,
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Show the daemon build
    Version,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

pub fn print_response(resp: &Response, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Text => println!("{}", resp.render_text().trim_end()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(resp)?),
    }
    Ok(())
}

pub fn print_message(resp: &Response) {
    if !resp.message.trim().is_empty() {
        println!("{}", resp.message.trim_end());
    }
}
