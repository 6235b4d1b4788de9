// ABOUTME: Command line argument definitions and parsing using Clap
// ABOUTME: Defines the main CLI structure and subcommands for phaseflow

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::graph::Phase;

#[derive(Parser)]
#[command(name = "phaseflow")]
#[command(about = "Dependency-driven workflow engine with phase gates and interface contracts")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Path to configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Disable colored output")]
    pub no_color: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a workflow graph without executing it
    Validate {
        #[arg(help = "Path to workflow graph YAML file")]
        graph: PathBuf,
    },

    /// Show the wave layout a graph would run in if every node succeeds
    Plan {
        #[arg(help = "Path to workflow graph YAML file")]
        graph: PathBuf,

        #[arg(long, help = "Print the plan as JSON")]
        json: bool,
    },

    /// Print the quality thresholds a phase must meet per iteration
    Thresholds {
        #[arg(help = "Delivery phase", value_parser = parse_phase)]
        phase: Phase,

        #[arg(short, long, help = "Number of iterations to show (defaults to max_iterations)")]
        iterations: Option<u32>,
    },

    /// Summarize a persisted run
    Inspect {
        #[arg(help = "Run id")]
        run_id: String,

        #[arg(long, help = "State directory (overrides config)")]
        state_dir: Option<PathBuf>,

        #[arg(long, help = "Print the full run state as JSON")]
        json: bool,
    },
}

fn parse_phase(value: &str) -> Result<Phase, String> {
    value.parse()
}

impl Args {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
