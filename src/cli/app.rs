// ABOUTME: Main application orchestration for the phaseflow CLI
// ABOUTME: Coordinates between CLI arguments, configuration, and command execution

use anyhow::Result;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use super::commands;
use super::{Args, Commands, Config};

pub struct App {
    config: Config,
}

impl App {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Initialize logging based on configuration
    pub fn init_logging(&self, verbose: bool, no_color: bool) -> Result<()> {
        let log_level = if verbose {
            "debug"
        } else {
            &self.config.logging.level
        };

        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(!no_color)
            .with_target(false)
            .with_writer(std::io::stderr);

        let installed = match self.config.logging.format.as_str() {
            "compact" => builder.compact().try_init(),
            _ => builder.try_init(),
        };
        installed.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

        debug!("Logging initialized with level: {}", log_level);
        Ok(())
    }

    /// Run the application with parsed arguments
    pub async fn run(&mut self, args: Args) -> Result<()> {
        self.init_logging(args.verbose, args.no_color)?;

        info!("Starting phaseflow v{}", env!("CARGO_PKG_VERSION"));
        debug!("Configuration loaded from: {:?}", args.config);

        match args.command {
            Commands::Validate { graph } => commands::validate_graph(graph).await,

            Commands::Plan { graph, json } => commands::plan_graph(graph, json).await,

            Commands::Thresholds { phase, iterations } => commands::show_thresholds(
                phase,
                iterations.unwrap_or(self.config.max_iterations),
                &self.config,
            ),

            Commands::Inspect {
                run_id,
                state_dir,
                json,
            } => commands::inspect_run(run_id, state_dir, json, &self.config).await,
        }
    }

    /// Load configuration named by the parsed arguments
    pub fn from_args(args: &Args) -> Result<Self> {
        let config = Config::load(args.config.clone())?;
        Ok(Self::new(config))
    }
}
