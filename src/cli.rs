//! Command-line interface definition for Pocketclaw
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands for serving surfaces, local chat, one-shot prompts,
//! session inspection and configuration checks.

use clap::{Parser, Subcommand};

/// Pocketclaw - embedded personal assistant runtime
///
/// Connects messaging surfaces to language-model backends and a small set
/// of sandboxed capabilities.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "pocketclaw")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "POCKETCLAW_CONFIG")]
    pub config: Option<String>,

    /// Enable verbose logging (forces debug level)
    #[arg(short, long)]
    pub verbose: bool,

    /// Override the primary inference backend
    #[arg(short, long)]
    pub backend: Option<String>,

    /// Override the log filter (e.g. "info", "pocketclaw=debug")
    #[arg(long)]
    pub log_level: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Serve every configured surface until interrupted
    Run,

    /// Chat with the agent on the local console
    Chat,

    /// Send a single prompt to the inference backends and print the answer
    Ask {
        /// Prompt text
        prompt: String,

        /// Print the answer incrementally as it is generated
        #[arg(short, long)]
        stream: bool,
    },

    /// Inspect stored sessions
    Sessions {
        /// Session subcommand
        #[command(subcommand)]
        command: SessionCommand,
    },

    /// Validate or print the effective configuration
    Config {
        /// Config subcommand
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

/// Session inspection subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum SessionCommand {
    /// List stored sessions
    List,

    /// Print one session's history
    Show {
        /// Session identifier
        id: String,
    },

    /// Delete sessions idle longer than the configured expiry
    Sweep,
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommand {
    /// Validate the configuration and exit
    Check,

    /// Print the effective configuration as YAML
    Show,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Configuration path, falling back to the default location
    pub fn config_path(&self) -> String {
        self.config
            .clone()
            .unwrap_or_else(|| "config/config.yaml".to_string())
    }
}
