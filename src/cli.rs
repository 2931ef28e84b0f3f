//! Command-line interface for guestnet
//!
//! Uses clap with derive for type-safe CLI parsing

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// guestnet - guest network device manager
#[derive(Parser)]
#[command(name = "guestnet")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file path (stock layout when omitted)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Validate configuration
    Check,

    /// Show the devices a host interface list would produce
    Plan {
        /// Output in JSON format
        #[arg(long)]
        json: bool,

        /// Host interfaces in enumeration order
        ifnames: Vec<String>,
    },

    /// Run the dispatcher against a simulated datapath
    Run {
        /// Event script (stdin when omitted)
        #[arg(short, long)]
        script: Option<PathBuf>,

        /// Print device tables in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts
    Completion {
        /// Shell to generate completion for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Generate shell completion scripts
    pub fn generate_completion(shell: Shell) {
        let mut cmd = Self::command();
        clap_complete::generate(shell, &mut cmd, "guestnet", &mut std::io::stdout());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_plan() {
        let cli = Cli::try_parse_from(["guestnet", "plan", "--json", "eth0", "wlan0"]).unwrap();
        match cli.command {
            Commands::Plan { json, ifnames } => {
                assert!(json);
                assert_eq!(ifnames, vec!["eth0", "wlan0"]);
            }
            _ => panic!("expected plan"),
        }
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from(["guestnet", "run", "-v", "--config", "net.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("net.toml")));
        assert!(matches!(cli.command, Commands::Run { script: None, json: false }));
    }
}
