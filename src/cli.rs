//! Command-line interface

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "honeypot")]
#[command(about = "Low-interaction TCP honeypot", long_about = None)]
pub struct Cli {
    /// Configuration file (optional; HONEYPOT_* environment variables also apply)
    #[arg(short, long, default_value = "config.toml", global = true)]
    pub config: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Listen on the given ports until stopped
    Start {
        /// Comma-separated ports, overriding `listener.ports`
        #[arg(short, long, value_delimiter = ',')]
        ports: Vec<u16>,

        /// Run in the background and return immediately
        #[arg(short, long)]
        detach: bool,
    },
    /// Stop a running honeypot through its control port
    Stop,
    /// Print recently recorded events as JSON lines
    Events {
        #[arg(short, long, default_value_t = 50)]
        limit: i32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_ports() {
        let cli = Cli::parse_from(["honeypot", "start", "--ports", "2121,2222,2121"]);
        match cli.command {
            Command::Start { ports, detach } => {
                assert_eq!(ports, vec![2121, 2222, 2121]);
                assert!(!detach);
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert_eq!(cli.config, "config.toml");
    }

    #[test]
    fn test_parse_stop_with_config() {
        let cli = Cli::parse_from(["honeypot", "stop", "--config", "/etc/honeypot.toml"]);
        assert!(matches!(cli.command, Command::Stop));
        assert_eq!(cli.config, "/etc/honeypot.toml");
    }

    #[test]
    fn test_rejects_invalid_port() {
        assert!(Cli::try_parse_from(["honeypot", "start", "--ports", "70000"]).is_err());
    }
}
