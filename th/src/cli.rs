//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// TabHub - one owner for a shared resource, many contexts
#[derive(Parser)]
#[command(
    name = "th",
    about = "Coordination hub electing one owner context for a shared store",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Socket path (overrides config)
    #[arg(short, long, global = true, help = "Hub socket path")]
    pub socket: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the hub in the foreground
    Serve {
        /// Max routed calls in flight (overrides config)
        #[arg(short, long)]
        max_concurrency: Option<usize>,
    },

    /// Join the hub as a long-lived context reading commands from stdin
    ///
    /// Each line is SQL to execute, or `!TYPE [JSON]` to broadcast.
    Node {
        /// Database file used if this node is elected (overrides config)
        #[arg(short, long)]
        db: Option<PathBuf>,
    },

    /// Execute one SQL statement through the current owner
    Exec {
        /// SQL to execute
        sql: String,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Send a broadcast to every connected context
    Broadcast {
        /// Event type
        #[arg(value_name = "TYPE")]
        event_type: String,

        /// JSON payload
        #[arg(default_value = "null")]
        payload: String,
    },
}

/// Output format for results
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// A line typed into `th node`
#[derive(Debug, Clone, PartialEq)]
pub enum NodeLine {
    Exec(String),
    Broadcast { event_type: String, payload: String },
    Blank,
}

/// Parse one stdin line for `th node`
pub fn parse_node_line(line: &str) -> NodeLine {
    debug!(%line, "parse_node_line: called");
    let line = line.trim();
    if line.is_empty() {
        return NodeLine::Blank;
    }

    match line.strip_prefix('!') {
        Some(rest) => {
            let (event_type, payload) = match rest.split_once(char::is_whitespace) {
                Some((event_type, payload)) => (event_type, payload.trim()),
                None => (rest, "null"),
            };
            NodeLine::Broadcast {
                event_type: event_type.to_string(),
                payload: payload.to_string(),
            }
        }
        None => NodeLine::Exec(line.to_string()),
    }
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tabhub")
        .join("logs")
        .join("tabhub.log")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_exec_with_global_flags() {
        let cli = Cli::try_parse_from(["th", "exec", "SELECT 1", "--socket", "/tmp/x.sock", "-f", "json"]).unwrap();
        assert_eq!(cli.socket, Some(PathBuf::from("/tmp/x.sock")));
        match cli.command {
            Command::Exec { sql, format } => {
                assert_eq!(sql, "SELECT 1");
                assert!(matches!(format, OutputFormat::Json));
            }
            other => panic!("Expected exec, got {:?}", other),
        }
    }

    #[test]
    fn test_broadcast_payload_defaults_to_null() {
        let cli = Cli::try_parse_from(["th", "broadcast", "table-changed"]).unwrap();
        match cli.command {
            Command::Broadcast { event_type, payload } => {
                assert_eq!(event_type, "table-changed");
                assert_eq!(payload, "null");
            }
            other => panic!("Expected broadcast, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_node_lines() {
        assert_eq!(parse_node_line("   "), NodeLine::Blank);
        assert_eq!(
            parse_node_line("SELECT * FROM users"),
            NodeLine::Exec("SELECT * FROM users".to_string())
        );
        assert_eq!(
            parse_node_line("!table-changed {\"table\": \"users\"}"),
            NodeLine::Broadcast {
                event_type: "table-changed".to_string(),
                payload: "{\"table\": \"users\"}".to_string(),
            }
        );
        assert_eq!(
            parse_node_line("!ping"),
            NodeLine::Broadcast {
                event_type: "ping".to_string(),
                payload: "null".to_string(),
            }
        );
    }

    #[test]
    fn test_log_path() {
        assert!(get_log_path().ends_with("tabhub/logs/tabhub.log"));
    }
}
