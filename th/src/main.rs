use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, info};

use rowstore::RowSet;
use tabhub::cli::{Cli, Command, NodeLine, OutputFormat, get_log_path, parse_node_line};
use tabhub::config::Config;
use tabhub::hub::{ContextMessage, Hub, HubMessage};
use tabhub::ipc::codec::{Frame, read_frame, write_frame};
use tabhub::ipc;
use tabhub::node::ClientNode;
use tabhub::store::StoreHandler;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Priority: CLI --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let socket_path = cli.socket.clone().unwrap_or_else(|| config.socket_path());

    debug!(command = ?cli.command, ?socket_path, "main: dispatching command");
    match cli.command {
        Command::Serve { max_concurrency } => cmd_serve(&config, &socket_path, max_concurrency).await,
        Command::Node { db } => cmd_node(&config, &socket_path, db).await,
        Command::Exec { sql, format } => cmd_exec(&config, &socket_path, &sql, format).await,
        Command::Broadcast { event_type, payload } => cmd_broadcast(&socket_path, &event_type, &payload).await,
    }
}

/// Run the hub until Ctrl-C
async fn cmd_serve(config: &Config, socket_path: &Path, max_concurrency: Option<usize>) -> Result<()> {
    debug!(?max_concurrency, "cmd_serve: called");
    let mut hub_config = config.hub.clone();
    if let Some(max) = max_concurrency {
        hub_config.max_concurrency = max;
    }

    let (listener, socket_path) = ipc::create_listener_at(socket_path)?;
    let hub = Hub::new(hub_config);
    let handle = hub.handle();
    let hub_task = tokio::spawn(hub.run());
    let serve_task = tokio::spawn(ipc::serve(listener, handle.clone()));

    println!("{} listening on {}", "Hub".green().bold(), socket_path.display());
    info!(?socket_path, "Hub serving");

    tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl-C")?;
    println!("Shutting down...");

    handle.shutdown().await?;
    hub_task.await.context("Hub task failed")?;
    serve_task.abort();
    ipc::cleanup_socket(&socket_path);
    Ok(())
}

/// Join as a context and execute stdin lines
async fn cmd_node(config: &Config, socket_path: &Path, db: Option<PathBuf>) -> Result<()> {
    let db_path = db.or_else(|| config.store.db_path.clone());
    debug!(?db_path, "cmd_node: called");

    let channel = ipc::connect(socket_path).await?;
    let node = ClientNode::builder()
        .with_handler(Arc::new(StoreHandler::new(db_path)))
        .with_timeout(config.node.request_timeout())
        .on_broadcast(|event| {
            println!("{} {} {}", "broadcast".cyan(), event.event_type.bold(), event.payload);
        })
        .connect(channel)
        .await?;
    println!("Connected as context {}", node.context_id().to_string().bold());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        match parse_node_line(&line) {
            NodeLine::Blank => continue,
            NodeLine::Exec(sql) => match node.exec(&sql).await {
                Ok(value) => print_result(&value, OutputFormat::Text)?,
                Err(e) => eprintln!("{} {}", "error:".red().bold(), e),
            },
            NodeLine::Broadcast { event_type, payload } => match serde_json::from_str::<Value>(&payload) {
                Ok(payload) => node.broadcast(&event_type, payload).await?,
                Err(e) => eprintln!("{} invalid JSON payload: {}", "error:".red().bold(), e),
            },
        }
    }

    node.disconnect();
    Ok(())
}

/// Execute one statement through the owner
async fn cmd_exec(config: &Config, socket_path: &Path, sql: &str, format: OutputFormat) -> Result<()> {
    debug!(%sql, "cmd_exec: called");
    let channel = ipc::connect(socket_path).await?;
    let node = ClientNode::builder()
        .with_timeout(config.node.request_timeout())
        .connect(channel)
        .await?;

    let value = node.exec(sql).await.map_err(|e| eyre!("{}", e))?;
    print_result(&value, format)
}

/// Send one broadcast and leave
async fn cmd_broadcast(socket_path: &Path, event_type: &str, payload: &str) -> Result<()> {
    debug!(%event_type, "cmd_broadcast: called");
    let payload: Value = serde_json::from_str(payload).context("Payload must be JSON")?;

    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("Failed to connect to hub at {}", socket_path.display()))?;
    let (read_half, mut write_half) = stream.into_split();

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    match read_frame::<_, HubMessage>(&mut reader, &mut line).await? {
        Frame::Message(HubMessage::Welcome { context_id }) => debug!(context_id, "cmd_broadcast: welcomed"),
        other => return Err(eyre!("Unexpected greeting from hub: {:?}", other)),
    }

    write_frame(
        &mut write_half,
        &ContextMessage::Broadcast {
            event_type: event_type.to_string(),
            payload,
        },
    )
    .await?;

    println!("Broadcast {} sent", event_type.bold());
    Ok(())
}

fn print_result(value: &Value, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Text => match serde_json::from_value::<RowSet>(value.clone()) {
            Ok(rows) if !rows.columns.is_empty() => {
                println!("{}", rows.columns.join("\t").bold());
                for row in &rows.rows {
                    let cells: Vec<String> = row
                        .iter()
                        .map(|v| match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect();
                    println!("{}", cells.join("\t"));
                }
                println!("{}", format!("({} rows)", rows.rows.len()).dimmed());
            }
            Ok(rows) => println!("{} row(s) changed", rows.changes),
            Err(_) => println!("{}", value),
        },
    }
    Ok(())
}
