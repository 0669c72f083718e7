//! SafeTrail CLI: runs the gateway and offers one-shot helpers for chat,
//! classification, and configuration.

mod app;
mod gateway;

use clap::Parser;
use safetrail_core::config::{AgentConfig, load_config, user_config_path};
use safetrail_core::types::{Location, RequestContext};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// SafeTrail: a personal safety agent with monitoring and escalation
#[derive(Parser, Debug)]
#[command(name = "safetrail", version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the HTTP and WebSocket gateway
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Send one message to a user's agent and print the response
    Chat {
        user_id: String,
        message: String,
        #[arg(long, requires = "lng", allow_hyphen_values = true)]
        lat: Option<f64>,
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lng: Option<f64>,
    },
    /// Show the intent and urgency detected for a message
    Classify { text: String },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the user config file location
    Path,
    /// Check the effective configuration for invalid values
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref(), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = config.storage.log_dir();
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "safetrail.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    match cli.command {
        Commands::Serve { host, port } => serve(config, host, port).await,
        Commands::Chat {
            user_id,
            message,
            lat,
            lng,
        } => chat(config, &user_id, &message, lat.zip(lng)).await,
        Commands::Classify { text } => {
            let classification = safetrail_core::classify(&text);
            println!("{}", serde_json::to_string_pretty(&classification)?);
            Ok(())
        }
        Commands::Config { action } => handle_config(&config, action),
    }
}

async fn serve(
    mut config: AgentConfig,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.gateway.host = host;
    }
    if let Some(port) = port {
        config.gateway.port = port;
    }
    for problem in config.validate() {
        tracing::warn!(problem = %problem, "Configuration problem");
    }
    let gateway_config = config.gateway.clone();
    let sessions = app::build_session_manager(config)?;
    gateway::run(sessions, &gateway_config).await
}

async fn chat(
    config: AgentConfig,
    user_id: &str,
    message: &str,
    coordinates: Option<(f64, f64)>,
) -> anyhow::Result<()> {
    let sessions = app::build_session_manager(config)?;
    let context = RequestContext {
        current_location: coordinates.map(|(lat, lng)| Location::new(lat, lng)),
        ..RequestContext::default()
    };
    let response = sessions
        .process_conversation(user_id, message, context)
        .await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    // Flushes memory to disk before exit.
    sessions.end_session(user_id).await?;
    Ok(())
}

fn handle_config(config: &AgentConfig, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            print!("{}", config.to_toml_string()?);
        }
        ConfigAction::Path => match user_config_path() {
            Some(path) => println!("{}", path.display()),
            None => println!("No config directory available on this platform"),
        },
        ConfigAction::Validate => {
            let problems = config.validate();
            if problems.is_empty() {
                println!("Configuration is valid");
            } else {
                for problem in &problems {
                    println!("  - {}", problem);
                }
                anyhow::bail!("{} configuration problem(s)", problems.len());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_with_coordinates() {
        let cli = Cli::try_parse_from([
            "safetrail", "chat", "u1", "where am I", "--lat", "40.7", "--lng", "-74.0",
        ])
        .unwrap();
        match cli.command {
            Commands::Chat { user_id, lat, lng, .. } => {
                assert_eq!(user_id, "u1");
                assert_eq!(lat, Some(40.7));
                assert_eq!(lng, Some(-74.0));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_lat_requires_lng() {
        assert!(Cli::try_parse_from(["safetrail", "chat", "u1", "hi", "--lat", "1.0"]).is_err());
    }

    #[test]
    fn test_parse_serve_and_verbosity() {
        let cli = Cli::try_parse_from(["safetrail", "-vv", "serve", "--port", "9000"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Serve { port: Some(9000), host: None }));
    }

    #[test]
    fn test_parse_config_validate() {
        let cli = Cli::try_parse_from(["safetrail", "config", "validate"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config { action: ConfigAction::Validate }
        ));
    }

    #[test]
    fn test_handle_config_validate_defaults() {
        assert!(handle_config(&AgentConfig::default(), ConfigAction::Validate).is_ok());
    }
}
