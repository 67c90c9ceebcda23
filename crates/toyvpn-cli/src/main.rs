//! ToyVpn CLI - control the VPN tunnel daemon

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use toyvpn_cli::daemon;
use toyvpn_cli::ipc::{IpcClient, IpcRequest, IpcResponse};
use toyvpn_cli::{ConfigError, ConfigStore, RetryPolicy};
use toyvpn_proto::{AppRouting, ConnectionConfig, ServiceRequest};

/// ToyVpn - connect this machine to a ToyVpn server
#[derive(Parser, Debug)]
#[command(name = "toyvpn")]
#[command(about = "Manage a ToyVpn tunnel", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding the connection profile and daemon socket
    #[arg(long, global = true, env = "TOYVPN_HOME")]
    config_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tunnel daemon in the foreground
    Daemon {
        /// Reconnect automatically with exponential backoff
        #[arg(long)]
        retry: bool,
        /// Give up after this many retries in a row (default: never)
        #[arg(long, requires = "retry")]
        max_retries: Option<u32>,
        /// Connect as soon as the daemon is up
        #[arg(long)]
        connect: bool,
    },
    /// Ask the daemon to connect with the stored profile
    Connect,
    /// Ask the daemon to disconnect
    Disconnect,
    /// Show the daemon's link status
    Status,
    /// Send a legacy start/stop action (e.g. com.aram.vpn.START)
    Action {
        action: String,
    },
    /// Stop the daemon
    Shutdown,
    /// Manage the connection profile
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Write the connection profile
    Set {
        /// VPN server host name or address
        #[arg(long)]
        server: String,
        /// VPN server port
        #[arg(long)]
        port: u16,
        /// Shared secret
        #[arg(long, env = "TOYVPN_SECRET")]
        secret: String,
        /// Route only these applications through the tunnel
        #[arg(long = "allow", conflicts_with = "disallow")]
        allow: Vec<String>,
        /// Route every application except these through the tunnel
        #[arg(long = "disallow")]
        disallow: Vec<String>,
        /// HTTP proxy host used to reach the server
        #[arg(long, requires = "proxy_port")]
        proxy_host: Option<String>,
        /// HTTP proxy port
        #[arg(long, requires = "proxy_host")]
        proxy_port: Option<u16>,
    },
    /// Print the connection profile (secret redacted)
    Show,
    /// Delete the connection profile
    Clear,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level)?;

    let store = match cli.config_dir {
        Some(dir) => ConfigStore::with_base_dir(dir),
        None => ConfigStore::new()?,
    };

    match cli.command {
        Commands::Daemon {
            retry,
            max_retries,
            connect,
        } => {
            let policy = if retry {
                RetryPolicy::enabled().with_max_attempts(max_retries)
            } else {
                RetryPolicy::default()
            };
            daemon::run(store, policy, connect).await
        }
        Commands::Connect => send(&store, IpcRequest::Connect).await,
        Commands::Disconnect => send(&store, IpcRequest::Disconnect).await,
        Commands::Status => send(&store, IpcRequest::Status).await,
        Commands::Shutdown => send(&store, IpcRequest::Shutdown).await,
        Commands::Action { action } => {
            let request = match action.parse::<ServiceRequest>() {
                Ok(ServiceRequest::Connect) => IpcRequest::Connect,
                Ok(ServiceRequest::Disconnect) => IpcRequest::Disconnect,
                Err(e) => {
                    warn!("Ignoring request: {}", e);
                    return Ok(());
                }
            };
            send(&store, request).await
        }
        Commands::Config { command } => handle_config_command(&store, command),
    }
}

/// Send one request to the daemon and print the reply
async fn send(store: &ConfigStore, request: IpcRequest) -> Result<()> {
    let socket = store.socket_path();
    let mut client = IpcClient::connect_to(&socket)
        .await
        .context("Is the daemon running? Start it with `toyvpn daemon`")?;

    match client.request(&request).await? {
        IpcResponse::Ok { message } => {
            println!("{}", message.unwrap_or_else(|| "OK".to_string()));
        }
        IpcResponse::Status { status } => println!("{}", status),
        IpcResponse::Pong => println!("pong"),
        IpcResponse::Error { message } => anyhow::bail!(message),
    }
    Ok(())
}

fn handle_config_command(store: &ConfigStore, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Set {
            server,
            port,
            secret,
            allow,
            disallow,
            proxy_host,
            proxy_port,
        } => {
            let routing = if disallow.is_empty() {
                AppRouting::Allow(allow.into_iter().collect::<BTreeSet<_>>())
            } else {
                AppRouting::Disallow(disallow.into_iter().collect())
            };

            let mut builder = ConnectionConfig::builder()
                .server(server, port)
                .shared_secret(secret)
                .routing(routing);
            if let (Some(host), Some(port)) = (proxy_host, proxy_port) {
                builder = builder.proxy(host, port);
            }
            let config = builder.build()?;

            store.save(&config)?;
            println!("Saved connection profile to {:?}", store.config_path());
        }
        ConfigCommands::Show => match store.load() {
            Ok(config) => {
                println!("Server:  {}", config.server_endpoint());
                println!("Secret:  <{} bytes>", config.shared_secret.len());
                match &config.routing {
                    AppRouting::Allow(apps) if apps.is_empty() => {
                        println!("Routing: all applications")
                    }
                    AppRouting::Allow(apps) => println!("Routing: only {}", join(apps)),
                    AppRouting::Disallow(apps) => println!("Routing: all except {}", join(apps)),
                }
                if let Some(proxy) = &config.proxy {
                    println!("Proxy:   {}", proxy.address());
                }
            }
            Err(ConfigError::NotConfigured(_)) => {
                println!("No connection profile. Create one with `toyvpn config set`.");
            }
            Err(e) => return Err(e.into()),
        },
        ConfigCommands::Clear => {
            store.clear()?;
            println!("Connection profile removed");
        }
    }
    Ok(())
}

fn join(apps: &BTreeSet<String>) -> String {
    apps.iter().cloned().collect::<Vec<_>>().join(", ")
}
