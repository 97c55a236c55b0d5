use anyhow::{anyhow, Context, Result};
use clap::Parser;
use config::{Config, Environment, File as ConfigFile};
use peertalk_network::{Message, Notification, PeerTalkClient, PeerTalkConfig};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod console;
mod version;

use console::{parse_endpoint, parse_line, ConsoleCommand, HELP};
use version::{git_commit_hash, PEERTALK_VERSION};

#[derive(Parser, Debug)]
#[command(name = "peertalk-node", version = PEERTALK_VERSION, about = "PeerTalk discovery node")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// UDP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind, defaults to all interfaces
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Capacity of the pending and trusted peer sets
    #[arg(long)]
    peer_limit: Option<usize>,

    /// Peer to contact at startup (repeatable)
    #[arg(long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<String>,

    #[arg(long)]
    log_level: Option<String>,

    /// `pretty` or `plain`
    #[arg(long)]
    log_format: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct AppConfig {
    network: PeerTalkConfig,
    listen_port: Option<u16>,
    bind_address: Option<IpAddr>,
    bootstrap_peers: Vec<String>,
    log_level: String,
    log_format: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            network: PeerTalkConfig::default(),
            listen_port: None,
            bind_address: None,
            bootstrap_peers: Vec::new(),
            log_level: "info".to_string(),
            log_format: "plain".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from an optional TOML file, then `PEERTALK_*` environment overrides.
    ///
    /// Nested keys use a double underscore, e.g. `PEERTALK_NETWORK__PEER_LIMIT`.
    fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                anyhow::bail!(
                    "Configuration file {} not found (specified via --config)",
                    path.display()
                );
            }
            builder = builder.add_source(ConfigFile::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("PEERTALK")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("bootstrap_peers"),
        );

        builder
            .build()?
            .try_deserialize()
            .context("invalid configuration")
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(port) = cli.port {
            self.listen_port = Some(port);
        }
        if let Some(bind) = cli.bind {
            self.bind_address = Some(bind);
        }
        if let Some(limit) = cli.peer_limit {
            self.network.peer_limit = limit;
            self.network.sample_limit = self.network.sample_limit.min(limit);
        }
        self.bootstrap_peers.extend(cli.bootstrap.iter().cloned());
        if let Some(level) = &cli.log_level {
            self.log_level = level.clone();
        }
        if let Some(format) = &cli.log_format {
            self.log_format = format.clone();
        }
    }
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // Logs go to stderr so console output stays readable.
    if config.log_format == "pretty" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref())?;
    config.apply_cli(&cli);
    config
        .network
        .validate()
        .map_err(|err| anyhow!("invalid network configuration: {}", err))?;

    init_logging(&config)?;
    info!(
        "Starting peertalk-node {} (commit {})",
        PEERTALK_VERSION,
        git_commit_hash()
    );

    let default_port = config.network.default_port;
    let client = Arc::new(PeerTalkClient::new(config.network.clone())?);
    let local_addr = client
        .listen(config.listen_port, config.bind_address)
        .await
        .context("failed to bind PeerTalk socket")?;
    client.start()?;
    let mut notifications = client
        .take_notifications()
        .context("notification stream already taken")?;

    for raw in &config.bootstrap_peers {
        match parse_endpoint(raw, default_port) {
            Ok(endpoint) => {
                client.add_bootstrap_peer(&endpoint)?;
                if let Err(err) = client.ping(&endpoint).await {
                    warn!("Failed to ping bootstrap peer {}: {}", endpoint, err);
                }
            }
            Err(err) => warn!("Skipping bootstrap peer {:?}: {}", raw, err),
        }
    }

    println!("Listening on {}", local_addr);
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_line(&line, default_port) {
                    Ok(Some(command)) => {
                        if !run_command(&client, command).await {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => println!("{}", err),
                }
            }
            notification = notifications.recv() => {
                match notification {
                    Some(Notification::Closed) | None => break,
                    Some(notification) => report(notification),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    client.close();
    info!("peertalk-node stopped");
    Ok(())
}

/// Execute one console command. Returns `false` when the node should stop.
async fn run_command(client: &PeerTalkClient, command: ConsoleCommand) -> bool {
    let result = match command {
        ConsoleCommand::Quit => return false,
        ConsoleCommand::Peers => {
            for endpoint in client.trusted_peers() {
                println!("trusted {}", endpoint);
            }
            for endpoint in client.pending_peers() {
                println!("pending {}", endpoint);
            }
            Ok(0)
        }
        ConsoleCommand::Metrics => {
            println!("{:?}", client.socket().metrics().snapshot());
            Ok(0)
        }
        ConsoleCommand::Ping(to) => client.ping(&to).await,
        ConsoleCommand::Boot { to, count } => client.request_peers(&to, count).await,
        ConsoleCommand::Send { to, text } => client.send(&Message::text("msg", text), &to).await,
    };

    if let Err(err) = result {
        println!("send failed: {}", err);
    }
    true
}

fn report(notification: Notification) {
    match notification {
        Notification::Message {
            command,
            message,
            from,
        } => match message.text {
            Some(text) => println!("{} [{}] {}", from, message.query, text),
            None => println!("{} {}", from, command),
        },
        Notification::DecodeError { from, error } => println!("{} sent garbage: {}", from, error),
        Notification::SendFailed { to, error } => println!("reply to {} failed: {}", to, error),
        Notification::Fatal(error) => println!("socket failed: {}", error),
        Notification::Closed => println!("socket closed"),
    }
}
