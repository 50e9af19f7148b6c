//! Sigmesh - Peer-to-peer VPN rendezvous
//!
//! Command line tools for keys, overlay addresses, peer references and
//! configuration files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sigmesh::address;
use sigmesh::config::SigmeshConfig;
use sigmesh::crypto::{parse_key, KeyPair};
use sigmesh::device::render_peers;
use sigmesh::dns::{HttpsDoh, DEFAULT_DOH_SERVER};
use sigmesh::peer::{PeerResolver, DEFAULT_RESOLVE_TIMEOUT};

/// Sigmesh - Peer-to-peer VPN rendezvous
#[derive(Parser)]
#[command(name = "sigmesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "sigmesh.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to the configured level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new private key
    Genkey {
        /// Also write the private key to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the public key for a private key
    Pubkey {
        /// Private key (hex or base64); defaults to the configured key
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Print the overlay address owned by a public key
    Ip {
        /// Public key (hex or base64)
        pubkey: String,
    },

    /// Resolve peer references and print their device configuration
    Resolve {
        /// Peer references; defaults to the configured peers
        peers: Vec<String>,

        /// DNS over HTTPS server
        #[arg(long)]
        doh: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "sigmesh.toml")]
        output: PathBuf,

        /// Relay link to listen on (repeatable)
        #[arg(long = "link")]
        links: Vec<String>,
    },

    /// Validate configuration file
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = cli
        .log_level
        .clone()
        .or_else(|| configured_log_level(&cli.config))
        .unwrap_or_else(|| "info".to_string());
    init_logging(&level);

    match cli.command {
        Commands::Genkey { output } => run_genkey(output),
        Commands::Pubkey { key } => run_pubkey(&cli.config, key),
        Commands::Ip { pubkey } => run_ip(&pubkey),
        Commands::Resolve { peers, doh } => run_resolve(&cli.config, peers, doh).await,
        Commands::Init { output, links } => run_init(output, links),
        Commands::CheckConfig => run_check_config(&cli.config),
    }
}

fn configured_log_level(path: &Path) -> Option<String> {
    if !path.exists() {
        return None;
    }
    SigmeshConfig::from_file(path).ok().map(|c| c.logging.level)
}

fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: &Path) -> anyhow::Result<SigmeshConfig> {
    SigmeshConfig::from_file(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn run_genkey(output: Option<PathBuf>) -> anyhow::Result<()> {
    let key = KeyPair::generate();
    if let Some(path) = output {
        key.save(&path)?;
    }
    println!("{}", key.private_hex());
    eprintln!("public key: {} ({})", key.public_hex(), key.public_base64());
    Ok(())
}

fn run_pubkey(config_path: &Path, key: Option<String>) -> anyhow::Result<()> {
    let key = match key {
        Some(encoded) => KeyPair::parse(&encoded)?,
        None => load_config(config_path)?.keypair()?,
    };
    println!("{}", key.public_hex());
    Ok(())
}

fn run_ip(pubkey: &str) -> anyhow::Result<()> {
    let key = parse_key(pubkey).context("public key must be 32 bytes of hex or base64")?;
    println!("{}", address::derive(&key)?);
    Ok(())
}

async fn run_resolve(config_path: &Path, peers: Vec<String>, doh: Option<String>) -> anyhow::Result<()> {
    let (peers, doh, deadline) = if peers.is_empty() {
        let config = load_config(config_path)?;
        let doh = doh.unwrap_or_else(|| config.signaling.doh.clone());
        (config.peers.clone(), doh, config.resolve_timeout())
    } else {
        let doh = doh.unwrap_or_else(|| DEFAULT_DOH_SERVER.to_string());
        (peers, doh, DEFAULT_RESOLVE_TIMEOUT)
    };
    if peers.is_empty() {
        bail!("no peer references given");
    }

    let transport = HttpsDoh::new(&doh, deadline)?;
    let resolver = PeerResolver::new(Arc::new(transport));
    let resolved = match resolver.resolve_all(&peers, deadline).await {
        Ok(resolved) => resolved,
        Err(e) if e.is_input_error() => return Err(anyhow::Error::new(e).context("invalid peer reference")),
        Err(e) if e.is_retryable() => {
            return Err(anyhow::Error::new(e).context("peer resolution failed, try again later"))
        }
        Err(e) => return Err(anyhow::Error::new(e).context("peer resolution failed")),
    };

    print!("{}", render_peers(&resolved));
    Ok(())
}

fn run_init(output: PathBuf, links: Vec<String>) -> anyhow::Result<()> {
    if output.exists() {
        bail!("{} already exists", output.display());
    }

    let key = KeyPair::generate();
    let links = links
        .iter()
        .map(|l| format!("{:?}", l))
        .collect::<Vec<_>>()
        .join(", ");
    let config_content = format!(r#"# Sigmesh Configuration
# Generated configuration file

# peer://<pubkey>[/<preshared>][?keepalive=N]
# peer://<domain>[/<preshared>][?keepalive=N]
# https://relay/path?peer=<pubkey>[&preshared=<key>][&keepalive=N]
peers = []

[node]
private_key = "{private_key}"
listen_port = 0
mtu = 2320
tun = "sigmesh"
# kernel or userspace
mode = "kernel"

[signaling]
links = [{links}]
doh = "1.1.1.1"
request_timeout_secs = 10
reconnect_interval_ms = 1000
resolve_timeout_secs = 60

[logging]
level = "info"
"#, private_key = key.private_hex());

    // Refuse to write something that would not load back
    SigmeshConfig::from_str(&config_content)?;

    std::fs::write(&output, config_content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&output, std::fs::Permissions::from_mode(0o600))?;
    }
    println!("Configuration file created: {}", output.display());
    println!("Public key: {}", key.public_hex());
    println!("Overlay address: {}", address::derive(&key.public_bytes())?);
    Ok(())
}

fn run_check_config(config_path: &Path) -> anyhow::Result<()> {
    match SigmeshConfig::from_file(config_path) {
        Ok(config) => {
            let key = config.keypair()?;
            println!("✓ Configuration is valid");
            println!("  Public key: {}", key.public_hex());
            println!("  Overlay address: {}", address::derive(&key.public_bytes())?);
            println!("  Device: {} ({} mode, mtu {})", config.node.tun, config.node.mode, config.node.mtu);
            println!("  Relay links: {}", config.signaling.links.len());
            println!("  Peers: {}", config.peers.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}
