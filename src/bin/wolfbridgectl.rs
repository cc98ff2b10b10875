//! WolfBridgeCtl - Inspect a WolfBridge state database
//!
//! Usage:
//!   wolfbridgectl status            - Device, server config and counts
//!   wolfbridgectl clients           - List clients
//!   wolfbridgectl export <pubkey>   - Print a client's configuration
//!   wolfbridgectl tunnels           - List multihop tunnels
//!   wolfbridgectl pool              - IP pool usage
//!
//! Reads the database directly; the bridge does not need to be loaded.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use wolfbridge::bridge::{render_client_config, ClientExport};
use wolfbridge::keys::{self, KeyPair};
use wolfbridge::store::Store;
use wolfbridge::BridgeConfig;

/// WolfBridge State Inspection Tool
#[derive(Parser)]
#[command(name = "wolfbridgectl")]
#[command(about = "Inspect WolfBridge state databases", long_about = None)]
struct Cli {
    /// Path to the state database
    #[arg(short, long, default_value = "/var/lib/wolfbridge/bridge.db")]
    db: PathBuf,

    /// Path to the bridge config file
    #[arg(short, long, default_value = "/etc/wolfbridge/config.toml")]
    config: PathBuf,

    /// Log level (defaults to `[logging] level` of the config file)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show device, server configuration and record counts
    Status,
    /// List clients
    Clients {
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Show one client as JSON
    Client {
        /// Client public key (hex)
        public_key: String,
    },
    /// Print a client's configuration document
    Export {
        /// Client public key (hex)
        public_key: String,
        /// Override the server endpoint
        #[arg(long)]
        endpoint: Option<String>,
        /// Override the DNS servers
        #[arg(long)]
        dns: Option<String>,
    },
    /// List multihop tunnels
    Tunnels,
    /// Show IP pool usage per family
    Pool,
    /// Check a bridge config file for errors
    CheckConfig {
        /// Config file to check (defaults to --config path)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Print a config file with every default filled in
    InitConfig,
    /// Generate a keypair (hex and base64)
    Keygen,
}

fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry.with(fmt_layer.compact()).init();
    } else {
        registry.with(fmt_layer).init();
    }
}

fn main() {
    let cli = Cli::parse();
    // A broken config file is reported by the command itself
    let config = load_config(&cli.config).unwrap_or_default();
    let level = cli.log_level.clone().unwrap_or_else(|| {
        config.log_level(-1).filter_directive().to_string()
    });
    init_logging(&level, &config.logging.format);

    let result = match &cli.command {
        Commands::Status => show_status(&cli),
        Commands::Clients { page, limit } => list_clients(&cli, *page, *limit),
        Commands::Client { public_key } => show_client(&cli, public_key),
        Commands::Export { public_key, endpoint, dns } => {
            export_client(&cli, public_key, endpoint.as_deref(), dns.as_deref())
        }
        Commands::Tunnels => list_tunnels(&cli),
        Commands::Pool => show_pool(&cli),
        Commands::CheckConfig { file } => check_config(file.as_deref().unwrap_or(&cli.config)),
        Commands::InitConfig => init_config(),
        Commands::Keygen => keygen(),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Config file if present, defaults otherwise
fn load_config(path: &Path) -> Result<BridgeConfig> {
    if !path.exists() {
        return Ok(BridgeConfig::default());
    }
    BridgeConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

/// Open an existing database; never create one
fn open_store(cli: &Cli) -> Result<Store> {
    if !cli.db.exists() {
        bail!("no database at {}", cli.db.display());
    }
    let config = load_config(&cli.config)?;
    Store::open(&cli.db, config.busy_timeout()).with_context(|| format!("opening {}", cli.db.display()))
}

fn format_time(ts: Option<i64>) -> String {
    ts.and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn format_bytes(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn show_status(cli: &Cli) -> Result<()> {
    let store = open_store(cli)?;
    let summary = store.summary()?;

    println!();
    println!("\x1b[1;36mWolfBridge State\x1b[0m  ({})", cli.db.display());
    println!("{}", "=".repeat(50));

    match store.device()? {
        Some(device) => {
            println!("  Interface:   {}", device.name);
            println!("  Listen port: {}", device.listen_port);
            println!("  Public key:  {}", keys::hex_to_base64(&device.public_key)?);
            println!("  Started:     {}", format_time(device.started_at));
        }
        None => println!("  \x1b[33m⚠\x1b[0m  No device record (bridge never initialized)"),
    }

    println!();
    match store.server_config()? {
        Some(server) => {
            println!("  Endpoint:    {}", server.endpoint.as_deref().unwrap_or("-"));
            match &server.network_v6 {
                Some(v6) => println!("  Network:     {}, {}", server.network, v6),
                None => println!("  Network:     {}", server.network),
            }
            println!("  DNS:         {}", server.dns_string());
            println!("  MTU:         {}", server.mtu);
            if server.fwmark != 0 {
                println!("  Fwmark:      {}", server.fwmark);
            }
        }
        None => println!("  \x1b[33m⚠\x1b[0m  Not set up"),
    }

    println!();
    println!("  Clients:     {}", summary.peer_count);
    println!("  Tunnels:     {}", summary.multihop_count);
    println!("  Schema:      v{}", store.schema_version()?);
    println!();
    Ok(())
}

fn list_clients(cli: &Cli, page: i64, limit: i64) -> Result<()> {
    let store = open_store(cli)?;
    let list = store.list_clients(page, limit)?;

    println!(
        "{:<46} {:<18} {:<8} {:<20} {:>10} {:>10}",
        "PUBLIC KEY", "ADDRESS", "ENABLED", "LAST HANDSHAKE", "RX", "TX"
    );
    println!("{}", "-".repeat(117));
    for client in &list.clients {
        let enabled = if client.enabled {
            "\x1b[32myes\x1b[0m     "
        } else {
            "\x1b[31mno\x1b[0m      "
        };
        println!(
            "{:<46} {:<18} {} {:<20} {:>10} {:>10}",
            keys::hex_to_base64(&client.public_key)?,
            client.allowed_ip,
            enabled,
            format_time(client.last_handshake),
            format_bytes(client.rx_bytes),
            format_bytes(client.tx_bytes),
        );
    }
    println!();
    println!("Page {} ({} per page), {} clients total", list.page, list.limit, list.total);
    Ok(())
}

fn show_client(cli: &Cli, public_key: &str) -> Result<()> {
    let store = open_store(cli)?;
    let client = store.client(&keys::normalize_key(public_key)?)?;
    println!("{}", serde_json::to_string_pretty(&client)?);
    Ok(())
}

fn export_client(cli: &Cli, public_key: &str, endpoint: Option<&str>, dns: Option<&str>) -> Result<()> {
    let store = open_store(cli)?;
    let client = store.client(&keys::normalize_key(public_key)?)?;
    let Some(device) = store.device()? else {
        bail!("no device record");
    };
    let server = store.server_config()?.unwrap_or_default();

    let Some(endpoint) = endpoint.map(str::to_string).or_else(|| server.endpoint.clone()) else {
        bail!("no server endpoint configured; pass --endpoint");
    };
    let dns = dns.map(str::to_string).unwrap_or_else(|| server.dns_string());

    let text = render_client_config(&ClientExport {
        client: &client,
        server_public_key: &device.public_key,
        endpoint: &endpoint,
        dns: &dns,
        mtu: server.mtu,
        prefix_v4: server.prefix_len_v4().unwrap_or(24),
        prefix_v6: server.prefix_len_v6().unwrap_or(64),
    })?;
    print!("{}", text);
    Ok(())
}

fn list_tunnels(cli: &Cli) -> Result<()> {
    let store = open_store(cli)?;
    let tunnels = store.list_multihop_tunnels()?;

    println!(
        "{:<16} {:<16} {:<24} {:<8} {:<10} {:>8}",
        "NAME", "INTERFACE", "REMOTE", "ENABLED", "STATUS", "PRIORITY"
    );
    println!("{}", "-".repeat(87));
    for tunnel in &tunnels {
        println!(
            "{:<16} {:<16} {:<24} {:<8} {:<10} {:>8}",
            tunnel.name,
            tunnel.interface_name,
            tunnel.remote_endpoint,
            if tunnel.enabled { "yes" } else { "no" },
            tunnel.status,
            tunnel.priority,
        );
        if let Some(error) = &tunnel.error_msg {
            println!("  \x1b[31m✗\x1b[0m  {}", error);
        }
    }
    if tunnels.is_empty() {
        println!("(no multihop tunnels)");
    }
    Ok(())
}

fn show_pool(cli: &Cli) -> Result<()> {
    let store = open_store(cli)?;
    let usage = store.pool_usage()?;
    if usage.is_empty() {
        println!("IP pool is empty (bridge not set up)");
        return Ok(());
    }
    for family in usage {
        let percent = if family.total > 0 {
            family.assigned as f64 * 100.0 / family.total as f64
        } else {
            0.0
        };
        println!(
            "  IPv{}: {:>5} / {:<5} assigned ({:.1}%)",
            family.family, family.assigned, family.total, percent
        );
    }
    Ok(())
}

fn check_config(path: &Path) -> Result<()> {
    println!();
    println!("Checking {}", path.display());
    match BridgeConfig::from_file(path) {
        Ok(config) => {
            println!("\x1b[1;32m✓\x1b[0m Backend: {:?}", config.device.backend);
            println!("\x1b[1;32m✓\x1b[0m Stats interval: {:?}", config.stats_interval());
            println!("\x1b[1;32m✓ Configuration looks good!\x1b[0m");
            Ok(())
        }
        Err(e) => {
            println!("  \x1b[31m✗\x1b[0m  {}", e);
            bail!("configuration has errors that must be fixed");
        }
    }
}

fn init_config() -> Result<()> {
    print!("{}", toml::to_string_pretty(&BridgeConfig::default())?);
    Ok(())
}

fn keygen() -> Result<()> {
    let pair = KeyPair::generate()?;
    println!("private_key     = {}", pair.private_key);
    println!("public_key      = {}", pair.public_key);
    println!("private_key_b64 = {}", keys::hex_to_base64(&pair.private_key)?);
    println!("public_key_b64  = {}", keys::hex_to_base64(&pair.public_key)?);
    Ok(())
}
