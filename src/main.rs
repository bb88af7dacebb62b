use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use service_registry::client::AdminClient;
use service_registry::config::{
    AdminConfig, DEFAULT_ADMIN_PORT, DEFAULT_BIND_ADDR, DEFAULT_GOSSIP_PORT, DEFAULT_RPC_PORT,
    GossipConfig, NodeConfig, RegistryConfig, RpcConfig, generate_node_id,
};
use service_registry::node::RegistryNode;
use service_registry::registry::types::{Locality, Member};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::time::{Duration, UNIX_EPOCH};
use tracing_subscriber::EnvFilter;

const DEFAULT_ADMIN_ADDR: &str = "127.0.0.1:8112";
const REVISION_WIDTH: usize = 25;

#[derive(Parser)]
#[command(name = "registry", version, about = "Distributed service registry")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a registry node until interrupted.
    Start(StartArgs),
    /// Query a running node through its admin listener.
    Info {
        #[command(subcommand)]
        target: InfoTarget,
    },
}

#[derive(Subcommand)]
enum InfoTarget {
    /// Print every member known to the node.
    Cluster {
        #[arg(long, default_value = DEFAULT_ADMIN_ADDR)]
        addr: String,
    },
    /// Print one member in detail.
    Member {
        id: String,
        #[arg(long, default_value = DEFAULT_ADMIN_ADDR)]
        addr: String,
    },
}

#[derive(Args)]
struct StartArgs {
    /// Defaults to a generated `registry-xxxxxxxx` id.
    #[arg(long, env = "REGISTRY_NODE_ID")]
    node_id: Option<String>,

    #[arg(long, default_value = DEFAULT_BIND_ADDR)]
    rpc_bind_addr: String,
    #[arg(long, default_value_t = DEFAULT_RPC_PORT)]
    rpc_bind_port: u16,
    #[arg(long)]
    rpc_adv_addr: Option<String>,
    #[arg(long)]
    rpc_adv_port: Option<u16>,

    #[arg(long, default_value = DEFAULT_BIND_ADDR)]
    gossip_bind_addr: String,
    #[arg(long, default_value_t = DEFAULT_GOSSIP_PORT)]
    gossip_bind_port: u16,
    #[arg(long)]
    gossip_adv_addr: Option<String>,
    #[arg(long)]
    gossip_adv_port: Option<u16>,
    /// Comma-separated `host:port` gossip addresses of existing nodes.
    #[arg(long, value_delimiter = ',')]
    gossip_seeds: Vec<String>,

    #[arg(long, default_value = DEFAULT_BIND_ADDR)]
    admin_bind_addr: String,
    #[arg(long, default_value_t = DEFAULT_ADMIN_PORT)]
    admin_bind_port: u16,

    #[arg(long)]
    region: Option<String>,
    #[arg(long)]
    availability_zone: Option<String>,

    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    heartbeat_timeout: Duration,
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    reconnect_timeout: Duration,
    #[arg(long, default_value = "30m", value_parser = humantime::parse_duration)]
    tombstone_timeout: Duration,

    /// Log filter, e.g. `info` or `service_registry=debug`. `RUST_LOG` wins when set.
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Append logs to this file instead of stdout.
    #[arg(long)]
    log_path: Option<PathBuf>,
}

impl StartArgs {
    fn into_config(self) -> NodeConfig {
        let node_id = self.node_id.unwrap_or_else(generate_node_id);

        let registry = RegistryConfig::default()
            .with_heartbeat_timeout(self.heartbeat_timeout)
            .with_reconnect_timeout(self.reconnect_timeout)
            .with_tombstone_timeout(self.tombstone_timeout);

        let gossip = GossipConfig::default()
            .with_bind(self.gossip_bind_addr, self.gossip_bind_port)
            .with_advertise(
                self.gossip_adv_addr.unwrap_or_default(),
                self.gossip_adv_port.unwrap_or(0),
            )
            .with_seeds(self.gossip_seeds);

        let rpc = RpcConfig::default()
            .with_bind(self.rpc_bind_addr, self.rpc_bind_port)
            .with_advertise(
                self.rpc_adv_addr.unwrap_or_default(),
                self.rpc_adv_port.unwrap_or(0),
            );

        let admin = AdminConfig::default().with_bind(self.admin_bind_addr, self.admin_bind_port);

        let mut config = NodeConfig::new(node_id)
            .with_registry(registry)
            .with_gossip(gossip)
            .with_rpc(rpc)
            .with_admin(admin);

        if self.region.is_some() || self.availability_zone.is_some() {
            config = config.with_locality(Locality::new(
                self.region.unwrap_or_default(),
                self.availability_zone.unwrap_or_default(),
            ));
        }
        config
    }
}

fn init_logging(level: &str, path: Option<&PathBuf>) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid log level {:?}", level))?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => builder.init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start(args) => {
            init_logging(&args.log_level, args.log_path.as_ref())?;
            run_node(args.into_config()).await
        }
        Command::Info { target } => match target {
            InfoTarget::Cluster { addr } => print_cluster(&addr).await,
            InfoTarget::Member { id, addr } => print_member(&addr, &id).await,
        },
    }
}

async fn run_node(config: NodeConfig) -> Result<()> {
    let node = RegistryNode::start(config).await?;

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    node.shutdown().await;
    Ok(())
}

// ============================================================
// INFO OUTPUT
// ============================================================

fn format_started(started: i64) -> String {
    if started <= 0 {
        return "-".to_string();
    }
    let at = UNIX_EPOCH + Duration::from_millis(started as u64);
    humantime::format_rfc3339_seconds(at).to_string()
}

fn format_locality(member: &Member) -> String {
    match &member.state.locality {
        Some(l) if l.availability_zone.is_empty() => l.region.clone(),
        Some(l) => format!("{}/{}", l.region, l.availability_zone),
        None => "-".to_string(),
    }
}

fn truncate_revision(revision: &str) -> String {
    if revision.chars().count() > REVISION_WIDTH {
        let short: String = revision.chars().take(REVISION_WIDTH).collect();
        format!("{}...", short)
    } else {
        revision.to_string()
    }
}

async fn print_cluster(addr: &str) -> Result<()> {
    let admin = AdminClient::new(addr)?;
    let members = admin.members().await?;

    let rows: Vec<[String; 7]> = members
        .iter()
        .map(|m| {
            [
                m.state.id.clone(),
                m.state.status.clone(),
                m.liveness.to_string(),
                m.state.service.clone(),
                format_locality(m),
                format_started(m.state.started),
                truncate_revision(&m.state.revision),
            ]
        })
        .collect();

    let header = [
        "ID", "STATUS", "LIVENESS", "SERVICE", "LOCALITY", "STARTED", "REVISION",
    ];
    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let print_row = |cells: Vec<&str>| {
        let line: Vec<String> = cells
            .iter()
            .zip(widths.iter())
            .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
            .collect();
        println!("{}", line.join("  ").trim_end());
    };

    print_row(header.to_vec());
    for row in &rows {
        print_row(row.iter().map(String::as_str).collect());
    }
    Ok(())
}

async fn print_member(addr: &str, id: &str) -> Result<()> {
    let admin = AdminClient::new(addr)?;
    let Some(member) = admin.member(id).await? else {
        anyhow::bail!("NOT_FOUND: member {} not found", id);
    };

    println!("ID:         {}", member.state.id);
    println!("Service:    {}", member.state.service);
    println!("Status:     {}", member.state.status);
    println!("Revision:   {}", member.state.revision);
    println!("Locality:   {}", format_locality(&member));
    println!("Started:    {}", format_started(member.state.started));
    println!("Liveness:   {}", member.liveness);
    println!(
        "Version:    {} @ {}",
        member.version.owner, member.version.timestamp
    );
    if member.expiry > 0 {
        println!("Expiry:     {}", format_started(member.expiry));
    } else {
        println!("Expiry:     -");
    }

    let mut metadata: Vec<(&String, &String)> = member.state.metadata.iter().collect();
    metadata.sort();
    if metadata.is_empty() {
        println!("Metadata:   -");
    } else {
        println!("Metadata:");
        for (key, value) in metadata {
            println!("  {} = {}", key, value);
        }
    }
    Ok(())
}
