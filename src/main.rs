use clap::{Parser, Subcommand};
use policyd::config::{self, ConfigLock};
use policyd::dhcp::{DhcpConfig, DhcpRequest, WireguardUpdate};
use policyd::firewall::RuleKind;
use policyd::identity::{PskEntry, Zone};
use policyd::netfilter;
use policyd::service::{Collaborators, ControlPlane};
use policyd::telemetry::{init_logging, LogConfig};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "policyd")]
#[command(about = "Network policy control plane for nftables verdict maps")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run the control plane daemon
    Run {
        /// Path to config.lock file
        #[arg(short, long, default_value = "config.lock")]
        config: PathBuf,
    },
    /// Address assignment
    Dhcp {
        #[arg(short, long, default_value = "config.lock")]
        config: PathBuf,
        #[command(subcommand)]
        action: DhcpAction,
    },
    /// WireGuard peers
    Wg {
        #[arg(short, long, default_value = "config.lock")]
        config: PathBuf,
        #[command(subcommand)]
        action: WgAction,
    },
    /// Zones
    Zone {
        #[arg(short, long, default_value = "config.lock")]
        config: PathBuf,
        #[command(subcommand)]
        action: ZoneAction,
    },
    /// Device records
    Device {
        #[arg(short, long, default_value = "config.lock")]
        config: PathBuf,
        #[command(subcommand)]
        action: DeviceAction,
    },
    /// Firewall rules
    Rule {
        #[arg(short, long, default_value = "config.lock")]
        config: PathBuf,
        #[command(subcommand)]
        action: RuleAction,
    },
    /// Inspect kernel maps
    Filter {
        #[arg(short, long, default_value = "config.lock")]
        config: PathBuf,
        #[command(subcommand)]
        action: FilterAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Generate config.lock from config.toml
    Generate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Output path for config.lock
        #[arg(short, long, default_value = "config.lock")]
        output: PathBuf,
    },
    /// Validate config.toml without generating lock file
    Validate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum DhcpAction {
    /// Handle a DHCP request for a MAC
    Request {
        #[arg(long)]
        mac: String,
        #[arg(long)]
        iface: String,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value = "")]
        identifier: String,
    },
    /// Reserve an address for a non-MAC identity
    Reserve { identifier: String },
    /// Replace the TinyNets and lease time
    SetConfig {
        #[arg(long = "tiny-net", required = true)]
        tiny_nets: Vec<String>,
        #[arg(long, default_value = "")]
        lease_time: String,
    },
}

#[derive(Subcommand)]
enum WgAction {
    /// Create or update a peer
    Update {
        #[arg(long)]
        pubkey: String,
        #[arg(long, default_value = "")]
        ip: String,
        #[arg(long, default_value = "")]
        iface: String,
        #[arg(long, default_value = "")]
        name: String,
    },
    /// Remove a peer
    Delete {
        #[arg(long)]
        pubkey: String,
        #[arg(long, default_value = "")]
        ip: String,
        #[arg(long, default_value = "")]
        iface: String,
    },
}

#[derive(Subcommand)]
enum ZoneAction {
    List,
    Add {
        name: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    Delete { name: String },
    Disable { name: String },
    Enable { name: String },
}

#[derive(Subcommand)]
enum DeviceAction {
    List,
    /// Replace a device's zones
    Zones { device: String, zones: Vec<String> },
    /// Replace a device's tags
    Tags { device: String, tags: Vec<String> },
    /// Set a device's wireless credential
    Psk {
        device: String,
        #[arg(long, default_value = "sae")]
        kind: String,
        #[arg(long)]
        psk: String,
    },
    Delete { device: String },
}

#[derive(Subcommand)]
enum RuleAction {
    List,
    Add { kind: String, json: String },
    Delete { kind: String, json: String },
    /// Toggle ping from LAN and WAN
    Ping {
        #[arg(long)]
        lan: bool,
        #[arg(long)]
        wan: bool,
    },
}

#[derive(Subcommand)]
enum FilterAction {
    /// Print a map's elements
    List { map: String },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Config { action }) => {
            init_logging(None);
            match action {
                ConfigAction::Generate {
                    config: config_path,
                    output,
                } => cmd_config_generate(&config_path, &output),
                ConfigAction::Validate {
                    config: config_path,
                } => cmd_config_validate(&config_path),
            }
        }
        Some(Commands::Run { config: lock_path }) => cmd_run(&lock_path),
        Some(Commands::Dhcp { config, action }) => {
            with_plane(&config, |plane| cmd_dhcp(plane, action))
        }
        Some(Commands::Wg { config, action }) => with_plane(&config, |plane| cmd_wg(plane, action)),
        Some(Commands::Zone { config, action }) => {
            with_plane(&config, |plane| cmd_zone(plane, action))
        }
        Some(Commands::Device { config, action }) => {
            with_plane(&config, |plane| cmd_device(plane, action))
        }
        Some(Commands::Rule { config, action }) => {
            with_plane(&config, |plane| cmd_rule(plane, action))
        }
        Some(Commands::Filter { config, action }) => {
            with_plane(&config, |plane| cmd_filter(plane, action))
        }
        None => cmd_run(&PathBuf::from("config.lock")),
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn read_lock(lock_path: &Path) -> Result<ConfigLock, String> {
    config::load_lock(lock_path).map_err(|e| format!("Failed to load {}: {}", lock_path.display(), e))
}

fn open_plane(lock: &ConfigLock) -> Result<ControlPlane, String> {
    let filter = netfilter::open(lock.netfilter.backend)
        .map_err(|e| format!("Failed to open packet filter: {}", e))?;
    ControlPlane::new(
        lock.paths.clone(),
        lock.interfaces.clone(),
        filter,
        Collaborators::default(),
    )
    .map_err(|e| format!("Failed to load state: {}", e))
}

/// Build a control plane from the lock file and run one operator command.
fn with_plane<F>(lock_path: &Path, f: F) -> Result<(), String>
where
    F: FnOnce(&ControlPlane) -> policyd::Result<()>,
{
    let lock = read_lock(lock_path)?;
    init_logging(Some(&LogConfig::from(&lock.logging)));
    let plane = open_plane(&lock)?;
    f(&plane).map_err(|e| e.to_string())
}

fn print_json<T: Serialize>(value: &T) -> policyd::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_run(lock_path: &Path) -> Result<(), String> {
    use tokio::runtime::Runtime;
    use tracing::{debug, warn};

    let lock = read_lock(lock_path)?;
    init_logging(Some(&LogConfig::from(&lock.logging)));
    info!("Loaded {} (generated {})", lock_path.display(), lock.generated_at);

    let plane = open_plane(&lock)?;
    let summary = plane
        .apply_all()
        .map_err(|e| format!("Failed to apply state: {}", e))?;
    info!(
        "Applied state: {} rules installed, {} failed, {} devices refreshed, {} skipped",
        summary.installed, summary.failed, summary.refreshed, summary.skipped
    );

    let rt = Runtime::new().map_err(|e| format!("Failed to create runtime: {}", e))?;

    rt.block_on(async move {
        let period = Duration::from_secs(lock.netfilter.reconcile_interval);
        let mut reconcile_timer = tokio::time::interval(period);
        // First tick completes immediately
        reconcile_timer.tick().await;

        info!("Control plane running, reconciling every {:?}", period);

        loop {
            tokio::select! {
                _ = reconcile_timer.tick() => {
                    match plane.reconcile() {
                        Ok(0) => debug!("Reconcile: no drift"),
                        Ok(n) => info!("Reconcile refreshed {} devices", n),
                        Err(e) => warn!("Reconcile failed: {}", e),
                    }
                    for (name, value) in plane.metrics().export() {
                        debug!(metric = %name, value, "counter");
                    }
                }
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        return Err(format!("Failed to wait for Ctrl-C: {}", e));
                    }
                    info!("Shutting down");
                    return Ok(());
                }
            }
        }
    })
}

fn cmd_dhcp(plane: &ControlPlane, action: DhcpAction) -> policyd::Result<()> {
    match action {
        DhcpAction::Request {
            mac,
            iface,
            name,
            identifier,
        } => {
            let response = plane.handle_dhcp_request(DhcpRequest {
                mac,
                identifier,
                name,
                iface,
            })?;
            print_json(&response)
        }
        DhcpAction::Reserve { identifier } => {
            print_json(&plane.handle_abstract_dhcp_request(&identifier)?)
        }
        DhcpAction::SetConfig {
            tiny_nets,
            lease_time,
        } => print_json(&plane.set_dhcp_config(DhcpConfig {
            tiny_nets,
            lease_time,
        })?),
    }
}

fn cmd_wg(plane: &ControlPlane, action: WgAction) -> policyd::Result<()> {
    match action {
        WgAction::Update {
            pubkey,
            ip,
            iface,
            name,
        } => plane.wireguard_update(WireguardUpdate {
            ip,
            public_key: pubkey,
            iface,
            name,
        }),
        WgAction::Delete { pubkey, ip, iface } => plane.wireguard_delete(WireguardUpdate {
            ip,
            public_key: pubkey,
            iface,
            name: String::new(),
        }),
    }
}

fn cmd_zone(plane: &ControlPlane, action: ZoneAction) -> policyd::Result<()> {
    match action {
        ZoneAction::List => {
            for zone in plane.zones()?.iter() {
                let state = if zone.disabled { "disabled" } else { "enabled" };
                println!("{:<16} {:<8} {}", zone.name, state, zone.zone_tags.join(","));
            }
            Ok(())
        }
        ZoneAction::Add { name, tags } => {
            let mut zone = Zone::new(name);
            zone.zone_tags = tags;
            plane.add_zone(zone)
        }
        ZoneAction::Delete { name } => plane.delete_zone(&name),
        ZoneAction::Disable { name } => plane.set_zone_disabled(&name, true),
        ZoneAction::Enable { name } => plane.set_zone_disabled(&name, false),
    }
}

fn cmd_device(plane: &ControlPlane, action: DeviceAction) -> policyd::Result<()> {
    match action {
        DeviceAction::List => print_json(&plane.devices()?),
        DeviceAction::Zones { device, zones } => {
            print_json(&plane.set_device_zones(&device, &zones)?)
        }
        DeviceAction::Tags { device, tags } => print_json(&plane.set_device_tags(&device, &tags)?),
        DeviceAction::Psk { device, kind, psk } => {
            plane.set_device_psk(&device, PskEntry { kind, psk })
        }
        DeviceAction::Delete { device } => plane.delete_device(&device),
    }
}

fn cmd_rule(plane: &ControlPlane, action: RuleAction) -> policyd::Result<()> {
    match action {
        RuleAction::List => print_json(&plane.firewall_config()),
        RuleAction::Add { kind, json } => {
            let kind: RuleKind = kind.parse()?;
            print_json(&plane.add_rule_json(kind, &json)?)
        }
        RuleAction::Delete { kind, json } => {
            let kind: RuleKind = kind.parse()?;
            print_json(&plane.delete_rule_json(kind, &json)?)
        }
        RuleAction::Ping { lan, wan } => plane.set_icmp(lan, wan),
    }
}

fn cmd_filter(plane: &ControlPlane, action: FilterAction) -> policyd::Result<()> {
    match action {
        FilterAction::List { map } => {
            for line in plane.filter_list(&map)? {
                println!("{}", line);
            }
            Ok(())
        }
    }
}

fn cmd_config_generate(config_path: &PathBuf, output_path: &PathBuf) -> Result<(), String> {
    println!("[INFO] Loading {}...", config_path.display());

    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;

    let validation = config::validate(&cfg);
    validation.print_diagnostics();

    if validation.has_errors() {
        return Err("Validation failed with errors".to_string());
    }

    let lock = config::generate_lock(&cfg).map_err(|e| format!("Failed to resolve config: {}", e))?;

    let lock_toml =
        toml::to_string_pretty(&lock).map_err(|e| format!("Failed to serialize lock: {}", e))?;

    let output = format!(
        "# Generated by policyd - DO NOT EDIT\n# Source: {}\n\n{}",
        config_path.display(),
        lock_toml
    );

    std::fs::write(output_path, output).map_err(|e| format!("Failed to write lock file: {}", e))?;

    println!("[INFO] Generated {}", output_path.display());
    Ok(())
}

fn cmd_config_validate(config_path: &PathBuf) -> Result<(), String> {
    println!("[INFO] Validating {}...", config_path.display());

    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;

    let validation = config::validate(&cfg);
    validation.print_diagnostics();

    if validation.has_errors() {
        Err("Validation failed".to_string())
    } else {
        println!("[INFO] Configuration is valid");
        Ok(())
    }
}
