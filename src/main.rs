use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::Zeroizing;

use netpilot::{
    Classification, ConnectionOutcome, NetContext, NetworkIdentity,
    config::{self, Config},
    connectivity,
    diagnostics::Severity,
    hotspot::{Band, HotspotConfig, Ownership, SecurityType},
    logging, scan, server,
};

#[derive(Parser)]
#[command(name = "netpilot")]
#[command(about = "Drive WiFi connections and hotspots through NetworkManager")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.config/netpilot/config.toml)
    #[arg(long, global = true, env = "NETPILOT_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List WiFi interfaces
    Interfaces,

    /// Scan for WiFi networks
    Scan,

    /// Connect to a WiFi network (Ctrl-C cancels)
    Connect {
        /// SSID of the network to connect to
        ssid: String,

        /// Password for the network (not needed for saved or open networks)
        #[arg(short, long, env = "NETPILOT_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Security descriptor, e.g. WPA2. Looked up in the last scan when omitted
        #[arg(short, long)]
        security: Option<String>,
    },

    /// Disconnect and verify the link is down
    Disconnect,

    /// Show connection status
    Status {
        /// Also check that the internet is reachable
        #[arg(long)]
        check_internet: bool,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Show or switch the WiFi radio
    Radio {
        #[arg(value_enum, default_value = "status")]
        action: RadioAction,
    },

    /// Manage hotspots
    #[command(subcommand)]
    Hotspot(HotspotCommand),

    /// Start the web dashboard
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,

        /// Address to bind
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
    },

    /// Inspect the configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Clone, Copy, ValueEnum)]
enum RadioAction {
    On,
    Off,
    Status,
}

#[derive(Subcommand)]
enum HotspotCommand {
    /// Create a hotspot configuration
    Create(HotspotArgs),

    /// Replace a hotspot configuration
    Update(HotspotArgs),

    /// Start a hotspot
    Start { name: String },

    /// Stop a hotspot, or every active one with --all
    Stop {
        #[arg(required_unless_present = "all")]
        name: Option<String>,

        #[arg(long, conflicts_with = "name")]
        all: bool,
    },

    /// Stop and remove a hotspot
    Delete { name: String },

    /// List owned and external hotspots
    List,

    /// Show a hotspot's state
    Status { name: String },

    /// List clients attached to a hotspot
    Clients { name: String },

    /// List interfaces and whether they can run an access point
    Interfaces,

    /// Create (or replace) and start the "quick" hotspot
    Quick {
        ssid: String,

        #[arg(short, long, env = "NETPILOT_HOTSPOT_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// WiFi interface (defaults to a USB adapter, else the first WiFi device)
        #[arg(short, long)]
        interface: Option<String>,

        /// Uplink to share (defaults to the default-route interface)
        #[arg(long)]
        internet: Option<String>,
    },
}

#[derive(Args)]
struct HotspotArgs {
    /// Configuration name
    name: String,

    #[arg(long)]
    ssid: String,

    /// WPA passphrase (8-63 characters)
    #[arg(short, long, env = "NETPILOT_HOTSPOT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[arg(long, value_enum, default_value = "wpa2")]
    security: SecurityArg,

    /// WiFi interface to run the access point on
    #[arg(short, long, default_value = "wlan0")]
    interface: String,

    /// Uplink to share (defaults to the default-route interface)
    #[arg(long)]
    internet: Option<String>,

    /// Gateway address; picked on first start when omitted
    #[arg(long)]
    gateway: Option<Ipv4Addr>,

    /// Channel, 0 lets the driver choose
    #[arg(long, default_value = "6")]
    channel: u8,

    /// Use the 5GHz band
    #[arg(long)]
    five_ghz: bool,

    #[arg(long)]
    hidden: bool,

    /// Keep clients from reaching each other
    #[arg(long)]
    isolate: bool,

    /// Do not share the uplink
    #[arg(long)]
    no_share: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum SecurityArg {
    Open,
    Wpa2,
    Wpa3,
}

impl HotspotArgs {
    fn into_config(self) -> HotspotConfig {
        HotspotConfig {
            name: self.name,
            ssid: self.ssid,
            security: match self.security {
                SecurityArg::Open => SecurityType::None,
                SecurityArg::Wpa2 => SecurityType::Wpa2,
                SecurityArg::Wpa3 => SecurityType::Wpa3,
            },
            password: self.password.unwrap_or_default(),
            wifi_interface: self.interface,
            internet_interface: self.internet,
            gateway: self.gateway,
            channel: self.channel,
            band: if self.five_ghz { Band::A } else { Band::Bg },
            hidden: self.hidden,
            client_isolation: self.isolate,
            share_internet: !self.no_share,
        }
    }
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config::config_path()?,
    };

    if let Commands::Config(cmd) = &cli.command {
        return cmd_config(cmd, &config_path);
    }

    let config = Config::load_from(&config_path)?;
    let ctx = NetContext::detect(&config)?;

    let result = match cli.command {
        Commands::Interfaces => cmd_interfaces(&ctx),
        Commands::Scan => cmd_scan(&ctx),
        Commands::Connect {
            ssid,
            password,
            security,
        } => cmd_connect(&ctx, ssid, password, security).await,
        Commands::Disconnect => cmd_disconnect(&ctx),
        Commands::Status {
            check_internet,
            json,
        } => cmd_status(&ctx, &config, check_internet, json),
        Commands::Radio { action } => cmd_radio(&ctx, action),
        Commands::Hotspot(cmd) => cmd_hotspot(&ctx, cmd),
        Commands::Serve { port, bind } => {
            server::run_server(ctx.clone(), server::ServerConfig { bind, port }).await
        }
        Commands::Config(_) => Ok(()),
    };

    print_diagnostics(&ctx);
    result
}

fn print_diagnostics(ctx: &NetContext) {
    for diagnostic in ctx.queue().drain() {
        let label = match diagnostic.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        eprintln!("{}: {}", label, diagnostic.message);
    }
}

fn cmd_config(cmd: &ConfigCommand, path: &Path) -> Result<()> {
    match cmd {
        ConfigCommand::Path => println!("{}", path.display()),
        ConfigCommand::Show => {
            println!("Config file: {}", path.display());
            println!();
            let cfg = Config::load_from(path)?;
            print!("{}", toml::to_string_pretty(&cfg).context("Failed to serialize config")?);
            println!("hotspot_dir = \"{}\"  # effective", cfg.hotspot_dir()?.display());
        }
    }
    Ok(())
}

fn cmd_interfaces(ctx: &NetContext) -> Result<()> {
    let interfaces = ctx.backend().list_wifi_interfaces()?;

    if interfaces.is_empty() {
        println!("No WiFi interfaces found.");
        return Ok(());
    }

    println!("{:<16} {:<14} {}", "INTERFACE", "STATE", "TYPE");
    println!("{}", "-".repeat(40));

    for iface in interfaces {
        let iface_type = if iface.is_usb { "USB" } else { "Built-in" };
        println!("{:<16} {:<14} {}", iface.name, iface.state, iface_type);
    }

    Ok(())
}

fn cmd_scan(ctx: &NetContext) -> Result<()> {
    if let Some(iface) = ctx.interface() {
        println!("Scanning on interface: {}", iface);
        println!();
    }

    let networks = scan::scan(ctx.backend().as_ref())?;
    scan::display_networks(&networks);

    Ok(())
}

async fn cmd_connect(
    ctx: &NetContext,
    ssid: String,
    password: Option<String>,
    security: Option<String>,
) -> Result<()> {
    let credential = password.map(Zeroizing::new);
    let security = match security {
        Some(security) => security,
        None if credential.is_some() => "WPA2".to_string(),
        None => ctx
            .backend()
            .scan_networks()
            .unwrap_or_default()
            .into_iter()
            .find(|n| n.identity.ssid == ssid)
            .map(|n| n.identity.security)
            .unwrap_or_default(),
    };
    let identity = NetworkIdentity::new(ssid, security);

    let orchestrator = ctx.orchestrator();
    println!("Connecting to '{}'... (Ctrl-C to cancel)", identity.ssid);
    let handle = orchestrator.connect(&identity, credential)?;

    let mut wait = tokio::task::spawn_blocking(move || handle.wait());
    let outcome = tokio::select! {
        outcome = &mut wait => outcome?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling...");
            orchestrator.cancel();
            wait.await?
        }
    };

    match outcome {
        ConnectionOutcome::Success(_) => {
            println!("{}", outcome);
            let status = orchestrator.status()?;
            if let Some(ip) = status.ip_address {
                println!("IP:        {}", ip);
            }
            Ok(())
        }
        ConnectionOutcome::Failed(kind, _) => {
            eprintln!("{}", kind.suggestion());
            if kind.can_retry() {
                eprintln!("This failure is often transient; try again.");
            }
            bail!("{}", outcome)
        }
        _ => bail!("{}", outcome),
    }
}

fn cmd_disconnect(ctx: &NetContext) -> Result<()> {
    println!("Disconnecting...");
    ctx.orchestrator().disconnect()?;
    println!("Disconnected.");
    Ok(())
}

fn cmd_status(ctx: &NetContext, config: &Config, check_internet: bool, json: bool) -> Result<()> {
    let orchestrator = ctx.orchestrator();
    let classification = orchestrator.classify();
    let status = orchestrator.status()?;
    let internet = check_internet
        .then(|| connectivity::is_reachable(&config.connectivity_url, Duration::from_secs(5)));

    if json {
        let value = serde_json::json!({
            "classification": classification,
            "connection": status,
            "internet": internet,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let state = match &classification {
        Classification::Connected { .. } => "connected",
        Classification::NotConnected => "not connected",
        Classification::Indeterminate => "indeterminate",
    };
    println!("State:     {}", state);
    println!("Connected: {}", status.ssid.as_deref().unwrap_or("(none)"));
    if let Some(device) = &status.device {
        println!("Interface: {}", device);
    }
    if let Some(ip) = &status.ip_address {
        println!("IP:        {}", ip);
    }
    if let Some(online) = internet {
        println!("Internet:  {}", if online { "reachable" } else { "unreachable" });
    }

    Ok(())
}

fn cmd_radio(ctx: &NetContext, action: RadioAction) -> Result<()> {
    match action {
        RadioAction::On => ctx.backend().set_wifi_enabled(true)?,
        RadioAction::Off => ctx.backend().set_wifi_enabled(false)?,
        RadioAction::Status => {}
    }
    let enabled = ctx.backend().wifi_enabled()?;
    println!("WiFi radio: {}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}

fn cmd_hotspot(ctx: &NetContext, cmd: HotspotCommand) -> Result<()> {
    let mut hotspots = ctx.hotspots()?;

    match cmd {
        HotspotCommand::Create(args) => {
            let config = args.into_config();
            let name = config.name.clone();
            hotspots.create(config)?;
            println!("Created hotspot '{}'. Start it with: netpilot hotspot start {}", name, name);
        }
        HotspotCommand::Update(args) => {
            let config = args.into_config();
            let name = config.name.clone();
            hotspots.update(&name, config)?;
            println!("Updated hotspot '{}'.", name);
        }
        HotspotCommand::Start { name } => {
            let status = hotspots.start(&name)?;
            println!("Hotspot '{}' ({}) is {}: {}", status.name, status.ssid, status.state, status.message);
        }
        HotspotCommand::Stop { name, all } => {
            if all {
                let stopped = hotspots.stop_all()?;
                println!("Stopped {} hotspot(s).", stopped);
            } else if let Some(name) = name {
                hotspots.stop(&name)?;
                println!("Stopped hotspot '{}'.", name);
            }
        }
        HotspotCommand::Delete { name } => {
            hotspots.delete(&name)?;
            println!("Deleted hotspot '{}'.", name);
        }
        HotspotCommand::List => {
            let listings = hotspots.list()?;
            if listings.is_empty() {
                println!("No hotspots.");
                return Ok(());
            }
            println!("{:<16} {:<24} {:<10} {:<16} {}", "NAME", "SSID", "INTERFACE", "GATEWAY", "OWNER");
            println!("{}", "-".repeat(76));
            for listing in listings {
                let config = &listing.config;
                let gateway = config
                    .gateway
                    .map(|g| g.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let owner = match listing.ownership {
                    Ownership::Owned => "netpilot",
                    Ownership::External => "external",
                };
                let iface = if config.wifi_interface.is_empty() { "-" } else { &config.wifi_interface };
                println!("{:<16} {:<24} {:<10} {:<16} {}", config.name, config.ssid, iface, gateway, owner);
            }
        }
        HotspotCommand::Status { name } => {
            let status = hotspots.status(&name)?;
            println!("Hotspot:   {}", status.name);
            println!("SSID:      {}", status.ssid);
            println!("State:     {}", status.state);
            println!("Clients:   {}", status.client_count);
            println!("Message:   {}", status.message);
        }
        HotspotCommand::Clients { name } => {
            let clients = hotspots.clients(&name)?;
            if clients.is_empty() {
                println!("No clients connected.");
                return Ok(());
            }
            println!("{:<20} {:>8} {:>12} {:>12}", "MAC", "SIGNAL", "RX BYTES", "TX BYTES");
            for station in clients {
                let dbm = station.signal_dbm.map(|s| format!("{} dBm", s)).unwrap_or_default();
                println!(
                    "{:<20} {:>8} {:>12} {:>12}",
                    station.mac,
                    dbm,
                    station.rx_bytes.unwrap_or(0),
                    station.tx_bytes.unwrap_or(0)
                );
            }
        }
        HotspotCommand::Interfaces => {
            for (iface, ap) in hotspots.available_interfaces()? {
                println!(
                    "{:<16} {:<14} {}",
                    iface.name,
                    iface.state,
                    if ap { "AP capable" } else { "no AP mode" }
                );
            }
        }
        HotspotCommand::Quick {
            ssid,
            password,
            interface,
            internet,
        } => {
            let status = hotspots.quick_start(
                &ssid,
                password.as_deref(),
                interface.as_deref(),
                internet.as_deref(),
            )?;
            println!("Hotspot '{}' is {}: {}", status.ssid, status.state, status.message);
        }
    }

    Ok(())
}
