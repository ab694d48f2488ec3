mod config;
mod conflict;
mod discovery;
mod hosts;
mod identity;
mod membership;
mod node;
mod protocol;
mod transport;

pub use config::{generate_domain, Config, ConfigError};
pub use conflict::{resolve_domain, short_suffix};
pub use discovery::{apply_announcement, DiscoveryEngine, DiscoveryError, Outcome, DEPARTURE_GRACE};
pub use hosts::{HostsError, HostsFile};
pub use identity::{device_id_path, Identity};
pub use membership::{ChangeListener, MembershipTable, NoopListener};
pub use node::Node;
pub use protocol::{Action, Announcement, DecodeError};
pub use transport::{local_ipv4, MulticastTransport, TransportError};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "lanlink", version, about = "LAN name discovery over multicast")]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, global = true, default_value = config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Announce this machine and keep the hosts file in sync (default)
    Run(RunArgs),
    /// Show the entries LanLink manages in the hosts file
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show the identity and addresses this machine would announce
    Status,
    /// Write a config file populated with the defaults
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Hosts file to manage instead of the configured one
    #[arg(long)]
    hosts: Option<PathBuf>,
    /// Device name to announce instead of the configured one
    #[arg(long)]
    name: Option<String>,
    /// Log level (overridden by RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,
    /// Log file written next to console output
    #[arg(long, default_value = "lanlink.log")]
    log_file: PathBuf,
    /// Only log to the console
    #[arg(long)]
    no_log_file: bool,
}

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;

    match cli
        .command
        .unwrap_or_else(|| Command::Run(RunArgs::default_for_cli()))
    {
        Command::Run(args) => {
            if let Some(hosts) = args.hosts {
                config.hosts_path = hosts;
            }
            if let Some(name) = args.name {
                config.device_name = name;
            }
            if let Some(level) = args.log_level {
                config.log_level = level;
            }
            let log_file = (!args.no_log_file).then_some(args.log_file.as_path());
            let _guard = init_logging(&config.log_level, log_file)?;

            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to build tokio runtime")?
                .block_on(serve(config, device_id_path(&cli.config)))
        }
        Command::List { json } => list(&config, json),
        Command::Status => status(&config, &device_id_path(&cli.config)),
        Command::InitConfig { force } => init_config(&cli.config, force),
    }
}

impl RunArgs {
    // `lanlink` with no subcommand behaves like `lanlink run`.
    fn default_for_cli() -> Self {
        Self {
            log_file: PathBuf::from("lanlink.log"),
            ..Self::default()
        }
    }
}

fn init_logging(level: &str, log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level {level:?}"))?;

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let name = path.file_name().context("log file path has no file name")?;
            let appender = tracing_appender::rolling::never(dir.unwrap_or(Path::new(".")), name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(guard)
}

async fn serve(config: Config, id_file: PathBuf) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "lanlink starting");
    config.validate()?;

    let identity = Identity::resolve(&config, &id_file);
    tracing::info!(
        device_name = %identity.display_name,
        domain_suffix = %config.domain_suffix,
        "identity resolved"
    );

    let hosts = Arc::new(HostsFile::new(&config.hosts_path));
    hosts.check_permission()?;
    hosts
        .initialize()
        .context("failed to initialize hosts file")?;
    // entries left by a previous run are not backed by any heartbeat yet
    if hosts.clear()? {
        tracing::info!(path = %hosts.path().display(), "cleared stale hosts entries");
    }

    let engine = DiscoveryEngine::start(config, identity, hosts.clone())
        .await
        .context("failed to start discovery")?;
    engine.run(shutdown_signal()).await;

    if let Err(e) = hosts.clear() {
        tracing::error!(error = %e, "failed to clear hosts entries on exit");
    }
    tracing::info!("lanlink stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

fn list(config: &Config, json: bool) -> anyhow::Result<()> {
    let hosts = HostsFile::new(&config.hosts_path);
    let entries = hosts.list()?;

    if json {
        let nodes: Vec<_> = entries
            .iter()
            .map(|(domain, ip)| serde_json::json!({ "domain": domain, "ip": ip }))
            .collect();
        let out = serde_json::json!({ "nodes": nodes, "total": entries.len() });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No LanLink entries in {}", hosts.path().display());
        return Ok(());
    }
    println!("{:<32} {:<15}", "DOMAIN", "IP");
    for (domain, ip) in &entries {
        println!("{domain:<32} {ip:<15}");
    }
    Ok(())
}

fn status(config: &Config, id_file: &Path) -> anyhow::Result<()> {
    let identity = Identity::resolve(config, id_file);
    let domain = generate_domain(&identity.display_name, &config.domain_suffix);
    let ip = local_ipv4()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|e| format!("unavailable ({e})"));

    println!("Device ID:   {}", identity.device_id);
    println!("Device name: {}", identity.display_name);
    println!("Domain:      {domain}");
    println!("Local IP:    {ip}");
    println!(
        "Multicast:   {}:{}",
        config.multicast_addr, config.multicast_port
    );
    println!("Hosts file:  {}", config.hosts_path.display());
    Ok(())
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists, use --force to overwrite", path.display());
    }
    Config::default().save(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
