use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

use snuabar_core::config::{config_path, data_dir, initialize_data_dir, AppConfig, DEFAULT_PORT};
use snuabar_core::locator::OutputLocator;
use snuabar_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use snuabar_core::registry::{JobRegistry, RegistryOptions};
use snuabar_core::server::{app_router, AppState, ServerInfo};
use snuabar_core::upstream::HttpExecutionHost;
use snuabar_core::workflow::{WorkflowCatalog, MODEL_MAP_FILE};

#[derive(Parser)]
#[command(
    name = "snuabar",
    about = "Deduplicating job queue in front of a node-graph generation host"
)]
struct Cli {
    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long, help = "Port to listen on (0 scans from 8000)")]
    port: Option<u16>,

    #[arg(long = "listen", value_name = "ADDR", help = "Interface to bind")]
    listen: Option<String>,

    #[arg(long)]
    data_dir: Option<PathBuf>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(&resolved_data_dir);

    run_server(cli.port, cli.listen, resolved_data_dir).await
}

#[cfg(test)]
fn select_log_filter(
    noise_base: &str,
    rust_log_env: Option<&str>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> String {
    let options = LoggingInitOptions {
        data_dir: None,
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        default_log_filter: DEFAULT_LOG_FILTER.to_string(),
        noise_filter: noise_base.to_string(),
        include_noise_filter_when_implicit: true,
        retention_files: logging::DEFAULT_LOG_RETENTION_FILES,
    };

    logging::select_log_filter(&options)
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(logging::redacting_make_writer(ready.appender))
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let attempted_log_dir = fallback
                .attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            let reason = fallback.reason;

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    let cfg_path = config_path(data_dir);
    info!(
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    if let Err(e) = initialize_data_dir(&data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(&data_dir);
    let mut config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    config.resolve_paths(&data_dir);

    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let catalog = load_catalog(&config.paths.workflows_dir)?;
    info!(
        workflows_dir = %catalog.dir().display(),
        workflows = catalog.list().len(),
        "Workflow catalog loaded"
    );

    let host_client = HttpExecutionHost::new(&config.upstream.base_url)?;
    info!(upstream = %logging::redact_url_credentials(&config.upstream.base_url), "Using execution host");

    let registry = JobRegistry::new(
        Arc::new(host_client),
        catalog,
        OutputLocator::new(config.paths.output_dir.clone(), config.registry.lookback_days),
        RegistryOptions {
            client_id: config.upstream.client_id_or_random(),
            upstream: config.upstream.clone(),
            release_failed_jobs: config.registry.release_failed_jobs,
        },
    );
    debug!(client_id = %registry.client_id(), "Upstream client id");

    let listener = bind_listener(&host, port, config.server.port_scan_attempts).await?;
    let bound_port = listener.local_addr()?.port();
    let server_info = ServerInfo {
        host: host.clone(),
        port: bound_port,
        local_ip: local_ip().to_string(),
    };
    info!(
        addr = %format!("{host}:{bound_port}"),
        lan = %server_info.address(),
        "Starting snuabar server"
    );

    let app = app_router(AppState::new(registry, server_info));
    axum::serve(listener, app).await?;
    Ok(())
}

fn load_catalog(workflows_dir: &Path) -> Result<WorkflowCatalog> {
    if !workflows_dir.join(MODEL_MAP_FILE).exists() {
        warn!(
            workflows_dir = %workflows_dir.display(),
            "No {MODEL_MAP_FILE} found; no workflows will be offered"
        );
        return Ok(WorkflowCatalog::empty(workflows_dir.to_path_buf()));
    }
    WorkflowCatalog::load(workflows_dir)
}

/// Ports tried in order: the requested one, then the ones after it. Port 0 scans from the default.
fn candidate_ports(port: u16, attempts: u16) -> Vec<u16> {
    let attempts = attempts.max(1);
    let start = if port == 0 { DEFAULT_PORT } else { port };
    (0..attempts)
        .map_while(|offset| start.checked_add(offset))
        .collect()
}

async fn bind_listener(host: &str, port: u16, attempts: u16) -> Result<TcpListener> {
    let mut last_error = None;
    for candidate in candidate_ports(port, attempts) {
        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => {
                if port != 0 && candidate != port {
                    warn!(requested = port, bound = candidate, "Requested port busy, using next free port");
                }
                return Ok(listener);
            }
            Err(err) => {
                debug!(port = candidate, error = %err, "Port unavailable");
                last_error = Some(err);
            }
        }
    }

    match last_error {
        Some(err) => Err(err).with_context(|| {
            format!("no free port on {host} after {attempts} attempts starting at {port}")
        }),
        None => bail!("no ports to try on {host}"),
    }
}

/// LAN address used to reach the default route. Nothing is sent on the socket.
fn local_ip() -> IpAddr {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
