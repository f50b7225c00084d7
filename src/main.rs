use mirrorgate::admin::{PKG_NAME, VERSION};
use mirrorgate::cloak::load_spider_ips;
use mirrorgate::config::Config;
use mirrorgate::convert;
use mirrorgate::proxy::{MirrorServer, MirrorState};
use mirrorgate::registry::SiteRegistry;
use mirrorgate::store::SqliteStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mirrorgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let store = Arc::new(SqliteStore::open(&config.server.database)?);
    let registry = Arc::new(SiteRegistry::load(store)?);
    let stats = registry.stats();
    info!(bound = stats.bound, unbound = stats.unbound, "Site registry loaded");

    let spider_ips = load_spider_ips(&config.cloak.spider_ip_files)?;
    if config.cloak.simulate_spiders {
        info!(count = spider_ips.len(), "Spider simulation enabled");
    }

    let state = Arc::new(MirrorState::new(
        &config,
        Arc::clone(&registry),
        spider_ips,
        convert::passthrough(),
    )?);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = MirrorServer::new(addr, state, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Mirror server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or registry reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading site registry...");
                    let registry = Arc::clone(&registry);
                    match tokio::task::spawn_blocking(move || registry.refresh()).await {
                        Ok(Ok(stats)) => {
                            info!(bound = stats.bound, unbound = stats.unbound, "Site registry reloaded");
                        }
                        Ok(Err(e)) => error!(error = %e, "Failed to reload site registry"),
                        Err(e) => error!(error = %e, "Site registry reload task failed"),
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for the server to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting mirror server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        tls_links = config.server.tls,
        database = %config.server.database,
        status_path = %config.server.status_path,
        image_prefix = %config.server.image_prefix,
        "Server configuration"
    );
    info!(
        root = %config.cache.root,
        save_images = config.cache.save_images,
        "Cache settings"
    );
    info!(
        proxy = config.upstream.proxy_url().unwrap_or("none"),
        request_timeout_secs = config.upstream.request_timeout_secs,
        pool_max_idle = config.upstream.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.upstream.pool_idle_timeout_secs,
        allow_external = config.upstream.allow_external,
        "Upstream settings"
    );
    info!(
        jump_mode = config.cloak.jump_mode,
        jump_index = config.cloak.jump_index,
        simulate_spiders = config.cloak.simulate_spiders,
        recognized_crawlers = config.crawlers.recognized.len(),
        approved_crawlers = config.crawlers.approved.len(),
        "Cloak settings"
    );
}
