use std::{net::SocketAddr, sync::Arc};

use appsproxy::{
    adapters::{
        AppHandlerDeps, AppHandlerManager, HickoryResolver, HttpControlPlane, ProxyRouter,
        UpstreamManager, UpstreamSettings,
        auth::{AuthHandlerSettings, DefaultFlowFactory, IdentityHeaders},
    },
    config::{ProxyConfig, ProxyConfigValidator, loader::load_config},
    core::{ConfigCache, NotifyManager, WakeupManager},
    metrics,
    ports::{Clock, ControlPlane, Resolve, SystemClock},
    tracing_setup,
    utils::GracefulShutdown,
};
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Configuration file; `APPS_PROXY__*` environment variables override it
    #[clap(short, long, default_value = "config.toml", global = true)]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration and exit
    Validate,
    /// Start the proxy (default)
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command.unwrap_or(Commands::Serve) {
        Commands::Validate => validate_config_command(&args.config).await,
        Commands::Serve => serve(&args.config).await,
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let config = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    ProxyConfigValidator::validate(&config).map_err(|e| eyre!("{e}"))?;

    tracing_setup::init_tracing(&config.log).context("Failed to initialize tracing")?;
    metrics::init_metrics().context("Failed to initialize metrics")?;

    let public_domain = config
        .public_domain()
        .ok_or_else(|| eyre!("public_url has no host"))?;
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let control_plane: Arc<dyn ControlPlane> = Arc::new(
        HttpControlPlane::new(&config.api.url, &config.api.token, config.api.timeout())
            .context("Failed to create control plane client")?,
    );
    let resolver: Arc<dyn Resolve> =
        Arc::new(HickoryResolver::from_system_conf().context("Failed to create DNS resolver")?);

    let notify = Arc::new(NotifyManager::new(
        control_plane.clone(),
        clock.clone(),
        config.notify.interval(),
    ));
    let wakeup = Arc::new(WakeupManager::new(
        control_plane.clone(),
        clock.clone(),
        config.wakeup.interval(),
    ));
    let upstreams = Arc::new(
        UpstreamManager::new(resolver, notify, wakeup, upstream_settings(&config))
            .context("Failed to create upstream client")?,
    );

    let handlers = Arc::new(AppHandlerManager::new(AppHandlerDeps {
        flows: Arc::new(
            DefaultFlowFactory::new(config.api.timeout())
                .context("Failed to create identity provider client")?,
        ),
        upstreams: upstreams.clone(),
        clock: clock.clone(),
        auth: AuthHandlerSettings {
            cookie_secret_salt: config.auth.cookie_secret_salt.clone(),
            session_ttl: config.auth.session_ttl(),
            headers: IdentityHeaders::new(&config.auth.header_prefix)
                .context("Invalid auth.header_prefix")?,
        },
    }));
    let configs = Arc::new(ConfigCache::new(control_plane, clock));
    let app = Arc::new(ProxyRouter::new(public_domain.clone(), configs, handlers)).into_router();

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!(
        listen_addr = %addr,
        public_domain = %public_domain,
        control_plane = %config.api.url,
        "Apps proxy listening"
    );

    let shutdown_waiter = graceful_shutdown.clone();
    let server_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let reason = shutdown_waiter.wait_for_shutdown_signal().await;
        tracing::info!("Shutdown signal received: {:?}", reason);
    })
    .await
    .context("Server error");

    upstreams.shutdown().await;
    tracing::info!("Graceful shutdown completed");
    server_result
}

fn upstream_settings(config: &ProxyConfig) -> UpstreamSettings {
    UpstreamSettings {
        connect_timeout: std::time::Duration::from_secs(config.upstream.connect_timeout_secs),
        response_header_timeout: std::time::Duration::from_secs(
            config.upstream.response_header_timeout_secs,
        ),
        notify_timeout: config.notify.timeout(),
        wakeup_timeout: config.wakeup.timeout(),
        shutdown_timeout: std::time::Duration::from_secs(config.upstream.shutdown_timeout_secs),
    }
}

/// Validate configuration and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration: {config_path} (+ APPS_PROXY__* environment)");

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ProxyConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Public URL: {}", config.public_url);
            println!("   • Control Plane: {}", config.api.url);
            println!("   • Session TTL: {}s", config.auth.session_ttl_secs);
            println!(
                "   • Notify / Wakeup Interval: {}s / {}s",
                config.notify.interval_secs, config.wakeup.interval_secs
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
