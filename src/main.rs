use anyhow::Context;
use clap::Parser;
use kafka_lag_engine::cache::{FileCache, PersistentCache};
use kafka_lag_engine::cluster::ClusterManager;
use kafka_lag_engine::config::Config;
use kafka_lag_engine::http::server::HttpServer;
use kafka_lag_engine::metrics::registry::MetricsRegistry;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "kafka-lag-engine")]
#[command(about = "Kafka consumer offset, highwater offset and consumer lag collector")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Run a single collection cycle per instance and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Starting kafka-lag-engine");

    let config = Config::load(Some(&args.config))?;
    info!(
        instances = config.instances.len(),
        poll_interval = ?config.exporter.poll_interval,
        cache_dir = %config.exporter.cache_dir.display(),
        "Configuration loaded"
    );

    let registry = Arc::new(MetricsRegistry::new());
    let cache: Arc<dyn PersistentCache> = Arc::new(
        FileCache::new(&config.exporter.cache_dir).with_context(|| {
            format!(
                "creating cache directory {}",
                config.exporter.cache_dir.display()
            )
        })?,
    );

    if args.once {
        return run_once(&config, registry, cache).await;
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let mut handles = Vec::new();
    for instance_config in config.instances.clone() {
        let registry = Arc::clone(&registry);
        let cache = Arc::clone(&cache);
        let shutdown_rx = shutdown_tx.subscribe();
        let exporter_config = config.exporter.clone();

        let handle = tokio::spawn(async move {
            let manager =
                match ClusterManager::new(&instance_config, &exporter_config, registry, cache) {
                    Ok(m) => m,
                    Err(e) => {
                        error!(
                            instance = instance_config.name,
                            error = %e,
                            "Failed to create cluster manager"
                        );
                        return;
                    }
                };

            manager.run(shutdown_rx).await;
        });

        handles.push(handle);
    }

    let http_server = HttpServer::new(
        &config.exporter.http_host,
        config.exporter.http_port,
        Arc::clone(&registry),
    )?;

    let shutdown_rx = shutdown_tx.subscribe();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = http_server.run(shutdown_rx).await {
            error!(error = %e, "HTTP server error");
        }
    });

    shutdown_signal().await;
    info!("Shutdown signal received, stopping...");

    let _ = shutdown_tx.send(());
    let _ = server_handle.await;

    let shutdown_timeout = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        futures::future::join_all(handles),
    );

    match shutdown_timeout.await {
        Ok(_) => info!("All cluster managers stopped"),
        Err(_) => error!("Timeout waiting for cluster managers to stop"),
    }

    info!("kafka-lag-engine stopped");
    Ok(())
}

async fn run_once(
    config: &Config,
    registry: Arc<MetricsRegistry>,
    cache: Arc<dyn PersistentCache>,
) -> anyhow::Result<()> {
    let mut failed = Vec::new();
    for instance_config in &config.instances {
        let manager = ClusterManager::new(
            instance_config,
            &config.exporter,
            Arc::clone(&registry),
            Arc::clone(&cache),
        )?;
        match manager.collect_once().await {
            Ok(summary) => info!(instance = manager.instance(), ?summary, "Cycle finished"),
            Err(e) => {
                error!(instance = manager.instance(), error = %e, "Cycle failed");
                failed.push(instance_config.name.clone());
            }
        }
    }

    print!("{}", registry.render_prometheus());

    if failed.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("collection failed for instances: {}", failed.join(", "))
    }
}

fn init_logging(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
