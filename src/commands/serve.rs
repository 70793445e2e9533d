use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use kube::Client;
use tokio::signal;
use tracing::info;

use infergate::auth::{DEFAULT_JWKS_TTL, JwksCache, run_jwks_refresher};
use infergate::config::GatewayConfig;
use infergate::datastore::metrics::run_metrics_poller;
use infergate::datastore::{Datastore, EventAction, ObjectKind};
use infergate::ratelimit::RateLimiter;
use infergate::reconcile;
use infergate::scheduler::{PrefixCacheStore, Scheduler};
use infergate::server::{AppState, build_router, force_metrics};

use crate::cli::ServeArgs;

pub async fn run(args: ServeArgs) -> Result<()> {
    println!("Starting inference gateway...\n");

    let config = match &args.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    let store = Arc::new(Datastore::new());
    let prefix_cache = Arc::new(PrefixCacheStore::new(config.scheduler.prefix_cache.clone()));
    let scheduler = Arc::new(
        Scheduler::from_config(&config.scheduler, prefix_cache.clone())
            .map_err(|e| anyhow::anyhow!("{e}"))?,
    );
    let limiter = Arc::new(RateLimiter::connect(config.rate_limit.clone()).await?);
    let jwks = Arc::new(JwksCache::new(DEFAULT_JWKS_TTL));

    // Control-plane subscribers: removed pods leave the prefix cache, and
    // server changes force the limiter to rebuild its buckets.
    {
        let prefix = prefix_cache.clone();
        store.register_callback(
            ObjectKind::Pod,
            Arc::new(move |event| {
                if event.action == EventAction::Delete {
                    prefix.purge_pod(&event.key);
                }
            }),
        );
        let limiter = limiter.clone();
        store.register_callback(
            ObjectKind::ModelServer,
            Arc::new(move |event| {
                if event.action != EventAction::Add {
                    limiter.invalidate();
                }
            }),
        );
    }

    tokio::spawn(store.clone().run_dispatcher());
    tokio::spawn(reconcile::model_route::run(client.clone(), store.clone()));
    tokio::spawn(reconcile::model_server::run(client.clone(), store.clone()));
    tokio::spawn(reconcile::pod::run(client.clone(), store.clone()));
    tokio::spawn(run_metrics_poller(
        store.clone(),
        Duration::from_secs(args.metrics_interval.max(1)),
    ));
    tokio::spawn(run_jwks_refresher(jwks.clone(), DEFAULT_JWKS_TTL));

    force_metrics();
    let state = AppState::new(store, scheduler, limiter, jwks);
    state.set_ready();

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let scheme = if args.tls_cert.is_some() { "https" } else { "http" };

    println!("  CRD watches ................. ModelRoute, ModelServer, Pod");
    println!(
        "  Metrics poll interval ....... {}s",
        args.metrics_interval.max(1)
    );
    println!("  API server .................. {scheme}://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    POST /v1/chat/completions . OpenAI chat completions");
    println!("    POST /v1/completions ...... OpenAI completions");
    println!("    GET  /v1/models ........... Served models");
    println!("    GET  /healthz ............. Liveness probe");
    println!("    GET  /readyz .............. Readiness probe");
    println!("    GET  /metrics ............. Prometheus metrics");
    println!();
    println!("Gateway running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!(port = args.port, tls = args.tls_cert.is_some(), "gateway_started");

    let app = build_router(state);

    match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => {
            let tls = RustlsConfig::from_pem_file(cert, key)
                .await
                .context("Failed to load TLS certificate or key")?;
            let handle = axum_server::Handle::new();

            let shutdown_handle = handle.clone();
            tokio::spawn(async move {
                let _ = signal::ctrl_c().await;
                info!("shutdown_signal_received");
                shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
            });

            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        _ => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {addr}"))?;
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = signal::ctrl_c().await;
                    info!("shutdown_signal_received");
                })
                .await?;
        }
    }

    info!("gateway_stopped");
    println!("Gateway stopped.");
    Ok(())
}
