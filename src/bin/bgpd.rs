use std::sync::Arc;

use anyhow::Result;
use routecast::bgp::{AnnouncerHooks, BgpServer};
use routecast::broadcast::Broadcaster;
use routecast::cache::Store;
use routecast::config::{BgpConfig, LoggerConfig, ResolverConfig, RouterConfig};
use routecast::resolver::Resolver;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;

#[tokio::main]
async fn main() -> Result<()> {
    let logger = LoggerConfig::from_env()?;
    init_tracing(&logger.level);

    let resolver_cfg = ResolverConfig::from_env()?;
    let bgp_cfg = BgpConfig::from_env()?;
    let router_cfg = RouterConfig::from_env()?;

    routecast::routeros::update_static_dns(&router_cfg).await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(8);
    let mut tasks = Vec::new();

    let (broadcaster, serve) = Broadcaster::new(bgp_cfg.attributes.clone());
    tasks.push(tokio::spawn(serve.run(shutdown_tx.subscribe())));

    let resolver = Resolver::new(resolver_cfg, Store::new(), broadcaster.clone());
    if resolver.enabled() {
        tasks.push(tokio::spawn(resolver.run(shutdown_tx.subscribe())));
    } else {
        tracing::info!("dns resolver disabled");
    }

    if bgp_cfg.enabled {
        let hooks = Arc::new(AnnouncerHooks::new(broadcaster.clone()));
        let server = BgpServer::new(bgp_cfg, hooks)?;
        let listener = server.bind().await?;
        tasks.push(tokio::spawn(server.serve(listener, shutdown_tx.clone())));
    } else {
        tracing::info!("bgp server disabled");
    }

    tracing::info!("routecast-bgpd started");

    wait_for_signal().await?;
    tracing::info!("received shutdown signal");
    let _ = shutdown_tx.send(());

    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}

fn init_tracing(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .json()
        .init();
}

async fn wait_for_signal() -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = hangup.recv() => {}
    }

    Ok(())
}
