use std::sync::Arc;

use anyhow::Result;
use routecast::config::{ContainerDnsConfig, LoggerConfig};
use routecast::containerdns::docker::{CacheWorker, DockerEngine};
use routecast::containerdns::store::{ChainStore, DockerStore, MemoryStore, RecordStore};
use routecast::containerdns::{DnsServer, Handler};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};

#[tokio::main]
async fn main() -> Result<()> {
    let logger = LoggerConfig::from_env()?;
    init_tracing(&logger.level);

    let dns_cfg = ContainerDnsConfig::from_env()?;
    let engine = DockerEngine::connect().await?;

    let memory = Arc::new(MemoryStore::new());
    let mut docker_store = DockerStore::new(Arc::new(engine.clone()));
    docker_store.set_cache(Arc::clone(&memory));

    let chain = ChainStore::new(vec![
        Arc::clone(&memory) as Arc<dyn RecordStore>,
        Arc::new(docker_store),
    ]);
    let handler = Arc::new(Handler::new(chain));
    let server = DnsServer::bind(&dns_cfg, handler).await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(8);
    let (events_tx, events_rx) = mpsc::channel(16);

    // The engine's event stream has no shutdown arm of its own; it
    // is aborted once the workers have drained.
    let events_task = tokio::spawn(engine.clone().stream_events(events_tx));

    let worker = CacheWorker::new(Arc::new(engine), memory);
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(worker.run(events_rx, shutdown_tx.subscribe())));
    tasks.push(tokio::spawn(server.run(shutdown_tx.subscribe())));

    tracing::info!("routecast-dnsd started");

    wait_for_signal().await?;
    tracing::info!("received shutdown signal");
    let _ = shutdown_tx.send(());

    for task in tasks {
        let _ = task.await;
    }

    events_task.abort();
    let _ = events_task.await;

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
