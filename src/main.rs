use std::sync::Arc;

use color_eyre::eyre::WrapErr;
use trust_service::{
    audit::{AuditLog, Counters},
    config::{Config, StoreBackend, TransportKind},
    crypto,
    dispatch::{ChannelTransport, Notifier, RedisTransport, Transport, WorkerQueues},
    persistence::JsonFile,
    registry::Registry,
    revocation::{MemoryRevocationStore, RedisRevocationStore, RevocationStore},
    scheduler::{FireTable, Scheduler, SystemClock},
    service::TrustService,
    telemetry,
};
use secrecy::ExposeSecret;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let _ = dotenvy::dotenv();
    telemetry::init_tracing();
    crypto::init()?;

    // Load configuration
    let config = Config::load()?;
    info!(
        store = ?config.store.backend,
        transport = ?config.dispatch.transport,
        "Loaded configuration"
    );
    if let Some(proxy) = config.network.proxy() {
        debug!(host = %proxy.host, port = proxy.port, "Workers use a proxy");
    }

    match config.store.backend {
        StoreBackend::Memory => run(config, MemoryRevocationStore::new()).await,
        StoreBackend::Redis => {
            let redis = config
                .redis
                .as_ref()
                .ok_or_else(|| color_eyre::eyre::eyre!("redis.uri is not configured"))?;
            let conn = redis
                .start()
                .await
                .wrap_err("Failed to connect to the revocation store")?;
            run(config, RedisRevocationStore::new(conn)).await
        }
    }
}

async fn run<S: RevocationStore>(config: Config, store: S) -> color_eyre::Result<()> {
    let counters = Arc::new(Counters::new());
    let audit = Arc::new(AuditLog::default());

    let registry = match &config.registry.path {
        Some(path) => Registry::load(JsonFile::new(path)).await?,
        None => Registry::in_memory(),
    };
    let table = match &config.scheduler.state_path {
        Some(path) => FireTable::on_disk(JsonFile::new(path)),
        None => FireTable::volatile(),
    };
    let scheduler = Scheduler::new(Arc::new(SystemClock), table).await?;

    let mut background: Vec<JoinHandle<()>> = Vec::new();
    let mut redis_transport = None;
    let transport: Arc<dyn Transport> = match config.dispatch.transport {
        TransportKind::Channel => {
            let (transport, queues) = ChannelTransport::new(config.dispatch.queue_capacity);
            background.push(drain_unattended(queues));
            Arc::new(transport)
        }
        TransportKind::Redis => {
            let uri = config
                .redis
                .as_ref()
                .ok_or_else(|| color_eyre::eyre::eyre!("redis.uri is not configured"))?
                .uri
                .expose_secret()
                .to_string();
            let transport = RedisTransport::connect(&uri, config.dispatch.queue_capacity)
                .await
                .wrap_err("Failed to connect to the worker queues")?;
            redis_transport = Some(transport.clone());
            Arc::new(transport)
        }
    };
    let notifier = Notifier::new(
        transport,
        config.dispatch.retry_policy(),
        Arc::clone(&counters),
        Arc::clone(&audit),
    )
    .with_proxy(config.network.proxy());

    let service = Arc::new(
        TrustService::new(store, registry, scheduler.clone(), notifier, counters, audit)
            .with_default_cron(config.scheduler.default_cron.clone()),
    );

    // Configured clock drift settings seed the registry on first start
    if service.registry().clock_drift().await.is_none() && config.clock_drift.cron.is_some() {
        service
            .set_clock_drift(Some(config.clock_drift.to_config()))
            .await?;
    }
    service.rehydrate().await;

    if let Some(transport) = redis_transport {
        let listener = transport.report_listener().await?;
        background.push(Arc::clone(&service).spawn_report_listener(listener));
    }
    let dispatcher = scheduler.start(service.clone());

    info!("Trust service running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    scheduler.shutdown();
    for task in background {
        task.abort();
    }
    if let Err(e) = dispatcher.await {
        warn!("Scheduler task ended abnormally: {e}");
    }
    info!(counters = ?service.counters().snapshot(), "Stopped");
    Ok(())
}

/// Without an out-of-process worker, in-process requests are only logged.
fn drain_unattended(queues: WorkerQueues) -> JoinHandle<()> {
    let WorkerQueues {
        mut harvester,
        mut downloader,
    } = queues;
    tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                Some(envelope) = harvester.recv() => envelope,
                Some(envelope) = downloader.recv() => envelope,
                else => break,
            };
            info!(id = %envelope.id, kind = envelope.message.kind(), "No worker attached, request dropped");
        }
    })
}
