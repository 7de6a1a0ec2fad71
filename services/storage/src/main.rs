use anyhow::{Context, Result};
use blinkwatch_pipeline::{KafkaConfig, TopicConsumer};
use blinkwatch_storage::{
    BlinkConsumer, Config, ConsumerKind, ConsumerLoop, EventHandler, EventStore, FrameConsumer,
    LoopStats, PgEventStore, SessionConsumer,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    let arg = std::env::args().nth(1);
    let kind = config
        .resolve_kind(arg.as_deref())
        .context("Failed to select consumer type")?;

    info!(
        service = %config.service.name,
        consumer = %kind,
        "Starting Blinkwatch storage consumer"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let kafka = config.kafka_for(kind);
    let topic = match kind {
        ConsumerKind::Frame => kafka.topics.frames.clone(),
        ConsumerKind::Blink => kafka.topics.blinks.clone(),
        ConsumerKind::Session => kafka.topics.sessions.clone(),
    };

    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutting down storage consumer");
        stop.cancel();
    });

    let stats = match kind {
        ConsumerKind::Frame => run(&config, kafka, FrameConsumer::new(topic), shutdown).await?,
        ConsumerKind::Blink => {
            let consumer = BlinkConsumer::new(topic).with_idle_horizon(config.blink_idle_horizon());
            run(&config, kafka, consumer, shutdown).await?
        }
        ConsumerKind::Session => {
            run(&config, kafka, SessionConsumer::new(topic), shutdown).await?
        }
    };

    info!(
        persisted = stats.persisted,
        invalid = stats.invalid,
        failed = stats.failed,
        "Storage consumer stopped"
    );

    Ok(())
}

/// Connect once to the store and the broker, then run the loop.
async fn run<H: EventHandler>(
    config: &Config,
    kafka: KafkaConfig,
    handler: H,
    shutdown: CancellationToken,
) -> Result<LoopStats> {
    let mut store = PgEventStore::connect(&config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;

    let mut source = match TopicConsumer::new(kafka) {
        Ok(source) => source,
        Err(e) => {
            release_store(&mut store).await;
            return Err(e).context("Failed to initialize Kafka consumer");
        }
    };
    if let Err(e) = source.subscribe(handler.topic()) {
        release_store(&mut store).await;
        return Err(e).context("Failed to subscribe");
    }

    ConsumerLoop::new(source, handler, store)
        .run(shutdown)
        .await
        .context("Consumer stopped on a fatal error")
}

async fn release_store(store: &mut PgEventStore) {
    if let Err(e) = store.close().await {
        warn!(error = %e, "Failed to close store connection");
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
