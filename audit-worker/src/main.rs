//! Consume audit events from Kafka and persist them effectively once.
use std::time::Duration;

use envconfig::Envconfig;
use tokio::signal;

use audit_common::health::HealthRegistry;
use audit_common::metrics::{serve, setup_metrics_router};
use audit_worker::config::{Config, StoreBackend};
use audit_worker::error::WorkerError;
use audit_worker::kafka::{AuditConsumer, TransactionalProducer};
use audit_worker::sinks::elastic::ElasticStore;
use audit_worker::sinks::postgres::PostgresStore;
use audit_worker::sinks::LogStore;
use audit_worker::worker::PipelineWorker;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness.register("worker", time::Duration::seconds(60));

    let store: Box<dyn LogStore> = match config.store_backend {
        StoreBackend::Postgres => Box::new(
            PostgresStore::new(&config.database_url, config.max_pg_connections)
                .await
                .expect("failed to connect to postgres"),
        ),
        StoreBackend::Elastic => {
            let store = ElasticStore::new(&config.elastic_url)
                .expect("failed to build elasticsearch client");
            store
                .ensure_indices()
                .await
                .expect("failed to create elasticsearch indices");
            Box::new(store)
        }
    };

    let consumer = AuditConsumer::new(&config).expect("failed to create kafka consumer");
    let producer = TransactionalProducer::from_config(&config, Duration::from_secs(10))
        .expect("failed to create transactional kafka producer");

    let bind = config.bind();
    let router = setup_metrics_router(&liveness);
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let worker = PipelineWorker::new(consumer, producer, store, &config, worker_liveness);
    worker.run(shutdown()).await?;

    Ok(())
}
