//! Operator binary for the outbox/idempotency/compensation stack.
//!
//! Grounded in the teacher's `outbox-cli` bootstrap (connect, run one
//! operation, print a summary, exit) generalized to every long-running and
//! one-shot operation the core exposes, plus the teacher's service-main
//! ambient stack (tracing init, `DbConfig::from_env`, signal-based shutdown)
//! for the subcommands that run forever.

use anyhow::{Context, Result};
use async_trait::async_trait;
use broker_adapter::{
    AmqpBrokerAdapter, BrokerAdapter, ConsumeCallback, InMemoryBrokerAdapter, KafkaBrokerAdapter,
    RawHandle, SendOutcome,
};
use clap::{Parser, Subcommand};
use compensation_scanner::{CompensationScanner, ScannerConfig};
use db_pool::DbConfig;
use idempotency_store::{IdempotencyStore, SqlxIdempotencyStore};
use outbox_dispatcher::{Dispatcher, DispatcherConfig};
use outbox_store::{OutboxStore, SqlxOutboxStore};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Selects among the concrete broker adapters at runtime without forcing
/// `Dispatcher`/`EventConsumer` to generalize over `dyn BrokerAdapter`.
enum AnyBrokerAdapter {
    Kafka(KafkaBrokerAdapter),
    Amqp(AmqpBrokerAdapter),
    Memory(InMemoryBrokerAdapter),
}

#[async_trait]
impl BrokerAdapter for AnyBrokerAdapter {
    async fn send(
        &self,
        topic: &str,
        payload: &[u8],
        message_id: &str,
        options: Option<&str>,
    ) -> SendOutcome {
        match self {
            Self::Kafka(a) => a.send(topic, payload, message_id, options).await,
            Self::Amqp(a) => a.send(topic, payload, message_id, options).await,
            Self::Memory(a) => a.send(topic, payload, message_id, options).await,
        }
    }

    async fn consume(&self, topics: Vec<String>, callback: ConsumeCallback) -> Result<()> {
        match self {
            Self::Kafka(a) => a.consume(topics, callback).await,
            Self::Amqp(a) => a.consume(topics, callback).await,
            Self::Memory(a) => a.consume(topics, callback).await,
        }
    }

    async fn ack(&self, handle: RawHandle) -> Result<()> {
        match self {
            Self::Kafka(a) => a.ack(handle).await,
            Self::Amqp(a) => a.ack(handle).await,
            Self::Memory(a) => a.ack(handle).await,
        }
    }

    async fn nack(&self, handle: RawHandle, requeue: bool) -> Result<()> {
        match self {
            Self::Kafka(a) => a.nack(handle, requeue).await,
            Self::Amqp(a) => a.nack(handle, requeue).await,
            Self::Memory(a) => a.nack(handle, requeue).await,
        }
    }

    async fn close(&self) -> Result<()> {
        match self {
            Self::Kafka(a) => a.close().await,
            Self::Amqp(a) => a.close().await,
            Self::Memory(a) => a.close().await,
        }
    }
}

#[derive(Parser)]
#[command(name = "mq-outbox", about = "Transactional outbox operator tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the outbox and idempotency tables if they don't exist.
    CreateSchema,
    /// Run a single dispatcher cycle and exit.
    DispatchOnce,
    /// Run the dispatcher forever, polling on its configured interval.
    RunDispatcher,
    /// Run the compensation scanner's producer-side sweep once and exit.
    CompensateProducer,
    /// Run the compensation scanner's consumer-side sweep once and exit.
    CompensateConsumer,
    /// Run both compensation sweeps forever, polling on the configured interval.
    RunCompensation,
    /// Requeue a failed outbox message back to pending so the dispatcher
    /// picks it up again.
    Replay {
        /// The message_id of the failed outbox record to requeue.
        message_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "mq_outbox=info,info".into()))
        .with_target(false)
        .json()
        .init();

    let cli = Cli::parse();

    let db_config = DbConfig::from_env("mq-outbox-cli").map_err(anyhow::Error::msg)?;
    let pool = db_pool::create_pool(db_config)
        .await
        .context("failed to create database pool")?;

    let outbox = Arc::new(SqlxOutboxStore::new(pool.clone()));
    let idempotency = Arc::new(SqlxIdempotencyStore::new(pool));

    match cli.command {
        Commands::CreateSchema => {
            outbox.create_schema().await.context("creating outbox schema")?;
            idempotency
                .create_schema()
                .await
                .context("creating idempotency schema")?;
            info!("schema created");
        }
        Commands::DispatchOnce => {
            let broker = build_broker().await?;
            let dispatcher = Dispatcher::new(outbox, broker, DispatcherConfig::from_env());
            let sent = dispatcher.dispatch_once().await.context("dispatch cycle failed")?;
            info!(sent_count = sent, "dispatch cycle complete");
        }
        Commands::RunDispatcher => {
            let broker = build_broker().await?;
            let config = DispatcherConfig::from_env();
            let interval = config.poll_interval;
            let dispatcher = Dispatcher::new(outbox, broker, config);
            let token = CancellationToken::new();
            let watcher = token.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                watcher.cancel();
            });
            dispatcher.run(interval, None, token).await;
            info!("dispatcher stopped");
        }
        Commands::CompensateProducer => {
            let scanner = CompensationScanner::new(outbox, idempotency, ScannerConfig::from_env());
            let count = scanner.check_producer().await.context("producer compensation sweep failed")?;
            info!(compensated = count, "producer compensation sweep complete");
        }
        Commands::CompensateConsumer => {
            let scanner = CompensationScanner::new(outbox, idempotency, ScannerConfig::from_env());
            let count = scanner.check_consumer().await.context("consumer compensation sweep failed")?;
            info!(compensated = count, "consumer compensation sweep complete");
        }
        Commands::RunCompensation => {
            let config = ScannerConfig::from_env();
            let scanner = CompensationScanner::new(outbox, idempotency, config);
            let token = CancellationToken::new();
            let watcher = token.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                watcher.cancel();
            });
            scanner.run(None, token).await;
            info!("compensation scanner stopped");
        }
        Commands::Replay { message_id } => {
            let requeued = outbox.requeue(&message_id).await.context("requeue failed")?;
            if requeued {
                info!(message_id = %message_id, "message requeued to pending");
            } else {
                info!(message_id = %message_id, "no matching failed message found");
            }
        }
    }

    Ok(())
}

/// Select a broker adapter implementation from `BROKER_KIND` (`kafka`,
/// `amqp`, or `memory`, defaulting to `memory`).
async fn build_broker() -> Result<Arc<AnyBrokerAdapter>> {
    let kind = std::env::var("BROKER_KIND").unwrap_or_else(|_| "memory".into());
    match kind.as_str() {
        "kafka" => {
            let brokers = std::env::var("KAFKA_BROKERS").context("KAFKA_BROKERS must be set for BROKER_KIND=kafka")?;
            let client_id = std::env::var("KAFKA_CLIENT_ID").unwrap_or_else(|_| "mq-outbox".into());
            let group_id = std::env::var("KAFKA_GROUP_ID").unwrap_or_else(|_| "mq-outbox".into());
            let adapter = KafkaBrokerAdapter::new(&brokers, &client_id, &group_id)
                .context("failed to build kafka broker adapter")?;
            Ok(Arc::new(AnyBrokerAdapter::Kafka(adapter)))
        }
        "amqp" => {
            let uri = std::env::var("AMQP_URI").context("AMQP_URI must be set for BROKER_KIND=amqp")?;
            let adapter = AmqpBrokerAdapter::connect(&uri)
                .await
                .context("failed to connect amqp broker adapter")?;
            Ok(Arc::new(AnyBrokerAdapter::Amqp(adapter)))
        }
        "memory" => Ok(Arc::new(AnyBrokerAdapter::Memory(InMemoryBrokerAdapter::new()))),
        other => anyhow::bail!("unknown BROKER_KIND: {other}"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c, shutting down"),
        _ = terminate => info!("received sigterm, shutting down"),
    }
}
