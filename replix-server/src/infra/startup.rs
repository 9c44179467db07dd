//! Builds the runtime object graph from a loaded [`Config`].

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use replix_config::Config;
use replix_core::credentials::{
    AesGcmVault, EnvParameterStore, FileParameterStore, ParameterStore,
};
use replix_core::database::{InMemoryJobRepository, PostgresJobRepository};
use replix_core::metrics::{FacadeMetrics, ProvisioningMetrics};
use replix_core::provisioning::{ComputeBackend, HttpComputeBackend, UnconfiguredBackend};
use replix_core::queue::{InMemoryQueue, ProvisioningQueue, QueueConsumer, RedisQueue};
use replix_core::{
    AdmissionController, ApiKeyHandle, DispatchMode, JobLifecycle, JobRepository,
    ProvisioningEngine,
};

use super::app_state::AppState;

/// Where provisioning messages go.
#[derive(Debug, Clone)]
pub enum QueueBackend {
    Redis(RedisQueue),
    /// In-process queue for dev mode without Redis; the consumer has to run
    /// inside the server process to see its messages.
    InProcess(Arc<InMemoryQueue>),
}

impl QueueBackend {
    fn as_dyn(&self) -> Arc<dyn ProvisioningQueue> {
        match self {
            QueueBackend::Redis(queue) => Arc::new(queue.clone()),
            QueueBackend::InProcess(queue) => queue.clone(),
        }
    }
}

/// Everything the binary needs after startup.
#[derive(Debug)]
pub struct Runtime {
    pub state: AppState,
    pub queue: Option<QueueBackend>,
    pub consumer: Option<Arc<QueueConsumer>>,
}

pub async fn connect_pool(database_url: &str, max_connections: u32) -> anyhow::Result<sqlx::PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .with_context(|| {
            format!(
                "failed to connect to PostgreSQL at {}",
                replix_core::redact(database_url)
            )
        })
}

pub async fn run_migrations(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    replix_core::MIGRATOR
        .run(pool)
        .await
        .context("database migration failed")?;
    info!("database migrations applied");
    Ok(())
}

async fn build_repository(config: &Config) -> anyhow::Result<Arc<dyn JobRepository>> {
    match &config.database.url {
        Some(url) => {
            let pool = connect_pool(url, config.database.max_connections).await?;
            if config.dev_mode {
                run_migrations(&pool).await?;
            }
            info!(database = %replix_core::redact(url), "job records stored in PostgreSQL");
            Ok(Arc::new(PostgresJobRepository::new(pool)))
        }
        None => {
            warn!("no database configured; job records are kept in memory");
            Ok(Arc::new(InMemoryJobRepository::new()))
        }
    }
}

fn build_backend(config: &Config) -> anyhow::Result<Arc<dyn ComputeBackend>> {
    let provisioning = &config.provisioning;
    match &provisioning.compute_endpoint {
        Some(endpoint) => {
            let backend = HttpComputeBackend::new(endpoint, provisioning.compute_timeout)
                .context("failed to build compute backend client")?;
            info!(endpoint = %endpoint, "compute backend configured");
            Ok(Arc::new(backend))
        }
        None => Ok(Arc::new(UnconfiguredBackend)),
    }
}

async fn build_queue(config: &Config) -> anyhow::Result<Option<QueueBackend>> {
    let policy = config.queue.redelivery_policy();
    match &config.redis {
        Some(redis) => {
            let queue = RedisQueue::connect(&redis.url, config.queue.name.clone(), policy)
                .await
                .context("failed to connect provisioning queue")?;
            Ok(Some(QueueBackend::Redis(queue)))
        }
        None if config.provisioning.mode == DispatchMode::Queued => Ok(Some(
            QueueBackend::InProcess(Arc::new(InMemoryQueue::new(policy))),
        )),
        None => Ok(None),
    }
}

fn build_parameter_store(config: &Config) -> Arc<dyn ParameterStore> {
    match &config.auth.parameter_store_dir {
        Some(dir) => Arc::new(FileParameterStore::new(dir.clone())),
        None => Arc::new(EnvParameterStore),
    }
}

/// Connect every adapter and assemble the lifecycle, the HTTP state and,
/// when a queue is configured, the queue consumer.
pub async fn wire(config: &Config) -> anyhow::Result<Runtime> {
    let repository = build_repository(config).await?;
    let vault = Arc::new(AesGcmVault::new(config.vault.key()).context("invalid vault key")?);
    let metrics: Arc<dyn ProvisioningMetrics> = Arc::new(FacadeMetrics);
    let backend = build_backend(config)?;

    let provisioning = &config.provisioning;
    let admission = Arc::new(AdmissionController::new(
        repository.clone(),
        provisioning.max_concurrent_jobs,
    ));
    let engine = Arc::new(ProvisioningEngine::new(
        repository.clone(),
        backend,
        provisioning.worker_template(),
        provisioning.retry_policy(),
        metrics.clone(),
    ));

    let queue = build_queue(config).await?;

    let mut lifecycle = JobLifecycle::new(
        repository.clone(),
        vault,
        admission.clone(),
        engine.clone(),
        metrics.clone(),
    )
    .with_retention(chrono::Duration::days(i64::from(config.retention_days)));
    if let (DispatchMode::Queued, Some(queue)) = (provisioning.mode, &queue) {
        lifecycle = lifecycle.with_queue(queue.as_dyn());
    }

    let consumer = queue.as_ref().map(|queue| {
        Arc::new(
            QueueConsumer::new(
                queue.as_dyn(),
                repository.clone(),
                admission.clone(),
                engine.clone(),
                metrics.clone(),
            )
            .with_batch_size(config.queue.batch_size)
            .with_poll_interval(config.queue.poll_interval),
        )
    });

    let api_key = Arc::new(ApiKeyHandle::new(
        build_parameter_store(config),
        config.auth.api_key_parameter.clone(),
    ));

    info!(
        mode = lifecycle.mode().as_str(),
        max_concurrent_jobs = provisioning.max_concurrent_jobs,
        max_attempts = provisioning.max_attempts,
        default_tier = %provisioning.default_tier,
        "provisioning configuration in effect"
    );

    Ok(Runtime {
        state: AppState::new(Arc::new(lifecycle), api_key),
        queue,
        consumer,
    })
}
