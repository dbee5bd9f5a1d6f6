use std::{future::IntoFuture, process, sync::Arc, time::Duration};

use keystash::{
    application::{
        bulk_delete::{BulkDeleteConfig, BulkDeleteWorkflow},
        cache::{CacheService, CacheServiceConfig},
        cache_names::CacheNameRegistry,
        error::AppError,
        expiry::ExpiryScheduler,
        jobs::JobWorkerContext,
        repos::{
            CacheNameRepo, DeletionJobRepo, EntryJournal, JobsRepo, KeyIndexRepo,
            ProjectionOutbox, UsageRepo,
        },
        store::ChunkedCacheStore,
    },
    config,
    infra::{
        db::PostgresRepositories,
        error::InfraError,
        http::{self, HttpState},
        jobs::{InlineJobRunner, spawn_job_monitor},
        memory::MemoryRepositories,
        telemetry,
    },
    projection::{EventQueue, ProjectionConfig, ProjectionConsumer, UsageLedger},
};
use tokio::sync::oneshot;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Migrate(_) => run_migrate(settings).await,
    }
}

/// Persistence adapters behind the service traits.
struct Repositories {
    journal: Arc<dyn EntryJournal>,
    outbox: Arc<dyn ProjectionOutbox>,
    names: Arc<dyn CacheNameRepo>,
    index: Arc<dyn KeyIndexRepo>,
    usage: Arc<dyn UsageRepo>,
    deletions: Arc<dyn DeletionJobRepo>,
    db: Option<Arc<PostgresRepositories>>,
}

impl Repositories {
    fn shared<R>(repos: Arc<R>, db: Option<Arc<PostgresRepositories>>) -> Self
    where
        R: EntryJournal
            + ProjectionOutbox
            + CacheNameRepo
            + KeyIndexRepo
            + UsageRepo
            + DeletionJobRepo
            + 'static,
    {
        Self {
            journal: repos.clone(),
            outbox: repos.clone(),
            names: repos.clone(),
            index: repos.clone(),
            usage: repos.clone(),
            deletions: repos,
            db,
        }
    }
}

async fn connect_database(
    settings: &config::Settings,
    url: &str,
) -> Result<PostgresRepositories, AppError> {
    let pool = PostgresRepositories::connect(url, settings.database.max_connections.get())
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::migration(err.to_string())))?;

    Ok(PostgresRepositories::new(pool))
}

async fn init_repositories(settings: &config::Settings) -> Result<Repositories, AppError> {
    match settings.database.url.as_deref() {
        Some(url) => {
            let db = Arc::new(connect_database(settings, url).await?);
            info!(
                max_connections = settings.database.max_connections.get(),
                "Using Postgres repositories"
            );
            Ok(Repositories::shared(db.clone(), Some(db)))
        }
        None => {
            warn!("No database configured; cache state will not survive a restart");
            Ok(Repositories::shared(Arc::new(MemoryRepositories::new()), None))
        }
    }
}

async fn run_migrate(settings: config::Settings) -> Result<(), AppError> {
    let url = settings
        .database
        .url
        .as_deref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))
        .map_err(AppError::from)?;

    connect_database(&settings, url).await?;
    info!("Migrations applied");
    Ok(())
}

struct ApplicationContext {
    cache: Arc<CacheService>,
    consumer: Arc<ProjectionConsumer>,
    expiry: Arc<ExpiryScheduler>,
    journal: Arc<dyn EntryJournal>,
    job_context: JobWorkerContext,
    db: Option<Arc<PostgresRepositories>>,
}

fn build_application_context(
    repositories: Repositories,
    settings: &config::Settings,
) -> ApplicationContext {
    let queue = Arc::new(EventQueue::new(repositories.outbox));
    let store = Arc::new(ChunkedCacheStore::with_capacity(
        repositories.journal.clone(),
        queue.clone(),
        settings.store.state_cache_capacity,
    ));
    let expiry = Arc::new(ExpiryScheduler::new(store.clone()));
    let ledger = Arc::new(UsageLedger::new(repositories.usage));
    let consumer = Arc::new(ProjectionConsumer::new(
        ProjectionConfig::from(settings),
        queue,
        repositories.index.clone(),
        ledger.clone(),
    ));
    let names = CacheNameRegistry::new(repositories.names);
    let workflow = Arc::new(BulkDeleteWorkflow::new(
        repositories.deletions,
        repositories.index.clone(),
        store.clone(),
        expiry.clone(),
        names.clone(),
        BulkDeleteConfig::from(&settings.bulk_delete),
    ));
    let job_context = JobWorkerContext {
        workflow: workflow.clone(),
    };
    let jobs: Arc<dyn JobsRepo> = match &repositories.db {
        Some(db) => db.clone(),
        None => Arc::new(InlineJobRunner::new(job_context.clone())),
    };
    let cache = Arc::new(CacheService::new(
        store,
        expiry.clone(),
        repositories.index,
        ledger,
        names,
        workflow,
        jobs,
        CacheServiceConfig::from(settings),
    ));

    ApplicationContext {
        cache,
        consumer,
        expiry,
        journal: repositories.journal,
        job_context,
        db: repositories.db,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let repositories = init_repositories(&settings).await?;
    let app = build_application_context(repositories, &settings);

    app.expiry
        .restore(app.journal.as_ref())
        .await
        .map_err(|err| AppError::unexpected(format!("failed to restore expiry timers: {err}")))?;

    let consumer = app.consumer.clone();
    let consume_handle = tokio::spawn(async move {
        let interval_ms = consumer.config().consume_interval_ms.max(1);
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = consumer.queue().notified() => {}
            }
            consumer.consume_all().await;
        }
    });

    let monitor_handle = app.db.as_ref().map(|db| {
        spawn_job_monitor(
            db.pool().clone(),
            app.job_context.clone(),
            settings.bulk_delete.concurrency.get(),
        )
    });

    let state = HttpState::new(app.cache, app.db);
    let result = serve_http(&settings, state).await;

    if let Some(handle) = monitor_handle {
        handle.abort();
        let _ = handle.await;
    }
    consume_handle.abort();
    let _ = consume_handle.await;
    let batches = app.consumer.consume_all().await;
    info!(batches, "Projection queue drained");

    result
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state, settings.server.max_request_bytes.get());
    let addr = settings.server.addr;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| AppError::from(InfraError::Bind { addr, source }))?;
    info!(%addr, "Listening");

    let (signalled_tx, signalled_rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = signalled_tx.send(());
        })
        .into_future();

    let grace = settings.server.graceful_shutdown;
    let deadline = async move {
        if signalled_rx.await.is_err() {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))
        }
        _ = deadline => {
            warn!(grace_seconds = grace.as_secs(), "Graceful shutdown timed out");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
