use std::{future::IntoFuture, process, sync::Arc};

use ondata::{
    application::{
        data::DataService,
        error::AppError,
        producer::{ProducerConfig, ResultProducer},
        repos::SeriesSource,
    },
    cache::{BlobStore, CacheConfig, CacheCoordinator, MemoryBlobStore, TokioClock},
    config::{self, StorageBackend},
    infra::{
        db::PostgresRepositories,
        dependency::{TracedBlobStore, TracedSeriesSource},
        error::InfraError,
        http::{self, HttpState},
        storage::FsBlobStore,
        telemetry,
    },
};
use tokio::sync::watch;
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
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let source = init_source(&settings)?;
    let store = init_store(&settings)?;

    let cache = Arc::new(CacheCoordinator::new(
        store.clone(),
        Arc::new(TokioClock),
        CacheConfig::from(&settings.cache),
    ));
    let producer = ResultProducer::new(source.clone(), ProducerConfig::from(&settings.producer));
    let data = Arc::new(DataService::new(cache, producer));

    let state = HttpState {
        data,
        store,
        source,
        public_url: settings.service.public_url.clone(),
        container: settings.storage.container.clone(),
    };

    serve_http(&settings, state).await
}

fn init_source(settings: &config::Settings) -> Result<Arc<dyn SeriesSource>, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))
        .map_err(AppError::from)?;

    let pool =
        PostgresRepositories::connect_lazy(database_url, settings.database.max_connections.get())
            .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;
    let repositories: Arc<dyn SeriesSource> = Arc::new(PostgresRepositories::new(
        pool,
        settings.database.released_only,
    ));

    Ok(Arc::new(TracedSeriesSource::new(repositories)))
}

fn init_store(settings: &config::Settings) -> Result<Arc<dyn BlobStore>, AppError> {
    let storage = &settings.storage;
    let inner: Arc<dyn BlobStore> = match storage.backend {
        StorageBackend::Memory => Arc::new(MemoryBlobStore::new(
            Arc::new(TokioClock),
            storage.public_base_url.clone(),
            storage.container.clone(),
        )),
        StorageBackend::Filesystem => Arc::new(
            FsBlobStore::new(
                storage.directory.clone(),
                storage.container.clone(),
                storage.public_base_url.clone(),
            )
            .map_err(|err| AppError::from(InfraError::from(err)))?,
        ),
    };

    info!(
        target = "ondata::startup",
        backend = ?storage.backend,
        container = %storage.container,
        "blob store ready"
    );

    Ok(Arc::new(TracedBlobStore::new(inner)))
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "ondata::startup",
        addr = %settings.server.addr,
        "listening"
    );

    let (stopping_tx, mut stopping_rx) = watch::channel(false);
    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown(
        async move {
            wait_for_shutdown_signal().await;
            let _ = stopping_tx.send(true);
        },
    );

    let grace = settings.server.graceful_shutdown;
    let deadline = async move {
        if stopping_rx.wait_for(|stopping| *stopping).await.is_ok() {
            tokio::time::sleep(grace).await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = server.into_future() => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
        }
        () = deadline => {
            warn!(
                target = "ondata::shutdown",
                grace_seconds = grace.as_secs(),
                "graceful shutdown window elapsed; dropping open connections"
            );
        }
    }

    info!(target = "ondata::shutdown", "server stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = sigint.recv() => {}
                }
            }
            _ => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!(target = "ondata::shutdown", "shutdown signal received");
}
