use std::{process, sync::Arc};

use feedcache::{
    cache::{self, CacheConfig, CacheServices, InvalidationEvent, PrewarmSource},
    config,
    error::AppError,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        origin::OriginClient,
        telemetry,
    },
};
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
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Ping(_) => run_ping(settings).await,
        config::Command::Invalidate(args) => run_invalidate(settings, &args.event).await,
    }
}

async fn connect_services(settings: &config::Settings) -> Result<CacheServices, AppError> {
    let backend = cache::store::connect(&settings.store.url, &settings.store.key_prefix)
        .await
        .map_err(|err| InfraError::store(err.to_string()))?;
    Ok(CacheServices::new(backend, &CacheConfig::from(settings)))
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let services = connect_services(&settings).await?;
    info!(
        backend = services.store.backend_name(),
        reachable = services.store.ping().await,
        "Cache store connected"
    );

    let origin = match settings.origin.base_url {
        Some(_) => Some(Arc::new(
            OriginClient::from_settings(&settings.origin)
                .map_err(|err| InfraError::origin(err.to_string()))?,
        )),
        None => {
            warn!("No origin configured; pre-warming and timeline reads are disabled");
            None
        }
    };
    let prewarm = origin
        .as_ref()
        .map(|client| services.prewarm(Arc::clone(client) as Arc<dyn PrewarmSource>));

    let router = http::build_router(HttpState {
        cache: services,
        prewarm,
        origin,
    });
    http::serve(
        settings.server.addr,
        settings.server.graceful_shutdown,
        router,
    )
    .await?;
    Ok(())
}

async fn run_ping(settings: config::Settings) -> Result<(), AppError> {
    let services = connect_services(&settings).await?;
    if services.store.ping().await {
        println!(
            "store {} ({}) is reachable",
            settings.store.url,
            services.store.backend_name()
        );
        Ok(())
    } else {
        Err(AppError::unexpected(format!(
            "store {} did not answer PING",
            settings.store.url
        )))
    }
}

async fn run_invalidate(settings: config::Settings, raw_event: &str) -> Result<(), AppError> {
    let event: InvalidationEvent = serde_json::from_str(raw_event)
        .map_err(|err| AppError::validation(format!("invalid event JSON: {err}")))?;
    let services = connect_services(&settings).await?;
    let report = services
        .router
        .route(&event)
        .await
        .map_err(|err| AppError::validation(err.to_string()))?;
    let rendered = serde_json::to_string_pretty(&report)
        .map_err(|err| AppError::unexpected(err.to_string()))?;
    println!("{rendered}");
    Ok(())
}
