use std::sync::Arc;

use immix_chat::error::{
    BindSnafu, ConfigureGeneratorSnafu, LoadConfigSnafu, OpenStorageSnafu, ServeSnafu,
};
use immix_chat::{AppState, ServerError, ServerSettings, router};
use snafu::ResultExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "immix=info,tower_http=info";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    if let Err(error) = run().await {
        tracing::error!(error = %error, "immix server failed");
        eprintln!("immix-server: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ServerError> {
    let settings = ServerSettings::load().context(LoadConfigSnafu {
        stage: "server-load-config",
    })?;

    let store = immix_storage::open_storage(&settings.database_url)
        .await
        .context(OpenStorageSnafu {
            stage: "server-open-storage",
            database_url: settings.database_url.clone(),
        })?;

    let models = settings
        .generator
        .model_handle()
        .context(ConfigureGeneratorSnafu {
            stage: "server-model-handle",
        })?;
    let models = Arc::new(models);
    let generator =
        immix_llm::create_generator(settings.generator.generator_config(), models.clone())
            .context(ConfigureGeneratorSnafu {
                stage: "server-create-generator",
            })?;
    tracing::info!(
        generator = %generator.id(),
        model = %models.current(),
        "generator ready"
    );

    let state = AppState::new(store, generator, models);
    let orchestrator = state.orchestrator.clone();
    let app = router(state);

    let address = settings.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .context(BindSnafu {
            stage: "server-bind",
            address: address.clone(),
        })?;
    tracing::info!(address = %address, "immix server listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    // Exchanges outlive their connections; let them finish persisting.
    orchestrator.shutdown().await;
    served.context(ServeSnafu {
        stage: "server-serve",
    })?;

    tracing::info!("immix server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
