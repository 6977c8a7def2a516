use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use teardown_core::acquisition::GitCloneAcquirer;
use teardown_core::chat::OpenAiChatBackend;
use teardown_core::config::ServiceConfig;
use teardown_core::generator::ClaudeGenerator;
use teardown_core::metadata::GitHubMetadataClient;
use teardown_core::object_storage::ObjectStorage;
use teardown_core::pipeline::TeardownPipeline;
use teardown_core::storage::{LocalStorage, StorageAdaptor};
use teardown_server::{ActorRegistry, AppState};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use warp::Filter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("teardown_server=info".parse()?)
                .add_directive("teardown_core=info".parse()?),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("teardown.yaml"));

    let config = ServiceConfig::load(&config_path)
        .await
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    tokio::fs::create_dir_all(&config.workdir)
        .await
        .with_context(|| format!("Failed to create {}", config.workdir.display()))?;

    let storage: Arc<dyn StorageAdaptor> = match config.object_storage() {
        Some(object) => {
            tracing::info!("Caching analyses in bucket {}", object.bucket);
            Arc::new(ObjectStorage::new(object))
        }
        None => {
            tracing::info!("Caching analyses under {}", config.data_dir.display());
            Arc::new(LocalStorage::new(&config.data_dir))
        }
    };

    let pipeline = Arc::new(TeardownPipeline::new(
        Arc::new(GitHubMetadataClient::new(config.github())),
        Arc::new(GitCloneAcquirer::new(&config.workdir)),
        Arc::new(ClaudeGenerator::new(config.claude())),
        storage,
        config.pipeline(),
    ));

    if config.openai_api_key.is_none() {
        tracing::warn!("OPENAI_API_KEY is not set; chat actors will fail their streams");
    }
    let chat = Arc::new(OpenAiChatBackend::new(config.openai()));

    let state = AppState::new(ActorRegistry::standard(chat, &config.models, pipeline));

    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["GET", "OPTIONS"])
        .allow_headers(vec!["Content-Type"]);
    let routes = teardown_server::routes::routes(state).with(cors);

    tracing::info!("Starting server at http://{}", config.addr);
    warp::serve(routes).run(config.addr).await;
    Ok(())
}
