//! Production entry point: wire the shared services and serve.

use std::sync::Arc;

use taskweft::config::RuntimeConfig;
use taskweft::gateway::{HttpLanguageModel, LanguageModel, StaticModel};
use taskweft::memory::InMemoryRecallIndex;
use taskweft::storage::{ArchiveStore, InMemoryArchive, InMemoryDurableLog, SqliteArchive};
use taskweft::transport::{SessionRegistry, SharedServices, router};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    taskweft::telemetry::init();
    let config = RuntimeConfig::from_env();

    let provider: Arc<dyn LanguageModel> = match config.provider.api_key.as_deref() {
        Some(key) => Arc::new(HttpLanguageModel::new(&config.provider.base_url, key)),
        None => {
            warn!("GEMINI_API_KEY not set; serving canned replies from the static model");
            Arc::new(StaticModel::always(
                "No model provider is configured on this server.",
            ))
        }
    };

    let archive: Arc<dyn ArchiveStore> = match config.sqlite_url.as_deref() {
        Some(url) => {
            info!(url, "using sqlite archive");
            Arc::new(SqliteArchive::connect(url).await?)
        }
        None => {
            warn!("TASKWEFT_SQLITE_URL not set; archive is in-memory");
            Arc::new(InMemoryArchive::new())
        }
    };

    let bind_addr = config.bind_addr.clone();
    let registry = SessionRegistry::new(SharedServices {
        config,
        provider,
        archive,
        log: Arc::new(InMemoryDurableLog::new()),
        index: Arc::new(InMemoryRecallIndex::new()),
    });

    let app = router(registry);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "taskweft listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}
