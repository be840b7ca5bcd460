//! The `serve` command: wire configuration into the running service.
//!
//! Construction order matters: temp root, media fetcher and callback
//! dispatcher first, then the engine factory and model pool, and finally
//! the processor with a deferred store factory so its connection pool is
//! created inside the processor's own runtime. The command then parks on
//! SIGINT; shutdown drains in-flight tasks before sweeping the temp root.

use log::{info, warn};
use std::sync::Arc;

use crate::cli::ServeArgs;
use crate::config::{ConfigService, ProductionConfigService};
use crate::core::engine;
use crate::core::pool::{self, ModelPool};
use crate::core::processor::{StoreFactory, TaskProcessor};
use crate::error::WhisperdError;
use crate::services::callback::CallbackDispatcher;
use crate::services::files::TempFiles;
use crate::services::media::MediaFetcher;
use crate::store::{SqliteTaskStore, TaskStore};
use crate::Result;

/// Run the service until interrupted.
pub async fn execute(args: ServeArgs) -> Result<()> {
    let service = match args.config {
        Some(path) => ProductionConfigService::with_config_file(path)?,
        None => ProductionConfigService::new()?,
    };
    let config = service.get_config()?;
    if let Some(path) = &config.loaded_from {
        info!("configuration loaded from {}", path.display());
    } else {
        info!("no configuration file found, using defaults");
    }

    let temp = Arc::new(TempFiles::new(&config.media)?);
    let fetcher = Arc::new(MediaFetcher::new(config.media.clone(), Arc::clone(&temp))?);
    let dispatcher = Arc::new(CallbackDispatcher::new(config.callback.clone())?);

    let factory = engine::factory_for(&config.pool.engine, config.pool.engine_params.clone())?;
    let model_pool = Arc::new(ModelPool::new(
        &config.pool,
        config.general.gpu_count,
        factory,
    )?);
    model_pool.initialize().await?;
    if pool::init_global(Arc::clone(&model_pool)).is_err() {
        warn!("model pool was already installed for this process");
    }

    let store_config = config.store.clone();
    let store_factory: StoreFactory = Box::new(move || {
        Box::pin(async move {
            let store = SqliteTaskStore::connect(&store_config).await?;
            Ok(Arc::new(store) as Arc<dyn TaskStore>)
        })
    });

    let processor = TaskProcessor::start(
        config.processor.clone(),
        store_factory,
        Arc::clone(&model_pool),
        fetcher,
        Arc::clone(&temp),
        dispatcher,
    )?;
    info!("whisperd {} serving (engine: {})", crate::VERSION, config.pool.engine);

    tokio::signal::ctrl_c()
        .await
        .map_err(WhisperdError::Io)?;
    info!("interrupt received, shutting down");

    // Joining the processor thread blocks; keep it off the async threads.
    tokio::task::spawn_blocking(move || processor.shutdown())
        .await
        .map_err(|e| WhisperdError::CommandExecution(format!("shutdown join failed: {}", e)))?;

    if config.processor.delete_temp_files_after_processing {
        temp.cleanup_all().await?;
    }
    info!("whisperd stopped");
    Ok(())
}
