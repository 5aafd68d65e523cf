//! CLI command implementations.

pub mod build;
pub mod serve;

use anyhow::{Context, Result};
use buildfarm_config::{FarmConfig, load_farm_config};
use buildfarm_core::store::JobStore;
use buildfarm_core::worker::{WorkerInfo, WorkerProxy};
use buildfarm_dispatch::{
    BuildContextProvider, BuildManager, Dispatcher, FsContentStore, ImageRegistry, LogNotifier,
    RegistryFileResolver, ResultCollector, StaticSourceCatalog, StatusHandler,
};
use buildfarm_worker::HttpWorkerProxy;
use std::sync::Arc;

pub fn load_config(path: &str) -> Result<FarmConfig> {
    load_farm_config(path).with_context(|| format!("Failed to load farm config: {}", path))
}

pub fn validate(path: &str) -> Result<()> {
    match load_farm_config(path) {
        Ok(config) => {
            println!("Configuration is valid");
            println!("  Farm:    {}", config.name);
            println!("  Root:    {}", config.root.display());
            println!("  Workers: {}", config.workers.len());
            println!("  Images:  {}", config.images.len());
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Dispatch components wired to a farm configuration.
pub struct Farm {
    pub config: FarmConfig,
    pub store: Arc<dyn JobStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub handler: Arc<StatusHandler>,
}

impl Farm {
    pub fn new(config: FarmConfig, store: Arc<dyn JobStore>) -> Self {
        let images = Arc::new(ImageRegistry::from_config(&config.images));
        let dispatcher = Dispatcher::new(
            BuildContextProvider::from_config(&config, images.clone()),
            Arc::new(RegistryFileResolver::new(images)),
            store.clone(),
        );
        let handler = StatusHandler::new(
            store.clone(),
            Arc::new(FsContentStore::new(&config.content_store)),
            Arc::new(LogNotifier),
            Arc::new(StaticSourceCatalog::new()),
            ResultCollector::new(&config.root),
        )
        .with_notify_on(config.notify_on.clone());

        Self {
            config,
            store,
            dispatcher: Arc::new(dispatcher),
            handler: Arc::new(handler),
        }
    }

    pub fn manager(&self) -> BuildManager {
        BuildManager::new(
            self.store.clone(),
            self.dispatcher.clone(),
            self.handler.clone(),
            self.config.poll_interval,
        )
    }

    pub fn worker_info(&self, name: &str) -> Result<WorkerInfo> {
        self.config
            .worker(name)
            .map(WorkerInfo::from)
            .with_context(|| format!("No worker named {} in {}", name, self.config.name))
    }

    pub fn worker(&self, name: &str) -> Result<Arc<dyn WorkerProxy>> {
        let proxy = HttpWorkerProxy::new(self.worker_info(name)?)
            .with_context(|| format!("Failed to create proxy for worker {}", name))?;
        Ok(Arc::new(proxy))
    }
}
