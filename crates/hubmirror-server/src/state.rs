//! Shared per-process state handed to every handler.

use std::sync::Arc;

use hubmirror_cache::{CacheLayout, ContainerRegistry, DiskReaper, ReaperConfig};

use crate::config::Config;
use crate::upstream::UpstreamClient;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub layout: CacheLayout,
    pub registry: ContainerRegistry,
    pub upstream: UpstreamClient,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, reqwest::Error> {
        let config = Arc::new(config);
        let layout = CacheLayout::new(config.repos_path.clone());
        let upstream = UpstreamClient::new(config.clone(), layout.clone())?;
        Ok(Self {
            config,
            layout,
            registry: ContainerRegistry::new(),
            upstream,
        })
    }

    /// The reaper bound to this state's cache root and registry.
    pub fn reaper(&self) -> DiskReaper {
        let reaper_config = ReaperConfig {
            limit: self.config.cache_size_limit,
            strategy: self.config.cache_clean_strategy,
            ..ReaperConfig::default()
        };
        DiskReaper::new(
            self.config.repos_path.clone(),
            reaper_config,
            self.registry.clone(),
        )
    }
}
