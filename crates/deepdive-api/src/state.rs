use std::sync::Arc;

use anyhow::Result;
use deepdive_core::{ConfigLoader, ResearchService, SpawnScheduler, build_driver};
use tracing::info;

use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppState {
    service: Arc<ResearchService>,
}

impl AppState {
    pub fn new(service: ResearchService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }

    pub async fn try_new(config: &AppConfig) -> Result<Self> {
        let core = ConfigLoader::load(config.config_path.clone())?;
        let driver = build_driver(&core).await?;

        let mut service = ResearchService::new(driver.clone(), core.llm.model.clone());
        if config.auto_continue {
            let scheduler = SpawnScheduler::new(driver, config.max_active_steps);
            service = service.with_scheduler(Arc::new(scheduler));
            info!(
                max_active = config.max_active_steps,
                "background continuation enabled"
            );
        }
        Ok(Self::new(service))
    }

    pub fn service(&self) -> Arc<ResearchService> {
        self.service.clone()
    }
}
