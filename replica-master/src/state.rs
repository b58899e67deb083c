use crate::config::AppConfig;
use replica_agent::replication::MasterRegistry;

pub struct AppState {
    pub config: AppConfig,
    pub registry: MasterRegistry,
}

impl AppState {
    pub fn new(config: AppConfig, registry: MasterRegistry) -> Self {
        Self { config, registry }
    }
}
