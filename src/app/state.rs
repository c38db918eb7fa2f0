//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::registry::RoomRegistry;
use crate::rooms::RoomManager;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub rooms: Arc<RoomManager>,
}

impl AppState {
    pub async fn new(config: Config) -> Self {
        let config = Arc::new(config);

        // A dead registry downgrades to single-host operation
        let registry = RoomRegistry::connect(config.registry_url()).await;

        let rooms = Arc::new(RoomManager::new(registry));

        Self { config, rooms }
    }
}
