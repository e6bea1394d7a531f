//! Application state shared across routes

use std::sync::Arc;

use tracing::info;

use crate::config::{Config, ProcessMode};
use crate::matchmaking::{GameManager, GameThreadManager, SingleGameManager};
use crate::ws::SocketRegistry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<dyn GameManager>,
    pub sockets: Arc<SocketRegistry>,
}

impl AppState {
    /// Build the state and start the manager's background tasks. Must be
    /// called from within a tokio runtime.
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let sockets = Arc::new(SocketRegistry::new());

        let manager: Arc<dyn GameManager> = match config.process_mode {
            ProcessMode::Single => {
                let manager = Arc::new(SingleGameManager::new(config.clone(), sockets.clone()));
                manager.start();
                manager
            }
            ProcessMode::Multi => {
                let manager = Arc::new(GameThreadManager::new(config.clone(), sockets.clone()));
                manager.start();
                manager
            }
        };
        info!(mode = ?config.process_mode, "Game manager started");

        Self {
            config,
            manager,
            sockets,
        }
    }
}
