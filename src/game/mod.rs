//! Game simulation modules

pub mod combat;
pub mod entity;
pub mod gas;
pub mod grid;
pub mod map;
pub mod r#match;
pub mod physics;
pub mod player;
pub mod sync;
pub mod world;

pub use r#match::{Game, GameConfig, GameData, GameError, GamePhase, GameSettings, Outgoing};
