//! Per-room simulation engine

pub mod bounds;
pub mod combat;
pub mod history;
pub mod player;
pub mod pressure;
pub mod projectile;
pub mod room;
pub mod snapshot;

pub use room::{GameRoom, RoomCommand, RoomHandle};
