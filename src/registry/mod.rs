//! Shared room registry backed by Redis
//!
//! Used only for cross-host room lookup on join. A missing or failing
//! registry is non-fatal; the server then runs single-host.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ws::protocol::GameMode;

/// Registry entry TTL in seconds
const ROOM_TTL_SECS: u64 = 3_600;

/// Room metadata stored under `room:<roomCode>`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMeta {
    pub room_code: String,
    pub game_mode: GameMode,
    pub created_at_ms: u64,
}

/// Registry client; `None` inside means disabled or unreachable
#[derive(Clone)]
pub struct RoomRegistry {
    connection: Option<ConnectionManager>,
}

impl RoomRegistry {
    /// Connect to the registry. Any failure downgrades to disabled.
    pub async fn connect(url: Option<&str>) -> Self {
        let Some(url) = url else {
            info!("room registry disabled, running single-host");
            return Self { connection: None };
        };

        let client = match redis::Client::open(url) {
            Ok(client) => client,
            Err(error) => {
                warn!(%error, "invalid registry URL, running single-host");
                return Self { connection: None };
            }
        };

        match ConnectionManager::new(client).await {
            Ok(connection) => {
                info!("room registry connected");
                Self {
                    connection: Some(connection),
                }
            }
            Err(error) => {
                warn!(%error, "registry unreachable, running single-host");
                Self { connection: None }
            }
        }
    }

    /// Publish room metadata with the registry TTL
    pub async fn publish(&self, meta: &RoomMeta) {
        let Some(mut connection) = self.connection.clone() else {
            return;
        };
        let key = registry_key(&meta.room_code);
        let payload = match serde_json::to_string(meta) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(room = %meta.room_code, %error, "failed to encode registry entry");
                return;
            }
        };
        if let Err(error) = connection.set_ex::<_, _, ()>(&key, payload, ROOM_TTL_SECS).await {
            warn!(room = %meta.room_code, %error, "failed to publish registry entry");
        }
    }

    /// Look a room up by code; None on miss, disabled, or error
    pub async fn lookup(&self, room_code: &str) -> Option<RoomMeta> {
        let mut connection = self.connection.clone()?;
        let key = registry_key(room_code);
        match connection.get::<_, Option<String>>(&key).await {
            Ok(Some(payload)) => match serde_json::from_str(&payload) {
                Ok(meta) => Some(meta),
                Err(error) => {
                    warn!(room = %room_code, %error, "corrupt registry entry");
                    None
                }
            },
            Ok(None) => None,
            Err(error) => {
                warn!(room = %room_code, %error, "registry lookup failed");
                None
            }
        }
    }

    /// Remove a room's entry on teardown
    pub async fn remove(&self, room_code: &str) {
        let Some(mut connection) = self.connection.clone() else {
            return;
        };
        let key = registry_key(room_code);
        if let Err(error) = connection.del::<_, ()>(&key).await {
            warn!(room = %room_code, %error, "failed to remove registry entry");
        }
    }
}

fn registry_key(room_code: &str) -> String {
    format!("room:{room_code}")
}
