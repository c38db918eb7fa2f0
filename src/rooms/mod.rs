//! Room lifecycle - creation, lookup, and command routing above the engine

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::game::{GameRoom, RoomCommand, RoomHandle};
use crate::monitor;
use crate::registry::{RoomMeta, RoomRegistry};
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, GameMode, ServerMsg};

/// Longest accepted room code
const MAX_ROOM_CODE_LEN: usize = 16;

/// Registry of all active rooms on this host plus the session-to-room index
pub struct RoomManager {
    rooms: Arc<DashMap<String, RoomHandle>>,
    session_rooms: Arc<DashMap<Uuid, String>>,
    registry: RoomRegistry,
}

impl RoomManager {
    pub fn new(registry: RoomRegistry) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            session_rooms: Arc::new(DashMap::new()),
            registry,
        }
    }

    pub fn active_rooms(&self) -> usize {
        self.rooms.len()
    }

    /// Route one client message. Lifecycle messages are resolved here; the
    /// rest are forwarded to the addressed room, or silently dropped when
    /// the room is unknown.
    pub async fn handle_message(
        &self,
        session: Uuid,
        msg: ClientMsg,
        outbox: &mpsc::UnboundedSender<ServerMsg>,
    ) {
        match msg {
            ClientMsg::CreateRoom {
                room_code,
                game_mode,
            } => self.create_room(session, room_code, game_mode, outbox).await,
            ClientMsg::JoinRoom { room_code } => self.join_room(session, room_code, outbox).await,
            ClientMsg::RejoinRoom {
                room_code,
                player_id,
            } => self.rejoin_room(session, room_code, player_id, outbox).await,
            other => self.forward(session, other).await,
        }
    }

    async fn create_room(
        &self,
        session: Uuid,
        room_code: String,
        game_mode: GameMode,
        outbox: &mpsc::UnboundedSender<ServerMsg>,
    ) {
        let room_code = room_code.trim().to_string();
        if room_code.is_empty() || room_code.len() > MAX_ROOM_CODE_LEN {
            let _ = outbox.send(ServerMsg::JoinError {
                message: "invalid room code".to_string(),
            });
            return;
        }
        if self.rooms.contains_key(&room_code) {
            let _ = outbox.send(ServerMsg::JoinError {
                message: "room code already in use".to_string(),
            });
            return;
        }

        monitor::start();
        self.leave_current(session, &room_code).await;

        let (room, handle) = GameRoom::new(room_code.clone(), game_mode);
        self.rooms.insert(room_code.clone(), handle.clone());

        let rooms = Arc::clone(&self.rooms);
        let session_rooms = Arc::clone(&self.session_rooms);
        let registry = self.registry.clone();
        let code = room_code.clone();
        tokio::spawn(async move {
            room.run().await;

            rooms.remove(&code);
            session_rooms.retain(|_, room| room != &code);
            registry.remove(&code).await;
            info!(room = %code, "room removed from manager");
        });

        self.registry
            .publish(&RoomMeta {
                room_code: room_code.clone(),
                game_mode,
                created_at_ms: unix_millis(),
            })
            .await;

        info!(room = %room_code, mode = game_mode.as_str(), "room created");
        self.send_to_room(
            &handle,
            RoomCommand::Join {
                session,
                outbox: outbox.clone(),
            },
        )
        .await;
        self.session_rooms.insert(session, room_code);
    }

    async fn join_room(
        &self,
        session: Uuid,
        room_code: String,
        outbox: &mpsc::UnboundedSender<ServerMsg>,
    ) {
        if let Some(handle) = self.rooms.get(&room_code).map(|h| h.value().clone()) {
            self.leave_current(session, &room_code).await;
            self.send_to_room(
                &handle,
                RoomCommand::Join {
                    session,
                    outbox: outbox.clone(),
                },
            )
            .await;
            self.session_rooms.insert(session, room_code);
            return;
        }

        // Not on this host; the registry only tells us the room exists
        // elsewhere, a room never spans hosts
        let message = if self.registry.lookup(&room_code).await.is_some() {
            "room is hosted on another instance".to_string()
        } else {
            "room not found".to_string()
        };
        let _ = outbox.send(ServerMsg::JoinError { message });
    }

    async fn rejoin_room(
        &self,
        session: Uuid,
        room_code: String,
        player_id: u32,
        outbox: &mpsc::UnboundedSender<ServerMsg>,
    ) {
        let Some(handle) = self.rooms.get(&room_code).map(|h| h.value().clone()) else {
            let _ = outbox.send(ServerMsg::JoinError {
                message: "room not found".to_string(),
            });
            return;
        };

        self.leave_current(session, &room_code).await;
        self.send_to_room(
            &handle,
            RoomCommand::Rejoin {
                session,
                player_id,
                outbox: outbox.clone(),
            },
        )
        .await;
        self.session_rooms.insert(session, room_code);
    }

    /// Detach a session from whatever room it is currently tracked in
    /// before it enters another one
    async fn leave_current(&self, session: Uuid, next_room: &str) {
        let Some((_, old_code)) = self.session_rooms.remove(&session) else {
            return;
        };
        if old_code == next_room {
            return;
        }
        let Some(handle) = self.rooms.get(&old_code).map(|h| h.value().clone()) else {
            return;
        };
        self.send_to_room(&handle, RoomCommand::Leave { session }).await;
    }

    /// Transport-level disconnect
    pub async fn disconnect(&self, session: Uuid) {
        let Some((_, room_code)) = self.session_rooms.remove(&session) else {
            return;
        };
        let Some(handle) = self.rooms.get(&room_code).map(|h| h.value().clone()) else {
            return;
        };
        self.send_to_room(&handle, RoomCommand::Leave { session }).await;
    }

    async fn forward(&self, session: Uuid, msg: ClientMsg) {
        let Some(handle) = self.rooms.get(msg.room_code()).map(|h| h.value().clone()) else {
            return;
        };

        let command = match msg {
            ClientMsg::PlayerReady { ready, .. } => RoomCommand::Ready { session, ready },
            ClientMsg::TeamSelect { team, .. } => RoomCommand::SelectTeam { session, team },
            ClientMsg::PlayerLoaded { .. } => RoomCommand::Loaded { session },
            ClientMsg::StartGame { .. } => RoomCommand::Start { session },
            ClientMsg::PlayerMove {
                target_x,
                target_z,
                action_id,
                seq,
                ..
            } => RoomCommand::Move {
                session,
                target_x,
                target_z,
                action_id,
                seq,
            },
            ClientMsg::KnifeThrow {
                target_x,
                target_z,
                action_id,
                client_timestamp,
                ..
            } => RoomCommand::Throw {
                session,
                target_x,
                target_z,
                action_id,
                client_timestamp,
            },
            ClientMsg::CollisionReport { target_team, .. } => RoomCommand::CollisionReport {
                session,
                target_team,
            },
            ClientMsg::CreateRoom { .. }
            | ClientMsg::JoinRoom { .. }
            | ClientMsg::RejoinRoom { .. } => return,
        };

        self.send_to_room(&handle, command).await;
    }

    async fn send_to_room(&self, handle: &RoomHandle, command: RoomCommand) {
        if handle.command_tx.send(command).await.is_err() {
            warn!(room = %handle.code, "room task is gone, command dropped");
        }
    }
}
