//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Game modes and their room capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameMode {
    #[serde(rename = "1v1")]
    OneVsOne,
    #[serde(rename = "3v3")]
    ThreeVsThree,
}

impl GameMode {
    pub fn max_players(self) -> usize {
        match self {
            GameMode::OneVsOne => 2,
            GameMode::ThreeVsThree => 6,
        }
    }

    pub fn team_size(self) -> usize {
        match self {
            GameMode::OneVsOne => 1,
            GameMode::ThreeVsThree => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GameMode::OneVsOne => "1v1",
            GameMode::ThreeVsThree => "3v3",
        }
    }
}

/// Team, serialized as the integers 1 and 2 on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Team {
    One,
    Two,
}

impl Team {
    pub fn as_u8(self) -> u8 {
        match self {
            Team::One => 1,
            Team::Two => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Team::One),
            2 => Some(Team::Two),
            _ => None,
        }
    }
}

impl Serialize for Team {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for Team {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        Team::from_u8(value).ok_or_else(|| serde::de::Error::custom("team must be 1 or 2"))
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMsg {
    /// Create a room and become its host
    #[serde(rename_all = "camelCase")]
    CreateRoom { room_code: String, game_mode: GameMode },

    /// Join an existing room
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_code: String },

    /// Reclaim a prior player slot with a fresh session
    #[serde(rename_all = "camelCase")]
    RejoinRoom { room_code: String, player_id: u32 },

    /// Toggle ready state in the lobby
    #[serde(rename_all = "camelCase")]
    PlayerReady { room_code: String, ready: bool },

    /// Switch team in the lobby
    #[serde(alias = "selectTeam", rename_all = "camelCase")]
    TeamSelect { room_code: String, team: Team },

    /// Client finished loading game assets
    #[serde(rename_all = "camelCase")]
    PlayerLoaded { room_code: String },

    /// Host requests game start
    #[serde(rename_all = "camelCase")]
    StartGame { room_code: String },

    /// Movement intent
    #[serde(rename_all = "camelCase")]
    PlayerMove {
        room_code: String,
        target_x: f32,
        target_z: f32,
        action_id: String,
        seq: u32,
        client_time: u64,
    },

    /// Throw intent
    #[serde(rename_all = "camelCase")]
    KnifeThrow {
        room_code: String,
        target_x: f32,
        target_z: f32,
        action_id: String,
        client_timestamp: u64,
    },

    /// Legacy client-assisted hit report
    #[serde(rename_all = "camelCase")]
    CollisionReport {
        room_code: String,
        target_team: Team,
        action_id: String,
    },
}

impl ClientMsg {
    /// Room code the message addresses
    pub fn room_code(&self) -> &str {
        match self {
            ClientMsg::CreateRoom { room_code, .. }
            | ClientMsg::JoinRoom { room_code }
            | ClientMsg::RejoinRoom { room_code, .. }
            | ClientMsg::PlayerReady { room_code, .. }
            | ClientMsg::TeamSelect { room_code, .. }
            | ClientMsg::PlayerLoaded { room_code }
            | ClientMsg::StartGame { room_code }
            | ClientMsg::PlayerMove { room_code, .. }
            | ClientMsg::KnifeThrow { room_code, .. }
            | ClientMsg::CollisionReport { room_code, .. } => room_code,
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMsg {
    /// Lobby snapshot, broadcast after every lobby mutation
    #[serde(rename_all = "camelCase")]
    RoomState {
        room_code: String,
        game_mode: GameMode,
        host_id: Option<u32>,
        players: Vec<LobbyPlayer>,
    },

    #[serde(rename_all = "camelCase")]
    RoomCreated { room_code: String, player_id: u32 },

    #[serde(rename_all = "camelCase")]
    JoinSuccess {
        room_code: String,
        player_id: u32,
        game_mode: GameMode,
    },

    #[serde(rename_all = "camelCase")]
    JoinError { message: String },

    #[serde(rename_all = "camelCase")]
    RoomFull { room_code: String },

    #[serde(rename_all = "camelCase")]
    RejoinSuccess {
        room_code: String,
        player_id: u32,
        game_mode: GameMode,
    },

    #[serde(rename_all = "camelCase")]
    PlayerReadyUpdate { player_id: u32, ready: bool },

    #[serde(rename_all = "camelCase")]
    TeamSelectSuccess { player_id: u32, team: Team },

    #[serde(rename_all = "camelCase")]
    TeamSelectError { message: String },

    #[serde(rename_all = "camelCase")]
    PlayerLoadUpdate { player_id: u32 },

    AllPlayersLoaded,

    /// Spawn assignments; clients load into the arena after this
    #[serde(rename_all = "camelCase")]
    GameStart { players: Vec<SpawnPosition> },

    /// Emitted the moment a throw is accepted, before the next tick
    #[serde(rename_all = "camelCase")]
    ServerKnifeSpawn {
        knife_id: String,
        action_id: String,
        owner_team: Team,
        x: f32,
        z: f32,
        velocity_x: f32,
        velocity_z: f32,
        tick: u64,
        server_time: u64,
    },

    #[serde(rename_all = "camelCase")]
    ServerKnifeDestroy { knife_id: String },

    #[serde(rename_all = "camelCase")]
    ServerKnifeHit {
        knife_id: String,
        player_id: u32,
        x: f32,
        z: f32,
    },

    #[serde(rename_all = "camelCase")]
    ServerHealthUpdate {
        player_id: u32,
        health: u8,
        is_dead: bool,
    },

    /// Acknowledgment of an accepted move, sent only to the commanding client
    #[serde(rename_all = "camelCase")]
    ServerMoveAck {
        action_id: String,
        tick: u64,
        server_time: u64,
        x: f32,
        z: f32,
        target_x: f32,
        target_z: f32,
    },

    /// Full room-state broadcast at the network update rate
    #[serde(rename_all = "camelCase")]
    ServerGameState {
        tick: u64,
        server_time: u64,
        players: Vec<PlayerSnapshot>,
        knives: Vec<KnifeSnapshot>,
    },

    /// `winning_team` is null on a draw (mutual elimination)
    #[serde(rename_all = "camelCase")]
    ServerGameOver { winning_team: Option<Team> },

    HostDisconnected,

    #[serde(rename_all = "camelCase")]
    OpponentDisconnected { player_id: u32 },

    /// Authority failures (non-host start, unready start)
    #[serde(rename_all = "camelCase")]
    Error { message: String },
}

/// Player entry in the lobby snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyPlayer {
    pub player_id: u32,
    pub team: Team,
    pub ready: bool,
    pub loaded: bool,
}

/// Spawn assignment broadcast with `gameStart`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnPosition {
    pub player_id: u32,
    pub team: Team,
    pub x: f32,
    pub z: f32,
}

/// Player state in a broadcast snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
    pub player_id: u32,
    pub team: Team,
    pub x: f32,
    pub z: f32,
    pub target_x: f32,
    pub target_z: f32,
    pub is_moving: bool,
    pub is_dead: bool,
    pub health: u8,
    pub last_processed_seq: u32,
}

/// Live projectile state in a broadcast snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnifeSnapshot {
    pub knife_id: String,
    pub owner_team: Team,
    pub x: f32,
    pub z: f32,
    pub velocity_x: f32,
    pub velocity_z: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn team_select_accepts_both_event_names() {
        let canonical = r#"{"type":"teamSelect","roomCode":"AB12","team":2}"#;
        let legacy = r#"{"type":"selectTeam","roomCode":"AB12","team":2}"#;

        for raw in [canonical, legacy] {
            match serde_json::from_str::<ClientMsg>(raw).expect("parse") {
                ClientMsg::TeamSelect { room_code, team } => {
                    assert_eq!(room_code, "AB12");
                    assert_eq!(team, Team::Two);
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[test]
    fn game_mode_uses_wire_names() {
        let msg: ClientMsg =
            serde_json::from_str(r#"{"type":"createRoom","roomCode":"AB12","gameMode":"3v3"}"#)
                .expect("parse");
        match msg {
            ClientMsg::CreateRoom { game_mode, .. } => {
                assert_eq!(game_mode, GameMode::ThreeVsThree);
                assert_eq!(game_mode.max_players(), 6);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn team_serializes_as_integer() {
        let json = serde_json::to_string(&Team::One).expect("serialize");
        assert_eq!(json, "1");
        assert!(serde_json::from_str::<Team>("3").is_err());
    }

    #[test]
    fn server_events_use_camel_case_tags() {
        let msg = ServerMsg::ServerKnifeSpawn {
            knife_id: "AB12-1".to_string(),
            action_id: "a1".to_string(),
            owner_team: Team::One,
            x: -30.0,
            z: 0.0,
            velocity_x: 4.5,
            velocity_z: 0.0,
            tick: 7,
            server_time: 1_000,
        };
        let json = serde_json::to_string(&msg).expect("serialize");
        assert!(json.contains(r#""type":"serverKnifeSpawn""#));
        assert!(json.contains(r#""knifeId":"AB12-1""#));
        assert!(json.contains(r#""ownerTeam":1"#));
    }

    #[test]
    fn move_command_round_trips() {
        let raw = r#"{"type":"playerMove","roomCode":"AB12","targetX":-30.5,"targetZ":12.0,"actionId":"m7","seq":42,"clientTime":123456}"#;
        let msg: ClientMsg = serde_json::from_str(raw).expect("parse");
        match &msg {
            ClientMsg::PlayerMove { target_x, seq, .. } => {
                assert_eq!(*target_x, -30.5);
                assert_eq!(*seq, 42);
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert_eq!(msg.room_code(), "AB12");
    }
}
