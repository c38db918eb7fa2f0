//! Room state and the authoritative tick loop

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::monitor;
use crate::util::time::{
    tick_delta, unix_millis, DEGRADED_UPDATE_RATE, NETWORK_UPDATE_RATE, TICK_RATE,
};
use crate::ws::protocol::{GameMode, ServerMsg, SpawnPosition, Team};

use super::bounds;
use super::combat;
use super::history::PositionHistory;
use super::player::{Player, PlayerTable};
use super::pressure::{PressureController, RateChange, SAMPLE_INTERVAL};
use super::projectile::{Projectile, ProjectileTable, KNIFE_COOLDOWN_MS, KNIFE_SPEED};
use super::snapshot;

/// Physics steps processed per scheduler iteration before the clock clamps
const MAX_CATCH_UP_TICKS: u32 = 8;
/// Backoff after an internal tick fault; the room is not torn down
const TICK_FAULT_BACKOFF: Duration = Duration::from_millis(100);
/// Below this remaining time the loop reschedules instead of sleeping
const COARSE_SLEEP_THRESHOLD: Duration = Duration::from_millis(1);
/// An empty lobby (creator never joined or vanished) expires after this
const EMPTY_ROOM_TIMEOUT: Duration = Duration::from_secs(60);
/// Zero-length throw rejection threshold
const MIN_THROW_DISTANCE_SQ: f32 = 1e-6;

/// Room phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    /// Waiting for players, team selection, ready-up
    Lobby,
    /// Start accepted, clients loading the arena
    Loading,
    /// Game running
    InProgress,
    /// Game over or room torn down
    Ended,
}

/// Commands delivered by the session layer
#[derive(Debug)]
pub enum RoomCommand {
    Join {
        session: Uuid,
        outbox: mpsc::UnboundedSender<ServerMsg>,
    },
    Rejoin {
        session: Uuid,
        player_id: u32,
        outbox: mpsc::UnboundedSender<ServerMsg>,
    },
    Leave {
        session: Uuid,
    },
    Ready {
        session: Uuid,
        ready: bool,
    },
    SelectTeam {
        session: Uuid,
        team: Team,
    },
    Loaded {
        session: Uuid,
    },
    Start {
        session: Uuid,
    },
    Move {
        session: Uuid,
        target_x: f32,
        target_z: f32,
        action_id: String,
        seq: u32,
    },
    Throw {
        session: Uuid,
        target_x: f32,
        target_z: f32,
        action_id: String,
        client_timestamp: u64,
    },
    CollisionReport {
        session: Uuid,
        target_team: Team,
    },
}

/// Routing decision for an outbound message
#[derive(Debug)]
pub enum Outbound {
    All(ServerMsg),
    One(Uuid, ServerMsg),
}

/// Authoritative room state (owned by the room task)
pub struct RoomState {
    pub code: String,
    pub mode: GameMode,
    pub phase: RoomPhase,
    pub tick: u64,
    pub players: PlayerTable,
    pub projectiles: ProjectileTable,
    pub history: PositionHistory,
    pub host: Option<Uuid>,
    /// Messages produced but not yet handed to the transport
    pub pending: Vec<Outbound>,
    next_player_id: u32,
    next_projectile_seq: u64,
    rng: ChaCha8Rng,
}

impl RoomState {
    pub fn new(code: String, mode: GameMode) -> Self {
        let seed = fnv1a64(code.as_bytes(), mode.as_str().as_bytes());
        Self {
            code,
            mode,
            phase: RoomPhase::Lobby,
            tick: 0,
            players: PlayerTable::new(),
            projectiles: ProjectileTable::new(),
            history: PositionHistory::default(),
            host: None,
            pending: Vec::new(),
            next_player_id: 1,
            next_projectile_seq: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    // ------------------------------------------------------------------
    // Lobby handlers
    // ------------------------------------------------------------------

    /// Returns false when the join was rejected
    pub fn join(&mut self, session: Uuid) -> bool {
        if self.phase != RoomPhase::Lobby {
            self.pending.push(Outbound::One(
                session,
                ServerMsg::JoinError {
                    message: "game already in progress".to_string(),
                },
            ));
            return false;
        }
        if let Some(player) = self.players.get(&session) {
            warn!(room = %self.code, player_id = player.player_id, "session already in room");
            return true;
        }
        if self.players.len() >= self.mode.max_players() {
            self.pending.push(Outbound::One(
                session,
                ServerMsg::RoomFull {
                    room_code: self.code.clone(),
                },
            ));
            return false;
        }

        let player_id = self.next_player_id;
        self.next_player_id += 1;

        // Auto-balance: the joiner lands on the smaller team
        let team = if self.players.team_count(Team::Two) < self.players.team_count(Team::One) {
            Team::Two
        } else {
            Team::One
        };

        self.players.insert(session, Player::new(player_id, team));

        if self.host.is_none() {
            self.host = Some(session);
            self.pending.push(Outbound::One(
                session,
                ServerMsg::RoomCreated {
                    room_code: self.code.clone(),
                    player_id,
                },
            ));
        } else {
            self.pending.push(Outbound::One(
                session,
                ServerMsg::JoinSuccess {
                    room_code: self.code.clone(),
                    player_id,
                    game_mode: self.mode,
                },
            ));
        }

        self.broadcast_room_state();
        true
    }

    /// Migrate a prior player slot to a fresh session key. All session-keyed
    /// tables are rekeyed together. Returns the replaced session on success.
    pub fn rejoin(&mut self, session: Uuid, player_id: u32) -> Option<Uuid> {
        let Some(old_session) = self.players.session_by_player_id(player_id) else {
            self.pending.push(Outbound::One(
                session,
                ServerMsg::JoinError {
                    message: "no such player in this room".to_string(),
                },
            ));
            return None;
        };

        if old_session != session {
            self.players.rekey(&old_session, session);
            self.projectiles.rekey_owner(&old_session, session);
            if self.host == Some(old_session) {
                self.host = Some(session);
            }
        }

        self.pending.push(Outbound::One(
            session,
            ServerMsg::RejoinSuccess {
                room_code: self.code.clone(),
                player_id,
                game_mode: self.mode,
            },
        ));
        self.broadcast_room_state();
        Some(old_session)
    }

    pub fn leave(&mut self, session: Uuid) {
        let Some(player) = self.players.remove(&session) else {
            return;
        };

        if self.host == Some(session) {
            info!(room = %self.code, player_id = player.player_id, "host left, closing room");
            self.pending.push(Outbound::All(ServerMsg::HostDisconnected));
            self.phase = RoomPhase::Ended;
            return;
        }

        self.pending.push(Outbound::All(ServerMsg::OpponentDisconnected {
            player_id: player.player_id,
        }));

        match self.phase {
            RoomPhase::Lobby => self.broadcast_room_state(),
            RoomPhase::Loading => {
                self.broadcast_room_state();
                // The departed player may have been the last one loading
                self.maybe_finish_loading();
            }
            RoomPhase::InProgress => self.check_game_over(),
            RoomPhase::Ended => {}
        }
    }

    pub fn set_ready(&mut self, session: Uuid, ready: bool) {
        if self.phase != RoomPhase::Lobby {
            return;
        }
        let Some(player) = self.players.get_mut(&session) else {
            return;
        };
        player.ready = ready;
        let player_id = player.player_id;
        self.pending.push(Outbound::All(ServerMsg::PlayerReadyUpdate {
            player_id,
            ready,
        }));
        self.broadcast_room_state();
    }

    pub fn select_team(&mut self, session: Uuid, team: Team) {
        if self.phase != RoomPhase::Lobby {
            self.pending.push(Outbound::One(
                session,
                ServerMsg::TeamSelectError {
                    message: "game already in progress".to_string(),
                },
            ));
            return;
        }
        let Some(player) = self.players.get(&session) else {
            return;
        };
        if player.ready {
            self.pending.push(Outbound::One(
                session,
                ServerMsg::TeamSelectError {
                    message: "cannot change team while ready".to_string(),
                },
            ));
            return;
        }
        if player.team != team && self.players.team_count(team) >= self.mode.team_size() {
            self.pending.push(Outbound::One(
                session,
                ServerMsg::TeamSelectError {
                    message: "team is full".to_string(),
                },
            ));
            return;
        }

        let Some(player) = self.players.get_mut(&session) else {
            return;
        };
        player.team = team;
        let player_id = player.player_id;
        self.pending.push(Outbound::All(ServerMsg::TeamSelectSuccess {
            player_id,
            team,
        }));
        self.broadcast_room_state();
    }

    pub fn start(&mut self, session: Uuid) {
        if self.host != Some(session) {
            self.pending.push(Outbound::One(
                session,
                ServerMsg::Error {
                    message: "only the host can start the game".to_string(),
                },
            ));
            return;
        }
        if self.phase != RoomPhase::Lobby {
            self.pending.push(Outbound::One(
                session,
                ServerMsg::Error {
                    message: "game already started".to_string(),
                },
            ));
            return;
        }
        if !self.players.values().all(|p| p.ready) {
            self.pending.push(Outbound::One(
                session,
                ServerMsg::Error {
                    message: "not all players are ready".to_string(),
                },
            ));
            return;
        }
        if self.players.team_count(Team::One) == 0 || self.players.team_count(Team::Two) == 0 {
            self.pending.push(Outbound::One(
                session,
                ServerMsg::Error {
                    message: "both teams need at least one player".to_string(),
                },
            ));
            return;
        }

        let spawns = self.assign_spawn_positions();
        self.phase = RoomPhase::Loading;
        self.pending
            .push(Outbound::All(ServerMsg::GameStart { players: spawns }));
        info!(room = %self.code, mode = self.mode.as_str(), "game starting, clients loading");
    }

    pub fn loaded(&mut self, session: Uuid) {
        if self.phase != RoomPhase::Loading {
            return;
        }
        let Some(player) = self.players.get_mut(&session) else {
            return;
        };
        player.loaded = true;
        let player_id = player.player_id;
        self.pending
            .push(Outbound::All(ServerMsg::PlayerLoadUpdate { player_id }));

        self.maybe_finish_loading();
    }

    fn maybe_finish_loading(&mut self) {
        if self.phase != RoomPhase::Loading || self.players.is_empty() {
            return;
        }
        if self.players.values().all(|p| p.loaded) {
            self.pending.push(Outbound::All(ServerMsg::AllPlayersLoaded));
            self.phase = RoomPhase::InProgress;
            info!(room = %self.code, "all players loaded, game running");
        }
    }

    /// Deterministic spawn positions from the room-derived seed,
    /// rejection-sampled inside each team's half
    fn assign_spawn_positions(&mut self) -> Vec<SpawnPosition> {
        let mut sessions: Vec<Uuid> = self.players.iter().map(|(s, _)| *s).collect();
        sessions.sort_unstable_by_key(|s| {
            self.players.get(s).map(|p| p.player_id).unwrap_or(u32::MAX)
        });

        let mut spawns = Vec::with_capacity(sessions.len());
        for session in sessions {
            let Some(player) = self.players.get(&session) else {
                continue;
            };
            let team = player.team;
            let (mut x, mut z);
            loop {
                let ax = self.rng.gen_range(24.0_f32..70.0);
                x = match team {
                    Team::One => -ax,
                    Team::Two => ax,
                };
                z = self.rng.gen_range(-60.0_f32..60.0);
                if bounds::is_valid_target(team, x, z) {
                    break;
                }
            }
            let Some(player) = self.players.get_mut(&session) else {
                continue;
            };
            player.x = x;
            player.z = z;
            player.target_x = x;
            player.target_z = z;
            player.is_moving = false;
            spawns.push(SpawnPosition {
                player_id: player.player_id,
                team,
                x,
                z,
            });
        }
        spawns
    }

    // ------------------------------------------------------------------
    // Game command handlers
    // ------------------------------------------------------------------

    /// Rejections are silent: no state change, no acknowledgment
    pub fn accept_move(
        &mut self,
        session: Uuid,
        target_x: f32,
        target_z: f32,
        action_id: String,
        seq: u32,
        now_ms: u64,
    ) {
        if self.phase != RoomPhase::InProgress {
            return;
        }
        let tick = self.tick;
        let Some(player) = self.players.get_mut(&session) else {
            return;
        };
        if player.is_dead || !bounds::is_valid_target(player.team, target_x, target_z) {
            return;
        }

        player.target_x = target_x;
        player.target_z = target_z;
        player.is_moving = true;
        player.last_processed_seq = seq;

        self.pending.push(Outbound::One(
            session,
            ServerMsg::ServerMoveAck {
                action_id,
                tick,
                server_time: now_ms,
                x: player.x,
                z: player.z,
                target_x,
                target_z,
            },
        ));
    }

    /// The spawn event is emitted immediately, before the next tick
    pub fn accept_throw(
        &mut self,
        session: Uuid,
        target_x: f32,
        target_z: f32,
        action_id: String,
        client_timestamp: u64,
        now_ms: u64,
    ) {
        if self.phase != RoomPhase::InProgress {
            return;
        }
        let tick = self.tick;
        let Some(player) = self.players.get_mut(&session) else {
            return;
        };
        if player.is_dead {
            return;
        }
        if now_ms.saturating_sub(player.last_throw_ms) < KNIFE_COOLDOWN_MS {
            return;
        }

        let dx = target_x - player.x;
        let dz = target_z - player.z;
        let len_sq = dx * dx + dz * dz;
        if len_sq <= MIN_THROW_DISTANCE_SQ {
            return;
        }
        let len = len_sq.sqrt();
        let vx = dx / len * KNIFE_SPEED;
        let vz = dz / len * KNIFE_SPEED;

        player.last_throw_ms = now_ms;
        let (x, z, owner_team) = (player.x, player.z, player.team);

        self.next_projectile_seq += 1;
        let knife = Projectile {
            id: format!("{}-{}", self.code, self.next_projectile_seq),
            owner: session,
            owner_team,
            action_id,
            x,
            z,
            prev_x: x,
            prev_z: z,
            vx,
            vz,
            spawn_ms: now_ms,
            client_ms: client_timestamp,
            has_hit: false,
        };

        self.pending.push(Outbound::All(ServerMsg::ServerKnifeSpawn {
            knife_id: knife.id.clone(),
            action_id: knife.action_id.clone(),
            owner_team,
            x,
            z,
            velocity_x: vx,
            velocity_z: vz,
            tick,
            server_time: now_ms,
        }));
        self.projectiles.insert(knife);
    }

    /// Legacy client-assisted hit path. Validation only; the authoritative
    /// path is the swept detector.
    pub fn collision_report(&mut self, session: Uuid, target_team: Team) {
        if self.phase != RoomPhase::InProgress {
            return;
        }
        let Some(attacker) = self.players.get(&session) else {
            return;
        };
        if attacker.is_dead || attacker.team == target_team {
            return;
        }

        let Some(victim) = self.players.first_living_on_team(target_team) else {
            return;
        };
        victim.apply_hit();
        let (player_id, health, is_dead) = (victim.player_id, victim.health, victim.is_dead);

        self.pending.push(Outbound::All(ServerMsg::ServerHealthUpdate {
            player_id,
            health,
            is_dead,
        }));
    }

    // ------------------------------------------------------------------
    // Physics tick
    // ------------------------------------------------------------------

    /// One fixed physics step: integrate movement, advance projectiles,
    /// record history, detect hits, check end of game
    pub fn step_physics(&mut self, now_ms: u64) {
        if self.phase != RoomPhase::InProgress {
            return;
        }

        self.tick += 1;
        let dt = tick_delta();

        for player in self.players.values_mut() {
            bounds::integrate(player, dt);
        }

        // Expired projectiles and last tick's hits leave before anything
        // else happens this tick
        let removed = self
            .projectiles
            .drain_where(|k| k.has_hit || k.expired(now_ms));
        for knife in removed {
            self.pending.push(Outbound::All(ServerMsg::ServerKnifeDestroy {
                knife_id: knife.id,
            }));
        }

        for knife in self.projectiles.values_mut() {
            knife.advance(dt);
        }

        self.history.record(now_ms, &self.players);

        let hits = combat::detect_hits(
            &mut self.projectiles,
            &mut self.players,
            &self.history,
            now_ms,
        );
        for hit in hits {
            self.pending.push(Outbound::All(ServerMsg::ServerHealthUpdate {
                player_id: hit.victim_player_id,
                health: hit.health,
                is_dead: hit.is_dead,
            }));
            self.pending.push(Outbound::All(ServerMsg::ServerKnifeHit {
                knife_id: hit.knife_id,
                player_id: hit.victim_player_id,
                x: hit.x,
                z: hit.z,
            }));
        }

        self.check_game_over();
    }

    /// Last team standing wins; mutual elimination on one tick is a draw
    fn check_game_over(&mut self) {
        if self.phase != RoomPhase::InProgress {
            return;
        }
        let living = self.players.living_teams();
        match living.len() {
            2 => {}
            1 => {
                let winner = living[0];
                info!(room = %self.code, winning_team = winner.as_u8(), "game over");
                self.pending.push(Outbound::All(ServerMsg::ServerGameOver {
                    winning_team: Some(winner),
                }));
                self.phase = RoomPhase::Ended;
            }
            _ => {
                info!(room = %self.code, "mutual elimination, game over in a draw");
                self.pending.push(Outbound::All(ServerMsg::ServerGameOver {
                    winning_team: None,
                }));
                self.phase = RoomPhase::Ended;
            }
        }
    }

    fn broadcast_room_state(&mut self) {
        let msg = snapshot::encode_room_state(self);
        self.pending.push(Outbound::All(msg));
    }
}

/// Handle to a running room task
#[derive(Clone)]
pub struct RoomHandle {
    pub code: String,
    pub command_tx: mpsc::Sender<RoomCommand>,
}

/// The authoritative room task: owns the state, the scheduler, and the
/// per-session outbound channels
pub struct GameRoom {
    state: RoomState,
    command_rx: mpsc::Receiver<RoomCommand>,
    outboxes: HashMap<Uuid, mpsc::UnboundedSender<ServerMsg>>,
}

impl GameRoom {
    pub fn new(code: String, mode: GameMode) -> (Self, RoomHandle) {
        let (command_tx, command_rx) = mpsc::channel(256);
        let handle = RoomHandle {
            code: code.clone(),
            command_tx,
        };
        let room = Self {
            state: RoomState::new(code, mode),
            command_rx,
            outboxes: HashMap::new(),
        };
        (room, handle)
    }

    /// Run the room until the game ends or everyone leaves.
    ///
    /// Two schedules share this single task: physics at `TICK_RATE` with
    /// bounded catch-up, and broadcasts at the network update rate. The
    /// loop sleeps until the earliest deadline, waking early for commands.
    pub async fn run(self) {
        let GameRoom {
            mut state,
            mut command_rx,
            mut outboxes,
        } = self;

        info!(room = %state.code, mode = state.mode.as_str(), "room task started");

        let tick_interval = Duration::from_secs_f64(1.0 / TICK_RATE as f64);
        let normal_broadcast = Duration::from_secs_f64(1.0 / NETWORK_UPDATE_RATE as f64);
        let degraded_broadcast = Duration::from_secs_f64(1.0 / DEGRADED_UPDATE_RATE as f64);

        let mut broadcast_interval = normal_broadcast;
        let mut next_tick = Instant::now() + tick_interval;
        let mut next_broadcast = Instant::now() + broadcast_interval;
        let mut next_sample = Instant::now() + SAMPLE_INTERVAL;
        let mut pressure = PressureController::new();
        let mut empty_since: Option<Instant> = None;

        loop {
            let now = Instant::now();

            // Physics catch-up, bounded. A panic inside the tick body is
            // caught here so one bad tick cannot take the room down.
            let mut steps = 0u32;
            let mut faulted = false;
            while next_tick <= now && steps < MAX_CATCH_UP_TICKS {
                let step = catch_unwind(AssertUnwindSafe(|| state.step_physics(unix_millis())));
                if let Err(payload) = step {
                    error!(
                        room = %state.code,
                        fault = panic_message(payload.as_ref()),
                        "tick fault, backing off"
                    );
                    faulted = true;
                    break;
                }
                next_tick += tick_interval;
                steps += 1;
            }
            if faulted {
                flush(&mut state, &mut outboxes);
                tokio::time::sleep(TICK_FAULT_BACKOFF).await;
                next_tick = Instant::now() + tick_interval;
                continue;
            }
            if next_tick <= now {
                // Still behind after bounded catch-up: clamp the clock
                debug!(room = %state.code, "physics clock clamped");
                next_tick = now + tick_interval;
            }

            // Broadcast schedule, decoupled from physics
            if next_broadcast <= now {
                match state.phase {
                    RoomPhase::InProgress => {
                        let msg = snapshot::encode_game_state(&state, unix_millis());
                        state.pending.push(Outbound::All(msg));
                    }
                    RoomPhase::Ended => {
                        // The match ended during this iteration's physics
                        // steps; the due snapshot still goes out, ahead of
                        // the not-yet-flushed game-over
                        insert_final_snapshot(&mut state, unix_millis());
                    }
                    _ => {}
                }
                next_broadcast += broadcast_interval;
                if next_broadcast <= now {
                    next_broadcast = now + broadcast_interval;
                }
            }

            // Host-pressure sample
            if next_sample <= now {
                let metrics = monitor::metrics();
                match pressure.sample(metrics) {
                    Some(RateChange::Degrade) => {
                        broadcast_interval = degraded_broadcast;
                        next_broadcast = now + broadcast_interval;
                        warn!(
                            room = %state.code,
                            p50_ms = metrics.p50_ms,
                            p95_ms = metrics.p95_ms,
                            p99_ms = metrics.p99_ms,
                            utilization = metrics.utilization,
                            "host overloaded, broadcast rate halved"
                        );
                    }
                    Some(RateChange::Restore) => {
                        broadcast_interval = normal_broadcast;
                        next_broadcast = now + broadcast_interval;
                        info!(room = %state.code, "host recovered, broadcast rate restored");
                    }
                    None => {}
                }
                next_sample = now + SAMPLE_INTERVAL;
            }

            flush(&mut state, &mut outboxes);

            if state.phase == RoomPhase::Ended {
                break;
            }
            if state.players.is_empty() {
                if state.phase != RoomPhase::Lobby {
                    info!(room = %state.code, "all players left, closing room");
                    break;
                }
                // A new room is briefly empty until its creator's join
                // command lands; expire it if nobody ever arrives
                let since = *empty_since.get_or_insert(now);
                if now.saturating_duration_since(since) > EMPTY_ROOM_TIMEOUT {
                    info!(room = %state.code, "empty room expired");
                    break;
                }
            } else {
                empty_since = None;
            }

            // Sleep until the earliest deadline; commands wake the loop
            let deadline = next_tick.min(next_broadcast).min(next_sample);
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining > COARSE_SLEEP_THRESHOLD {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    command = command_rx.recv() => match command {
                        Some(command) => {
                            dispatch(&mut state, &mut outboxes, command);
                            flush(&mut state, &mut outboxes);
                        }
                        None => break,
                    }
                }
            } else {
                tokio::task::yield_now().await;
            }
        }

        flush(&mut state, &mut outboxes);
        info!(room = %state.code, "room task ended");
    }
}

/// Apply one command to the room state, keeping the outbox table in sync
fn dispatch(
    state: &mut RoomState,
    outboxes: &mut HashMap<Uuid, mpsc::UnboundedSender<ServerMsg>>,
    command: RoomCommand,
) {
    let now_ms = unix_millis();
    match command {
        RoomCommand::Join { session, outbox } => {
            outboxes.insert(session, outbox);
            if !state.join(session) {
                flush(state, outboxes);
                outboxes.remove(&session);
            }
        }
        RoomCommand::Rejoin {
            session,
            player_id,
            outbox,
        } => {
            outboxes.insert(session, outbox);
            match state.rejoin(session, player_id) {
                Some(old_session) => {
                    if old_session != session {
                        outboxes.remove(&old_session);
                    }
                }
                None => {
                    flush(state, outboxes);
                    outboxes.remove(&session);
                }
            }
        }
        RoomCommand::Leave { session } => {
            state.leave(session);
            flush(state, outboxes);
            outboxes.remove(&session);
        }
        RoomCommand::Ready { session, ready } => state.set_ready(session, ready),
        RoomCommand::SelectTeam { session, team } => state.select_team(session, team),
        RoomCommand::Loaded { session } => state.loaded(session),
        RoomCommand::Start { session } => state.start(session),
        RoomCommand::Move {
            session,
            target_x,
            target_z,
            action_id,
            seq,
        } => state.accept_move(session, target_x, target_z, action_id, seq, now_ms),
        RoomCommand::Throw {
            session,
            target_x,
            target_z,
            action_id,
            client_timestamp,
        } => state.accept_throw(
            session,
            target_x,
            target_z,
            action_id,
            client_timestamp,
            now_ms,
        ),
        RoomCommand::CollisionReport {
            session,
            target_team,
        } => state.collision_report(session, target_team),
    }
}

/// Hand pending messages to the per-session transport channels
fn flush(state: &mut RoomState, outboxes: &mut HashMap<Uuid, mpsc::UnboundedSender<ServerMsg>>) {
    for outbound in state.pending.drain(..) {
        match outbound {
            Outbound::All(msg) => {
                for tx in outboxes.values() {
                    let _ = tx.send(msg.clone());
                }
            }
            Outbound::One(session, msg) => {
                if let Some(tx) = outboxes.get(&session) {
                    let _ = tx.send(msg);
                }
            }
        }
    }
}

/// Insert the snapshot for the match-ending tick ahead of its pending
/// game-over, keeping the per-tick event order hits, snapshot, game-over.
/// Does nothing once the game-over has already been flushed; no snapshot
/// follows a delivered game-over. Returns whether a snapshot was inserted.
fn insert_final_snapshot(state: &mut RoomState, now_ms: u64) -> bool {
    let Some(position) = state
        .pending
        .iter()
        .position(|out| matches!(out, Outbound::All(ServerMsg::ServerGameOver { .. })))
    else {
        return false;
    };
    let msg = snapshot::encode_game_state(state, now_ms);
    state.pending.insert(position, Outbound::All(msg));
    true
}

/// Human-readable panic payload for the tick-fault log
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// FNV-1a over the room code and mode, the room-derived RNG seed
fn fnv1a64(code: &[u8], mode: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in code.iter().chain(mode.iter()) {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::projectile::KNIFE_LIFETIME_MS;

    const T0: u64 = 1_700_000_000_000;
    /// Simulated milliseconds per physics step, close to 1000 / 120
    const STEP_MS: u64 = 8;

    fn drain(state: &mut RoomState) -> Vec<ServerMsg> {
        state
            .pending
            .drain(..)
            .map(|out| match out {
                Outbound::All(msg) => msg,
                Outbound::One(_, msg) => msg,
            })
            .collect()
    }

    fn drain_targeted(state: &mut RoomState) -> Vec<(Option<Uuid>, ServerMsg)> {
        state
            .pending
            .drain(..)
            .map(|out| match out {
                Outbound::All(msg) => (None, msg),
                Outbound::One(session, msg) => (Some(session), msg),
            })
            .collect()
    }

    /// Full lobby flow into a running 1v1 with fixed, facing positions
    fn setup_running_1v1() -> (RoomState, Uuid, Uuid) {
        let mut state = RoomState::new("TEST".to_string(), GameMode::OneVsOne);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(state.join(a));
        assert!(state.join(b));
        state.set_ready(a, true);
        state.set_ready(b, true);
        state.start(a);
        assert_eq!(state.phase, RoomPhase::Loading);
        state.loaded(a);
        state.loaded(b);
        assert_eq!(state.phase, RoomPhase::InProgress);

        // Deterministic facing positions for combat scenarios
        {
            let pa = state.players.get_mut(&a).expect("player a");
            pa.x = -19.0;
            pa.z = 0.0;
            pa.target_x = -19.0;
            pa.target_z = 0.0;
        }
        {
            let pb = state.players.get_mut(&b).expect("player b");
            pb.x = 19.0;
            pb.z = 0.0;
            pb.target_x = 19.0;
            pb.target_z = 0.0;
        }

        state.pending.clear();
        (state, a, b)
    }

    /// Step until a health update appears; returns (messages, steps taken)
    fn step_until_health_update(
        state: &mut RoomState,
        start_ms: u64,
        max_steps: u64,
    ) -> (Vec<ServerMsg>, u64) {
        for i in 1..=max_steps {
            state.step_physics(start_ms + i * STEP_MS);
            let msgs = drain(state);
            if msgs
                .iter()
                .any(|m| matches!(m, ServerMsg::ServerHealthUpdate { .. }))
            {
                return (msgs, i);
            }
        }
        panic!("no health update within {max_steps} steps");
    }

    #[test]
    fn lobby_flow_assigns_teams_and_host() {
        let mut state = RoomState::new("AB12".to_string(), GameMode::OneVsOne);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(state.join(a));
        let msgs = drain_targeted(&mut state);
        assert!(matches!(
            msgs[0],
            (Some(s), ServerMsg::RoomCreated { .. }) if s == a
        ));

        assert!(state.join(b));
        let pa = state.players.get(&a).expect("a");
        let pb = state.players.get(&b).expect("b");
        assert_eq!(pa.team, Team::One);
        assert_eq!(pb.team, Team::Two);
        assert_eq!(state.host, Some(a));
    }

    #[test]
    fn full_room_rejects_with_room_full() {
        let mut state = RoomState::new("AB12".to_string(), GameMode::OneVsOne);
        assert!(state.join(Uuid::new_v4()));
        assert!(state.join(Uuid::new_v4()));
        drain(&mut state);

        let late = Uuid::new_v4();
        assert!(!state.join(late));
        let msgs = drain_targeted(&mut state);
        assert!(matches!(
            msgs[0],
            (Some(s), ServerMsg::RoomFull { .. }) if s == late
        ));
    }

    #[test]
    fn start_requires_host_and_readiness() {
        let mut state = RoomState::new("AB12".to_string(), GameMode::OneVsOne);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        state.join(a);
        state.join(b);
        drain(&mut state);

        state.start(b);
        let msgs = drain(&mut state);
        assert!(matches!(&msgs[0], ServerMsg::Error { message } if message.contains("host")));
        assert_eq!(state.phase, RoomPhase::Lobby);

        state.start(a);
        let msgs = drain(&mut state);
        assert!(matches!(&msgs[0], ServerMsg::Error { message } if message.contains("ready")));
        assert_eq!(state.phase, RoomPhase::Lobby);
    }

    #[test]
    fn team_select_locks_while_ready_and_respects_capacity() {
        let mut state = RoomState::new("AB12".to_string(), GameMode::OneVsOne);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        state.join(a);
        state.join(b);
        state.set_ready(a, true);
        drain(&mut state);

        state.select_team(a, Team::Two);
        let msgs = drain(&mut state);
        assert!(matches!(&msgs[0], ServerMsg::TeamSelectError { message } if message.contains("ready")));

        // b (team two) cannot move onto a's full team in 1v1
        state.select_team(b, Team::One);
        let msgs = drain(&mut state);
        assert!(matches!(&msgs[0], ServerMsg::TeamSelectError { message } if message.contains("full")));
    }

    #[test]
    fn spawn_positions_are_deterministic_per_room_seed() {
        let run = || {
            let mut state = RoomState::new("SEED".to_string(), GameMode::ThreeVsThree);
            let sessions: Vec<Uuid> = (0..6).map(|_| Uuid::new_v4()).collect();
            for s in &sessions {
                state.join(*s);
                state.set_ready(*s, true);
            }
            state.start(sessions[0]);
            let mut spawns: Vec<(u32, f32, f32)> = state
                .players
                .values()
                .map(|p| (p.player_id, p.x, p.z))
                .collect();
            spawns.sort_by_key(|(id, _, _)| *id);
            spawns
        };

        let first = run();
        let second = run();
        assert_eq!(first, second);
        for (_, x, z) in &first {
            assert!(x.abs() > 18.0);
            assert!(x.abs() + z.abs() < 120.0);
        }
    }

    #[test]
    fn basic_damage_scenario() {
        let (mut state, a, b) = setup_running_1v1();

        state.accept_throw(a, 19.0, 0.0, "t1".to_string(), T0, T0);
        let msgs = drain(&mut state);
        assert_eq!(msgs.len(), 1);
        let (vx, vz) = match &msgs[0] {
            ServerMsg::ServerKnifeSpawn {
                velocity_x,
                velocity_z,
                ..
            } => (*velocity_x, *velocity_z),
            other => panic!("expected spawn, got {other:?}"),
        };
        assert!((vx - KNIFE_SPEED).abs() < 1e-4);
        assert_eq!(vz, 0.0);

        // Distance 38 minus the collision radius at KNIFE_SPEED u/s
        let travel_ticks = (((38.0 - 11.025) / KNIFE_SPEED) * 120.0).ceil() as u64;
        let (msgs, steps) = step_until_health_update(&mut state, T0, travel_ticks + 4);
        assert!(steps <= travel_ticks + 2, "hit too late: {steps} steps");

        // health update precedes the projectile-hit event
        let health_pos = msgs
            .iter()
            .position(|m| matches!(m, ServerMsg::ServerHealthUpdate { .. }))
            .expect("health update");
        let hit_pos = msgs
            .iter()
            .position(|m| matches!(m, ServerMsg::ServerKnifeHit { .. }))
            .expect("knife hit");
        assert!(health_pos < hit_pos);

        match &msgs[health_pos] {
            ServerMsg::ServerHealthUpdate {
                health, is_dead, ..
            } => {
                assert_eq!(*health, 4);
                assert!(!is_dead);
            }
            _ => unreachable!(),
        }
        assert_eq!(state.players.get(&b).expect("b").health, 4);
    }

    #[test]
    fn cooldown_allows_exactly_one_spawn() {
        let (mut state, a, _b) = setup_running_1v1();

        state.accept_throw(a, 19.0, 0.0, "t1".to_string(), T0, T0);
        state.accept_throw(a, 19.0, 5.0, "t2".to_string(), T0 + 500, T0 + 500);

        let spawns = drain(&mut state)
            .into_iter()
            .filter(|m| matches!(m, ServerMsg::ServerKnifeSpawn { .. }))
            .count();
        assert_eq!(spawns, 1);
        assert_eq!(state.projectiles.len(), 1);

        // After the cooldown the next throw is accepted
        state.accept_throw(a, 19.0, 5.0, "t3".to_string(), T0 + 4_000, T0 + 4_000);
        let spawns = drain(&mut state)
            .into_iter()
            .filter(|m| matches!(m, ServerMsg::ServerKnifeSpawn { .. }))
            .count();
        assert_eq!(spawns, 1);
    }

    #[test]
    fn zero_length_throw_is_rejected() {
        let (mut state, a, _b) = setup_running_1v1();
        state.accept_throw(a, -19.0, 0.0, "t1".to_string(), T0, T0);
        assert!(drain(&mut state).is_empty());
        assert!(state.projectiles.is_empty());
    }

    #[test]
    fn out_of_bounds_move_is_silently_ignored() {
        let (mut state, a, _b) = setup_running_1v1();

        state.accept_move(a, -10.0, 0.0, "m1".to_string(), 1, T0);
        assert!(drain(&mut state).is_empty());
        let pa = state.players.get(&a).expect("a");
        assert_eq!((pa.target_x, pa.target_z), (-19.0, 0.0));
        assert!(!pa.is_moving);
        assert_eq!(pa.last_processed_seq, 0);
    }

    #[test]
    fn accepted_move_acks_the_commanding_client_only() {
        let (mut state, a, _b) = setup_running_1v1();

        state.accept_move(a, -30.0, 10.0, "m1".to_string(), 7, T0);
        let msgs = drain_targeted(&mut state);
        assert_eq!(msgs.len(), 1);
        match &msgs[0] {
            (Some(target), ServerMsg::ServerMoveAck { action_id, target_x, .. }) => {
                assert_eq!(*target, a);
                assert_eq!(action_id, "m1");
                assert_eq!(*target_x, -30.0);
            }
            other => panic!("expected targeted ack, got {other:?}"),
        }
        assert_eq!(state.players.get(&a).expect("a").last_processed_seq, 7);
    }

    #[test]
    fn dead_players_cannot_act() {
        let (mut state, a, b) = setup_running_1v1();
        {
            let pb = state.players.get_mut(&b).expect("b");
            pb.health = 0;
            pb.is_dead = true;
        }

        state.accept_move(b, 30.0, 0.0, "m1".to_string(), 1, T0);
        state.accept_throw(b, -19.0, 0.0, "t1".to_string(), T0, T0);
        assert!(drain(&mut state).is_empty());

        // and the hit detector skips them: a knife through b's position hits nothing
        state.accept_throw(a, 19.0, 0.0, "t2".to_string(), T0, T0);
        drain(&mut state);
        for i in 1..=1_200u64 {
            state.step_physics(T0 + i * STEP_MS);
        }
        assert!(!drain(&mut state)
            .iter()
            .any(|m| matches!(m, ServerMsg::ServerHealthUpdate { .. })));
    }

    #[test]
    fn projectile_expires_with_exactly_one_destroy() {
        let (mut state, a, _b) = setup_running_1v1();

        // Throw away from the opponent so nothing is hit
        state.accept_throw(a, -19.0, 60.0, "t1".to_string(), T0, T0);
        drain(&mut state);

        state.step_physics(T0 + STEP_MS);
        assert!(drain(&mut state)
            .iter()
            .all(|m| !matches!(m, ServerMsg::ServerKnifeDestroy { .. })));

        // Past the lifetime the next tick boundary destroys it
        state.step_physics(T0 + KNIFE_LIFETIME_MS + STEP_MS);
        let destroys = drain(&mut state)
            .into_iter()
            .filter(|m| matches!(m, ServerMsg::ServerKnifeDestroy { .. }))
            .count();
        assert_eq!(destroys, 1);
        assert!(state.projectiles.is_empty());

        state.step_physics(T0 + KNIFE_LIFETIME_MS + 2 * STEP_MS);
        assert!(drain(&mut state)
            .iter()
            .all(|m| !matches!(m, ServerMsg::ServerKnifeDestroy { .. })));
    }

    #[test]
    fn hit_projectile_is_destroyed_at_the_next_tick_boundary() {
        let (mut state, a, _b) = setup_running_1v1();

        state.accept_throw(a, 19.0, 0.0, "t1".to_string(), T0, T0);
        drain(&mut state);
        let (_, steps) = step_until_health_update(&mut state, T0, 1_200);

        state.step_physics(T0 + (steps + 1) * STEP_MS);
        let msgs = drain(&mut state);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, ServerMsg::ServerKnifeDestroy { .. })));
        assert!(state.projectiles.is_empty());
    }

    #[test]
    fn prev_position_tracks_last_tick() {
        let (mut state, a, _b) = setup_running_1v1();
        state.accept_throw(a, 19.0, 0.0, "t1".to_string(), T0, T0);
        drain(&mut state);

        state.step_physics(T0 + STEP_MS);
        let after_one: Vec<(f32, f32)> = state
            .projectiles
            .values()
            .map(|k| (k.x, k.z))
            .collect();

        state.step_physics(T0 + 2 * STEP_MS);
        let prev: Vec<(f32, f32)> = state
            .projectiles
            .values()
            .map(|k| (k.prev_x, k.prev_z))
            .collect();
        assert_eq!(after_one, prev);
    }

    #[test]
    fn five_hits_end_the_game() {
        let (mut state, a, b) = setup_running_1v1();

        let mut healths = Vec::new();
        let mut now = T0;
        for round in 0..5 {
            state.accept_throw(a, 19.0, 0.0, format!("t{round}"), now, now);
            let spawned = drain(&mut state)
                .iter()
                .any(|m| matches!(m, ServerMsg::ServerKnifeSpawn { .. }));
            assert!(spawned, "throw {round} rejected");

            let (msgs, steps) = step_until_health_update(&mut state, now, 1_200);
            for msg in &msgs {
                if let ServerMsg::ServerHealthUpdate {
                    health, is_dead, ..
                } = msg
                {
                    healths.push((*health, *is_dead));
                }
            }
            now += steps * STEP_MS;
            // respect the cooldown before the next round
            now += KNIFE_COOLDOWN_MS;

            if round == 4 {
                let game_over = msgs.iter().find_map(|m| match m {
                    ServerMsg::ServerGameOver { winning_team } => Some(*winning_team),
                    _ => None,
                });
                assert_eq!(game_over, Some(Some(Team::One)));
            } else {
                // knife from the previous round must be gone before the next
                state.step_physics(now);
                drain(&mut state);
                now += STEP_MS;
            }
        }

        assert_eq!(
            healths,
            vec![
                (4, false),
                (3, false),
                (2, false),
                (1, false),
                (0, true)
            ]
        );
        assert_eq!(state.phase, RoomPhase::Ended);
        assert!(state.players.get(&b).expect("b").is_dead);

        // No further simulation after the game ends
        let tick = state.tick;
        state.step_physics(now + STEP_MS);
        assert_eq!(state.tick, tick);
        assert!(drain(&mut state).is_empty());
    }

    #[test]
    fn mutual_elimination_is_a_draw() {
        let (mut state, a, b) = setup_running_1v1();
        state.players.get_mut(&a).expect("a").health = 1;
        state.players.get_mut(&b).expect("b").health = 1;

        // Symmetric throws: both knives land on the same tick
        state.accept_throw(a, 19.0, 0.0, "ta".to_string(), T0, T0);
        state.accept_throw(b, -19.0, 0.0, "tb".to_string(), T0, T0);
        drain(&mut state);

        let mut outcome = None;
        for i in 1..=1_200u64 {
            state.step_physics(T0 + i * STEP_MS);
            let msgs = drain(&mut state);
            if let Some(found) = msgs.iter().find_map(|m| match m {
                ServerMsg::ServerGameOver { winning_team } => Some(*winning_team),
                _ => None,
            }) {
                outcome = Some(found);
                break;
            }
        }
        assert_eq!(outcome, Some(None), "expected a drawn game");
        assert_eq!(state.phase, RoomPhase::Ended);
    }

    #[test]
    fn ending_tick_broadcast_precedes_game_over() {
        let (mut state, a, b) = setup_running_1v1();
        state.players.get_mut(&b).expect("b").health = 1;

        state.accept_throw(a, 19.0, 0.0, "t1".to_string(), T0, T0);
        drain(&mut state);

        // Step without flushing until the fatal hit ends the game
        let mut i = 0u64;
        while state.phase != RoomPhase::Ended {
            i += 1;
            assert!(i <= 1_200, "game never ended");
            state.step_physics(T0 + i * STEP_MS);
        }

        // A broadcast due on the ending tick goes out ahead of the game-over
        assert!(insert_final_snapshot(&mut state, T0 + i * STEP_MS));
        let msgs = drain(&mut state);
        let hit = msgs
            .iter()
            .position(|m| matches!(m, ServerMsg::ServerKnifeHit { .. }))
            .expect("knife hit");
        let snap = msgs
            .iter()
            .position(|m| matches!(m, ServerMsg::ServerGameState { .. }))
            .expect("final snapshot");
        let over = msgs
            .iter()
            .position(|m| matches!(m, ServerMsg::ServerGameOver { .. }))
            .expect("game over");
        assert!(hit < snap && snap < over);

        // Once the game-over has been flushed, no snapshot follows it
        assert!(!insert_final_snapshot(&mut state, T0 + (i + 1) * STEP_MS));
        assert!(drain(&mut state).is_empty());
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload = std::panic::catch_unwind(|| panic!("bad tick {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "bad tick 7");
    }

    #[test]
    fn collision_report_damages_first_living_opponent() {
        let (mut state, a, b) = setup_running_1v1();

        state.collision_report(a, Team::Two);
        let msgs = drain(&mut state);
        assert!(matches!(
            msgs[0],
            ServerMsg::ServerHealthUpdate { health: 4, is_dead: false, .. }
        ));
        assert_eq!(state.players.get(&b).expect("b").health, 4);

        // same team: silently dropped
        state.collision_report(a, Team::One);
        assert!(drain(&mut state).is_empty());
        assert_eq!(state.players.get(&a).expect("a").health, 5);
    }

    #[test]
    fn rejoin_rekeys_every_session_table() {
        let (mut state, _a, b) = setup_running_1v1();
        state.accept_throw(b, -19.0, 0.0, "t1".to_string(), T0, T0);
        drain(&mut state);

        let player_id = state.players.get(&b).expect("b").player_id;
        let replacement = Uuid::new_v4();
        let old = state.rejoin(replacement, player_id);
        assert_eq!(old, Some(b));

        assert!(state.players.get(&b).is_none());
        assert_eq!(
            state.players.get(&replacement).expect("rekeyed").player_id,
            player_id
        );
        assert!(state.projectiles.values().all(|k| k.owner == replacement));

        // commands through the new session key work
        drain(&mut state);
        state.accept_move(replacement, 30.0, 5.0, "m1".to_string(), 3, T0 + 10);
        let msgs = drain_targeted(&mut state);
        assert!(matches!(
            msgs[0],
            (Some(s), ServerMsg::ServerMoveAck { .. }) if s == replacement
        ));
    }

    #[test]
    fn host_departure_tears_the_room_down() {
        let (mut state, a, _b) = setup_running_1v1();
        state.leave(a);
        let msgs = drain(&mut state);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, ServerMsg::HostDisconnected)));
        assert_eq!(state.phase, RoomPhase::Ended);
    }

    #[test]
    fn non_host_departure_keeps_the_room_and_ends_the_match() {
        let (mut state, _a, b) = setup_running_1v1();
        state.leave(b);
        let msgs = drain(&mut state);
        assert!(msgs
            .iter()
            .any(|m| matches!(m, ServerMsg::OpponentDisconnected { .. })));
        // last team standing
        assert!(msgs.iter().any(|m| matches!(
            m,
            ServerMsg::ServerGameOver { winning_team: Some(Team::One) }
        )));
        assert_eq!(state.phase, RoomPhase::Ended);
    }
}
