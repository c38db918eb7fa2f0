//! Live player records and the session-keyed player table

use std::collections::HashMap;

use uuid::Uuid;

use crate::ws::protocol::Team;

/// Maximum health of a player
pub const MAX_HEALTH: u8 = 5;

/// Player state in a room (authoritative)
#[derive(Debug, Clone)]
pub struct Player {
    pub player_id: u32,
    pub team: Team,

    // Position and movement
    pub x: f32,
    pub z: f32,
    pub target_x: f32,
    pub target_z: f32,
    pub is_moving: bool,

    // Combat
    pub health: u8,
    pub is_dead: bool,
    /// Wall-clock time of the last accepted throw, 0 = never thrown
    pub last_throw_ms: u64,

    // Reconciliation bookkeeping
    pub last_processed_seq: u32,

    // Lobby bookkeeping
    pub ready: bool,
    pub loaded: bool,
}

impl Player {
    pub fn new(player_id: u32, team: Team) -> Self {
        Self {
            player_id,
            team,
            x: 0.0,
            z: 0.0,
            target_x: 0.0,
            target_z: 0.0,
            is_moving: false,
            health: MAX_HEALTH,
            is_dead: false,
            last_throw_ms: 0,
            last_processed_seq: 0,
            ready: false,
            loaded: false,
        }
    }

    /// Apply one point of damage. Returns true on the transition to dead.
    pub fn apply_hit(&mut self) -> bool {
        self.health = self.health.saturating_sub(1);
        if self.health == 0 && !self.is_dead {
            self.is_dead = true;
            self.is_moving = false;
            return true;
        }
        false
    }
}

/// Session-keyed set of live players
#[derive(Debug, Default)]
pub struct PlayerTable {
    players: HashMap<Uuid, Player>,
}

impl PlayerTable {
    pub fn new() -> Self {
        Self {
            players: HashMap::new(),
        }
    }

    pub fn get(&self, session: &Uuid) -> Option<&Player> {
        self.players.get(session)
    }

    pub fn get_mut(&mut self, session: &Uuid) -> Option<&mut Player> {
        self.players.get_mut(session)
    }

    pub fn insert(&mut self, session: Uuid, player: Player) {
        self.players.insert(session, player);
    }

    pub fn remove(&mut self, session: &Uuid) -> Option<Player> {
        self.players.remove(session)
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, &Player)> {
        self.players.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Uuid, &mut Player)> {
        self.players.iter_mut()
    }

    pub fn values(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Player> {
        self.players.values_mut()
    }

    /// Session key of the player holding `player_id`
    pub fn session_by_player_id(&self, player_id: u32) -> Option<Uuid> {
        self.players
            .iter()
            .find(|(_, p)| p.player_id == player_id)
            .map(|(session, _)| *session)
    }

    /// Number of players on a team
    pub fn team_count(&self, team: Team) -> usize {
        self.players.values().filter(|p| p.team == team).count()
    }

    /// Teams that still have at least one living player
    pub fn living_teams(&self) -> Vec<Team> {
        let mut teams = Vec::with_capacity(2);
        for team in [Team::One, Team::Two] {
            if self
                .players
                .values()
                .any(|p| p.team == team && !p.is_dead)
            {
                teams.push(team);
            }
        }
        teams
    }

    /// First living player on a team, lowest player id first for determinism
    pub fn first_living_on_team(&mut self, team: Team) -> Option<&mut Player> {
        self.players
            .values_mut()
            .filter(|p| p.team == team && !p.is_dead)
            .min_by_key(|p| p.player_id)
    }

    /// Rekey a player record in place (session migration on rejoin).
    /// Returns false when the old session is unknown.
    pub fn rekey(&mut self, old_session: &Uuid, new_session: Uuid) -> bool {
        match self.players.remove(old_session) {
            Some(player) => {
                self.players.insert(new_session, player);
                true
            }
            None => false,
        }
    }
}
