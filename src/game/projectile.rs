//! Live projectile records

use std::collections::HashMap;

use uuid::Uuid;

use crate::ws::protocol::Team;

/// Projectile travel speed in units per second
pub const KNIFE_SPEED: f32 = 4.5864;
/// Wall-clock cooldown between throws per player
pub const KNIFE_COOLDOWN_MS: u64 = 4_000;
/// Projectile lifetime measured from spawn wall-clock
pub const KNIFE_LIFETIME_MS: u64 = 35_000;

/// Active projectile in a room
#[derive(Debug, Clone)]
pub struct Projectile {
    /// `<roomCode>-<n>` with n monotonically increasing within the room
    pub id: String,
    pub owner: Uuid,
    pub owner_team: Team,
    pub action_id: String,

    pub x: f32,
    pub z: f32,
    pub prev_x: f32,
    pub prev_z: f32,
    pub vx: f32,
    pub vz: f32,

    /// Server wall-clock at spawn
    pub spawn_ms: u64,
    /// Owner-reported client wall-clock at throw, used for lag compensation
    pub client_ms: u64,

    /// One-way flag; once set the projectile is removed at the next tick
    /// boundary and ignored by hit detection
    pub has_hit: bool,
}

impl Projectile {
    /// Advance one fixed timestep, saving the previous position for the
    /// swept hit test
    pub fn advance(&mut self, dt: f32) {
        self.prev_x = self.x;
        self.prev_z = self.z;
        self.x += self.vx * dt;
        self.z += self.vz * dt;
    }

    pub fn expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.spawn_ms) > KNIFE_LIFETIME_MS
    }
}

/// Keyed set of live projectiles
#[derive(Debug, Default)]
pub struct ProjectileTable {
    projectiles: HashMap<String, Projectile>,
}

impl ProjectileTable {
    pub fn new() -> Self {
        Self {
            projectiles: HashMap::new(),
        }
    }

    pub fn insert(&mut self, projectile: Projectile) {
        self.projectiles.insert(projectile.id.clone(), projectile);
    }

    pub fn len(&self) -> usize {
        self.projectiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projectiles.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &Projectile> {
        self.projectiles.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Projectile> {
        self.projectiles.values_mut()
    }

    /// Remove every projectile matching the predicate, returning the removed
    /// records in id order
    pub fn drain_where<F: Fn(&Projectile) -> bool>(&mut self, pred: F) -> Vec<Projectile> {
        let mut ids: Vec<String> = self
            .projectiles
            .values()
            .filter(|p| pred(p))
            .map(|p| p.id.clone())
            .collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| self.projectiles.remove(&id))
            .collect()
    }

    /// Migrate ownership on session rekey
    pub fn rekey_owner(&mut self, old_session: &Uuid, new_session: Uuid) {
        for projectile in self.projectiles.values_mut() {
            if projectile.owner == *old_session {
                projectile.owner = new_session;
            }
        }
    }
}
