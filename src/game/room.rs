//! Room state and the authoritative simulation step
//!
//! A [`Room`] owns one world. It is driven from a single task (see
//! [`super::scheduler`]) so every mutation happens in one place: intents
//! through [`Room::handle_input`], time through [`Room::tick_high`] and
//! [`Room::tick_low`]. Everything the room wants clients to hear is queued
//! in an outbox and drained by the driver after each step.

use std::collections::HashMap;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, error, info, warn};

use crate::config::GameConfig;
use crate::util::time::{tick_delta, SIMULATION_TPS, SNAPSHOT_TPS};
use crate::util::Vec2;
use crate::ws::protocol::{ClientMsg, MatchOutcome, PlayerResult, ServerMsg, WorldSnapshot};

use super::player::{ControlIntent, PlayerEntity, PlayerEnv, PlayerEvent, ThrowRequest, MAX_CHARGE, PLAYER_SIZE};
use super::projectile::{self, FailureReason, PhysicsContext, Projectile, ProjectileOutcome, MISS_PENALTY};
use super::router::{self, AdvanceOutcome, Vehicle};
use super::snapshot::{player_snapshot, projectile_snapshot, vehicle_snapshot, SnapshotBuilder};
use super::validation::{validator_for, MoveValidator, ProposedMove};
use super::world::{CityLayout, DeliveryTargets, GRID_COLS, GRID_ROWS};
use super::{ConnectionId, Outbound, PlayerInput};

/// Points per whole second left on the clock, paid to everyone on victory
pub const TIME_BONUS_PER_SECOND: u32 = 10;

/// Why a connection could not enter a room
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("Room is full ({max} players)")]
    RoomFull { max: usize },

    #[error("Connection is already in this room")]
    AlreadyJoined,
}

impl JoinError {
    /// Wire error code sent to the refused connection
    pub fn code(&self) -> &'static str {
        match self {
            Self::RoomFull { .. } => "room_full",
            Self::AlreadyJoined => "already_joined",
        }
    }
}

/// Everything simulated inside a room
struct World {
    city: CityLayout,
    targets: DeliveryTargets,
    vehicles: Vec<Vehicle>,
    players: HashMap<ConnectionId, PlayerEntity>,
    projectiles: Vec<Projectile>,
    time_remaining: f32,
    started: bool,
    over: bool,
    deliveries_completed: usize,
}

impl World {
    fn lobby(city: CityLayout, duration: f32) -> Self {
        Self {
            city,
            targets: DeliveryTargets::default(),
            vehicles: Vec::new(),
            players: HashMap::new(),
            projectiles: Vec::new(),
            time_remaining: duration,
            started: false,
            over: false,
            deliveries_completed: 0,
        }
    }
}

pub struct Room {
    id: String,
    config: GameConfig,
    world: World,
    rng: ChaCha8Rng,
    validator: Box<dyn MoveValidator>,
    snapshot_builder: SnapshotBuilder,
    outbox: Vec<Outbound>,
    tick: u64,
    next_projectile_id: u64,
}

impl Room {
    pub fn new(id: impl Into<String>, config: GameConfig) -> Self {
        let mut rng = match config.world_seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let city = CityLayout::generate_with(&mut rng, GRID_COLS, GRID_ROWS);
        let world = World::lobby(city, config.match_duration_secs);
        let validator = validator_for(config.move_validation);

        Self {
            id: id.into(),
            config,
            world,
            rng,
            validator,
            snapshot_builder: SnapshotBuilder::new(SIMULATION_TPS / SNAPSHOT_TPS),
            outbox: Vec::new(),
            tick: 0,
            next_projectile_id: 1,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn player_count(&self) -> usize {
        self.world.players.len()
    }

    pub fn is_started(&self) -> bool {
        self.world.started
    }

    pub fn is_over(&self) -> bool {
        self.world.over
    }

    /// Match running and not yet decided
    pub fn in_play(&self) -> bool {
        self.world.started && !self.world.over
    }

    /// Messages produced since the last call
    pub fn take_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    /// Full read-only view of the world
    pub fn snapshot(&self) -> WorldSnapshot {
        let w = &self.world;
        WorldSnapshot {
            bounds: w.city.bounds,
            obstacles: w.city.obstacles.clone(),
            targets: w.targets.as_slice().to_vec(),
            vehicles: w.vehicles.iter().map(vehicle_snapshot).collect(),
            projectiles: w.projectiles.iter().map(projectile_snapshot).collect(),
            players: w.players.values().map(player_snapshot).collect(),
            time_remaining: w.time_remaining,
            started: w.started,
            over: w.over,
            deliveries_completed: w.deliveries_completed,
            required_deliveries: self.config.required_deliveries,
        }
    }

    fn send(&mut self, outbound: Outbound) {
        self.outbox.push(outbound);
    }

    fn full_state_for(&self, conn_id: ConnectionId) -> ServerMsg {
        ServerMsg::FullState {
            you: conn_id,
            world: self.snapshot(),
        }
    }

    /// Add a player for a fresh connection
    pub fn connect(&mut self, conn_id: ConnectionId, now_ms: u64) -> Result<(), JoinError> {
        if self.world.players.contains_key(&conn_id) {
            warn!(room = %self.id, conn_id = %conn_id, "Connection already in room");
            return Err(JoinError::AlreadyJoined);
        }

        let max = self.config.max_players;
        if self.world.players.len() >= max {
            warn!(room = %self.id, conn_id = %conn_id, max, "Room full, rejecting player");
            return Err(JoinError::RoomFull { max });
        }

        let spawn = self.world.city.spawn_point(&mut self.rng, PLAYER_SIZE);
        let player = PlayerEntity::new(conn_id, spawn, self.config.throws_per_player, now_ms);
        let joined = player_snapshot(&player);
        self.world.players.insert(conn_id, player);

        info!(
            room = %self.id,
            conn_id = %conn_id,
            player_count = self.world.players.len(),
            "Player joined room"
        );

        let full_state = self.full_state_for(conn_id);
        self.send(Outbound::only(conn_id, full_state));
        self.send(Outbound::except(conn_id, ServerMsg::PlayerJoined { player: joined }));
        Ok(())
    }

    /// Remove a player. Safe to call more than once.
    pub fn disconnect(&mut self, conn_id: ConnectionId) {
        if self.world.players.remove(&conn_id).is_none() {
            return;
        }

        info!(
            room = %self.id,
            conn_id = %conn_id,
            player_count = self.world.players.len(),
            "Player left room"
        );
        self.send(Outbound::all(ServerMsg::PlayerLeft { conn_id }));

        if self.world.players.is_empty() {
            info!(room = %self.id, "Room empty, resetting world");
            self.reset_world();
            return;
        }

        // The leaver may have been the last one not ready
        self.maybe_start();
    }

    /// Apply one client intent
    pub fn handle_input(&mut self, input: PlayerInput) {
        let PlayerInput {
            conn_id,
            msg,
            received_at,
        } = input;

        if !matches!(msg, ClientMsg::Ping { .. }) && !self.world.players.contains_key(&conn_id) {
            debug!(room = %self.id, conn_id = %conn_id, "Intent from unknown connection ignored");
            return;
        }

        match msg {
            ClientMsg::Move {
                x,
                y,
                heading,
                vx,
                vy,
                charging,
                charge,
            } => {
                let proposed = ProposedMove {
                    position: Vec2::new(x, y),
                    heading,
                    velocity: Vec2::new(vx, vy),
                };
                self.handle_move(conn_id, proposed, charging, charge, received_at);
            }
            ClientMsg::Steer { turn } => {
                self.apply_control(conn_id, ControlIntent::Steer(turn));
            }
            ClientMsg::Throw { x, y, vx, vy } => {
                self.handle_throw(conn_id, Vec2::new(x, y), Vec2::new(vx, vy), received_at);
            }
            ClientMsg::ChargeState { charging, aim } => {
                if !self.in_play() {
                    debug!(room = %self.id, conn_id = %conn_id, "Charge outside a running match ignored");
                    return;
                }
                let throw = self.apply_control(conn_id, ControlIntent::Charge { charging, aim });
                self.relay_flags(conn_id);
                if let Some(request) = throw {
                    self.spawn_projectile(conn_id, request);
                }
            }
            ClientMsg::BrakeState { braking } => {
                self.apply_control(conn_id, ControlIntent::Brake(braking));
                self.relay_flags(conn_id);
            }
            ClientMsg::Name { name } => self.handle_rename(conn_id, &name),
            ClientMsg::Ready => self.handle_ready(conn_id),
            ClientMsg::Reset => self.reset(),
            ClientMsg::Leave => self.disconnect(conn_id),
            ClientMsg::Ping { t } => {
                self.send(Outbound::only(conn_id, ServerMsg::Pong { t }));
            }
        }
    }

    fn handle_move(
        &mut self,
        conn_id: ConnectionId,
        proposed: ProposedMove,
        charging: bool,
        charge: f32,
        now_ms: u64,
    ) {
        let Some(player) = self.world.players.get_mut(&conn_id) else {
            return;
        };

        if let Err(rejection) = self.validator.validate(player, &proposed, now_ms) {
            warn!(room = %self.id, conn_id = %conn_id, %rejection, "Move rejected");
            self.send(Outbound::only(
                conn_id,
                ServerMsg::Error {
                    code: "move_rejected".to_string(),
                    message: rejection.to_string(),
                },
            ));
            return;
        }

        player.apply_reported_move(proposed.position, proposed.heading, proposed.velocity, &self.world.city);
        player.last_move_at = Some(now_ms);
        player.input.charging = charging && !player.is_stunned();
        if charge.is_finite() {
            player.charge = charge.clamp(0.0, MAX_CHARGE);
        }

        let update = ServerMsg::PlayerUpdate {
            id: conn_id,
            x: player.position.x,
            y: player.position.y,
            heading: player.heading,
            vx: player.velocity.x,
            vy: player.velocity.y,
            charging: player.input.charging,
            charge: player.charge,
        };
        self.send(Outbound::except(conn_id, update));
    }

    fn handle_throw(&mut self, conn_id: ConnectionId, position: Vec2, velocity: Vec2, now_ms: u64) {
        if !self.in_play() {
            debug!(room = %self.id, conn_id = %conn_id, "Throw outside a running match ignored");
            return;
        }
        let Some(player) = self.world.players.get_mut(&conn_id) else {
            return;
        };

        let proposed = ProposedMove {
            position,
            heading: player.heading,
            velocity,
        };
        if let Err(rejection) = self.validator.validate(player, &proposed, now_ms) {
            warn!(room = %self.id, conn_id = %conn_id, %rejection, "Throw rejected");
            return;
        }
        if !player.consume_throw() {
            debug!(room = %self.id, conn_id = %conn_id, "Throw refused, none left or stunned");
            return;
        }

        let position = self.world.city.bounds.clamp(position, 0.0);
        self.spawn_projectile(conn_id, ThrowRequest { position, velocity });
    }

    fn apply_control(&mut self, conn_id: ConnectionId, intent: ControlIntent) -> Option<ThrowRequest> {
        self.world
            .players
            .get_mut(&conn_id)
            .and_then(|p| p.apply_input(intent))
    }

    fn relay_flags(&mut self, conn_id: ConnectionId) {
        let Some(player) = self.world.players.get(&conn_id) else {
            return;
        };
        let flags = ServerMsg::PlayerInput {
            id: conn_id,
            braking: player.input.braking,
            charging: player.input.charging,
        };
        self.send(Outbound::except(conn_id, flags));
    }

    fn handle_rename(&mut self, conn_id: ConnectionId, raw: &str) {
        let Some(player) = self.world.players.get_mut(&conn_id) else {
            return;
        };
        if !player.set_name(raw) {
            debug!(room = %self.id, conn_id = %conn_id, "Empty name ignored");
            return;
        }
        let name = player.name.clone();
        info!(room = %self.id, conn_id = %conn_id, name = %name, "Player renamed");
        self.send(Outbound::all(ServerMsg::PlayerRenamed { id: conn_id, name }));
    }

    fn handle_ready(&mut self, conn_id: ConnectionId) {
        if self.world.started {
            debug!(room = %self.id, conn_id = %conn_id, "Ready after start ignored");
            return;
        }
        let Some(player) = self.world.players.get_mut(&conn_id) else {
            return;
        };
        if player.ready {
            return;
        }
        player.ready = true;
        self.send(Outbound::all(ServerMsg::PlayerReady { id: conn_id }));
        self.maybe_start();
    }

    fn maybe_start(&mut self) {
        let w = &self.world;
        if !w.started && !w.players.is_empty() && w.players.values().all(|p| p.ready) {
            self.start_match();
        }
    }

    fn start_match(&mut self) {
        let required = self.config.required_deliveries;
        let targets = match self.world.city.place_delivery_targets(&mut self.rng, required) {
            Ok(targets) => targets,
            Err(err) => {
                error!(room = %self.id, error = %err, "Could not start match");
                for player in self.world.players.values_mut() {
                    player.ready = false;
                }
                self.send(Outbound::all(ServerMsg::Error {
                    code: "generation_failed".to_string(),
                    message: err.to_string(),
                }));
                return;
            }
        };

        let w = &mut self.world;
        w.vehicles = router::spawn_vehicles(&mut self.rng, &w.city, self.config.vehicle_count);
        w.targets = targets;
        w.projectiles.clear();
        w.time_remaining = self.config.match_duration_secs;
        w.deliveries_completed = 0;
        w.started = true;
        w.over = false;
        for player in w.players.values_mut() {
            let position = player.position;
            player.respawn(position, self.config.throws_per_player);
        }
        self.tick = 0;
        self.snapshot_builder.force_next();

        info!(
            room = %self.id,
            players = self.world.players.len(),
            targets = self.world.targets.len(),
            vehicles = self.world.vehicles.len(),
            "Match started"
        );

        let start = ServerMsg::MatchStart {
            bounds: self.world.city.bounds,
            obstacles: self.world.city.obstacles.clone(),
            targets: self.world.targets.as_slice().to_vec(),
            vehicles: self.world.vehicles.iter().map(vehicle_snapshot).collect(),
            time_remaining: self.world.time_remaining,
            required_deliveries: required,
        };
        self.send(Outbound::all(start));
    }

    fn spawn_projectile(&mut self, owner: ConnectionId, request: ThrowRequest) {
        let id = self.next_projectile_id;
        self.next_projectile_id += 1;

        let projectile = Projectile::new(id, owner, request.position, request.velocity);
        let msg = ServerMsg::Throw {
            owner,
            projectile_id: id,
            x: projectile.position.x,
            y: projectile.position.y,
            vx: projectile.velocity.x,
            vy: projectile.velocity.y,
        };
        self.world.projectiles.push(projectile);
        debug!(room = %self.id, owner = %owner, projectile_id = id, "Parcel thrown");
        self.send(Outbound::all(msg));
    }

    /// Client-requested reset: new city, everyone back in the lobby
    pub fn reset(&mut self) {
        info!(room = %self.id, "World reset requested");
        self.reset_world();
        let ids: Vec<ConnectionId> = self.world.players.keys().copied().collect();
        for id in ids {
            let full_state = self.full_state_for(id);
            self.send(Outbound::only(id, full_state));
        }
    }

    fn reset_world(&mut self) {
        let w = &mut self.world;
        w.city = CityLayout::generate_with(&mut self.rng, GRID_COLS, GRID_ROWS);
        w.targets = DeliveryTargets::default();
        w.vehicles.clear();
        w.projectiles.clear();
        w.time_remaining = self.config.match_duration_secs;
        w.started = false;
        w.over = false;
        w.deliveries_completed = 0;
        for player in w.players.values_mut() {
            let spawn = w.city.spawn_point(&mut self.rng, PLAYER_SIZE);
            player.respawn(spawn, self.config.throws_per_player);
            player.ready = false;
        }
        self.tick = 0;
    }

    /// One high-frequency step: clock, players, parcels, end conditions
    pub fn tick_high(&mut self) {
        if !self.in_play() {
            return;
        }
        self.tick += 1;
        self.world.time_remaining = (self.world.time_remaining - tick_delta()).max(0.0);

        self.tick_players();
        self.tick_projectiles();

        if self.snapshot_builder.should_send() {
            let snapshot = self.snapshot_builder.build(
                self.tick,
                self.world.time_remaining,
                self.world.players.values(),
            );
            self.send(Outbound::all(snapshot));
        }

        self.check_match_end();
    }

    fn tick_players(&mut self) {
        let env = PlayerEnv {
            city: &self.world.city,
            vehicles: &self.world.vehicles,
        };
        let mut stunned = Vec::new();
        for player in self.world.players.values_mut() {
            match player.tick(&env) {
                Some(PlayerEvent::Stunned) => stunned.push(player.id),
                Some(PlayerEvent::Recovered) => {
                    debug!(room = %self.id, conn_id = %player.id, "Player recovered");
                }
                None => {}
            }
        }
        for id in stunned {
            self.send(Outbound::all(ServerMsg::PlayerStunned { id }));
        }
    }

    fn tick_projectiles(&mut self) {
        let had_projectiles = !self.world.projectiles.is_empty();

        let mut i = 0;
        while i < self.world.projectiles.len() {
            let outcome = {
                let w = &mut self.world;
                let ctx = PhysicsContext {
                    bounds: w.city.bounds,
                    obstacles: &w.city.obstacles,
                    vehicles: &w.vehicles,
                    target: w.targets.active_index().zip(w.targets.active()),
                };
                projectile::update(&mut w.projectiles[i], &ctx)
            };

            if outcome.is_active() {
                i += 1;
                continue;
            }

            let parcel = self.world.projectiles.remove(i);
            match outcome {
                ProjectileOutcome::Delivered {
                    target_index,
                    distance,
                    score,
                } => self.resolve_delivery(parcel.owner, target_index, distance, score),
                ProjectileOutcome::Failed(reason) => self.resolve_failure(parcel.owner, reason),
                ProjectileOutcome::Sliding | ProjectileOutcome::Settled => {}
            }
        }

        // Keep batching while anything flies, plus one empty batch once the
        // last parcel is gone
        if had_projectiles || !self.world.projectiles.is_empty() {
            let projectiles = self.world.projectiles.iter().map(projectile_snapshot).collect();
            self.send(Outbound::all(ServerMsg::ProjectileBatch { projectiles }));
        }
    }

    fn resolve_delivery(&mut self, owner: ConnectionId, target_index: usize, distance: f32, score: u32) {
        let next_target = self.world.targets.advance();
        self.world.deliveries_completed += 1;

        // The owner may have left while the parcel was sliding
        if let Some(player) = self.world.players.get_mut(&owner) {
            player.score += score;
            player.deliveries += 1;
            player.throws_remaining += 1;
        }

        info!(
            room = %self.id,
            player = %owner,
            target_index,
            distance,
            score,
            deliveries = self.world.deliveries_completed,
            "Parcel delivered"
        );
        self.send(Outbound::all(ServerMsg::DeliveryMade {
            player: owner,
            target_index,
            score,
            next_target,
            deliveries_completed: self.world.deliveries_completed,
        }));
    }

    fn resolve_failure(&mut self, owner: ConnectionId, reason: FailureReason) {
        if let Some(player) = self.world.players.get_mut(&owner) {
            player.score = player.score.saturating_sub(MISS_PENALTY);
        }
        debug!(room = %self.id, player = %owner, ?reason, "Parcel failed");
        self.send(Outbound::all(ServerMsg::DeliveryFailed {
            player: owner,
            reason,
            penalty: MISS_PENALTY,
        }));
    }

    fn check_match_end(&mut self) {
        let w = &self.world;
        if w.deliveries_completed >= self.config.required_deliveries {
            // `as` saturates, so a huge clock only caps the bonus
            let time_bonus = (w.time_remaining.floor() as u32).saturating_mul(TIME_BONUS_PER_SECOND);
            for player in self.world.players.values_mut() {
                player.score = player.score.saturating_add(time_bonus);
            }
            self.end_match(MatchOutcome::Victory, time_bonus);
        } else if w.time_remaining <= 0.0 {
            self.end_match(MatchOutcome::TimeUp, 0);
        } else if !w.players.is_empty()
            && w.projectiles.is_empty()
            && w.players.values().all(|p| p.throws_remaining == 0)
        {
            self.end_match(MatchOutcome::OutOfThrows, 0);
        }
    }

    fn end_match(&mut self, outcome: MatchOutcome, time_bonus: u32) {
        self.world.over = true;

        let mut results: Vec<PlayerResult> = self
            .world
            .players
            .values()
            .map(|p| PlayerResult {
                id: p.id,
                name: p.name.clone(),
                score: p.score,
                deliveries: p.deliveries,
            })
            .collect();
        results.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.name.cmp(&b.name)));

        info!(
            room = %self.id,
            ?outcome,
            time_bonus,
            deliveries = self.world.deliveries_completed,
            "Match over"
        );
        self.send(Outbound::all(ServerMsg::MatchOver {
            outcome,
            time_bonus,
            results,
        }));
    }

    /// One low-frequency step: vehicles
    pub fn tick_low(&mut self) {
        if !self.in_play() || self.world.vehicles.is_empty() {
            return;
        }

        let traffic: Vec<(u32, Vec2)> = self.world.vehicles.iter().map(|v| (v.id, v.position)).collect();
        for vehicle in &mut self.world.vehicles {
            if router::advance(vehicle, &self.world.city, &traffic, &mut self.rng) == AdvanceOutcome::Rerouted {
                debug!(room = %self.id, vehicle = vehicle.id, "Vehicle rerouted");
            }
        }

        let vehicles = self.world.vehicles.iter().map(vehicle_snapshot).collect();
        self.send(Outbound::all(ServerMsg::VehicleBatch { vehicles }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::Audience;
    use crate::game::world::TARGET_RADIUS;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn config() -> GameConfig {
        GameConfig {
            world_seed: Some(7),
            ..GameConfig::default()
        }
    }

    fn join(room: &mut Room) -> ConnectionId {
        let id = Uuid::new_v4();
        room.connect(id, 1_000).unwrap();
        id
    }

    fn send(room: &mut Room, conn_id: ConnectionId, msg: ClientMsg) {
        room.handle_input(PlayerInput {
            conn_id,
            msg,
            received_at: 1_000,
        });
    }

    /// Ready everyone and start with no traffic in the way
    fn started_room(config: GameConfig, players: usize) -> (Room, Vec<ConnectionId>) {
        let mut room = Room::new("test", config);
        let ids: Vec<ConnectionId> = (0..players).map(|_| join(&mut room)).collect();
        for id in &ids {
            send(&mut room, *id, ClientMsg::Ready);
        }
        assert!(room.is_started());
        room.world.vehicles.clear();
        room.take_outbox();
        (room, ids)
    }

    /// Drop a resting parcel on the active target
    fn drop_on_target(room: &mut Room, owner: ConnectionId) {
        let target = room.world.targets.active().unwrap().position;
        room.world
            .projectiles
            .push(Projectile::new(900, owner, target, Vec2::ZERO));
    }

    fn has(outbox: &[Outbound], pred: impl Fn(&ServerMsg) -> bool) -> bool {
        outbox.iter().any(|o| pred(&o.msg))
    }

    #[test]
    fn joiner_gets_full_state_and_peers_hear_about_it() {
        let mut room = Room::new("test", config());
        let a = join(&mut room);
        room.take_outbox();

        let b = join(&mut room);
        let out = room.take_outbox();
        assert_eq!(out.len(), 2);

        assert_eq!(out[0].audience, Audience::Only(b));
        match &out[0].msg {
            ServerMsg::FullState { you, world } => {
                assert_eq!(*you, b);
                assert_eq!(world.players.len(), 2);
                assert!(!world.started);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(out[1].audience, Audience::AllExcept(b));
        assert!(out[1].audience.includes(a));
        assert!(matches!(&out[1].msg, ServerMsg::PlayerJoined { player } if player.id == b));
    }

    #[test]
    fn full_room_rejects_joiner() {
        let mut room = Room::new(
            "test",
            GameConfig {
                max_players: 1,
                ..config()
            },
        );
        join(&mut room);
        room.take_outbox();

        let late = Uuid::new_v4();
        let err = room.connect(late, 0).unwrap_err();
        assert_eq!(err, JoinError::RoomFull { max: 1 });
        assert_eq!(err.code(), "room_full");
        // Nothing is broadcast; the caller tells the refused connection
        assert!(room.take_outbox().is_empty());
        assert_eq!(room.player_count(), 1);
    }

    #[test]
    fn nobody_ready_means_no_match() {
        let mut room = Room::new("test", config());
        join(&mut room);
        join(&mut room);
        room.take_outbox();

        for _ in 0..600 {
            room.tick_high();
            room.tick_low();
        }
        assert!(!room.is_started());
        assert!(room.take_outbox().is_empty());
    }

    #[test]
    fn match_starts_once_everyone_is_ready() {
        let mut room = Room::new("test", config());
        let a = join(&mut room);
        let b = join(&mut room);

        send(&mut room, a, ClientMsg::Ready);
        assert!(!room.is_started());

        send(&mut room, b, ClientMsg::Ready);
        assert!(room.is_started());

        let out = room.take_outbox();
        assert!(has(&out, |m| matches!(m, ServerMsg::MatchStart { required_deliveries: 10, .. })));
        assert_eq!(room.world.targets.len(), 10);
        assert_eq!(room.world.vehicles.len(), config().vehicle_count);
    }

    #[test]
    fn leaving_twice_is_the_same_as_leaving_once() {
        let mut room = Room::new("test", config());
        let _a = join(&mut room);
        let b = join(&mut room);
        room.take_outbox();

        send(&mut room, b, ClientMsg::Leave);
        let first = room.snapshot();
        assert_eq!(room.take_outbox().len(), 1);

        send(&mut room, b, ClientMsg::Leave);
        room.disconnect(b);
        assert_eq!(room.snapshot(), first);
        assert!(room.take_outbox().is_empty());
    }

    #[test]
    fn leaver_can_unblock_the_start() {
        let mut room = Room::new("test", config());
        let a = join(&mut room);
        let b = join(&mut room);
        send(&mut room, a, ClientMsg::Ready);
        room.disconnect(b);
        assert!(room.is_started());
    }

    #[test]
    fn last_player_leaving_resets_the_world() {
        let (mut room, ids) = started_room(config(), 1);
        room.disconnect(ids[0]);
        assert!(!room.is_started());
        assert_eq!(room.player_count(), 0);
        assert_eq!(room.world.targets.len(), 0);
    }

    #[test]
    fn ping_is_answered_only_to_sender() {
        let mut room = Room::new("test", config());
        let a = join(&mut room);
        join(&mut room);
        room.take_outbox();

        send(&mut room, a, ClientMsg::Ping { t: 1_700_000_000_123.25 });
        let out = room.take_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].audience, Audience::Only(a));
        assert_eq!(out[0].msg, ServerMsg::Pong { t: 1_700_000_000_123.25 });
    }

    #[test]
    fn intents_from_unknown_connections_are_dropped() {
        let mut room = Room::new("test", config());
        join(&mut room);
        room.take_outbox();

        let stranger = Uuid::new_v4();
        send(
            &mut room,
            stranger,
            ClientMsg::Move {
                x: 10.0,
                y: 10.0,
                heading: 0.0,
                vx: 0.0,
                vy: 0.0,
                charging: false,
                charge: 0.0,
            },
        );
        send(&mut room, stranger, ClientMsg::Ready);
        assert!(room.take_outbox().is_empty());
        assert!(!room.is_started());
    }

    #[test]
    fn moves_are_relayed_to_everyone_but_the_sender() {
        let mut room = Room::new("test", config());
        let a = join(&mut room);
        join(&mut room);
        room.take_outbox();

        let start = room.world.players[&a].position;
        send(
            &mut room,
            a,
            ClientMsg::Move {
                x: start.x + 2.0,
                y: start.y,
                heading: 0.5,
                vx: 2.0,
                vy: 0.0,
                charging: false,
                charge: 0.0,
            },
        );
        let out = room.take_outbox();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].audience, Audience::AllExcept(a));
        assert!(matches!(out[0].msg, ServerMsg::PlayerUpdate { id, heading, .. } if id == a && heading == 0.5));
        assert_eq!(room.world.players[&a].last_move_at, Some(1_000));
    }

    #[test]
    fn renames_are_trimmed_and_broadcast() {
        let mut room = Room::new("test", config());
        let a = join(&mut room);
        room.take_outbox();

        send(&mut room, a, ClientMsg::Name { name: "   ".to_string() });
        assert!(room.take_outbox().is_empty());

        send(&mut room, a, ClientMsg::Name { name: "  Zed ".to_string() });
        let out = room.take_outbox();
        assert!(has(&out, |m| matches!(m, ServerMsg::PlayerRenamed { name, .. } if name == "Zed")));
    }

    #[test]
    fn throws_only_count_during_a_match() {
        let mut room = Room::new("test", config());
        let a = join(&mut room);
        room.take_outbox();

        let throw = ClientMsg::Throw {
            x: 100.0,
            y: 100.0,
            vx: 3.0,
            vy: 0.0,
        };
        send(&mut room, a, throw.clone());
        assert!(room.world.projectiles.is_empty());
        assert!(room.take_outbox().is_empty());

        send(&mut room, a, ClientMsg::Ready);
        room.take_outbox();
        send(&mut room, a, throw);
        assert_eq!(room.world.projectiles.len(), 1);
        assert_eq!(room.world.players[&a].throws_remaining, config().throws_per_player - 1);
        let out = room.take_outbox();
        assert!(matches!(out[0].msg, ServerMsg::Throw { owner, .. } if owner == a));
        assert_eq!(out[0].audience, Audience::All);
    }

    #[test]
    fn delivery_scores_refunds_and_advances_the_target() {
        let (mut room, ids) = started_room(config(), 1);
        let a = ids[0];
        drop_on_target(&mut room, a);

        room.tick_high();

        let player = &room.world.players[&a];
        assert_eq!(player.score, 100);
        assert_eq!(player.deliveries, 1);
        assert_eq!(player.throws_remaining, config().throws_per_player + 1);
        assert_eq!(room.world.targets.active_index(), Some(1));
        assert_eq!(room.world.deliveries_completed, 1);

        let out = room.take_outbox();
        assert!(has(&out, |m| matches!(
            m,
            ServerMsg::DeliveryMade { target_index: 0, score: 100, next_target: Some(1), .. }
        )));
        // Final empty batch once the parcel is gone
        assert!(has(&out, |m| matches!(m, ServerMsg::ProjectileBatch { projectiles } if projectiles.is_empty())));

        room.tick_high();
        let out = room.take_outbox();
        assert!(!has(&out, |m| matches!(m, ServerMsg::ProjectileBatch { .. })));
    }

    #[derive(Debug, Clone, Copy)]
    enum Landing {
        OnTarget,
        Elsewhere,
        TwoOnTarget,
    }

    fn any_landing() -> impl Strategy<Value = Landing> {
        prop_oneof![Just(Landing::OnTarget), Just(Landing::Elsewhere), Just(Landing::TwoOnTarget)]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn exactly_one_target_active_until_all_are_delivered(
            seed in any::<u64>(),
            landings in proptest::collection::vec(any_landing(), 1..40),
        ) {
            let mut room = Room::new("test", GameConfig { world_seed: Some(seed), ..config() });
            let a = join(&mut room);
            send(&mut room, a, ClientMsg::Ready);
            prop_assume!(room.is_started());
            room.world.vehicles.clear();

            for step in landings {
                let Some(active) = room.world.targets.active_index() else { break };
                match step {
                    Landing::OnTarget => drop_on_target(&mut room, a),
                    Landing::TwoOnTarget => {
                        drop_on_target(&mut room, a);
                        drop_on_target(&mut room, a);
                    }
                    Landing::Elsewhere => {
                        let other = (active + 1) % room.world.targets.len();
                        let position = room.world.targets.as_slice()[other].position;
                        room.world.projectiles.push(Projectile::new(901, a, position, Vec2::ZERO));
                    }
                }
                room.tick_high();

                let active = room.world.targets.as_slice().iter().filter(|t| t.active).count();
                if room.world.deliveries_completed < room.world.targets.len() {
                    prop_assert_eq!(active, 1);
                } else {
                    prop_assert_eq!(active, 0);
                    prop_assert!(room.is_over());
                }
            }
        }
    }

    #[test]
    fn delivering_every_target_leaves_none_active() {
        let (mut room, ids) = started_room(config(), 1);
        for _ in 0..config().required_deliveries {
            drop_on_target(&mut room, ids[0]);
            room.tick_high();
        }

        assert!(room.world.targets.as_slice().iter().all(|t| !t.active));
        assert!(room.is_over());
    }

    #[test]
    fn misses_cost_points_but_never_go_negative() {
        let (mut room, ids) = started_room(config(), 1);
        let a = ids[0];
        let elsewhere = room.world.targets.as_slice()[1].position;
        room.world.players.get_mut(&a).unwrap().score = 3;
        room.world
            .projectiles
            .push(Projectile::new(1, a, elsewhere, Vec2::ZERO));

        room.tick_high();

        assert_eq!(room.world.players[&a].score, 0);
        let out = room.take_outbox();
        assert!(has(&out, |m| matches!(
            m,
            ServerMsg::DeliveryFailed { reason: FailureReason::Missed, penalty: MISS_PENALTY, .. }
        )));
    }

    #[test]
    fn parcels_leaving_the_map_fail_out_of_bounds() {
        let (mut room, ids) = started_room(config(), 1);
        room.world
            .projectiles
            .push(Projectile::new(1, ids[0], Vec2::new(1.0, 1.0), Vec2::new(-10.0, -10.0)));

        room.tick_high();

        assert!(room.world.projectiles.is_empty());
        let out = room.take_outbox();
        assert!(has(&out, |m| matches!(
            m,
            ServerMsg::DeliveryFailed { reason: FailureReason::OutOfBounds, .. }
        )));
    }

    #[test]
    fn victory_pays_a_time_bonus_to_everyone() {
        let (mut room, ids) = started_room(
            GameConfig {
                required_deliveries: 1,
                ..config()
            },
            2,
        );
        drop_on_target(&mut room, ids[0]);

        room.tick_high();
        assert!(room.is_over());

        // 180 s minus one tick leaves 179 whole seconds
        let bonus = 179 * TIME_BONUS_PER_SECOND;
        assert_eq!(room.world.players[&ids[0]].score, 100 + bonus);
        assert_eq!(room.world.players[&ids[1]].score, bonus);

        let out = room.take_outbox();
        match &out.last().unwrap().msg {
            ServerMsg::MatchOver {
                outcome,
                time_bonus,
                results,
            } => {
                assert_eq!(*outcome, MatchOutcome::Victory);
                assert_eq!(*time_bonus, bonus);
                assert_eq!(results[0].id, ids[0]);
            }
            other => panic!("unexpected {other:?}"),
        }

        // Decided matches stay frozen
        let tick = room.tick;
        room.tick_high();
        assert_eq!(room.tick, tick);
        assert!(room.take_outbox().is_empty());
    }

    #[test]
    fn huge_clock_caps_the_victory_bonus() {
        let (mut room, ids) = started_room(
            GameConfig {
                required_deliveries: 1,
                match_duration_secs: 1.0e12,
                ..config()
            },
            1,
        );
        room.world.players.get_mut(&ids[0]).unwrap().score = 7;
        room.world.deliveries_completed = 1;

        room.tick_high();

        assert!(room.is_over());
        assert_eq!(room.world.players[&ids[0]].score, u32::MAX);
        let out = room.take_outbox();
        assert!(has(&out, |m| matches!(
            m,
            ServerMsg::MatchOver { outcome: MatchOutcome::Victory, time_bonus: u32::MAX, .. }
        )));
    }

    #[test]
    fn victory_wins_over_other_end_conditions() {
        let (mut room, ids) = started_room(
            GameConfig {
                required_deliveries: 1,
                ..config()
            },
            1,
        );
        room.world.deliveries_completed = 1;
        room.world.time_remaining = 0.0;
        room.world.players.get_mut(&ids[0]).unwrap().throws_remaining = 0;

        room.tick_high();

        let out = room.take_outbox();
        assert!(has(&out, |m| matches!(
            m,
            ServerMsg::MatchOver { outcome: MatchOutcome::Victory, time_bonus: 0, .. }
        )));
    }

    #[test]
    fn clock_running_out_ends_the_match() {
        let (mut room, _) = started_room(
            GameConfig {
                match_duration_secs: 0.05,
                ..config()
            },
            1,
        );
        for _ in 0..10 {
            room.tick_high();
        }
        assert!(room.is_over());
        let out = room.take_outbox();
        assert!(has(&out, |m| matches!(m, ServerMsg::MatchOver { outcome: MatchOutcome::TimeUp, .. })));
    }

    #[test]
    fn no_throws_and_nothing_in_flight_is_a_stalemate() {
        let (mut room, _) = started_room(
            GameConfig {
                throws_per_player: 0,
                ..config()
            },
            2,
        );
        room.tick_high();
        let out = room.take_outbox();
        assert!(has(&out, |m| matches!(
            m,
            ServerMsg::MatchOver { outcome: MatchOutcome::OutOfThrows, .. }
        )));
    }

    #[test]
    fn parcel_in_flight_postpones_the_stalemate() {
        let (mut room, ids) = started_room(
            GameConfig {
                throws_per_player: 0,
                ..config()
            },
            1,
        );
        let center = room.world.targets.as_slice()[1].position;
        room.world
            .projectiles
            .push(Projectile::new(1, ids[0], center, Vec2::new(4.0, 0.0)));

        room.tick_high();
        assert!(!room.is_over());
    }

    #[test]
    fn snapshots_follow_the_snapshot_rate() {
        let (mut room, _) = started_room(config(), 1);
        let mut snapshots = 0;
        for _ in 0..SIMULATION_TPS {
            room.tick_high();
            snapshots += room
                .take_outbox()
                .iter()
                .filter(|o| matches!(o.msg, ServerMsg::Snapshot { .. }))
                .count();
        }
        // The forced one on the first tick, then every third tick
        let expected = SNAPSHOT_TPS as usize;
        assert!(snapshots == expected || snapshots == expected + 1);
    }

    #[test]
    fn vehicles_broadcast_on_the_low_tick() {
        let mut room = Room::new("test", config());
        let a = join(&mut room);
        send(&mut room, a, ClientMsg::Ready);
        room.take_outbox();

        room.tick_low();
        let out = room.take_outbox();
        assert!(has(&out, |m| matches!(
            m,
            ServerMsg::VehicleBatch { vehicles } if vehicles.len() == config().vehicle_count
        )));
    }

    #[test]
    fn reset_returns_everyone_to_the_lobby() {
        let (mut room, ids) = started_room(config(), 2);
        room.tick_high();
        room.take_outbox();

        send(&mut room, ids[0], ClientMsg::Reset);

        assert!(!room.is_started());
        assert!(room.world.players.values().all(|p| !p.ready));
        assert!(room.world.players.values().all(|p| p.score == 0));
        let out = room.take_outbox();
        let full_states = out
            .iter()
            .filter(|o| matches!(o.msg, ServerMsg::FullState { .. }))
            .count();
        assert_eq!(full_states, 2);
    }

    #[test]
    fn impossible_target_count_keeps_the_room_in_the_lobby() {
        let mut room = Room::new(
            "test",
            GameConfig {
                required_deliveries: 5_000,
                ..config()
            },
        );
        let a = join(&mut room);
        send(&mut room, a, ClientMsg::Ready);

        assert!(!room.is_started());
        assert!(!room.world.players[&a].ready);
        let out = room.take_outbox();
        assert!(has(&out, |m| matches!(m, ServerMsg::Error { code, .. } if code == "generation_failed")));
    }

    #[test]
    fn target_radius_matches_world_constant() {
        let (room, _) = started_room(config(), 1);
        assert!(room
            .world
            .targets
            .as_slice()
            .iter()
            .all(|t| t.radius == TARGET_RADIUS));
    }
}
