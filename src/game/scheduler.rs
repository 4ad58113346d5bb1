//! Room tasks and the registry that finds them

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::GameConfig;
use crate::util::time::{simulation_period, vehicle_period};

use super::room::{JoinError, Room};
use super::{ConnectionId, Outbound, PlayerInput};

const COMMAND_QUEUE: usize = 1024;
const OUTBOUND_QUEUE: usize = 1024;

/// Work queued for a room task
#[derive(Debug)]
pub enum RoomCommand {
    Connect {
        conn_id: ConnectionId,
        at: u64,
        reply: oneshot::Sender<Result<(), JoinError>>,
    },
    Input(PlayerInput),
}

/// The room task stopped and no longer takes commands
#[derive(Debug, thiserror::Error)]
#[error("Room {0} is no longer running")]
pub struct SendError(pub String);

/// Why a connection did not end up in a room
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    Refused(#[from] JoinError),

    #[error(transparent)]
    Stopped(#[from] SendError),
}

/// Cheap, cloneable way to talk to a running room
#[derive(Clone)]
pub struct RoomHandle {
    pub id: String,
    pub command_tx: mpsc::Sender<RoomCommand>,
    pub outbound_tx: broadcast::Sender<Outbound>,
    pub player_count: Arc<AtomicUsize>,
}

impl RoomHandle {
    pub fn player_count(&self) -> usize {
        self.player_count.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.outbound_tx.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.command_tx.is_closed()
    }

    pub async fn send(&self, command: RoomCommand) -> Result<(), SendError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SendError(self.id.clone()))
    }

    /// Add a connection and wait for the room's answer.
    ///
    /// The receiver is subscribed before the request goes out, so it sees
    /// the full state the room sends on a successful join.
    pub async fn connect(
        &self,
        conn_id: ConnectionId,
        at: u64,
    ) -> Result<broadcast::Receiver<Outbound>, ConnectError> {
        let outbound_rx = self.subscribe();
        let (reply, answer) = oneshot::channel();
        self.send(RoomCommand::Connect { conn_id, at, reply }).await?;
        // A dropped reply means the task stopped with the request still queued
        answer.await.map_err(|_| SendError(self.id.clone()))??;
        Ok(outbound_rx)
    }
}

/// Registry of all rooms, keyed by name
pub struct RoomRegistry {
    rooms: Arc<DashMap<String, RoomHandle>>,
    config: GameConfig,
}

impl RoomRegistry {
    pub fn new(config: GameConfig) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Handle for `name`, starting the room task on first use or after the
    /// previous task for that name stopped
    pub fn get_or_spawn(&self, name: &str) -> RoomHandle {
        match self.rooms.entry(name.to_string()) {
            Entry::Occupied(entry) if !entry.get().is_stopped() => entry.get().clone(),
            Entry::Occupied(mut entry) => {
                let handle = self.spawn(name);
                entry.insert(handle.clone());
                handle
            }
            Entry::Vacant(entry) => entry.insert(self.spawn(name)).value().clone(),
        }
    }

    fn spawn(&self, name: &str) -> RoomHandle {
        let room = Room::new(name, self.config.clone());
        let (task, handle) = RoomTask::new(room, Duration::from_secs(self.config.room_idle_secs));
        let rooms = Arc::clone(&self.rooms);
        let key = name.to_string();
        tokio::spawn(async move {
            task.run().await;
            // Only drop the entry if it still points at the task that just ended
            rooms.remove_if(&key, |_, handle| handle.is_stopped());
        });
        handle
    }

    /// Join `name`, respawning the room once if its task stopped under us
    pub async fn join(
        &self,
        name: &str,
        conn_id: ConnectionId,
        at: u64,
    ) -> Result<(RoomHandle, broadcast::Receiver<Outbound>), ConnectError> {
        let room = self.get_or_spawn(name);
        match room.connect(conn_id, at).await {
            Ok(outbound_rx) => Ok((room, outbound_rx)),
            Err(ConnectError::Stopped(_)) => {
                debug!(room = %name, conn_id = %conn_id, "Room stopped while joining, retrying");
                let room = self.get_or_spawn(name);
                let outbound_rx = room.connect(conn_id, at).await?;
                Ok((room, outbound_rx))
            }
            Err(err) => Err(err),
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn total_players(&self) -> usize {
        self.rooms.iter().map(|r| r.value().player_count()).sum()
    }
}

/// Owns a [`Room`] and is the only thing that touches it
pub struct RoomTask {
    room: Room,
    command_rx: mpsc::Receiver<RoomCommand>,
    outbound_tx: broadcast::Sender<Outbound>,
    player_count: Arc<AtomicUsize>,
    idle_timeout: Duration,
    empty_since: Option<Instant>,
}

impl RoomTask {
    pub fn new(room: Room, idle_timeout: Duration) -> (Self, RoomHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (outbound_tx, _) = broadcast::channel(OUTBOUND_QUEUE);
        let player_count = Arc::new(AtomicUsize::new(0));

        let handle = RoomHandle {
            id: room.id().to_string(),
            command_tx,
            outbound_tx: outbound_tx.clone(),
            player_count: player_count.clone(),
        };
        let task = Self {
            room,
            command_rx,
            outbound_tx,
            player_count,
            idle_timeout,
            empty_since: None,
        };
        (task, handle)
    }

    /// Serve commands and drive both tick rates until the room has been
    /// empty for the idle timeout or every handle is gone
    pub async fn run(mut self) {
        info!(room = %self.room.id(), "Room task started");

        let mut high = interval(simulation_period());
        high.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut low = interval(vehicle_period());
        low.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.empty_since = Some(Instant::now());

        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
                _ = high.tick() => self.room.tick_high(),
                _ = low.tick() => {
                    self.room.tick_low();
                    if self.idle_expired() {
                        info!(room = %self.room.id(), "Room idle, shutting down");
                        break;
                    }
                }
            }
            self.flush();
        }

        info!(room = %self.room.id(), "Room task stopped");
    }

    fn apply(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Connect { conn_id, at, reply } => {
                let result = self.room.connect(conn_id, at);
                if let Err(err) = &result {
                    debug!(room = %self.room.id(), conn_id = %conn_id, error = %err, "Connect refused");
                }
                self.track_occupancy();
                // Nobody is waiting for the answer, so the join must not stick
                if let Err(Ok(())) = reply.send(result) {
                    self.room.disconnect(conn_id);
                }
            }
            RoomCommand::Input(input) => self.room.handle_input(input),
        }
        self.track_occupancy();
    }

    fn track_occupancy(&mut self) {
        let players = self.room.player_count();
        self.player_count.store(players, Ordering::Relaxed);
        if players > 0 {
            self.empty_since = None;
        } else if self.empty_since.is_none() {
            self.empty_since = Some(Instant::now());
        }
    }

    fn idle_expired(&self) -> bool {
        self.empty_since
            .is_some_and(|since| since.elapsed() >= self.idle_timeout)
    }

    fn flush(&mut self) {
        for outbound in self.room.take_outbox() {
            // No subscribers is fine; the room keeps running empty
            let _ = self.outbound_tx.send(outbound);
        }
    }
}
