//! Game simulation modules

pub mod player;
pub mod projectile;
pub mod room;
pub mod router;
pub mod scheduler;
pub mod snapshot;
pub mod validation;
pub mod world;

pub use scheduler::{RoomHandle, RoomRegistry};

use crate::ws::protocol::{ClientMsg, ServerMsg};
use uuid::Uuid;

/// Identifies one live connection; valid only while it stays connected
pub type ConnectionId = Uuid;

/// Client intent received from WebSocket
#[derive(Debug, Clone)]
pub struct PlayerInput {
    pub conn_id: ConnectionId,
    pub msg: ClientMsg,
    pub received_at: u64,
}

/// Which connections an outbound message is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    All,
    AllExcept(ConnectionId),
    Only(ConnectionId),
}

impl Audience {
    pub fn includes(&self, conn_id: ConnectionId) -> bool {
        match self {
            Self::All => true,
            Self::AllExcept(excluded) => *excluded != conn_id,
            Self::Only(target) => *target == conn_id,
        }
    }
}

/// Server message addressed to part of a room
#[derive(Debug, Clone)]
pub struct Outbound {
    pub audience: Audience,
    pub msg: ServerMsg,
}

impl Outbound {
    pub fn all(msg: ServerMsg) -> Self {
        Self {
            audience: Audience::All,
            msg,
        }
    }

    pub fn except(conn_id: ConnectionId, msg: ServerMsg) -> Self {
        Self {
            audience: Audience::AllExcept(conn_id),
            msg,
        }
    }

    pub fn only(conn_id: ConnectionId, msg: ServerMsg) -> Self {
        Self {
            audience: Audience::Only(conn_id),
            msg,
        }
    }
}
