//! Per-connection session state.
//!
//! Each WebSocket connection carries one [`ClientSession`]; once joined to a
//! vault, a [`ClientHandle`] lives in that vault's room and is the address
//! broadcasts are delivered to. Sends go through an unbounded mpsc channel
//! drained by the connection's socket loop, which keeps delivery FIFO per
//! recipient.

use std::collections::HashSet;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::db::Role;
use crate::protocol::ServerEvent;

/// Outbound channel to one connection.
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

/// A connection's membership in a vault room.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub conn_id: Uuid,
    pub user_id: i64,
    pub user_name: String,
    pub is_server_admin: bool,
    /// Role cached at join time; refreshed before every mutating message.
    pub role: Role,
    /// Awareness client ids this connection has spoken for, used to craft
    /// removal updates on departure.
    pub awareness_ids: HashSet<u64>,
    sender: EventSender,
}

impl ClientHandle {
    pub fn new(
        conn_id: Uuid,
        user: &AuthUser,
        role: Role,
        sender: EventSender,
    ) -> Self {
        Self {
            conn_id,
            user_id: user.id,
            user_name: user.name.clone(),
            is_server_admin: user.is_server_admin,
            role,
            awareness_ids: HashSet::new(),
            sender,
        }
    }

    /// Enqueue an event; a closed channel means the connection is already
    /// gone and the event is dropped.
    pub fn send(&self, event: ServerEvent) {
        let _ = self.sender.send(event);
    }
}

/// State machine of one connection: NEW → AUTHED → JOINED → GONE.
#[derive(Debug)]
pub struct ClientSession {
    pub conn_id: Uuid,
    pub user: Option<AuthUser>,
    /// Vault id and cached role while joined.
    pub joined: Option<(String, Role)>,
    sender: EventSender,
}

impl ClientSession {
    pub fn new(sender: EventSender) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            user: None,
            joined: None,
            sender,
        }
    }

    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    pub fn send(&self, event: ServerEvent) {
        let _ = self.sender.send(event);
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_progression() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = ClientSession::new(tx);
        assert!(!session.is_authenticated());

        session.user = Some(AuthUser {
            id: 1,
            name: "ada".into(),
            is_server_admin: false,
        });
        assert!(session.is_authenticated());

        session.send(ServerEvent::Pong);
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::Pong)));
    }

    #[test]
    fn test_handle_send_after_disconnect_is_silent() {
        let (tx, rx) = mpsc::unbounded_channel();
        let user = AuthUser {
            id: 1,
            name: "ada".into(),
            is_server_admin: false,
        };
        let handle = ClientHandle::new(Uuid::new_v4(), &user, Role::Editor, tx);
        drop(rx);
        handle.send(ServerEvent::Pong);
    }
}
