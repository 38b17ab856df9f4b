//! JSON socket events.
//!
//! Clients speak JSON text frames; binary sync payloads travel base64-framed
//! inside `sync-message` events. The payload's leading byte selects SYNC or
//! AWARENESS (see `burrow_core::crdt::wire`).

use serde::{Deserialize, Serialize};

use crate::auth::AuthUser;
use crate::db::Role;

/// Base64 framing for binary payloads inside JSON events.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Events sent by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    Authenticate {
        token: String,
    },
    JoinVault {
        #[serde(rename = "vaultId")]
        vault_id: String,
    },
    LeaveVault {
        #[serde(rename = "vaultId")]
        vault_id: String,
    },
    SyncMessage {
        #[serde(with = "b64")]
        payload: Vec<u8>,
    },
    Ping,
}

/// Events sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    Authenticated {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        user: Option<AuthUser>,
    },
    VaultJoined {
        #[serde(rename = "vaultId")]
        vault_id: String,
        role: Role,
    },
    VaultRole {
        #[serde(rename = "vaultId")]
        vault_id: String,
        role: Role,
    },
    FileList {
        files: Vec<String>,
    },
    SyncMessage {
        #[serde(with = "b64")]
        payload: Vec<u8>,
    },
    UserJoined {
        #[serde(rename = "userId")]
        user_id: i64,
        name: String,
        role: Role,
    },
    UserLeft {
        #[serde(rename = "userId")]
        user_id: i64,
        name: String,
    },
    PermissionDenied {
        action: String,
        #[serde(rename = "vaultId")]
        vault_id: String,
        message: String,
    },
    Error {
        message: String,
    },
    Pong,
}

impl ServerEvent {
    pub fn permission_denied(action: &str, vault_id: &str, message: impl Into<String>) -> Self {
        ServerEvent::PermissionDenied {
            action: action.to_string(),
            vault_id: vault_id.to_string(),
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_tags() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"type":"join-vault","vaultId":"v1"}"#).unwrap();
        assert!(matches!(event, ClientEvent::JoinVault { vault_id } if vault_id == "v1"));

        let event: ClientEvent = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(event, ClientEvent::Ping));
    }

    #[test]
    fn test_payload_base64_round_trip() {
        let event = ClientEvent::SyncMessage {
            payload: vec![0, 1, 254, 255],
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"sync-message""#));

        let back: ClientEvent = serde_json::from_str(&json).unwrap();
        match back {
            ClientEvent::SyncMessage { payload } => assert_eq!(payload, vec![0, 1, 254, 255]),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_server_event_shape() {
        let event = ServerEvent::VaultJoined {
            vault_id: "v1".into(),
            role: Role::Editor,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"vault-joined""#));
        assert!(json.contains(r#""role":"editor""#));
        assert!(json.contains(r#""vaultId":"v1""#));
    }

    #[test]
    fn test_permission_denied_shape() {
        let event = ServerEvent::permission_denied("write", "v2", "read-only role");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"permission-denied""#));
        assert!(json.contains(r#""action":"write""#));
    }
}
