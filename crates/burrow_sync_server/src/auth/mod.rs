//! Authentication seam.
//!
//! Token minting, hashing, and account management belong to the external
//! credential service. The sync core only needs to turn an opaque token into
//! an identity, so that is the whole interface: [`TokenVerifier`]. The
//! default implementation reads the `auth_tokens` table the external service
//! writes.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity attached to an authenticated connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: i64,
    pub name: String,
    pub is_server_admin: bool,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("database error: {0}")]
    Db(String),
}

/// Turns an opaque token into a user identity.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// `Ok(None)` means the token is unknown or expired.
    async fn verify(&self, token: &str) -> Result<Option<AuthUser>, AuthError>;
}

/// Token verifier backed by the shared sqlite database.
pub struct DbTokenVerifier {
    conn: Arc<Mutex<Connection>>,
}

impl DbTokenVerifier {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl TokenVerifier for DbTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Option<AuthUser>, AuthError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT u.id, u.name, u.is_server_admin, t.expires_at \
                 FROM auth_tokens t JOIN users u ON u.id = t.user_id \
                 WHERE t.token = ?",
                [token],
                |row| {
                    Ok((
                        AuthUser {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            is_server_admin: row.get::<_, i64>(2)? != 0,
                        },
                        row.get::<_, Option<i64>>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| AuthError::Db(e.to_string()))?;

        Ok(row.and_then(|(user, expires_at)| {
            match expires_at {
                Some(expiry) if expiry <= Utc::now().timestamp() => None,
                _ => Some(user),
            }
        }))
    }
}

/// Insert a token row (test and bootstrap helper; real tokens are minted by
/// the external credential service).
pub fn insert_token(
    conn: &Connection,
    token: &str,
    user_id: i64,
    expires_at: Option<i64>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO auth_tokens (token, user_id, expires_at) VALUES (?1, ?2, ?3)",
        params![token, user_id, expires_at],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_database;

    fn setup() -> Arc<Mutex<Connection>> {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();
        conn.execute(
            "INSERT INTO users (id, name, is_server_admin) VALUES (1, 'ada', 1)",
            [],
        )
        .unwrap();
        insert_token(&conn, "tok-live", 1, None).unwrap();
        insert_token(&conn, "tok-dead", 1, Some(1)).unwrap();
        Arc::new(Mutex::new(conn))
    }

    #[tokio::test]
    async fn test_valid_token() {
        let verifier = DbTokenVerifier::new(setup());
        let user = verifier.verify("tok-live").await.unwrap().unwrap();
        assert_eq!(user.id, 1);
        assert_eq!(user.name, "ada");
        assert!(user.is_server_admin);
    }

    #[tokio::test]
    async fn test_expired_token() {
        let verifier = DbTokenVerifier::new(setup());
        assert!(verifier.verify("tok-dead").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let verifier = DbTokenVerifier::new(setup());
        assert!(verifier.verify("nope").await.unwrap().is_none());
    }
}
