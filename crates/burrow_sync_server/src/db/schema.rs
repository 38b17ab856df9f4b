use rusqlite::Connection;

/// SQL schema for users, auth tokens, and vault memberships
const SCHEMA: &str = r#"
-- Users table (identity is minted by the external auth service; the sync
-- core only consumes id/name/admin flag)
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    is_server_admin INTEGER NOT NULL DEFAULT 0
);

-- Auth tokens (minted externally; the server only validates them)
CREATE TABLE IF NOT EXISTS auth_tokens (
    token TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    expires_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_auth_tokens_user ON auth_tokens(user_id);

-- Vault memberships
CREATE TABLE IF NOT EXISTS vault_members (
    vault_id TEXT NOT NULL,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    added_by INTEGER,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (vault_id, user_id)
);

CREATE INDEX IF NOT EXISTS idx_vault_members_user ON vault_members(user_id);
CREATE INDEX IF NOT EXISTS idx_vault_members_vault ON vault_members(vault_id);
"#;

/// Initialize the database schema.
///
/// Foreign keys must be enabled per connection; membership cascade on user
/// deletion depends on it.
pub fn init_database(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}
