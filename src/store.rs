//! SQLite-backed relay store.
//!
//! Tables:
//! - `users`: name (unique), password_hash, salt, access tier, key set
//! - `sessions`: token_hash, user_id, created_at
//! - `devices`: caller-supplied id, owner, access tier, key set
//! - `macros`: endpoint (unique routing key), device, access tier, key set, params
//!
//! ## Design Decisions
//! - Sessions use opaque random tokens, SHA-256 hashed for storage; the
//!   plaintext token is revealed exactly once at login/signup.
//! - Password hashing is iterated SHA-256 (100k rounds) + per-user salt with
//!   constant-time comparison. Hashing always happens BEFORE the connection
//!   lock is taken so the slow part never holds up a transaction.
//! - Signup and login each bundle their writes into a single transaction:
//!   the user row and the initial session row land together or not at all,
//!   and a login re-checks the user row inside its transaction so a session
//!   can never be issued for a concurrently deleted account.
//! - Key sets are persisted as JSON arrays; `access` as its tier string.

use crate::access::AccessTier;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;

/// Token byte length before hex encoding (32 bytes = 64 hex chars).
const TOKEN_BYTES: usize = 32;

/// Salt byte length for password hashing.
const SALT_BYTES: usize = 16;

/// Number of SHA-256 iterations for password stretching.
const HASH_ITERATIONS: u32 = 100_000;

/// A registered user. Carries no password material: the hash and salt stay
/// inside the store and are never part of any read path.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub access: AccessTier,
    pub keys: HashSet<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A device owned by a user, exposing zero or more macros.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub access: AccessTier,
    pub keys: HashSet<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A named remote trigger bound to a device.
#[derive(Debug, Clone, Serialize)]
pub struct Macro {
    pub endpoint: String,
    pub device_id: String,
    pub access: AccessTier,
    pub keys: HashSet<String>,
    pub params: Option<serde_json::Value>,
}

/// SQLite-backed store for users, sessions, devices, and macros.
pub struct RelayStore {
    conn: Mutex<rusqlite::Connection>,
}

const USER_COLUMNS: &str = "id, name, access, keys, created_at, updated_at";
const DEVICE_COLUMNS: &str = "id, user_id, name, access, keys, created_at, updated_at";
const MACRO_COLUMNS: &str = "endpoint, device_id, access, keys, params";

impl RelayStore {
    /// Open (or create) the relay database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path)
            .map_err(|e| Error::Internal(e.into()))?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;

        Self::init_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store (for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| Error::Internal(e.into()))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::init_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_tables(conn: &rusqlite::Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                salt TEXT NOT NULL,
                access TEXT NOT NULL DEFAULT 'SHARED',
                keys TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                token_hash TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);

            CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                access TEXT NOT NULL,
                keys TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_devices_user ON devices(user_id);

            CREATE TABLE IF NOT EXISTS macros (
                endpoint TEXT PRIMARY KEY,
                device_id TEXT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
                access TEXT NOT NULL,
                keys TEXT NOT NULL DEFAULT '[]',
                params TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_macros_device ON macros(device_id);",
        )?;
        Ok(())
    }

    // ── Authentication ──────────────────────────────────────────────

    /// Create a new user and its initial session in one transaction.
    /// Returns the user and the plaintext session token (revealed only once).
    pub fn sign_up(&self, name: &str, password: &str) -> Result<(User, String)> {
        let name = name.trim();
        if name.is_empty() || password.is_empty() {
            return Err(Error::validation("Missing username or password"));
        }
        if name.len() > 64 {
            return Err(Error::validation("Username too long (max 64 characters)"));
        }

        // Hash before taking the connection lock; this is the slow part.
        let user_id = uuid::Uuid::new_v4().to_string();
        let salt = generate_salt();
        let password_hash = hash_password(password, &salt);
        let token = generate_token();
        let token_hash = hash_token(&token);
        let now = epoch_secs();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT INTO users (id, name, password_hash, salt, access, keys, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                user_id,
                name,
                password_hash,
                salt,
                AccessTier::Shared.as_str(),
                "[]",
                now,
                now
            ],
        );
        if let Err(err) = inserted {
            return Err(map_constraint(
                err,
                format!("Username '{name}' is already taken"),
            ));
        }
        tx.execute(
            "INSERT INTO sessions (token_hash, user_id, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![token_hash, user_id, now],
        )?;
        tx.commit()?;

        let user = User {
            id: user_id,
            name: name.to_string(),
            access: AccessTier::Shared,
            keys: HashSet::new(),
            created_at: now,
            updated_at: now,
        };
        Ok((user, token))
    }

    /// Authenticate by name + password and issue a fresh session.
    ///
    /// `NotFound` for an unknown name, `Unauthorized` for a bad password.
    /// The hash comparison runs outside any lock; the session insert
    /// re-checks the user row inside its transaction.
    pub fn login(&self, name: &str, password: &str) -> Result<(User, String)> {
        let name = name.trim();
        let credentials = {
            let conn = self.conn.lock();
            let row: std::result::Result<(String, String, String), _> = conn.query_row(
                "SELECT id, password_hash, salt FROM users WHERE name = ?1",
                rusqlite::params![name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            );
            match row {
                Ok(found) => Some(found),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(e) => return Err(e.into()),
            }
        };

        let Some((user_id, stored_hash, salt)) = credentials else {
            // Perform dummy hash to prevent timing side-channel
            let _ = hash_password(password, "0000000000000000");
            return Err(Error::not_found("User not found"));
        };

        let attempt_hash = hash_password(password, &salt);
        if !constant_time_eq(stored_hash.as_bytes(), attempt_hash.as_bytes()) {
            return Err(Error::unauthorized("Invalid password"));
        }

        let token = generate_token();
        let token_hash = hash_token(&token);
        let now = epoch_secs();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let user = match tx.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            rusqlite::params![user_id],
            map_user,
        ) {
            Ok(user) => user,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                return Err(Error::not_found("User not found"));
            }
            Err(e) => return Err(e.into()),
        };
        tx.execute(
            "INSERT INTO sessions (token_hash, user_id, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![token_hash, user_id, now],
        )?;
        tx.commit()?;

        Ok((user, token))
    }

    /// Delete the session matching `token`. Deleting an unknown token is a
    /// no-op; the returned flag only reports whether a row was removed.
    pub fn logout(&self, token: &str) -> Result<bool> {
        let token_hash = hash_token(token);
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE token_hash = ?1",
            rusqlite::params![token_hash],
        )?;
        Ok(deleted > 0)
    }

    /// Resolve a session token to its owning user with a single point lookup.
    pub fn validate_session(&self, token: &str) -> Option<User> {
        let token_hash = hash_token(token);
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT u.id, u.name, u.access, u.keys, u.created_at, u.updated_at
             FROM sessions s JOIN users u ON s.user_id = u.id
             WHERE s.token_hash = ?1",
            rusqlite::params![token_hash],
            map_user,
        )
        .ok()
    }

    /// Replace a user's bearer-key set.
    pub fn set_user_keys(&self, user_id: &str, keys: &HashSet<String>) -> Result<bool> {
        let now = epoch_secs();
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE users SET keys = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![keys_to_json(keys), now, user_id],
        )?;
        Ok(updated > 0)
    }

    /// Remove a user. Sessions, devices, and macros cascade away with it.
    pub fn delete_user(&self, user_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM users WHERE id = ?1",
            rusqlite::params![user_id],
        )?;
        Ok(deleted > 0)
    }

    // ── Devices ─────────────────────────────────────────────────────

    /// Register a device under a user. The id is caller-supplied and unique
    /// across the relay (it is the routing key toward the trigger service).
    pub fn create_device(
        &self,
        user_id: &str,
        id: &str,
        name: &str,
        access: AccessTier,
        keys: &HashSet<String>,
    ) -> Result<Device> {
        let id = id.trim();
        if id.is_empty() || name.trim().is_empty() {
            return Err(Error::validation("Missing device id or name"));
        }
        check_keys_for_tier(access, keys)?;
        let now = epoch_secs();
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT INTO devices (id, user_id, name, access, keys, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                id,
                user_id,
                name.trim(),
                access.as_str(),
                keys_to_json(keys),
                now,
                now
            ],
        );
        if let Err(err) = inserted {
            return Err(map_constraint(
                err,
                format!("Device id '{id}' is already taken"),
            ));
        }
        Ok(Device {
            id: id.to_string(),
            user_id: user_id.to_string(),
            name: name.trim().to_string(),
            access,
            keys: keys.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    /// List all devices owned by a user.
    pub fn list_devices(&self, user_id: &str) -> Result<Vec<Device>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE user_id = ?1 ORDER BY created_at"
        ))?;
        let devices = stmt
            .query_map(rusqlite::params![user_id], map_device)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(devices)
    }

    /// Look up a device by id (any owner — used on the invoke path).
    pub fn device(&self, id: &str) -> Result<Option<Device>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1"),
            rusqlite::params![id],
            map_device,
        );
        match row {
            Ok(device) => Ok(Some(device)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a device owned by the given user. Its macros cascade away.
    pub fn delete_device(&self, user_id: &str, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM devices WHERE id = ?1 AND user_id = ?2",
            rusqlite::params![id, user_id],
        )?;
        Ok(deleted > 0)
    }

    // ── Macros ──────────────────────────────────────────────────────

    /// Register a macro under a device. The endpoint is the relay-wide
    /// routing key and doubles as the action name at the trigger service.
    pub fn create_macro(
        &self,
        device_id: &str,
        endpoint: &str,
        access: AccessTier,
        keys: &HashSet<String>,
        params: Option<&serde_json::Value>,
    ) -> Result<Macro> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Err(Error::validation("Missing macro endpoint"));
        }
        check_keys_for_tier(access, keys)?;
        let params_json = params.map(|p| p.to_string());
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT INTO macros (endpoint, device_id, access, keys, params)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                endpoint,
                device_id,
                access.as_str(),
                keys_to_json(keys),
                params_json
            ],
        );
        if let Err(err) = inserted {
            return Err(map_constraint(
                err,
                format!("Macro endpoint '{endpoint}' is already taken"),
            ));
        }
        Ok(Macro {
            endpoint: endpoint.to_string(),
            device_id: device_id.to_string(),
            access,
            keys: keys.clone(),
            params: params.cloned(),
        })
    }

    /// List all macros exposed by a device.
    pub fn list_macros(&self, device_id: &str) -> Result<Vec<Macro>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MACRO_COLUMNS} FROM macros WHERE device_id = ?1 ORDER BY endpoint"
        ))?;
        let macros = stmt
            .query_map(rusqlite::params![device_id], map_macro)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(macros)
    }

    /// Resolve a macro by its endpoint routing key.
    pub fn macro_by_endpoint(&self, endpoint: &str) -> Result<Option<Macro>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            &format!("SELECT {MACRO_COLUMNS} FROM macros WHERE endpoint = ?1"),
            rusqlite::params![endpoint],
            map_macro,
        );
        match row {
            Ok(m) => Ok(Some(m)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a macro, scoped to devices owned by the given user.
    pub fn delete_macro(&self, user_id: &str, endpoint: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM macros WHERE endpoint = ?1
             AND device_id IN (SELECT id FROM devices WHERE user_id = ?2)",
            rusqlite::params![endpoint, user_id],
        )?;
        Ok(deleted > 0)
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

fn map_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        access: AccessTier::from_str_lossy(&row.get::<_, String>(2)?),
        keys: keys_from_json(&row.get::<_, String>(3)?),
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn map_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        access: AccessTier::from_str_lossy(&row.get::<_, String>(3)?),
        keys: keys_from_json(&row.get::<_, String>(4)?),
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn map_macro(row: &rusqlite::Row<'_>) -> rusqlite::Result<Macro> {
    let params: Option<String> = row.get(4)?;
    Ok(Macro {
        endpoint: row.get(0)?,
        device_id: row.get(1)?,
        access: AccessTier::from_str_lossy(&row.get::<_, String>(2)?),
        keys: keys_from_json(&row.get::<_, String>(3)?),
        params: params.and_then(|raw| serde_json::from_str(&raw).ok()),
    })
}

fn keys_to_json(keys: &HashSet<String>) -> String {
    serde_json::to_string(keys).unwrap_or_else(|_| "[]".to_string())
}

fn keys_from_json(raw: &str) -> HashSet<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// Keys are only meaningful on RESTRICTED resources; a RESTRICTED resource
/// with an empty key set is allowed (unreachable until a key is provisioned).
fn check_keys_for_tier(access: AccessTier, keys: &HashSet<String>) -> Result<()> {
    if access != AccessTier::Restricted && !keys.is_empty() {
        return Err(Error::validation(
            "Keys may only be set on RESTRICTED resources",
        ));
    }
    Ok(())
}

/// Map a unique/foreign-key violation to `Conflict`; pass everything else on.
fn map_constraint(err: rusqlite::Error, message: String) -> Error {
    match err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Error::Conflict(message)
        }
        other => other.into(),
    }
}

// ── Cryptographic Helpers ───────────────────────────────────────────

/// Generate a random salt (hex-encoded).
fn generate_salt() -> String {
    let mut bytes = [0u8; SALT_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generate a random session token (hex-encoded).
fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Hash a password with salt using iterated SHA-256.
fn hash_password(password: &str, salt: &str) -> String {
    let mut hash = Sha256::new();
    hash.update(salt.as_bytes());
    hash.update(password.as_bytes());
    let mut result = hash.finalize();

    // Iterated hashing for key stretching
    for _ in 1..HASH_ITERATIONS {
        let mut h = Sha256::new();
        h.update(result);
        h.update(salt.as_bytes());
        result = h.finalize();
    }

    hex::encode(result)
}

/// Hash a session token (SHA-256, single pass — tokens are already high-entropy).
pub(crate) fn hash_token(token: &str) -> String {
    let mut h = Sha256::new();
    h.update(token.as_bytes());
    hex::encode(h.finalize())
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

// ── Tests ───────────────────────────────────────────────────────────
