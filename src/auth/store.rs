use std::path::Path;
use std::str::FromStr;

use chrono::{Duration, Utc};
use rand::RngCore;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use uuid::Uuid;

use super::cookie::session_id_from_header;
use super::password::{hash_secret, verify_secret};
use super::types::{AuthUser, DevicePinRow, LoginOutcome, UserRow, normalize_username};

/// Session lifetime.
pub const SESSION_TTL_DAYS: i64 = 7;

/// Session lifetime in seconds, for the cookie `Max-Age`.
#[must_use]
pub fn session_ttl_secs() -> i64 {
    Duration::days(SESSION_TTL_DAYS).num_seconds()
}

/// Persistent user + session + device-PIN store.
#[derive(Debug, Clone)]
pub struct AuthStore {
    pool: SqlitePool,
}

impl AuthStore {
    /// Open (or create) the auth database and run migrations.
    ///
    /// # Errors
    /// Returns an error if the database cannot be created or a migration
    /// fails.
    pub async fn new(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite:{display}",
            display = db_path.display()
        ))?
        .create_if_missing(true)
        .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )
            ",
        )
        .execute(pool)
        .await?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_optional(pool)
                .await?
                .flatten();

        if current_version.unwrap_or(0) < 1 {
            Self::migrate_to_v1(pool).await?;
        }

        Ok(())
    }

    /// Migration v1: users, sessions, and device PINs.
    async fn migrate_to_v1(pool: &SqlitePool) -> anyhow::Result<()> {
        tracing::info!("Applying auth migration v1: initial schema");

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                password_salt TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS auth_sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_auth_sessions_expires_at
            ON auth_sessions(expires_at)
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS device_pins (
                device_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                pin_hash TEXT NOT NULL,
                pin_salt TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_used_at TEXT
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query("INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(1)
            .bind(Utc::now().to_rfc3339())
            .execute(pool)
            .await?;

        tracing::info!("Auth migration v1 complete");
        Ok(())
    }

    /// Create a user unless the username already exists.
    ///
    /// # Errors
    /// Returns an error if hashing or the insert fails.
    pub async fn seed_user(&self, username: &str, password: &str) -> anyhow::Result<()> {
        let username = normalize_username(username);
        let existing: Option<String> = sqlx::query_scalar("SELECT id FROM users WHERE username = ?")
            .bind(&username)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Ok(());
        }

        let hashed = hash_secret(password)?;
        sqlx::query(
            r"
            INSERT INTO users (id, username, password_hash, password_salt, created_at)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&username)
        .bind(&hashed.hash)
        .bind(&hashed.salt)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::info!(username = %username, "Seeded user");
        Ok(())
    }

    /// Check a username/password pair without creating a session.
    ///
    /// Unknown user and wrong password are indistinguishable to the caller.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn verify_password(
        &self,
        username: &str,
        password: &str,
    ) -> anyhow::Result<Option<AuthUser>> {
        let username = normalize_username(username);
        let row: Option<UserRow> = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, password_hash, password_salt, created_at FROM users WHERE username = ?",
        )
        .bind(&username)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        if !verify_secret(password, &row.password_salt, &row.password_hash) {
            return Ok(None);
        }
        Ok(Some(row.into()))
    }

    /// Password login: verify and mint a session.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> anyhow::Result<Option<LoginOutcome>> {
        self.evict_expired().await?;
        let Some(user) = self.verify_password(username, password).await? else {
            return Ok(None);
        };
        let session_id = self.create_session(&user.id).await?;
        Ok(Some(LoginOutcome { session_id, user }))
    }

    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn has_device_pin(&self, device_id: &str) -> anyhow::Result<bool> {
        let existing: Option<String> =
            sqlx::query_scalar("SELECT device_id FROM device_pins WHERE device_id = ?")
                .bind(device_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(existing.is_some())
    }

    /// Register (or replace) the PIN bound to a device.
    ///
    /// # Errors
    /// Returns an error if hashing or the upsert fails.
    pub async fn upsert_device_pin(
        &self,
        user_id: &str,
        device_id: &str,
        pin: &str,
    ) -> anyhow::Result<()> {
        let hashed = hash_secret(pin)?;
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r"
            INSERT INTO device_pins (device_id, user_id, pin_hash, pin_salt, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
                user_id = excluded.user_id,
                pin_hash = excluded.pin_hash,
                pin_salt = excluded.pin_salt,
                updated_at = excluded.updated_at
            ",
        )
        .bind(device_id)
        .bind(user_id)
        .bind(&hashed.hash)
        .bind(&hashed.salt)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Device-PIN login: verify and mint a session, stamping the PIN's
    /// last use.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn login_with_device_pin(
        &self,
        device_id: &str,
        pin: &str,
    ) -> anyhow::Result<Option<LoginOutcome>> {
        self.evict_expired().await?;

        let row: Option<DevicePinRow> = sqlx::query_as::<_, DevicePinRow>(
            "SELECT user_id, pin_hash, pin_salt FROM device_pins WHERE device_id = ?",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        if !verify_secret(pin, &row.pin_salt, &row.pin_hash) {
            return Ok(None);
        }

        let user: Option<UserRow> = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, password_hash, password_salt, created_at FROM users WHERE id = ?",
        )
        .bind(&row.user_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(user) = user else {
            return Ok(None);
        };

        sqlx::query("UPDATE device_pins SET last_used_at = ? WHERE device_id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(device_id)
            .execute(&self.pool)
            .await?;

        let user: AuthUser = user.into();
        let session_id = self.create_session(&user.id).await?;
        Ok(Some(LoginOutcome { session_id, user }))
    }

    /// Mint a session row for a user.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn create_session(&self, user_id: &str) -> anyhow::Result<String> {
        let session_id = generate_session_id();
        let now = Utc::now();
        let expires_at = now + Duration::days(SESSION_TTL_DAYS);

        sqlx::query(
            r"
            INSERT INTO auth_sessions (id, user_id, expires_at, created_at)
            VALUES (?, ?, ?, ?)
            ",
        )
        .bind(&session_id)
        .bind(user_id)
        .bind(expires_at.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(session_id)
    }

    /// Remove a session row.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn logout(&self, session_id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM auth_sessions WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Resolve a raw `Cookie` header to a user.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn authenticate(&self, cookie_header: &str) -> anyhow::Result<Option<AuthUser>> {
        let Some(session_id) = session_id_from_header(cookie_header) else {
            return Ok(None);
        };
        self.authenticate_session(&session_id).await
    }

    /// Resolve a session id to a user, evicting expired sessions first.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn authenticate_session(
        &self,
        session_id: &str,
    ) -> anyhow::Result<Option<AuthUser>> {
        self.evict_expired().await?;

        let user: Option<UserRow> = sqlx::query_as::<_, UserRow>(
            r"
            SELECT u.id, u.username, u.password_hash, u.password_salt, u.created_at
            FROM auth_sessions s
            JOIN users u ON u.id = s.user_id
            WHERE s.id = ?
            ",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user.map(AuthUser::from))
    }

    /// Whether any session row (live or expired) exists for the id.
    /// Test-support accessor.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn session_row_exists(&self, session_id: &str) -> anyhow::Result<bool> {
        let row: Option<String> = sqlx::query_scalar("SELECT id FROM auth_sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Force a session's expiry into the past. Test-support mutator.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn expire_session(&self, session_id: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE auth_sessions SET expires_at = ? WHERE id = ?")
            .bind((Utc::now() - Duration::seconds(1)).to_rfc3339())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn evict_expired(&self) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM auth_sessions WHERE expires_at <= ?")
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// 32 random bytes, hex-encoded.
fn generate_session_id() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
