use serde::{Deserialize, Serialize};
use typeshare::typeshare;

/// User account as exposed to clients.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub id: String,
    pub username: String,
    /// Account creation timestamp (ISO 8601).
    pub created_at: String,
}

/// A successful login: the opaque session id plus the user it belongs to.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub session_id: String,
    pub user: AuthUser,
}

/// User row from the database.
#[derive(Debug, Clone)]
pub(super) struct UserRow {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub password_salt: String,
    pub created_at: String,
}

impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for UserRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            password_hash: row.try_get("password_hash")?,
            password_salt: row.try_get("password_salt")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<UserRow> for AuthUser {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            username: row.username,
            created_at: row.created_at,
        }
    }
}

/// Device PIN row from the database.
#[derive(Debug, Clone)]
pub(super) struct DevicePinRow {
    pub user_id: String,
    pub pin_hash: String,
    pub pin_salt: String,
}

impl sqlx::FromRow<'_, sqlx::sqlite::SqliteRow> for DevicePinRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            user_id: row.try_get("user_id")?,
            pin_hash: row.try_get("pin_hash")?,
            pin_salt: row.try_get("pin_salt")?,
        })
    }
}

/// Lower-cased, trimmed username form used for storage and lookups.
#[must_use]
pub fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase()
}

/// Validate and normalize a device PIN: trimmed, 4-8 ASCII digits.
#[must_use]
pub fn normalize_pin(pin: &str) -> Option<String> {
    let pin = pin.trim();
    if (4..=8).contains(&pin.len()) && pin.bytes().all(|b| b.is_ascii_digit()) {
        Some(pin.to_string())
    } else {
        None
    }
}

/// Device ids are opaque tokens between 16 and 200 characters.
#[must_use]
pub fn valid_device_id(device_id: &str) -> bool {
    (16..=200).contains(&device_id.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_bounds() {
        assert_eq!(normalize_pin("1234").as_deref(), Some("1234"));
        assert_eq!(normalize_pin("12345678").as_deref(), Some("12345678"));
        assert_eq!(normalize_pin(" 1234 ").as_deref(), Some("1234"));
        assert!(normalize_pin("123").is_none());
        assert!(normalize_pin("123456789").is_none());
        assert!(normalize_pin("12a4").is_none());
    }

    #[test]
    fn username_normalization() {
        assert_eq!(normalize_username("  Alice "), "alice");
    }

    #[test]
    fn device_id_bounds() {
        assert!(!valid_device_id("short"));
        assert!(valid_device_id(&"d".repeat(16)));
        assert!(valid_device_id(&"d".repeat(200)));
        assert!(!valid_device_id(&"d".repeat(201)));
    }
}
