//! Refresh credential storage.
//!
//! Rows are looked up by the SHA-256 of the bearer secret; the secret itself is
//! never stored. A row is only ever flipped to consumed (once, by rotation) or
//! revoked, and is deleted by the expiry sweep.

use serde::Serialize;
use sqlx::sqlite::SqlitePool;

use crate::device::DeviceContext;

/// A stored refresh credential.
#[derive(Debug, Clone)]
pub struct RefreshCredential {
    pub id: i64,
    pub token_hash: String,
    pub family: String,
    pub user_id: i64,
    pub device_fingerprint: String,
    pub device_name: String,
    pub ip_address: String,
    pub ip_prefix: String,
    pub user_agent_hash: String,
    pub device_id: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
    pub last_used_at: i64,
    pub consumed: bool,
    pub revoked: bool,
    /// Token version of the user this credential was issued under.
    pub user_token_version: i64,
}

impl RefreshCredential {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    /// Check that the credential can still be exchanged, naming the first
    /// reason it cannot.
    pub fn check_usable(&self, now: i64, current_token_version: i64) -> Result<(), &'static str> {
        if self.consumed {
            return Err("consumed");
        }
        if self.revoked {
            return Err("revoked");
        }
        if self.is_expired(now) {
            return Err("expired");
        }
        if self.user_token_version != current_token_version {
            return Err("stale token version");
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct RefreshCredentialRow {
    id: i64,
    token_hash: String,
    family: String,
    user_id: i64,
    device_fingerprint: String,
    device_name: String,
    ip_address: String,
    ip_prefix: String,
    user_agent_hash: String,
    device_id: Option<String>,
    created_at: i64,
    expires_at: i64,
    last_used_at: i64,
    consumed: i32,
    revoked: i32,
    user_token_version: i64,
}

impl From<RefreshCredentialRow> for RefreshCredential {
    fn from(row: RefreshCredentialRow) -> Self {
        Self {
            id: row.id,
            token_hash: row.token_hash,
            family: row.family,
            user_id: row.user_id,
            device_fingerprint: row.device_fingerprint,
            device_name: row.device_name,
            ip_address: row.ip_address,
            ip_prefix: row.ip_prefix,
            user_agent_hash: row.user_agent_hash,
            device_id: row.device_id,
            created_at: row.created_at,
            expires_at: row.expires_at,
            last_used_at: row.last_used_at,
            consumed: row.consumed != 0,
            revoked: row.revoked != 0,
            user_token_version: row.user_token_version,
        }
    }
}

/// Input for [`RefreshTokenStore::create`].
#[derive(Debug, Clone, Copy)]
pub struct NewRefreshCredential<'a> {
    pub token_hash: &'a str,
    pub family: &'a str,
    pub user_id: i64,
    pub device: &'a DeviceContext,
    pub issued_at: i64,
    pub expires_at: i64,
    pub user_token_version: i64,
}

/// A device with at least one usable refresh credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveDevice {
    pub fingerprint: String,
    pub device_name: String,
    pub ip_address: String,
    pub last_used_at: i64,
}

#[derive(sqlx::FromRow)]
struct ActiveDeviceRow {
    device_fingerprint: String,
    device_name: String,
    ip_address: String,
    last_used_at: i64,
}

/// Store for refresh credentials.
#[derive(Clone)]
pub struct RefreshTokenStore {
    pool: SqlitePool,
}

impl RefreshTokenStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new credential.
    ///
    /// The row starts revoked if the user's live token version no longer equals
    /// `user_token_version`, so a concurrent version bump can never leave a
    /// usable credential behind. Fails with `RowNotFound` if the user is gone.
    pub async fn create(&self, new: &NewRefreshCredential<'_>) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO refresh_tokens (
                token_hash, family, user_id, device_fingerprint, device_name, ip_address,
                ip_prefix, user_agent_hash, device_id, created_at, expires_at, last_used_at,
                consumed, revoked, user_token_version
             )
             SELECT ?1, ?2, users.id, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?9,
                    0, CASE WHEN users.token_version = ?11 THEN 0 ELSE 1 END, ?11
             FROM users WHERE users.id = ?12",
        )
        .bind(new.token_hash)
        .bind(new.family)
        .bind(&new.device.fingerprint)
        .bind(&new.device.device_name)
        .bind(&new.device.ip_address)
        .bind(&new.device.ip_prefix)
        .bind(&new.device.user_agent_hash)
        .bind(new.device.device_id.as_deref())
        .bind(new.issued_at)
        .bind(new.expires_at)
        .bind(new.user_token_version)
        .bind(new.user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(sqlx::Error::RowNotFound);
        }
        Ok(result.last_insert_rowid())
    }

    /// Get a credential by the hash of its secret.
    pub async fn get_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshCredential>, sqlx::Error> {
        let row: Option<RefreshCredentialRow> = sqlx::query_as(
            "SELECT id, token_hash, family, user_id, device_fingerprint, device_name, ip_address,
                    ip_prefix, user_agent_hash, device_id, created_at, expires_at, last_used_at,
                    consumed, revoked, user_token_version
             FROM refresh_tokens WHERE token_hash = ?",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(RefreshCredential::from))
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<RefreshCredential>, sqlx::Error> {
        let row: Option<RefreshCredentialRow> = sqlx::query_as(
            "SELECT id, token_hash, family, user_id, device_fingerprint, device_name, ip_address,
                    ip_prefix, user_agent_hash, device_id, created_at, expires_at, last_used_at,
                    consumed, revoked, user_token_version
             FROM refresh_tokens WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(RefreshCredential::from))
    }

    /// Flip an active credential to consumed.
    ///
    /// Returns false if the row was already consumed or revoked; of any number
    /// of concurrent callers exactly one sees true.
    pub async fn mark_consumed(&self, id: i64, at: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET consumed = 1, last_used_at = ?
             WHERE id = ? AND consumed = 0 AND revoked = 0",
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Revoke a single credential (logout).
    pub async fn revoke_by_hash(&self, token_hash: &str) -> Result<bool, sqlx::Error> {
        let result =
            sqlx::query("UPDATE refresh_tokens SET revoked = 1 WHERE token_hash = ? AND revoked = 0")
                .bind(token_hash)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Revoke every credential of a user.
    pub async fn revoke_all_for_user(&self, user_id: i64) -> Result<u64, sqlx::Error> {
        let result =
            sqlx::query("UPDATE refresh_tokens SET revoked = 1 WHERE user_id = ? AND revoked = 0")
                .bind(user_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    /// Revoke every credential of a user bound to one device.
    pub async fn revoke_device(&self, user_id: i64, fingerprint: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = 1
             WHERE user_id = ? AND device_fingerprint = ? AND revoked = 0",
        )
        .bind(user_id)
        .bind(fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete every credential whose expiry has passed.
    pub async fn delete_expired(&self, now: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Devices holding a usable credential, most recently used first.
    pub async fn active_devices(
        &self,
        user_id: i64,
        now: i64,
    ) -> Result<Vec<ActiveDevice>, sqlx::Error> {
        // SQLite takes the bare columns from the row that holds MAX(last_used_at)
        let rows: Vec<ActiveDeviceRow> = sqlx::query_as(
            "SELECT device_fingerprint, device_name, ip_address, MAX(last_used_at) AS last_used_at
             FROM refresh_tokens
             WHERE user_id = ?1 AND consumed = 0 AND revoked = 0 AND expires_at > ?2
               AND user_token_version = (SELECT token_version FROM users WHERE id = ?1)
             GROUP BY device_fingerprint
             ORDER BY last_used_at DESC, MAX(id) DESC",
        )
        .bind(user_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ActiveDevice {
                fingerprint: row.device_fingerprint,
                device_name: row.device_name,
                ip_address: row.ip_address,
                last_used_at: row.last_used_at,
            })
            .collect())
    }

    /// List all credentials of a user, newest first.
    pub async fn list_by_user(&self, user_id: i64) -> Result<Vec<RefreshCredential>, sqlx::Error> {
        let rows: Vec<RefreshCredentialRow> = sqlx::query_as(
            "SELECT id, token_hash, family, user_id, device_fingerprint, device_name, ip_address,
                    ip_prefix, user_agent_hash, device_id, created_at, expires_at, last_used_at,
                    consumed, revoked, user_token_version
             FROM refresh_tokens WHERE user_id = ? ORDER BY id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RefreshCredential::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn device(ua: &str) -> DeviceContext {
        DeviceContext::new(Some(ua), "10.0.0.1".parse().unwrap(), None)
    }

    async fn setup() -> (Database, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let user_id = db.users().create("u1", "alice", "h", "A").await.unwrap();
        (db, user_id)
    }

    async fn insert(
        db: &Database,
        user_id: i64,
        hash: &str,
        device: &DeviceContext,
        expires_at: i64,
        version: i64,
    ) -> i64 {
        db.refresh_tokens()
            .create(&NewRefreshCredential {
                token_hash: hash,
                family: "fam-1",
                user_id,
                device,
                issued_at: 1000,
                expires_at,
                user_token_version: version,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (db, user_id) = setup().await;
        let dev = device("Firefox");
        let id = insert(&db, user_id, "hash-1", &dev, 5000, 0).await;

        let cred = db.refresh_tokens().get_by_hash("hash-1").await.unwrap().unwrap();
        assert_eq!(cred.id, id);
        assert_eq!(cred.family, "fam-1");
        assert_eq!(cred.device_fingerprint, dev.fingerprint);
        assert_eq!(cred.ip_prefix, "10.0.0");
        assert_eq!(cred.last_used_at, 1000);
        assert!(!cred.consumed && !cred.revoked);
        assert_eq!(cred.check_usable(2000, 0), Ok(()));
        assert_eq!(cred.check_usable(5000, 0), Err("expired"));
        assert_eq!(cred.check_usable(2000, 1), Err("stale token version"));

        assert!(db.refresh_tokens().get_by_hash("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_with_stale_version_is_revoked() {
        let (db, user_id) = setup().await;
        db.users().bump_token_version(user_id).await.unwrap();

        insert(&db, user_id, "stale", &device("Firefox"), 5000, 0).await;
        let cred = db.refresh_tokens().get_by_hash("stale").await.unwrap().unwrap();
        assert!(cred.revoked);
    }

    #[tokio::test]
    async fn test_create_for_missing_user_fails() {
        let (db, _) = setup().await;
        let dev = device("Firefox");
        let result = db
            .refresh_tokens()
            .create(&NewRefreshCredential {
                token_hash: "h",
                family: "f",
                user_id: 424242,
                device: &dev,
                issued_at: 0,
                expires_at: 10,
                user_token_version: 0,
            })
            .await;
        assert!(matches!(result, Err(sqlx::Error::RowNotFound)));
    }

    #[tokio::test]
    async fn test_mark_consumed_once() {
        let (db, user_id) = setup().await;
        let id = insert(&db, user_id, "hash-1", &device("Firefox"), 5000, 0).await;

        assert!(db.refresh_tokens().mark_consumed(id, 2000).await.unwrap());
        assert!(!db.refresh_tokens().mark_consumed(id, 2001).await.unwrap());

        let cred = db.refresh_tokens().get_by_id(id).await.unwrap().unwrap();
        assert!(cred.consumed);
        assert_eq!(cred.last_used_at, 2000);
    }

    #[tokio::test]
    async fn test_revoked_cannot_be_consumed() {
        let (db, user_id) = setup().await;
        let id = insert(&db, user_id, "hash-1", &device("Firefox"), 5000, 0).await;

        assert!(db.refresh_tokens().revoke_by_hash("hash-1").await.unwrap());
        assert!(!db.refresh_tokens().revoke_by_hash("hash-1").await.unwrap());
        assert!(!db.refresh_tokens().mark_consumed(id, 2000).await.unwrap());
    }

    #[tokio::test]
    async fn test_revoke_all_and_device() {
        let (db, user_id) = setup().await;
        let firefox = device("Firefox");
        let chrome = device("Chrome");
        insert(&db, user_id, "a", &firefox, 5000, 0).await;
        insert(&db, user_id, "b", &chrome, 5000, 0).await;
        insert(&db, user_id, "c", &chrome, 5000, 0).await;

        let store = db.refresh_tokens();
        assert_eq!(store.revoke_device(user_id, &chrome.fingerprint).await.unwrap(), 2);
        assert!(!store.get_by_hash("a").await.unwrap().unwrap().revoked);

        assert_eq!(store.revoke_all_for_user(user_id).await.unwrap(), 1);
        assert!(store.list_by_user(user_id).await.unwrap().iter().all(|c| c.revoked));
    }

    #[tokio::test]
    async fn test_delete_expired() {
        let (db, user_id) = setup().await;
        insert(&db, user_id, "old", &device("Firefox"), 1500, 0).await;
        insert(&db, user_id, "new", &device("Firefox"), 9000, 0).await;

        assert_eq!(db.refresh_tokens().delete_expired(2000).await.unwrap(), 1);
        assert!(db.refresh_tokens().get_by_hash("old").await.unwrap().is_none());
        assert!(db.refresh_tokens().get_by_hash("new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_active_devices_ordered_by_last_use() {
        let (db, user_id) = setup().await;
        let firefox = device("Mozilla/5.0 (X11; Linux x86_64) Firefox/128.0");
        let chrome = device(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36",
        );
        let old_id = insert(&db, user_id, "a", &firefox, 9000, 0).await;
        insert(&db, user_id, "b", &chrome, 9000, 0).await;
        insert(&db, user_id, "c", &firefox, 9000, 0).await;
        // Consumed and revoked rows don't count
        db.refresh_tokens().mark_consumed(old_id, 3000).await.unwrap();
        insert(&db, user_id, "d", &device("Revoked"), 9000, 0).await;
        db.refresh_tokens().revoke_by_hash("d").await.unwrap();
        sqlx::query("UPDATE refresh_tokens SET last_used_at = 2500 WHERE token_hash = 'b'")
            .execute(db.pool())
            .await
            .unwrap();

        let devices = db.refresh_tokens().active_devices(user_id, 2000).await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].fingerprint, chrome.fingerprint);
        assert_eq!(devices[0].device_name, "Chrome on Windows 10");
        assert_eq!(devices[0].last_used_at, 2500);
        assert_eq!(devices[1].fingerprint, firefox.fingerprint);
    }
}
