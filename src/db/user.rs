use sqlx::sqlite::SqlitePool;

#[derive(Clone)]
pub struct UserStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub uuid: String,
    pub username: String,
    pub password_hash: String,
    pub full_name: String,
    /// Generation counter; bumping it invalidates every issued credential.
    pub token_version: i64,
    pub enabled: bool,
    pub account_locked: bool,
    pub lock_expires_at: Option<i64>,
    pub failed_login_attempts: i64,
    pub last_login_at: Option<i64>,
    pub created_at: i64,
}

impl User {
    /// Seconds until the lock lifts, or `None` if the account is usable at `now`.
    pub fn lock_remaining(&self, now: i64) -> Option<u64> {
        if !self.account_locked {
            return None;
        }
        match self.lock_expires_at {
            Some(expires) if expires > now => u64::try_from(expires - now).ok(),
            Some(_) => None,
            // Locked without an expiry stays locked
            None => Some(u64::MAX),
        }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    uuid: String,
    username: String,
    password_hash: String,
    full_name: String,
    token_version: i64,
    enabled: i32,
    account_locked: i32,
    lock_expires_at: Option<i64>,
    failed_login_attempts: i64,
    last_login_at: Option<i64>,
    created_at: i64,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            uuid: row.uuid,
            username: row.username,
            password_hash: row.password_hash,
            full_name: row.full_name,
            token_version: row.token_version,
            enabled: row.enabled != 0,
            account_locked: row.account_locked != 0,
            lock_expires_at: row.lock_expires_at,
            failed_login_attempts: row.failed_login_attempts,
            last_login_at: row.last_login_at,
            created_at: row.created_at,
        }
    }
}

/// Counter state after a failed login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailedLogin {
    pub attempts: i64,
    pub locked: bool,
}

impl UserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new user. Returns the user ID.
    pub async fn create(
        &self,
        uuid: &str,
        username: &str,
        password_hash: &str,
        full_name: &str,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO users (uuid, username, password_hash, full_name) VALUES (?, ?, ?, ?)",
        )
        .bind(uuid)
        .bind(username)
        .bind(password_hash)
        .bind(full_name)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Get a user by username (case-insensitive).
    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>, sqlx::Error> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, uuid, username, password_hash, full_name, token_version, enabled,
                    account_locked, lock_expires_at, failed_login_attempts, last_login_at, created_at
             FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    /// Get a user by ID.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<User>, sqlx::Error> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, uuid, username, password_hash, full_name, token_version, enabled,
                    account_locked, lock_expires_at, failed_login_attempts, last_login_at, created_at
             FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    /// Get a user by UUID.
    pub async fn get_by_uuid(&self, uuid: &str) -> Result<Option<User>, sqlx::Error> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, uuid, username, password_hash, full_name, token_version, enabled,
                    account_locked, lock_expires_at, failed_login_attempts, last_login_at, created_at
             FROM users WHERE uuid = ?",
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    /// Atomically increment the token version. Returns the new version.
    pub async fn bump_token_version(&self, id: i64) -> Result<Option<i64>, sqlx::Error> {
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE users SET token_version = token_version + 1 WHERE id = ? RETURNING token_version",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0))
    }

    /// Count a failed login, locking the account until `lock_until` once
    /// `max_attempts` is reached.
    pub async fn record_failed_login(
        &self,
        id: i64,
        max_attempts: u32,
        lock_until: i64,
    ) -> Result<Option<FailedLogin>, sqlx::Error> {
        let row: Option<(i64, i32)> = sqlx::query_as(
            "UPDATE users SET
                failed_login_attempts = failed_login_attempts + 1,
                account_locked = CASE WHEN failed_login_attempts + 1 >= ?1 THEN 1 ELSE account_locked END,
                lock_expires_at = CASE WHEN failed_login_attempts + 1 >= ?1 THEN ?2 ELSE lock_expires_at END
             WHERE id = ?3
             RETURNING failed_login_attempts, account_locked",
        )
        .bind(i64::from(max_attempts))
        .bind(lock_until)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(attempts, locked)| FailedLogin {
            attempts,
            locked: locked != 0,
        }))
    }

    /// Clear the lock and the failure counter.
    pub async fn unlock(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE users SET account_locked = 0, lock_expires_at = NULL, failed_login_attempts = 0 WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record a successful login.
    pub async fn record_login(&self, id: i64, at: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE users SET failed_login_attempts = 0, account_locked = 0, lock_expires_at = NULL, last_login_at = ? WHERE id = ?",
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_enabled(&self, id: i64, enabled: bool) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE users SET enabled = ? WHERE id = ?")
            .bind(enabled as i32)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Check if a username is available.
    pub async fn is_username_available(&self, username: &str) -> Result<bool, sqlx::Error> {
        let count: (i32,) = sqlx::query_as("SELECT COUNT(*) FROM users WHERE username = ?")
            .bind(username)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0 == 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::Database;

    #[tokio::test]
    async fn test_bump_token_version() {
        let db = Database::open(":memory:").await.unwrap();
        let id = db.users().create("u1", "alice", "h", "A").await.unwrap();

        assert_eq!(db.users().bump_token_version(id).await.unwrap(), Some(1));
        assert_eq!(db.users().bump_token_version(id).await.unwrap(), Some(2));
        assert_eq!(db.users().bump_token_version(9999).await.unwrap(), None);

        let user = db.users().get_by_id(id).await.unwrap().unwrap();
        assert_eq!(user.token_version, 2);
    }

    #[tokio::test]
    async fn test_failed_logins_lock_at_threshold() {
        let db = Database::open(":memory:").await.unwrap();
        let users = db.users();
        let id = users.create("u1", "alice", "h", "A").await.unwrap();

        for attempt in 1..=2 {
            let state = users.record_failed_login(id, 3, 5000).await.unwrap().unwrap();
            assert_eq!(state.attempts, attempt);
            assert!(!state.locked);
        }
        let state = users.record_failed_login(id, 3, 5000).await.unwrap().unwrap();
        assert_eq!(state, super::FailedLogin { attempts: 3, locked: true });

        let user = users.get_by_id(id).await.unwrap().unwrap();
        assert!(user.account_locked);
        assert_eq!(user.lock_expires_at, Some(5000));
        assert_eq!(user.lock_remaining(4000), Some(1000));
        assert_eq!(user.lock_remaining(5000), None);

        users.unlock(id).await.unwrap();
        let user = users.get_by_id(id).await.unwrap().unwrap();
        assert!(!user.account_locked);
        assert_eq!(user.failed_login_attempts, 0);
        assert_eq!(user.lock_expires_at, None);
    }

    #[tokio::test]
    async fn test_record_login_resets_counter() {
        let db = Database::open(":memory:").await.unwrap();
        let users = db.users();
        let id = users.create("u1", "alice", "h", "A").await.unwrap();

        users.record_failed_login(id, 5, 0).await.unwrap();
        users.record_login(id, 1234).await.unwrap();

        let user = users.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(user.failed_login_attempts, 0);
        assert_eq!(user.last_login_at, Some(1234));
    }
}
