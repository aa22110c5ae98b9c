use crate::db::models::*;
use crate::error::AppResult;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite, SqliteConnection};
use tracing::info;

pub type DbPool = Pool<Sqlite>;

/// Id of the only row in `ip_state`
const IP_STATE_ID: i64 = 1;

/// Database operations for the address pool cursor.
///
/// Every method takes a connection so callers can run them inside one
/// transaction. SQLite has no `SELECT ... FOR UPDATE`; [`IpStateRepo::lock`]
/// issues a no-op write instead, which takes the database write lock for the
/// rest of the transaction.
pub struct IpStateRepo;

impl IpStateRepo {
    /// Take the write lock on the pool row. Returns false if the row is missing.
    pub async fn lock(conn: &mut SqliteConnection) -> AppResult<bool> {
        let result = sqlx::query("UPDATE ip_state SET id = id WHERE id = ?")
            .bind(IP_STATE_ID)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get(conn: &mut SqliteConnection) -> AppResult<Option<IpState>> {
        let state = sqlx::query_as::<_, IpState>("SELECT * FROM ip_state WHERE id = ?")
            .bind(IP_STATE_ID)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(state)
    }

    /// Drop any existing row and store a fresh one
    pub async fn replace(
        conn: &mut SqliteConnection,
        network_cidr: &str,
        next_available_ip: &str,
    ) -> AppResult<()> {
        sqlx::query("DELETE FROM ip_state")
            .execute(&mut *conn)
            .await?;

        sqlx::query("INSERT INTO ip_state (id, network_cidr, next_available_ip) VALUES (?, ?, ?)")
            .bind(IP_STATE_ID)
            .bind(network_cidr)
            .bind(next_available_ip)
            .execute(&mut *conn)
            .await?;

        Ok(())
    }

    pub async fn set_next(conn: &mut SqliteConnection, next_available_ip: &str) -> AppResult<()> {
        sqlx::query("UPDATE ip_state SET next_available_ip = ? WHERE id = ?")
            .bind(next_available_ip)
            .bind(IP_STATE_ID)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

/// Database operations for one-time tokens.
///
/// Timestamps are written with whole seconds so their text form sorts
/// chronologically.
pub struct TokenRepo;

impl TokenRepo {
    pub async fn insert(conn: &mut SqliteConnection, token: &OneTimeToken) -> AppResult<()> {
        sqlx::query("INSERT INTO one_time_tokens (token, created_at, expires_at) VALUES (?, ?, ?)")
            .bind(&token.token)
            .bind(token.created_at)
            .bind(token.expires_at)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Delete a token and hand back its row. The delete is the lock: a
    /// concurrent caller either waits for it or finds nothing.
    pub async fn take(conn: &mut SqliteConnection, token: &str) -> AppResult<Option<OneTimeToken>> {
        let row = sqlx::query_as::<_, OneTimeToken>(
            "DELETE FROM one_time_tokens WHERE token = ? RETURNING token, created_at, expires_at",
        )
        .bind(token)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(row)
    }

    #[cfg(test)]
    pub async fn get(conn: &mut SqliteConnection, token: &str) -> AppResult<Option<OneTimeToken>> {
        let row = sqlx::query_as::<_, OneTimeToken>("SELECT * FROM one_time_tokens WHERE token = ?")
            .bind(token)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(row)
    }

    /// Remove tokens that expired before `now`
    pub async fn purge_expired(conn: &mut SqliteConnection, now: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM one_time_tokens WHERE expires_at < ?")
            .bind(now)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    #[cfg(test)]
    pub async fn count(conn: &mut SqliteConnection) -> AppResult<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM one_time_tokens")
            .fetch_one(&mut *conn)
            .await?;
        Ok(count.0)
    }
}

#[cfg(test)]
pub async fn setup_test_db() -> DbPool {
    use sqlx::sqlite::SqlitePoolOptions;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    init_db(&pool).await.expect("Failed to init database");
    pool
}

/// Initialize database with migrations
pub async fn init_db(pool: &DbPool) -> AppResult<()> {
    info!("Running database migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ip_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            network_cidr TEXT NOT NULL,
            next_available_ip TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS one_time_tokens (
            token TEXT PRIMARY KEY,
            created_at DATETIME NOT NULL,
            expires_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tokens_expires_at ON one_time_tokens(expires_at)")
        .execute(pool)
        .await?;

    info!("Database migrations complete");
    Ok(())
}
