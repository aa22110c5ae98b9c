//! Single-use access tokens.
//!
//! A token is either stored and unused, or gone. Looking at a token always
//! deletes it, whether or not it turned out to be valid.

use crate::db::{DbPool, OneTimeToken, TokenRepo};
use crate::error::{AppError, AppResult};
use chrono::{Duration, SubsecRound, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::debug;

/// Raw token size; 256 bits of entropy.
const TOKEN_BYTES: usize = 32;

pub const DEFAULT_TOKEN_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct TokenLedger {
    pool: DbPool,
    ttl: Duration,
}

impl TokenLedger {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            ttl: Duration::hours(DEFAULT_TOKEN_TTL_HOURS),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Issue a fresh token. The value is only ever returned here.
    pub async fn new_token(&self) -> AppResult<String> {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let value = hex::encode(bytes);

        let now = Utc::now().trunc_subsecs(0);
        let token = OneTimeToken {
            token: value.clone(),
            created_at: now,
            expires_at: now + self.ttl,
        };

        let mut conn = self.pool.acquire().await?;
        TokenRepo::insert(&mut conn, &token).await?;

        debug!("Issued one-time token expiring at {}", token.expires_at);
        Ok(value)
    }

    /// Consume `value`. Expired tokens are deleted and reported as
    /// [`AppError::TokenExpired`]; unknown or already used ones as
    /// [`AppError::TokenNotFound`].
    pub async fn validate_and_burn(&self, value: &str) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        let Some(token) = TokenRepo::take(&mut tx, value).await? else {
            debug!("Token rejected: not found");
            return Err(AppError::TokenNotFound);
        };

        // Commit the delete in both branches so an expired token is purged
        // on first sight.
        tx.commit().await?;

        if token.is_expired(Utc::now()) {
            debug!("Token rejected: expired at {}", token.expires_at);
            return Err(AppError::TokenExpired);
        }

        debug!("Token accepted");
        Ok(())
    }

    /// Delete every token already past its expiry
    pub async fn purge_expired(&self) -> AppResult<u64> {
        let mut conn = self.pool.acquire().await?;
        let purged = TokenRepo::purge_expired(&mut conn, Utc::now().trunc_subsecs(0)).await?;
        if purged > 0 {
            debug!("Purged {} expired tokens", purged);
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_test_db;

    #[tokio::test]
    async fn test_new_token_shape() {
        let ledger = TokenLedger::new(setup_test_db().await);
        let first = ledger.new_token().await.unwrap();
        let second = ledger.new_token().await.unwrap();

        assert_eq!(first.len(), TOKEN_BYTES * 2);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_token_burns_once() {
        let ledger = TokenLedger::new(setup_test_db().await);
        let token = ledger.new_token().await.unwrap();

        tokio_test::assert_ok!(ledger.validate_and_burn(&token).await);
        assert!(matches!(
            ledger.validate_and_burn(&token).await,
            Err(AppError::TokenNotFound)
        ));
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let ledger = TokenLedger::new(setup_test_db().await);
        assert!(matches!(
            ledger.validate_and_burn("deadbeef").await,
            Err(AppError::TokenNotFound)
        ));
    }

    #[tokio::test]
    async fn test_expired_token_purged_on_first_look() {
        let ledger = TokenLedger::new(setup_test_db().await).with_ttl(-Duration::hours(1));
        let token = ledger.new_token().await.unwrap();

        assert!(matches!(
            ledger.validate_and_burn(&token).await,
            Err(AppError::TokenExpired)
        ));
        assert!(matches!(
            ledger.validate_and_burn(&token).await,
            Err(AppError::TokenNotFound)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_burn_single_winner() {
        let ledger = TokenLedger::new(setup_test_db().await);
        let token = ledger.new_token().await.unwrap();

        let a = {
            let ledger = ledger.clone();
            let token = token.clone();
            tokio::spawn(async move { ledger.validate_and_burn(&token).await })
        };
        let b = {
            let ledger = ledger.clone();
            let token = token.clone();
            tokio::spawn(async move { ledger.validate_and_burn(&token).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let successes = results.iter().filter(|r| r.is_ok()).count();
        let not_found = results
            .iter()
            .filter(|r| matches!(r, Err(AppError::TokenNotFound)))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(not_found, 1);
    }

    #[tokio::test]
    async fn test_purge_expired_keeps_live_tokens() {
        let pool = setup_test_db().await;
        let stale = TokenLedger::new(pool.clone()).with_ttl(-Duration::hours(2));
        let live = TokenLedger::new(pool);

        stale.new_token().await.unwrap();
        stale.new_token().await.unwrap();
        let token = live.new_token().await.unwrap();

        assert_eq!(live.purge_expired().await.unwrap(), 2);
        tokio_test::assert_ok!(live.validate_and_burn(&token).await);
    }
}
