use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Singleton row holding the address pool cursor
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct IpState {
    pub id: i64,
    pub network_cidr: String,
    pub next_available_ip: String,
}

/// Stored single-use access token
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct OneTimeToken {
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OneTimeToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}
