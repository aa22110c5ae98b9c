//! HTTP surface of the provisioning service.

pub mod auth;
pub mod routes;

pub use routes::create_router;

use crate::config::AuthConfig;
use crate::provision::Provisioner;
use crate::tokens::TokenLedger;
use std::sync::Arc;

/// Shared state for every handler and middleware
#[derive(Debug, Clone)]
pub struct ApiState {
    pub provisioner: Provisioner,
    pub tokens: TokenLedger,
    pub auth: Arc<AuthConfig>,
}

impl ApiState {
    pub fn new(provisioner: Provisioner, tokens: TokenLedger, auth: AuthConfig) -> Self {
        Self {
            provisioner,
            tokens,
            auth: Arc::new(auth),
        }
    }
}
