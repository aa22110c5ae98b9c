//! Bearer authentication.
//!
//! [`master_auth`] runs on every request and marks callers holding the master
//! token. [`token_auth`] lets marked callers through and otherwise burns a
//! one-time token. [`require_master`] admits marked callers only.

use crate::api::ApiState;
use crate::error::AppError;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use tracing::{debug, warn};

/// Request extension set once the master token has been accepted
#[derive(Debug, Clone, Copy)]
pub struct MasterAuthenticated;

/// Compare two strings without exiting early on the first difference.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Token from an `Authorization: Bearer ...` header, if non-empty
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    (!token.is_empty()).then_some(token)
}

fn peer_addr(req: &Request) -> Option<SocketAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

fn is_master(req: &Request) -> bool {
    req.extensions().get::<MasterAuthenticated>().is_some()
}

pub async fn master_auth(State(state): State<ApiState>, mut req: Request, next: Next) -> Response {
    let master_token = state.auth.master_token.as_str();
    if master_token.is_empty() {
        return next.run(req).await;
    }

    let accepted = bearer_token(req.headers())
        .map(|token| constant_time_eq(token, master_token))
        .unwrap_or(false);
    if !accepted {
        return next.run(req).await;
    }

    if state.auth.master_localhost_only {
        match peer_addr(&req) {
            Some(addr) if addr.ip().to_canonical().is_loopback() => {}
            Some(addr) => {
                warn!("Master token presented from non-local peer {}", addr);
                return AppError::Forbidden.into_response();
            }
            None => {
                debug!("Master token presented without a known peer address");
                return next.run(req).await;
            }
        }
    }

    req.extensions_mut().insert(MasterAuthenticated);
    next.run(req).await
}

pub async fn token_auth(
    State(state): State<ApiState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if is_master(&req) {
        return Ok(next.run(req).await);
    }
    if state.auth.token_auth_disabled {
        return Err(AppError::Unauthorized);
    }

    let token = bearer_token(req.headers())
        .ok_or(AppError::Unauthorized)?
        .to_string();
    match state.tokens.validate_and_burn(&token).await {
        Ok(()) => Ok(next.run(req).await),
        Err(e) if e.is_token_rejection() => {
            debug!("One-time token rejected: {}", e);
            Err(AppError::Unauthorized)
        }
        Err(e) => Err(e),
    }
}

pub async fn require_master(req: Request, next: Next) -> Result<Response, AppError> {
    if is_master(&req) {
        Ok(next.run(req).await)
    } else {
        Err(AppError::Unauthorized)
    }
}
