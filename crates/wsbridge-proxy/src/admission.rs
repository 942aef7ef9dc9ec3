//! Front-door admission gates, run in the fixed order spec.md §4.1 mandates:
//! overlay check, peer parsing, credential check, rate limit.

use std::net::IpAddr;

use axum::http::StatusCode;
use wsbridge_core::credential::{extract_bearer, CredentialChecker};
use wsbridge_core::overlay::{is_overlay_addr, parse_peer_host};
use wsbridge_core::ratelimit::RateLimiter;
use wsbridge_core::BridgeConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    Overlay,
    MalformedPeer,
    Credential,
    RateLimit,
}

impl AdmissionError {
    pub fn status(self) -> StatusCode {
        match self {
            AdmissionError::Overlay => StatusCode::FORBIDDEN,
            AdmissionError::MalformedPeer => StatusCode::BAD_REQUEST,
            AdmissionError::Credential => StatusCode::FORBIDDEN,
            AdmissionError::RateLimit => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

fn path_is_public(config: &BridgeConfig, path: &str) -> bool {
    config
        .public_path_prefixes
        .iter()
        .any(|prefix| path.starts_with(prefix.as_str()))
}

/// Runs admission gates 1-4 of spec.md §4.1. Returns the admitted peer IP on
/// success. Public-path bypass applies only to the credential check.
pub fn check(
    config: &BridgeConfig,
    credential: &CredentialChecker,
    rate_limiter: &RateLimiter,
    peer_addr: &str,
    path: &str,
    auth_header: Option<&str>,
    query_token: Option<&str>,
) -> Result<IpAddr, AdmissionError> {
    let ip = parse_peer_host(peer_addr).ok_or(AdmissionError::MalformedPeer)?;

    if config.overlay_enabled && !is_overlay_addr(ip) {
        return Err(AdmissionError::Overlay);
    }

    if let Some(secret) = config.credential_token.as_deref() {
        if !secret.is_empty() && !path_is_public(config, path) {
            let presented = auth_header
                .and_then(extract_bearer)
                .or_else(|| {
                    query_token.map(|t| {
                        tracing::warn!("credential presented via query parameter, not Authorization header");
                        t.to_string()
                    })
                })
                .unwrap_or_default();
            if !credential.token_matches(&presented, secret) {
                return Err(AdmissionError::Credential);
            }
        }
    }

    if config.rate_limit.enabled && !rate_limiter.allow(ip) {
        return Err(AdmissionError::RateLimit);
    }

    Ok(ip)
}
