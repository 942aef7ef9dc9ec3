//! The front door (spec.md §4.1, §4.2): one handler for every path, which
//! runs admission, then dispatches either into the connection engine or the
//! HTTP reverse-proxy fallback.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use wsbridge_core::registry::AdmissionRefusal;

use crate::admission;
use crate::engine;
use crate::reverseproxy;
use crate::state::AppState;
use crate::subprotocol;

fn header_token_list(headers: &HeaderMap, name: &str) -> Vec<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let has_upgrade_token = header_token_list(headers, "connection")
        .iter()
        .any(|tok| tok.eq_ignore_ascii_case("upgrade"));
    let wants_websocket = headers
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    has_upgrade_token && wants_websocket
}

fn query_value<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

fn refusal_status(refusal: AdmissionRefusal) -> StatusCode {
    match refusal {
        AdmissionRefusal::GlobalCapacity => StatusCode::SERVICE_UNAVAILABLE,
        AdmissionRefusal::PerIpCapacity => StatusCode::TOO_MANY_REQUESTS,
    }
}

pub async fn front_door(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
) -> Response {
    let config = state.config();
    let (mut parts, body) = req.into_parts();

    let path = parts.uri.path().to_string();
    let auth_header = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let query_token = parts
        .uri
        .query()
        .and_then(|q| query_value(q, "token"))
        .map(str::to_string);

    let ip = match admission::check(
        &config,
        &state.credential,
        &state.rate_limiter,
        &peer.to_string(),
        &path,
        auth_header.as_deref(),
        query_token.as_deref(),
    ) {
        Ok(ip) => ip,
        Err(e) => return e.status().into_response(),
    };

    if !is_websocket_upgrade(&parts.headers) {
        let req = Request::from_parts(parts, body);
        let upstream_base: axum::http::Uri = match config.upstream_url.parse() {
            Ok(u) => u,
            Err(_) => return StatusCode::BAD_GATEWAY.into_response(),
        };
        return reverseproxy::forward(&state.http_client, &upstream_base, req).await;
    }

    if let Err(refusal) =
        state
            .connections
            .try_increment(ip, config.capacity.max_global, config.capacity.max_per_ip)
    {
        return refusal_status(refusal).into_response();
    }

    let requested_protocols = header_token_list(&parts.headers, "sec-websocket-protocol");
    let negotiated = match subprotocol::negotiate(&requested_protocols, &config.allowed_subprotocols) {
        Ok(kept) => kept,
        Err(()) => {
            state.connections.decrement(ip);
            return StatusCode::FORBIDDEN.into_response();
        }
    };

    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(u) => u,
        Err(rejection) => {
            state.connections.decrement(ip);
            return rejection.into_response();
        }
    };

    let max_frame_size = config.max_frame_size;
    let engine_state = state.clone();
    let protocols = negotiated.clone();
    upgrade
        .protocols(protocols)
        .max_frame_size(max_frame_size)
        .on_upgrade(move |socket| engine::run(engine_state, socket, ip, negotiated))
}

pub fn router() -> axum::Router<Arc<AppState>> {
    axum::Router::new().fallback(front_door)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_websocket_upgrade_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive, Upgrade".parse().unwrap());
        headers.insert("upgrade", "websocket".parse().unwrap());
        assert!(is_websocket_upgrade(&headers));
    }

    #[test]
    fn plain_request_is_not_an_upgrade() {
        let headers = HeaderMap::new();
        assert!(!is_websocket_upgrade(&headers));
    }

    #[test]
    fn extracts_query_token() {
        assert_eq!(query_value("a=1&token=abc&b=2", "token"), Some("abc"));
        assert_eq!(query_value("a=1", "token"), None);
    }
}
