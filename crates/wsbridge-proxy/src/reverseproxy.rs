//! HTTP reverse-proxy fallback (spec.md §4.1 step 5): every non-WebSocket
//! request is forwarded verbatim to the Gateway with scheme/host/`Host`
//! rewritten, streaming the response body unchanged.

use axum::body::Body;
use axum::http::{Request, Response, StatusCode, Uri};
use hyper::header::HOST;

use crate::error::ProxyError;
use crate::state::HttpClient;

fn rewrite_uri(original: &Uri, upstream_base: &Uri) -> Result<Uri, ProxyError> {
    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Uri::builder()
        .scheme(upstream_base.scheme().cloned().ok_or_else(|| {
            ProxyError::UpstreamUnreachable("upstream URL has no scheme".to_string())
        })?)
        .authority(upstream_base.authority().cloned().ok_or_else(|| {
            ProxyError::UpstreamUnreachable("upstream URL has no authority".to_string())
        })?)
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ProxyError::UpstreamUnreachable(e.to_string()))
}

/// Forwards `req` to `upstream_base`, returning `502` (per spec.md §6) if the
/// upstream is unreachable rather than propagating a transport error to the
/// caller.
pub async fn forward(
    client: &HttpClient,
    upstream_base: &Uri,
    mut req: Request<Body>,
) -> Response<Body> {
    let new_uri = match rewrite_uri(req.uri(), upstream_base) {
        Ok(u) => u,
        Err(e) => {
            tracing::warn!(error = %e, "reverse proxy: failed to rewrite request URI");
            return bad_gateway();
        }
    };
    *req.uri_mut() = new_uri;

    if let Some(authority) = upstream_base.authority() {
        if let Ok(value) = authority.as_str().parse() {
            req.headers_mut().insert(HOST, value);
        }
    }

    match client.request(req).await {
        Ok(resp) => resp.map(Body::new),
        Err(e) => {
            tracing::warn!(error = %e, "reverse proxy: upstream request failed");
            bad_gateway()
        }
    }
}

fn bad_gateway() -> Response<Body> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(Body::from("upstream unreachable"))
        .unwrap()
}
