//! Public listener (§2 supplement): resolves an inbound external request
//! to a client id by host-prefix match and hands it to
//! `Client::forward_request` / `Client::forward_upgrade`. Deliberately
//! thin — no virtual-host templating, no path rewriting, just enough to
//! drive the Core end to end (spec.md's Non-goal on routing logic).

use std::convert::Infallible;
use std::sync::Arc;

use hyper::header::UPGRADE;
use hyper::{Request, Response, StatusCode};

use crate::server::admin::BoxBody;
use crate::state::AppState;
use crate::tunnel::request_forward::full_box_body;

pub async fn handle(
    state: Arc<AppState>,
    request: Request<hyper::body::Incoming>,
) -> Result<Response<BoxBody>, Infallible> {
    let Some(client_id) = resolve_client_id(&state, &request) else {
        return Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(full_box_body("unknown tunnel host"))
            .expect("static response is well-formed"));
    };

    let Some(client) = state.manager.get_client(&client_id).await else {
        return Ok(Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(full_box_body("tunnel not connected"))
            .expect("static response is well-formed"));
    };

    let is_upgrade = request.headers().get(UPGRADE).is_some();

    let response = if is_upgrade {
        client.forward_upgrade(request).await
    } else {
        client.forward_request(request).await
    };
    Ok(response)
}

/// Host-prefix match: `<client-id>.<anything>` or a bare `<client-id>`
/// host resolves to that client. Operators needing real subdomain
/// templating or path-based routing are expected to front this listener
/// with their own reverse proxy (§1 ambient note: out of scope here).
fn resolve_client_id(state: &AppState, request: &Request<hyper::body::Incoming>) -> Option<String> {
    let host = request
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())?;
    let _ = state;
    let host = host.split(':').next().unwrap_or(host);
    let prefix = host.split('.').next().unwrap_or(host);
    Some(prefix.to_string())
}
