//! Admin HTTP surface (§2/§6 supplement): a line-for-line translation of
//! `ClientManager`'s public methods onto HTTP. No business logic lives
//! here — every handler is a direct call into the Core plus status-code
//! mapping.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use tracing::warn;

use crate::state::AppState;
use crate::tunnel::request_forward::{empty_box_body, full_box_body, BoxBodyError};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, BoxBodyError>;

#[derive(Debug, Deserialize, Default)]
struct NewClientRequest {
    id: Option<String>,
}

pub async fn handle(
    state: Arc<AppState>,
    request: Request<Incoming>,
) -> Result<Response<BoxBody>, Infallible> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = match (&method, path.as_str()) {
        (&Method::POST, "/clients") => create_client(&state, request).await,
        (&Method::GET, "/stats") => stats(&state).await,
        (&Method::GET, p) if p.starts_with("/clients/") && p.ends_with("/stats") => {
            let id = &p["/clients/".len()..p.len() - "/stats".len()];
            client_stats(&state, id).await
        }
        (&Method::DELETE, p) if p.starts_with("/clients/") => {
            let id = &p["/clients/".len()..];
            delete_client(&state, id).await
        }
        _ => not_found(),
    };

    Ok(response)
}

async fn create_client(state: &Arc<AppState>, request: Request<Incoming>) -> Response<BoxBody> {
    let body = match request.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "failed reading admin request body");
            return bad_request("could not read request body");
        }
    };

    let requested_id = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice::<NewClientRequest>(&body) {
            Ok(parsed) => parsed.id,
            Err(_) => None,
        }
    };

    match state.manager.new_client(requested_id).await {
        Ok(client) => json_response(
            StatusCode::CREATED,
            &serde_json::json!({
                "id": client.id(),
                "port": client.tunnel_port(),
                "max_conn_count": state.config.max_tcp_sockets,
            }),
        ),
        Err(e) => {
            warn!(error = %e, "failed to create client");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &serde_json::json!({ "error": e.to_string() }),
            )
        }
    }
}

async fn client_stats(state: &Arc<AppState>, id: &str) -> Response<BoxBody> {
    match state.manager.get_client(id).await {
        Some(client) => {
            let stats = client.stats().await;
            json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "id": client.id(),
                    "connected_sockets": stats.connected_sockets,
                }),
            )
        }
        None => not_found(),
    }
}

async fn delete_client(state: &Arc<AppState>, id: &str) -> Response<BoxBody> {
    state.manager.remove_client(id).await;
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(empty_box_body())
        .expect("static response is well-formed")
}

async fn stats(state: &Arc<AppState>) -> Response<BoxBody> {
    let stats = state.manager.stats().await;
    json_response(StatusCode::OK, &stats)
}

fn not_found() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(full_box_body("not found"))
        .expect("static response is well-formed")
}

fn bad_request(message: &str) -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(full_box_body(message.to_string()))
        .expect("static response is well-formed")
}

fn json_response(status: StatusCode, value: &impl serde::Serialize) -> Response<BoxBody> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(full_box_body(body))
        .expect("static response is well-formed")
}
