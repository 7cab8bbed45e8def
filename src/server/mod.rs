//! External HTTP surfaces: the public tunnel-routing listener and the
//! admin API. Both are thin hyper `http1` servers in the teacher's
//! `proxy/server.rs` style — accept loop, `service_fn` per connection,
//! `with_upgrades()` so WebSocket clients can pass through the public
//! listener (§2 supplement: these collaborators perform no business logic
//! of their own, they only translate HTTP onto the Core's methods).

pub mod admin;
pub mod public;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::state::AppState;

/// Run an accept loop that serves `handler` over HTTP/1.1 with upgrade
/// support, until the shutdown signal fires.
pub async fn serve<F, Fut>(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
    handler: F,
) where
    F: Fn(Arc<AppState>, hyper::Request<hyper::body::Incoming>) -> Fut
        + Clone
        + Send
        + 'static,
    Fut: std::future::Future<Output = Result<hyper::Response<admin::BoxBody>, Infallible>>
        + Send,
{
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "accept error on external listener");
                        continue;
                    }
                };
                spawn_connection(stream, peer, Arc::clone(&state), handler.clone());
            }
            _ = shutdown.changed() => {
                debug!("external listener shutting down");
                return;
            }
        }
    }
}

fn spawn_connection<F, Fut>(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    state: Arc<AppState>,
    handler: F,
) where
    F: Fn(Arc<AppState>, hyper::Request<hyper::body::Incoming>) -> Fut
        + Clone
        + Send
        + 'static,
    Fut: std::future::Future<Output = Result<hyper::Response<admin::BoxBody>, Infallible>>
        + Send,
{
    tokio::spawn(async move {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let state = Arc::clone(&state);
            handler(state, req)
        });
        if let Err(e) = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            debug!(peer = %peer, error = %e, "external connection closed with error");
        }
    });
}
