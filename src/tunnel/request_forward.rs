//! Forward-request algorithm (§4.4): relay one HTTP/1.1 exchange across a
//! checked-out tunnel socket using hyper as the connection factory, so body
//! streaming and most failure modes come from hyper's own plumbing rather
//! than a hand-rolled copy loop (§9 ambient note).

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};

use super::agent::CheckedOutSocket;
use super::io::ArcIo;

pub type BoxBodyError = Box<dyn std::error::Error + Send + Sync>;

pub fn empty_box_body() -> BoxBody<Bytes, BoxBodyError> {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

pub fn full_box_body(bytes: impl Into<Bytes>) -> BoxBody<Bytes, BoxBodyError> {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn bad_gateway() -> Response<BoxBody<Bytes, BoxBodyError>> {
    Response::builder()
        .status(hyper::StatusCode::BAD_GATEWAY)
        .body(full_box_body("bad gateway"))
        .expect("static response is well-formed")
}

/// Forward one HTTP request over a socket checked out from a client's
/// Tunnel Agent and return the response, streamed body included.
///
/// Per §4.4: if the handshake or request send fails before any response
/// headers arrive, a synthesized `502` is returned to the external caller
/// instead of propagating the transport error; once response headers have
/// been received, any subsequent body-streaming failure terminates the
/// response stream rather than retrying or substituting content.
pub async fn forward_request(
    socket: CheckedOutSocket,
    request: Request<Incoming>,
) -> Response<BoxBody<Bytes, BoxBodyError>> {
    let io = TokioIo::new(ArcIo(Arc::clone(socket.stream())));

    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "tunnel upstream handshake failed");
            return bad_gateway();
        }
    };

    // The checked-out socket stays alive (and so counted in `connected_count`)
    // for as long as hyper's connection driver is using it; only once that
    // driver finishes do we report the tunnel socket released back to the
    // agent (dropping `socket` runs `CheckedOutSocket`'s release-on-drop).
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "tunnel upstream connection closed");
        }
        drop(socket);
    });

    let response = match sender.send_request(request).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(error = %e, "tunnel upstream request failed");
            return bad_gateway();
        }
    };

    response.map(|body| body.map_err(BoxBodyError::from).boxed())
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc as StdArc;

    use http_body_util::{BodyExt, Empty};
    use hyper::service::service_fn;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::Mutex;

    use super::*;
    use crate::tunnel::agent::TunnelAgent;

    async fn checkout_against_stub() -> (CheckedOutSocket, TcpStream) {
        let (agent, _events) = TunnelAgent::spawn(4);
        let port = agent
            .listen("127.0.0.1:0".parse::<SocketAddr>().unwrap())
            .await
            .unwrap();
        let stub = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let socket = agent.create_connection().await.unwrap();
        (socket, stub)
    }

    /// Runs a single external connection through a real `hyper` server whose
    /// service is `forward_request` itself, so the function under test
    /// receives a genuine `Request<Incoming>` rather than a hand-built stand-in.
    async fn serve_one_connection_with(socket: CheckedOutSocket) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let socket = StdArc::new(Mutex::new(Some(socket)));
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let io = TokioIo::new(stream);
            let socket = StdArc::clone(&socket);
            let service = service_fn(move |req: Request<Incoming>| {
                let socket = StdArc::clone(&socket);
                async move {
                    let socket = socket.lock().await.take().expect("single request");
                    Ok::<_, std::convert::Infallible>(forward_request(socket, req).await)
                }
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await;
        });
        addr
    }

    #[tokio::test]
    async fn relays_a_canned_upstream_response() {
        let (socket, mut stub) = checkout_against_stub().await;
        let external_addr = serve_one_connection_with(socket).await;

        let stub_task = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let n = stub.read(&mut buf).await.unwrap();
            let received = String::from_utf8_lossy(&buf[..n]).to_string();
            stub.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
            received
        });

        let client_io = TokioIo::new(TcpStream::connect(external_addr).await.unwrap());
        let (mut sender, conn) = hyper::client::conn::http1::handshake(client_io)
            .await
            .unwrap();
        tokio::spawn(conn);

        let request = Request::builder()
            .method("GET")
            .uri("/widgets")
            .header(hyper::header::HOST, "example")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = sender.send_request(request).await.unwrap();
        assert_eq!(response.status(), hyper::StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");

        let received = stub_task.await.unwrap();
        assert!(received.starts_with("GET /widgets HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn bad_gateway_is_returned_when_stub_closes_before_handshake() {
        let (socket, stub) = checkout_against_stub().await;
        drop(stub);
        let external_addr = serve_one_connection_with(socket).await;

        let client_io = TokioIo::new(TcpStream::connect(external_addr).await.unwrap());
        let (mut sender, conn) = hyper::client::conn::http1::handshake(client_io)
            .await
            .unwrap();
        tokio::spawn(conn);

        let request = Request::builder()
            .method("GET")
            .uri("/")
            .header(hyper::header::HOST, "example")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = sender.send_request(request).await.unwrap();
        assert_eq!(response.status(), hyper::StatusCode::BAD_GATEWAY);
    }
}
