//! Client: one registered tunnel user, wrapping a Tunnel Agent with a grace
//! timer and the request/upgrade forwarding entry points (§4.2).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::{Request, Response};
use tokio::sync::Notify;
use tracing::{debug, info};

use super::agent::{AgentError, AgentEvent, AgentStats, TunnelAgent, DEFAULT_MAX_SOCKETS};
use super::request_forward::{self, BoxBodyError};
use super::upgrade_forward;

/// Default grace period (§4.2): how long a client with zero connected
/// sockets is kept registered before being torn down.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(1000);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client is closed")]
    Closed,
    #[error(transparent)]
    Agent(#[from] AgentError),
}

pub struct ClientConfig {
    pub max_tcp_sockets: u32,
    pub grace_period: Duration,
    pub tunnel_port_range: Option<(u16, u16)>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_tcp_sockets: DEFAULT_MAX_SOCKETS,
            grace_period: DEFAULT_GRACE_PERIOD,
            tunnel_port_range: None,
        }
    }
}

/// A registered client: a bound Tunnel Agent plus the grace-period
/// supervisor that closes it once it has been empty too long.
pub struct Client {
    id: String,
    agent: TunnelAgent,
    tunnel_port: u16,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
}

impl Client {
    /// Construct and start listening. Binds an OS-chosen port unless a
    /// `tunnel_port_range` is configured, in which case it scans that range
    /// (§3 supplement).
    pub async fn start(id: String, config: &ClientConfig) -> Result<Self, ClientError> {
        let (agent, mut events) = TunnelAgent::spawn(config.max_tcp_sockets);
        let tunnel_port = bind_within_range(&agent, config.tunnel_port_range).await?;

        let closed = Arc::new(AtomicBool::new(false));
        let close_notify = Arc::new(Notify::new());

        spawn_grace_supervisor(
            id.clone(),
            agent.clone(),
            config.grace_period,
            Arc::clone(&closed),
            Arc::clone(&close_notify),
            events,
        );

        info!(client_id = %id, port = tunnel_port, "client registered");

        Ok(Self {
            id,
            agent,
            tunnel_port,
            closed,
            close_notify,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tunnel_port(&self) -> u16 {
        self.tunnel_port
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> AgentStats {
        self.agent.stats().await
    }

    /// Resolves once this client has been torn down (idle grace period
    /// expired, or `close()` was called directly).
    pub async fn on_close(&self) {
        if self.is_closed() {
            return;
        }
        self.close_notify.notified().await;
    }

    /// Idempotent (§4.2): a second call is a silent no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.agent.destroy();
        self.close_notify.notify_waiters();
        info!(client_id = %self.id, "client closed");
    }

    pub async fn forward_request(
        &self,
        request: Request<Incoming>,
    ) -> Response<BoxBody<Bytes, BoxBodyError>> {
        match self.agent.create_connection().await {
            Ok(socket) => request_forward::forward_request(socket, request).await,
            Err(e) => {
                debug!(client_id = %self.id, error = %e, "no tunnel socket available for request");
                request_forward::bad_gateway()
            }
        }
    }

    pub async fn forward_upgrade(
        &self,
        request: Request<Incoming>,
    ) -> Response<BoxBody<Bytes, BoxBodyError>> {
        match self.agent.create_connection().await {
            Ok(socket) => upgrade_forward::forward_upgrade(socket, request).await,
            Err(e) => {
                debug!(client_id = %self.id, error = %e, "no tunnel socket available for upgrade");
                request_forward::bad_gateway()
            }
        }
    }
}

async fn bind_within_range(
    agent: &TunnelAgent,
    range: Option<(u16, u16)>,
) -> Result<u16, ClientError> {
    let Some((lo, hi)) = range else {
        return Ok(agent.listen(any_port(0)).await?);
    };
    let mut last_err = None;
    for port in lo..=hi {
        match agent.listen(any_port(port)).await {
            Ok(bound) => return Ok(bound),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or(AgentError::Closed).into())
}

fn any_port(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
}

/// A dedicated task per client watches the agent's online/offline events
/// and arms/disarms a grace timer (§4.2): the timer starts armed (a fresh
/// client with no sockets yet is still within its grace window), is
/// cancelled the moment the agent goes online, and is re-armed the moment
/// it goes offline again.
fn spawn_grace_supervisor(
    id: String,
    agent: TunnelAgent,
    grace_period: Duration,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<AgentEvent>,
) {
    tokio::spawn(async move {
        let mut grace_deadline = Some(tokio::time::Instant::now() + grace_period);
        loop {
            let sleep = async {
                match grace_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(AgentEvent::Online) => {
                            grace_deadline = None;
                        }
                        Some(AgentEvent::Offline) => {
                            grace_deadline = Some(tokio::time::Instant::now() + grace_period);
                        }
                        Some(AgentEvent::Error(reason)) => {
                            debug!(client_id = %id, reason = %reason, "tunnel agent reported an error");
                            break;
                        }
                        Some(AgentEvent::End) | None => break,
                    }
                }
                _ = sleep => {
                    debug!(client_id = %id, "grace period expired, closing client");
                    break;
                }
            }
        }
        if !closed.swap(true, Ordering::SeqCst) {
            agent.destroy();
            close_notify.notify_waiters();
            info!(client_id = %id, "client closed");
        }
    });
}
