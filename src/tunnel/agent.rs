//! Tunnel Agent: owns one client's inbound TCP listener and socket pool.
//!
//! All mutable pool state (`available`, `waiters`, `connected_count`,
//! `closed`) lives inside a single actor task so that accept, close, and
//! `create_connection` bookkeeping never interleaves mid-update (§5,
//! single-writer-per-agent).

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Default cap on concurrently admitted sockets for one client (§3).
pub const DEFAULT_MAX_SOCKETS: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("tunnel agent already started")]
    AlreadyStarted,
    #[error("tunnel agent is closed")]
    Closed,
    #[error("tunnel listener error: {0}")]
    Io(#[from] std::io::Error),
}

/// Presence/lifecycle events a Client subscribes to (§9: typed channel
/// realization of the source's event emitter).
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// `connected_count` crossed 0 -> 1.
    Online,
    /// `connected_count` crossed 1 -> 0 (agent still open).
    Offline,
    /// The listener itself failed; the agent is now closed.
    Error(String),
    /// The agent finished closing (listener end).
    End,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct AgentStats {
    pub connected_sockets: u32,
}

/// A socket on loan to a forwarder. Dropping it (however it happens —
/// normal completion, panic unwind, or an abandoned waiter) notifies the
/// agent actor exactly once so `connected_count` bookkeeping always runs
/// (§4.1 edge case: "a socket delivered to a waiter that has since been
/// abandoned ... must still be either consumed or closed").
pub struct CheckedOutSocket {
    id: u64,
    stream: Arc<TcpStream>,
    release_tx: mpsc::UnboundedSender<Command>,
}

impl CheckedOutSocket {
    /// Borrow the underlying socket. Callers that need an owned I/O object
    /// (hyper's handshake, a raw upgrade splice) clone this `Arc` and keep
    /// the `CheckedOutSocket` itself alive for as long as the clone is in
    /// use — dropping it early would report the socket back to the agent
    /// (and decrement `connected_count`) while the exchange is still live.
    pub fn stream(&self) -> &Arc<TcpStream> {
        &self.stream
    }
}

impl Drop for CheckedOutSocket {
    fn drop(&mut self) {
        let _ = self.release_tx.send(Command::SocketReleased(self.id));
    }
}

enum Command {
    Listen {
        bind_addr: SocketAddr,
        reply: oneshot::Sender<Result<u16, AgentError>>,
    },
    CreateConnection {
        reply: oneshot::Sender<Result<CheckedOutSocket, AgentError>>,
    },
    Stats {
        reply: oneshot::Sender<AgentStats>,
    },
    Destroy,
    IdleSocketClosed(u64),
    SocketReleased(u64),
}

/// Cheap, cloneable handle to a running agent actor.
#[derive(Clone)]
pub struct TunnelAgent {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl TunnelAgent {
    /// Spawn a new agent actor with the given per-client socket cap.
    /// Returns the handle plus the event receiver the owning Client
    /// subscribes to (there is exactly one subscriber, so an mpsc channel
    /// is sufficient — no need for `broadcast`).
    pub fn spawn(max_sockets: u32) -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let actor = Actor {
            listener: None,
            available: VecDeque::new(),
            waiters: VecDeque::new(),
            connected_count: 0,
            max_sockets,
            started: false,
            closed: false,
            next_socket_id: 0,
            consecutive_accept_errors: 0,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            events: event_tx,
        };
        tokio::spawn(actor.run());
        (Self { cmd_tx }, event_rx)
    }

    pub async fn listen(&self, bind_addr: SocketAddr) -> Result<u16, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Listen { bind_addr, reply })?;
        rx.await.map_err(|_| AgentError::Closed)?
    }

    pub async fn create_connection(&self) -> Result<CheckedOutSocket, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CreateConnection { reply })?;
        rx.await.map_err(|_| AgentError::Closed)?
    }

    pub async fn stats(&self) -> AgentStats {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Stats { reply }).is_err() {
            return AgentStats::default();
        }
        rx.await.unwrap_or_default()
    }

    pub fn destroy(&self) {
        let _ = self.cmd_tx.send(Command::Destroy);
    }

    fn send(&self, cmd: Command) -> Result<(), AgentError> {
        self.cmd_tx.send(cmd).map_err(|_| AgentError::Closed)
    }
}

struct IdleEntry {
    id: u64,
    stream: Arc<TcpStream>,
    cancel_watch: oneshot::Sender<()>,
}

struct Actor {
    listener: Option<TcpListener>,
    available: VecDeque<IdleEntry>,
    waiters: VecDeque<oneshot::Sender<Result<CheckedOutSocket, AgentError>>>,
    connected_count: u32,
    max_sockets: u32,
    started: bool,
    closed: bool,
    next_socket_id: u64,
    consecutive_accept_errors: u32,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<AgentEvent>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                accepted = accept_when_listening(&self.listener) => {
                    if self.handle_accept(accepted) {
                        break;
                    }
                }
            }
        }
        debug!("tunnel agent actor exiting");
    }

    /// Returns true if the actor should stop running.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Listen { bind_addr, reply } => {
                let result = self.do_listen(bind_addr).await;
                let _ = reply.send(result);
                false
            }
            Command::CreateConnection { reply } => {
                self.do_create_connection(reply);
                false
            }
            Command::Stats { reply } => {
                let _ = reply.send(AgentStats {
                    connected_sockets: self.connected_count,
                });
                false
            }
            Command::Destroy => {
                self.do_destroy();
                true
            }
            Command::IdleSocketClosed(id) => {
                self.reap_idle(id);
                false
            }
            Command::SocketReleased(id) => {
                self.on_socket_released(id);
                false
            }
        }
    }

    async fn do_listen(&mut self, bind_addr: SocketAddr) -> Result<u16, AgentError> {
        if self.started {
            return Err(AgentError::AlreadyStarted);
        }
        let listener = TcpListener::bind(bind_addr).await?;
        let port = listener.local_addr()?.port();
        self.listener = Some(listener);
        self.started = true;
        info!(port, "tunnel agent listening");
        Ok(port)
    }

    fn do_create_connection(&mut self, reply: oneshot::Sender<Result<CheckedOutSocket, AgentError>>) {
        if self.closed {
            let _ = reply.send(Err(AgentError::Closed));
            return;
        }
        if let Some(entry) = self.available.pop_front() {
            let _ = entry.cancel_watch.send(());
            let checked_out = CheckedOutSocket {
                id: entry.id,
                stream: entry.stream,
                release_tx: self.cmd_tx.clone(),
            };
            let _ = reply.send(Ok(checked_out));
            return;
        }
        self.waiters.push_back(reply);
    }

    fn do_destroy(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.listener = None;
        for entry in self.available.drain(..) {
            let _ = entry.cancel_watch.send(());
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(AgentError::Closed));
        }
        let _ = self.events.send(AgentEvent::End);
        debug!("tunnel agent destroyed");
    }

    /// A run of this many back-to-back `accept()` failures with no
    /// successful accept in between is treated as the listener having died
    /// outright, rather than a sequence of transient per-connection errors.
    const MAX_CONSECUTIVE_ACCEPT_ERRORS: u32 = 16;

    /// Returns true if this accept tipped the agent into fatal shutdown
    /// (listener presumed dead), in which case the caller should stop
    /// polling it — the agent has already destroyed itself.
    fn handle_accept(&mut self, accepted: std::io::Result<(TcpStream, SocketAddr)>) -> bool {
        let (stream, peer) = match accepted {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "tunnel accept error");
                self.consecutive_accept_errors += 1;
                if self.consecutive_accept_errors >= Self::MAX_CONSECUTIVE_ACCEPT_ERRORS {
                    // The listener itself appears dead (§7 `error` ->
                    // Client `close()` -> Manager `remove_client`), not
                    // just a transient per-connection hiccup.
                    let reason = e.to_string();
                    let _ = self.events.send(AgentEvent::Error(reason));
                    self.do_destroy();
                    return true;
                }
                return false;
            }
        };
        self.consecutive_accept_errors = 0;

        if self.closed {
            // Race between destroy() and an in-flight accept (§4.1 edge case).
            drop(stream);
            return false;
        }

        if self.connected_count >= self.max_sockets {
            warn!(peer = %peer, cap = self.max_sockets, "tunnel socket cap exceeded, dropping");
            drop(stream);
            return false;
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY on tunnel socket");
        }

        if self.connected_count == 0 {
            let _ = self.events.send(AgentEvent::Online);
        }
        self.connected_count += 1;

        let id = self.next_socket_id;
        self.next_socket_id += 1;
        let stream = Arc::new(stream);

        if let Some(waiter) = self.waiters.pop_front() {
            // Deferred delivery (§9): never complete a waiter synchronously
            // from within accept processing.
            let checked_out = CheckedOutSocket {
                id,
                stream,
                release_tx: self.cmd_tx.clone(),
            };
            tokio::spawn(async move {
                // If the receiver already dropped, the returned socket's
                // Drop impl still reports the release on its own.
                if let Err(Ok(socket)) = waiter.send(Ok(checked_out)) {
                    drop(socket);
                }
            });
            debug!(socket_id = id, "tunnel socket delivered to waiter");
        } else {
            let (cancel_tx, cancel_rx) = oneshot::channel();
            let watch_stream = Arc::clone(&stream);
            let cmd_tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                tokio::select! {
                    result = watch_stream.readable() => {
                        if result.is_ok() {
                            let _ = cmd_tx.send(Command::IdleSocketClosed(id));
                        }
                    }
                    _ = cancel_rx => {}
                }
            });
            self.available.push_back(IdleEntry {
                id,
                stream,
                cancel_watch: cancel_tx,
            });
            debug!(socket_id = id, "tunnel socket idle");
        }
        false
    }

    /// An idle socket's readability watcher fired. If the socket is still
    /// sitting in `available` this really is a peer close (or stray data
    /// with nobody to read it); reap it. If it's gone, the watcher lost the
    /// race to checkout-time cancellation and this is a stale, harmless
    /// notification (§4.1 edge case: "an available socket may close while
    /// idle; it must silently vanish from available").
    fn reap_idle(&mut self, id: u64) {
        if let Some(pos) = self.available.iter().position(|e| e.id == id) {
            self.available.remove(pos);
            self.note_socket_closed();
            debug!(socket_id = id, "idle tunnel socket closed, reaped");
        }
    }

    fn on_socket_released(&mut self, id: u64) {
        // Released sockets are never in `available` (only idle sockets are);
        // this always represents the end of an active exchange.
        let _ = id;
        self.note_socket_closed();
    }

    fn note_socket_closed(&mut self) {
        if self.connected_count > 0 {
            self.connected_count -= 1;
        }
        if self.connected_count == 0 && !self.closed {
            let _ = self.events.send(AgentEvent::Offline);
        }
    }
}

async fn accept_when_listening(
    listener: &Option<TcpListener>,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn loopback() -> SocketAddr {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)
    }

    #[tokio::test]
    async fn listen_twice_fails() {
        let (agent, _events) = TunnelAgent::spawn(DEFAULT_MAX_SOCKETS);
        agent.listen(loopback()).await.unwrap();
        let err = agent.listen(loopback()).await.unwrap_err();
        assert!(matches!(err, AgentError::AlreadyStarted));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_connection_serves_accepted_socket() {
        let (agent, mut events) = TunnelAgent::spawn(DEFAULT_MAX_SOCKETS);
        let port = agent.listen(loopback()).await.unwrap();

        let dial = tokio::spawn(async move {
            TcpStream::connect((Ipv4Addr::LOCALHOST, port))
                .await
                .unwrap()
        });
        let _peer_side = dial.await.unwrap();

        assert!(matches!(events.recv().await, Some(AgentEvent::Online)));

        let checked_out = agent.create_connection().await.unwrap();
        assert_eq!(agent.stats().await.connected_sockets, 1);
        drop(checked_out);

        // Releasing the only live socket must fire Offline.
        assert!(matches!(events.recv().await, Some(AgentEvent::Offline)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn waiter_is_served_fifo() {
        let (agent, _events) = TunnelAgent::spawn(DEFAULT_MAX_SOCKETS);
        let port = agent.listen(loopback()).await.unwrap();

        let agent_clone = agent.clone();
        let waiter = tokio::spawn(async move { agent_clone.create_connection().await });

        // Give the waiter a moment to register before the socket arrives.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let _peer = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .await
            .unwrap();

        let checked_out = waiter.await.unwrap().unwrap();
        assert_eq!(agent.stats().await.connected_sockets, 1);
        drop(checked_out);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn destroy_completes_waiters_with_closed() {
        let (agent, _events) = TunnelAgent::spawn(DEFAULT_MAX_SOCKETS);
        agent.listen(loopback()).await.unwrap();

        let agent_clone = agent.clone();
        let waiter = tokio::spawn(async move { agent_clone.create_connection().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        agent.destroy();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(AgentError::Closed)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cap_exceeded_sockets_are_dropped() {
        let (agent, mut events) = TunnelAgent::spawn(2);
        let port = agent.listen(loopback()).await.unwrap();

        for _ in 0..3 {
            let mut s = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
                .await
                .unwrap();
            // Give the actor a chance to process the accept before dialing again.
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let mut buf = [0u8; 1];
            // The third connection should observe EOF quickly since the
            // broker closes it without ever reading or writing.
            let _ = s.write_all(b"x").await;
            let _ = s.read(&mut buf).await;
        }

        assert!(matches!(events.recv().await, Some(AgentEvent::Online)));
        assert_eq!(agent.stats().await.connected_sockets, 2);
    }
}
