//! Server lifecycle and connection acceptance.
//!
//! The [`Server`] owns the listening socket, the acceptor task, and the
//! connection registry for one running period. `start` binds the socket,
//! builds a fresh verb map, and launches the acceptor; `stop` halts
//! acceptance, waits for the acceptor to unwind, and optionally
//! terminates every registered connection. Both are safe to call from
//! any task; running-state transitions are broadcast on a watch channel.

use crate::config::Config;
use crate::connection::Connection;
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::verbs::VerbMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Listen backlog for the accepting socket
const LISTEN_BACKLOG: i32 = 1024;

/// Observable running state, broadcast on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Running { local_addr: SocketAddr },
}

impl ServerState {
    pub fn is_running(self) -> bool {
        matches!(self, ServerState::Running { .. })
    }
}

/// Server lifecycle errors
#[derive(Debug)]
pub enum ServerError {
    /// `start` was called while the server is already running
    AlreadyRunning,
    /// The listening socket could not be bound
    Bind(io::Error),
    /// The acceptor loop failed while the server was still running
    Accept(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::AlreadyRunning => write!(f, "Server is already running"),
            ServerError::Bind(e) => write!(f, "Failed to bind listening socket: {e}"),
            ServerError::Accept(e) => write!(f, "Acceptor loop failed: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::AlreadyRunning => None,
            ServerError::Bind(e) | ServerError::Accept(e) => Some(e),
        }
    }
}

/// State owned by one running period, torn down as a unit by `stop`
struct ActiveRun {
    shutdown: CancellationToken,
    acceptor: JoinHandle<Result<(), io::Error>>,
}

/// SMTP server instance
pub struct Server {
    config: Arc<Config>,
    registry: Arc<ConnectionRegistry>,
    state: watch::Sender<ServerState>,
    run: Mutex<Option<ActiveRun>>,
}

impl Server {
    /// Create a new server instance. No socket is bound until [`start`].
    ///
    /// [`start`]: Server::start
    pub fn new(config: Config) -> Self {
        let (state, _) = watch::channel(ServerState::Stopped);
        Server {
            config: Arc::new(config),
            registry: Arc::new(ConnectionRegistry::new()),
            state,
            run: Mutex::new(None),
        }
    }

    /// Whether the server is currently accepting connections.
    pub fn is_running(&self) -> bool {
        self.state.borrow().is_running()
    }

    /// The bound listen address, available while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match *self.state.borrow() {
            ServerState::Running { local_addr } => Some(local_addr),
            ServerState::Stopped => None,
        }
    }

    /// The concrete bound port, available while running. Useful when the
    /// server was configured with an ephemeral port.
    pub fn port_number(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    /// Subscribe to running-state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Number of connections currently being processed.
    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    /// Bind the listening socket and launch the acceptor loop.
    ///
    /// Returns once the socket is bound and the loop is running; it does
    /// not wait for any client activity. Fails with
    /// [`ServerError::AlreadyRunning`] if called while running and with
    /// [`ServerError::Bind`] if the socket cannot be bound, leaving the
    /// server stopped in the latter case.
    pub async fn start(&self) -> Result<(), ServerError> {
        let mut run = self.run.lock().await;
        if run.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = bind_listener(&self.config.listen).map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;

        // Fresh verb map per run; every connection of this run sees the
        // same fully populated table
        let verbs = Arc::new(VerbMap::builtin());
        let shutdown = CancellationToken::new();

        self.transition(ServerState::Running { local_addr });
        info!(addr = %local_addr, "Server listening");

        let acceptor = tokio::spawn(accept_loop(
            listener,
            verbs,
            Arc::clone(&self.registry),
            Arc::clone(&self.config),
            shutdown.clone(),
        ));

        *run = Some(ActiveRun { shutdown, acceptor });
        Ok(())
    }

    /// Stop the server, terminating any active connections.
    pub async fn stop(&self) -> Result<(), ServerError> {
        self.stop_with(true).await
    }

    /// Stop the server.
    ///
    /// Halts acceptance and waits for the acceptor task to unwind. When
    /// `kill_connections` is set, additionally closes and terminates
    /// every registered connection, waiting up to the configured
    /// shutdown timeout for the registry to drain. Calling while not
    /// running is a no-op. An acceptor fault captured during the run is
    /// returned here rather than swallowed.
    pub async fn stop_with(&self, kill_connections: bool) -> Result<(), ServerError> {
        let mut run = self.run.lock().await;
        let Some(ActiveRun { shutdown, acceptor }) = run.take() else {
            return Ok(());
        };

        shutdown.cancel();
        // The acceptor must be fully unwound before connections are touched
        let accept_result = acceptor.await;

        if kill_connections && !self.registry.is_empty() {
            let snapshot = self.registry.snapshot();
            debug!(connections = snapshot.len(), "Terminating active connections");
            for handle in snapshot {
                trace!(peer = %handle.peer(), "Closing connection");
                handle.close();
                handle.terminate();
            }

            let drain = tokio::time::timeout(
                Duration::from_secs(self.config.shutdown_timeout),
                self.registry.drained(),
            );
            if drain.await.is_err() {
                warn!(remaining = self.registry.len(), "Shutdown drain timed out");
            }
        }

        self.transition(ServerState::Stopped);
        info!("Server stopped");

        match accept_result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ServerError::Accept(e)),
            Err(e) => Err(ServerError::Accept(io::Error::other(e))),
        }
    }

    /// Atomically update the state and enqueue the notification.
    /// No-op transitions notify nobody.
    fn transition(&self, next: ServerState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
    }
}

/// Create the listening socket with address reuse enabled.
fn bind_listener(listen: &str) -> io::Result<TcpListener> {
    let addr: SocketAddr = listen.parse().map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid listen address '{listen}': {e}"),
        )
    })?;

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}

/// Accept connections until cancelled.
///
/// Runs as its own task for the lifetime of one running period. The only
/// suspension points are the cancellation wait and the accept itself.
/// Returns `Err` only for an accept failure without a pending stop; the
/// fault is logged here as well, since until the next `stop` call the
/// server would otherwise sit nominally running with no acceptor.
async fn accept_loop(
    listener: TcpListener,
    verbs: Arc<VerbMap>,
    registry: Arc<ConnectionRegistry>,
    config: Arc<Config>,
    shutdown: CancellationToken,
) -> Result<(), io::Error> {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            res = listener.accept() => res,
        };

        match accepted {
            Ok((stream, peer)) => {
                if shutdown.is_cancelled() {
                    // Stop raced the accept; close the stray endpoint
                    // instead of leaking it
                    drop(stream);
                    return Ok(());
                }

                debug!(peer = %peer, "New connection");
                launch_connection(
                    stream,
                    peer,
                    Arc::clone(&verbs),
                    Arc::clone(&registry),
                    Arc::clone(&config),
                );
            }
            // Listener torn down by a concurrent stop: expected, end quietly
            Err(_) if shutdown.is_cancelled() => return Ok(()),
            Err(e) => {
                error!(error = %e, "Accept failed; acceptor loop ending");
                return Err(e);
            }
        }
    }
}

/// Register a connection and launch its processing.
///
/// The handle is registered before the processing task is spawned, and a
/// supervisor task awaits the processing task's completion (success,
/// error, panic, or forced termination) before performing the single
/// registry removal.
fn launch_connection(
    stream: TcpStream,
    peer: SocketAddr,
    verbs: Arc<VerbMap>,
    registry: Arc<ConnectionRegistry>,
    config: Arc<Config>,
) {
    let close = CancellationToken::new();
    let kill = CancellationToken::new();
    let id = registry.add(ConnectionHandle::new(peer, close.clone(), kill.clone()));

    let conn = Connection::new(stream, peer, verbs, config, close);
    let processing = tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = kill.cancelled() => {
                // Dropping the processing future closes the stream
                debug!(peer = %peer, "Connection terminated");
                Ok(())
            }
            res = conn.process() => res,
        }
    });

    tokio::spawn(async move {
        match processing.await {
            Ok(Ok(())) => trace!(peer = %peer, "Connection finished"),
            Ok(Err(e)) => debug!(peer = %peer, error = %e, "Connection error"),
            Err(e) => warn!(peer = %peer, error = %e, "Connection task failed"),
        }
        registry.remove(id);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::time::timeout;

    const BOUNDED: Duration = Duration::from_secs(5);

    fn server() -> Server {
        Server::new(Config::default())
    }

    async fn connect(server: &Server) -> tokio::net::TcpStream {
        let addr = server.local_addr().unwrap();
        tokio::net::TcpStream::connect(addr).await.unwrap()
    }

    /// Connect and read the greeting, so the connection is known to be
    /// registered before the caller continues.
    async fn connect_greeted(server: &Server) -> BufReader<tokio::net::TcpStream> {
        let mut client = BufReader::new(connect(server).await);
        let mut banner = String::new();
        client.read_line(&mut banner).await.unwrap();
        assert!(banner.starts_with("220 "), "unexpected banner: {banner}");
        client
    }

    async fn wait_for_connections(server: &Server, expected: usize) {
        timeout(BOUNDED, async {
            while server.active_connections() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "registry never reached {expected} (at {})",
                server.active_connections()
            )
        });
    }

    #[tokio::test]
    async fn test_start_stop_round_trip() {
        let server = server();
        assert!(!server.is_running());
        assert!(server.port_number().is_none());

        server.start().await.unwrap();
        assert!(server.is_running());
        let port = server.port_number().unwrap();
        assert_ne!(port, 0);

        server.stop().await.unwrap();
        assert!(!server.is_running());
        assert!(server.port_number().is_none());
    }

    #[tokio::test]
    async fn test_start_while_running_fails() {
        let server = server();
        server.start().await.unwrap();
        let port = server.port_number();

        let err = server.start().await.unwrap_err();
        assert!(matches!(err, ServerError::AlreadyRunning));

        // State unchanged by the failed start
        assert!(server.is_running());
        assert_eq!(server.port_number(), port);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_while_stopped_is_noop() {
        let server = server();
        let mut state = server.subscribe();

        server.stop().await.unwrap();
        server.stop_with(false).await.unwrap();

        assert!(!server.is_running());
        // No notification fired for the no-op stops
        assert!(!state.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_server_stopped() {
        let holder = server();
        holder.start().await.unwrap();
        let taken = holder.local_addr().unwrap();

        let config = Config {
            listen: taken.to_string(),
            ..Config::default()
        };
        let server = Server::new(config);
        let mut state = server.subscribe();

        let err = server.start().await.unwrap_err();
        assert!(matches!(err, ServerError::Bind(_)));
        assert!(!server.is_running());
        // Failed start fires no notification
        assert!(!state.has_changed().unwrap());

        holder.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_listen_address_is_bind_error() {
        let config = Config {
            listen: "not-an-address".to_string(),
            ..Config::default()
        };
        let server = Server::new(config);
        let err = server.start().await.unwrap_err();
        assert!(matches!(err, ServerError::Bind(_)));
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_notification_fires_once_per_transition() {
        let server = server();
        let mut state = server.subscribe();

        server.start().await.unwrap();
        state.changed().await.unwrap();
        assert!(state.borrow_and_update().is_running());
        assert!(!state.has_changed().unwrap());

        server.stop().await.unwrap();
        state.changed().await.unwrap();
        assert!(!state.borrow_and_update().is_running());
        assert!(!state.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let server = server();
        server.start().await.unwrap();
        server.stop().await.unwrap();

        server.start().await.unwrap();
        assert!(server.is_running());

        // The fresh run serves commands (new verb map, new acceptor)
        let mut client = connect_greeted(&server).await;
        client.get_mut().write_all(b"NOOP\r\n").await.unwrap();
        let mut reply = String::new();
        client.read_line(&mut reply).await.unwrap();
        assert!(reply.starts_with("250 "));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_tracks_connection_lifecycle() {
        let server = server();
        server.start().await.unwrap();
        assert_eq!(server.active_connections(), 0);

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(connect_greeted(&server).await);
        }
        wait_for_connections(&server, 3).await;

        // Completing each session removes its registry entry
        for mut client in clients {
            client.get_mut().write_all(b"QUIT\r\n").await.unwrap();
            let mut reply = String::new();
            client.read_line(&mut reply).await.unwrap();
            assert!(reply.starts_with("221 "));
        }
        wait_for_connections(&server, 0).await;

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_kills_idle_connections() {
        let server = server();
        server.start().await.unwrap();

        let mut clients = Vec::new();
        for _ in 0..5 {
            clients.push(connect_greeted(&server).await);
        }
        wait_for_connections(&server, 5).await;

        // All five sit idle; stop must still return within a bound
        timeout(BOUNDED, server.stop()).await.unwrap().unwrap();
        assert!(!server.is_running());
        assert_eq!(server.active_connections(), 0);

        // Each client sees the close: a 421 goodbye and then EOF
        for client in &mut clients {
            let mut out = String::new();
            timeout(BOUNDED, client.read_to_string(&mut out))
                .await
                .unwrap()
                .unwrap();
            assert!(out.is_empty() || out.starts_with("421 "), "got: {out}");
        }
    }

    #[tokio::test]
    async fn test_stop_without_kill_leaves_connections_running() {
        let server = server();
        server.start().await.unwrap();

        let mut client = connect_greeted(&server).await;
        wait_for_connections(&server, 1).await;

        server.stop_with(false).await.unwrap();
        assert!(!server.is_running());

        // New acceptance has ceased but the accepted session still works
        assert_eq!(server.active_connections(), 1);
        client.get_mut().write_all(b"NOOP\r\n").await.unwrap();
        let mut reply = String::new();
        client.read_line(&mut reply).await.unwrap();
        assert!(reply.starts_with("250 "));

        client.get_mut().write_all(b"QUIT\r\n").await.unwrap();
        reply.clear();
        client.read_line(&mut reply).await.unwrap();
        assert!(reply.starts_with("221 "));
        wait_for_connections(&server, 0).await;
    }

    #[tokio::test]
    async fn test_ephemeral_port_scenario() {
        // Configure port 0, start, observe a concrete port, serve one
        // client, and stop within a bound
        let server = server();
        server.start().await.unwrap();

        assert!(server.is_running());
        let port = server.port_number().unwrap();
        assert_ne!(port, 0);

        let client = connect(&server).await;
        drop(client);

        timeout(BOUNDED, server.stop()).await.unwrap().unwrap();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_immediate_stop_with_no_connections() {
        let server = server();
        server.start().await.unwrap();
        server.stop().await.unwrap();
        assert!(!server.is_running());
        assert_eq!(server.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_no_acceptance_after_stop() {
        let server = server();
        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();
        server.stop().await.unwrap();

        let refused = tokio::net::TcpStream::connect(addr).await;
        assert!(refused.is_err());
    }
}
