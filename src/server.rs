//! Relay server: newline-delimited JSON over TCP
//!
//! Each TCP connection is one session. Lines read from the socket are
//! [`ClientRequest`]s; every [`ServerEvent`] for the session is written back
//! as one JSON line by a per-connection writer task.

use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{RelayError, Result};
use crate::multiplexer::NotificationMultiplexer;
use crate::protocol::{ClientRequest, ServerEvent};
use crate::session::{ClientTransport, SessionManager};

/// Events buffered per client before forwarding waits on the socket
const OUTBOUND_QUEUE_SIZE: usize = 256;

/// Outbound queues of connected clients, keyed by session id
#[derive(Debug, Default)]
struct ClientWriters {
    senders: DashMap<String, mpsc::Sender<ServerEvent>>,
}

#[async_trait]
impl ClientTransport for ClientWriters {
    async fn forward_to_client(&self, session_id: &str, event: ServerEvent) -> Result<()> {
        let sender = self
            .senders
            .get(session_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| RelayError::unknown_session(session_id))?;
        sender
            .send(event)
            .await
            .map_err(|_| RelayError::transport(format!("client {session_id} disconnected")))
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub running: bool,
    pub uptime_seconds: u64,
    pub total_connections: u64,
    pub active_connections: usize,
    pub sessions: usize,
}

#[derive(Debug, Default)]
struct ServerState {
    running: bool,
    start_time: Option<chrono::DateTime<chrono::Utc>>,
    local_addr: Option<SocketAddr>,
    total_connections: u64,
    active_connections: usize,
}

/// TCP front end for a [`NotificationMultiplexer`]
pub struct RelayServer {
    bind_address: String,
    sessions: Arc<SessionManager>,
    writers: Arc<ClientWriters>,
    shutdown_tx: broadcast::Sender<()>,
    state: Arc<RwLock<ServerState>>,
}

impl RelayServer {
    pub fn new(multiplexer: &NotificationMultiplexer) -> Self {
        let writers = Arc::new(ClientWriters::default());
        let sessions = Arc::new(
            multiplexer.session_manager(Arc::clone(&writers) as Arc<dyn ClientTransport>),
        );
        let (shutdown_tx, _) = broadcast::channel(16);

        Self {
            bind_address: multiplexer.config().bind_address.clone(),
            sessions,
            writers,
            shutdown_tx,
            state: Arc::new(RwLock::new(ServerState::default())),
        }
    }

    /// Listen on a different address than the configured one
    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    /// Bind and start accepting clients; returns the bound address
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut state = self.state.write().await;
        if state.running {
            return Err(RelayError::config("relay server is already running"));
        }

        let listener = TcpListener::bind(&self.bind_address).await?;
        let local_addr = listener.local_addr()?;

        state.running = true;
        state.start_time = Some(chrono::Utc::now());
        state.local_addr = Some(local_addr);
        drop(state);

        info!(address = %local_addr, "Relay server listening");

        let server = self.clone();
        tokio::spawn(async move {
            server.accept_connections(listener).await;
        });

        Ok(local_addr)
    }

    /// Stop accepting, close every client and tear down all sessions
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.running {
            return Ok(());
        }

        info!("Stopping relay server");
        let _ = self.shutdown_tx.send(());
        self.sessions.disconnect_all().await;

        state.running = false;
        info!("Relay server stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.state.read().await.running
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state.read().await.local_addr
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub async fn stats(&self) -> ServerStats {
        let state = self.state.read().await;
        ServerStats {
            running: state.running,
            uptime_seconds: state
                .start_time
                .map(|start| (chrono::Utc::now() - start).num_seconds() as u64)
                .unwrap_or(0),
            total_connections: state.total_connections,
            active_connections: state.active_connections,
            sessions: self.sessions.session_count(),
        }
    }

    async fn accept_connections(&self, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            // Subscribed before the state lock, which `stop` holds while signalling
                            let connection_shutdown = self.shutdown_tx.subscribe();
                            {
                                let mut state = self.state.write().await;
                                if !state.running {
                                    debug!(peer = %addr, "Dropping connection accepted during shutdown");
                                    break;
                                }
                                state.total_connections += 1;
                                state.active_connections += 1;
                            }

                            let session_id = uuid::Uuid::new_v4().to_string();
                            info!(session_id = %session_id, peer = %addr, "Client connected");

                            let server = self.clone();
                            tokio::spawn(async move {
                                server
                                    .handle_connection(session_id, stream, addr, connection_shutdown)
                                    .await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("Accept loop shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        session_id: String,
        stream: TcpStream,
        addr: SocketAddr,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let (reader, mut writer) = stream.into_split();
        let mut buf_reader = BufReader::new(reader);

        let (event_tx, mut event_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_QUEUE_SIZE);
        self.writers.senders.insert(session_id.clone(), event_tx);

        let writer_session = session_id.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let line = match serde_json::to_string(&event) {
                    Ok(json) => format!("{json}\n"),
                    Err(e) => {
                        error!(error = %e, "Failed to serialize event");
                        continue;
                    }
                };
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    debug!(session_id = %writer_session, error = %e, "Client write failed");
                    break;
                }
            }
        });

        self.sessions.on_connect(&session_id, &addr.to_string()).await;

        let mut line = String::new();
        loop {
            tokio::select! {
                read_result = buf_reader.read_line(&mut line) => {
                    match read_result {
                        Ok(0) => {
                            info!(session_id = %session_id, "Connection closed by client");
                            break;
                        }
                        Ok(_) => {
                            self.handle_line(&session_id, line.trim()).await;
                            line.clear();
                        }
                        Err(e) => {
                            warn!(session_id = %session_id, error = %e, "Error reading from client");
                            break;
                        }
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!(session_id = %session_id, "Connection shutting down");
                    break;
                }
            }
        }

        if let Err(e) = self.sessions.on_disconnect(&session_id).await {
            warn!(session_id = %session_id, error = %e, "Session teardown incomplete");
        }
        self.writers.senders.remove(&session_id);
        writer_task.abort();

        {
            let mut state = self.state.write().await;
            state.active_connections = state.active_connections.saturating_sub(1);
        }
        debug!(session_id = %session_id, "Connection handler completed");
    }

    async fn handle_line(&self, session_id: &str, line: &str) {
        if line.is_empty() {
            return;
        }

        match serde_json::from_str::<ClientRequest>(line) {
            Ok(request) => {
                // Failures were already reported to the client
                let _ = self.sessions.handle_request(session_id, request).await;
            }
            Err(e) => {
                warn!(session_id, error = %e, "Failed to parse client request");
                let _ = self
                    .writers
                    .forward_to_client(session_id, ServerEvent::error(format!("Invalid request: {e}")))
                    .await;
            }
        }
    }
}

impl Clone for RelayServer {
    fn clone(&self) -> Self {
        Self {
            bind_address: self.bind_address.clone(),
            sessions: Arc::clone(&self.sessions),
            writers: Arc::clone(&self.writers),
            shutdown_tx: self.shutdown_tx.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::connection::MemoryConnection;

    fn server() -> (NotificationMultiplexer, RelayServer) {
        let (conn, _handle) = MemoryConnection::new();
        let multiplexer = NotificationMultiplexer::with_connection(
            Box::new(conn),
            RelayConfig::default().with_bind_address("127.0.0.1:0"),
        )
        .unwrap();
        let server = RelayServer::new(&multiplexer);
        (multiplexer, server)
    }

    #[tokio::test]
    async fn test_server_start_stop() {
        let (_multiplexer, server) = server();
        assert!(!server.is_running().await);

        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.is_running().await);
        assert!(server.start().await.is_err());

        server.stop().await.unwrap();
        assert!(!server.is_running().await);
        assert_eq!(server.stats().await.sessions, 0);
    }

    #[tokio::test]
    async fn test_connection_accepted_before_stop_is_torn_down() {
        let (_multiplexer, server) = server();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        let shutdown_rx = server.shutdown_tx.subscribe();
        server.shutdown_tx.send(()).unwrap();

        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            server.handle_connection("late".to_string(), stream, peer, shutdown_rx),
        )
        .await
        .expect("handler must observe a shutdown sent before it started");
        assert_eq!(server.sessions().session_count(), 0);
        assert!(server.writers.senders.is_empty());

        let mut received = Vec::new();
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            tokio::io::AsyncReadExt::read_to_end(&mut client, &mut received),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_forward_to_unknown_session_fails() {
        let writers = ClientWriters::default();
        let err = writers
            .forward_to_client("nobody", ServerEvent::error("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UnknownSession { .. }));
    }
}
