//! Connection state for a remote compile server.
//!
//! A [`TransportSession`] is either fully connected (process handle, server
//! address, connection id and both context ids all valid) or fully
//! disconnected. Callers never observe anything in between: the state is
//! swapped as a whole under a mutex that is never held across an `.await`.
//!
//! Every [`TransportSession::disconnect`] bumps the session generation. A
//! connect that started under an older generation never publishes its
//! contexts; it releases them on the server and fails instead.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use oopjit_common::{FailureReason, TransportConfig};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::process::ProcessHandle;
use crate::wire::{ClientMessage, CodeGenRequest, ServerMessage, read_frame, write_frame};
use crate::TransportError;

/// Upper bound for the best-effort context cleanup sent on disconnect.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct Connection {
    /// Duplicated handle to the server process.
    pub process: ProcessHandle,
    pub addr: SocketAddr,
    pub connection_id: Uuid,
    pub thread_context_id: u64,
    pub script_context_id: u64,
}

#[derive(Debug, Clone, Default)]
pub enum SessionState {
    Connected(Connection),
    #[default]
    Disconnected,
}

#[derive(Debug)]
pub struct TransportSession {
    state: Mutex<SessionState>,
    generation: AtomicU64,
    connect_lock: tokio::sync::Mutex<()>,
    config: TransportConfig,
}

impl TransportSession {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            state: Mutex::new(SessionState::Disconnected),
            generation: AtomicU64::new(0),
            connect_lock: tokio::sync::Mutex::new(()),
            config,
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A copy of the current state.
    pub fn snapshot(&self) -> SessionState {
        self.state().clone()
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.state(), SessionState::Connected(_))
    }

    pub fn connection(&self) -> Option<Connection> {
        match &*self.state() {
            SessionState::Connected(connection) => Some(connection.clone()),
            SessionState::Disconnected => None,
        }
    }

    /// Number of explicit disconnects so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn connection_id(&self) -> Option<Uuid> {
        match &*self.state() {
            SessionState::Connected(connection) => Some(connection.connection_id),
            SessionState::Disconnected => None,
        }
    }

    /// Establishes the session, retrying while the server is not listening
    /// yet.
    ///
    /// Retries back off linearly up to the configured cap and stop after the
    /// configured number of attempts. The target process is watched during
    /// every backoff, so a server that dies aborts the loop at once. Calling
    /// this on a session already connected with `connection_id` is a no-op.
    pub async fn connect(
        &self,
        target: &ProcessHandle,
        addr: SocketAddr,
        connection_id: Uuid,
    ) -> Result<(), TransportError> {
        self.connect_at(self.generation(), target, addr, connection_id)
            .await
    }

    /// Like [`Self::connect`], but fails with
    /// [`TransportError::StaleResponse`] once the session has been
    /// disconnected after `generation` was observed.
    pub async fn connect_at(
        &self,
        generation: u64,
        target: &ProcessHandle,
        addr: SocketAddr,
        connection_id: Uuid,
    ) -> Result<(), TransportError> {
        let _guard = self.connect_lock.lock().await;
        if self.generation() != generation {
            debug!(%connection_id, "Session disconnected before connecting");
            return Err(TransportError::StaleResponse);
        }
        match self.connection_id() {
            Some(current) if current == connection_id => return Ok(()),
            Some(_) => self.teardown().await,
            None => {}
        }

        let max_attempts = self.config.max_connect_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);
            if target.has_exited() {
                warn!(pid = target.pid(), "Compile server exited before connecting");
                return Err(TransportError::ServerExited);
            }

            let err = match handshake(addr, connection_id, self.config.max_frame_size).await {
                Ok((thread_context_id, script_context_id)) => {
                    let connection = Connection {
                        process: target.duplicate(),
                        addr,
                        connection_id,
                        thread_context_id,
                        script_context_id,
                    };
                    return self.publish(generation, connection, attempt).await;
                }
                Err(err) => err,
            };

            if !is_recoverable(&err) {
                warn!(%addr, %err, "Compile server handshake failed");
                return Err(err);
            }
            if attempt >= max_attempts {
                warn!(%addr, attempts = attempt, "Giving up on compile server");
                return Err(TransportError::RetriesExhausted { attempts: attempt });
            }

            let delay = self.config.backoff(attempt);
            debug!(%addr, attempt, ?delay, %err, "Compile server not ready, retrying");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = target.exited(self.config.process_poll_interval()) => {
                    warn!(pid = target.pid(), "Compile server exited while connecting");
                    return Err(TransportError::ServerExited);
                }
            }
            if self.generation() != generation {
                debug!(%addr, %connection_id, attempt, "Session disconnected while connecting");
                return Err(TransportError::StaleResponse);
            }
        }
    }

    /// Installs a freshly handshaken connection unless a disconnect raced
    /// with the handshake, in which case its contexts are released again.
    async fn publish(&self, generation: u64, connection: Connection, attempt: u32) -> Result<(), TransportError> {
        {
            let mut state = self.state();
            // disconnect bumps the generation before it takes the state
            if self.generation() == generation {
                info!(addr = %connection.addr, connection_id = %connection.connection_id, attempt, "Connected to compile server");
                *state = SessionState::Connected(connection);
                return Ok(());
            }
        }
        debug!(connection_id = %connection.connection_id, "Session disconnected during handshake, releasing contexts");
        self.release(&connection).await;
        Err(TransportError::StaleResponse)
    }

    /// Tears the session down and invalidates every connect and call that
    /// started before. A second call finds it disconnected and does nothing.
    pub async fn disconnect(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.teardown().await;
    }

    /// Drops the current connection without invalidating in-flight connects.
    pub(crate) async fn teardown(&self) {
        let previous = std::mem::take(&mut *self.state());
        let SessionState::Connected(connection) = previous else {
            return;
        };

        self.release(&connection).await;
        info!(connection_id = %connection.connection_id, "Disconnected from compile server");
    }

    /// Best-effort close of the connection's contexts on the server.
    async fn release(&self, connection: &Connection) {
        if connection.process.has_exited() {
            debug!(connection_id = %connection.connection_id, "Server already gone, skipping cleanup");
            return;
        }
        let cleanup = cleanup(connection, self.config.max_frame_size);
        match tokio::time::timeout(CLEANUP_TIMEOUT, cleanup).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(%err, "Context cleanup failed"),
            Err(_) => debug!("Context cleanup timed out"),
        }
    }

    /// Sends one code generation request over a fresh stream.
    pub async fn call(&self, connection: &Connection, request: CodeGenRequest) -> Result<ServerMessage, TransportError> {
        let max = self.config.max_frame_size;
        let mut stream = TcpStream::connect(connection.addr).await?;
        hello(&mut stream, connection.connection_id, max).await?;
        exchange(&mut stream, &ClientMessage::RemoteCodeGen(request), max).await
    }

    /// Asks the server to stop accepting connections.
    pub async fn request_server_shutdown(&self, addr: SocketAddr, connection_id: Uuid) -> Result<(), TransportError> {
        let max = self.config.max_frame_size;
        let mut stream = TcpStream::connect(addr).await?;
        hello(&mut stream, connection_id, max).await?;
        expect_ok(exchange(&mut stream, &ClientMessage::Shutdown, max).await?)
    }
}

fn is_recoverable(err: &TransportError) -> bool {
    use std::io::ErrorKind;
    match err {
        TransportError::Io(e) => matches!(
            e.kind(),
            ErrorKind::ConnectionRefused
                | ErrorKind::NotFound
                | ErrorKind::TimedOut
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
        ),
        _ => false,
    }
}

async fn exchange(stream: &mut TcpStream, message: &ClientMessage, max: u32) -> Result<ServerMessage, TransportError> {
    write_frame(stream, message, max).await?;
    read_frame(stream, max).await?.ok_or_else(|| {
        TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("server closed the stream during {}", message.name()),
        ))
    })
}

fn expect_ok(reply: ServerMessage) -> Result<(), TransportError> {
    match reply {
        ServerMessage::Status { code } => match FailureReason::from_status_code(code) {
            None => Ok(()),
            Some(reason) => Err(TransportError::Remote(reason)),
        },
        other => Err(TransportError::UnexpectedReply(format!("{other:?}"))),
    }
}

pub(crate) fn remote_failure(reply: ServerMessage) -> TransportError {
    match reply {
        ServerMessage::Status { code } => match FailureReason::from_status_code(code) {
            Some(reason) => TransportError::Remote(reason),
            None => TransportError::UnexpectedReply("bare success status".to_string()),
        },
        other => TransportError::UnexpectedReply(format!("{other:?}")),
    }
}

async fn hello(stream: &mut TcpStream, connection_id: Uuid, max: u32) -> Result<(), TransportError> {
    let message = ClientMessage::Hello {
        connection_id,
        client_pid: std::process::id(),
    };
    match exchange(stream, &message, max).await? {
        ServerMessage::HelloAck { .. } => Ok(()),
        other => Err(remote_failure(other)),
    }
}

/// Opens the thread and script contexts for a new session.
async fn handshake(addr: SocketAddr, connection_id: Uuid, max: u32) -> Result<(u64, u64), TransportError> {
    let mut stream = TcpStream::connect(addr).await?;
    hello(&mut stream, connection_id, max).await?;

    let thread_context_id = match exchange(&mut stream, &ClientMessage::InitializeThreadContext, max).await? {
        ServerMessage::ThreadContextInitialized { thread_context_id } => thread_context_id,
        other => return Err(remote_failure(other)),
    };
    let init_script = ClientMessage::InitializeScriptContext { thread_context_id };
    match exchange(&mut stream, &init_script, max).await? {
        ServerMessage::ScriptContextInitialized { script_context_id } => Ok((thread_context_id, script_context_id)),
        other => {
            // Do not leave a half-open session behind on the server
            let close = ClientMessage::CleanupThreadContext { thread_context_id };
            if let Err(err) = exchange(&mut stream, &close, max).await {
                debug!(%err, "Failed to release thread context after handshake failure");
            }
            Err(remote_failure(other))
        }
    }
}

async fn cleanup(connection: &Connection, max: u32) -> Result<(), TransportError> {
    let mut stream = TcpStream::connect(connection.addr).await?;
    hello(&mut stream, connection.connection_id, max).await?;
    let close_script = ClientMessage::CleanupScriptContext {
        script_context_id: connection.script_context_id,
    };
    expect_ok(exchange(&mut stream, &close_script, max).await?)?;
    let close_thread = ClientMessage::CleanupThreadContext {
        thread_context_id: connection.thread_context_id,
    };
    expect_ok(exchange(&mut stream, &close_thread, max).await?)
}
