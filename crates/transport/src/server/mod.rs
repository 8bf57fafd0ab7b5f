//! Out-of-process compile server.

mod context;
mod service;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use oopjit_common::{FailureReason, TransportConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::TransportError;
use crate::wire::{ClientMessage, ServerMessage, read_frame, write_frame};

pub use context::ServerContextManager;
pub use service::CompileService;

/// Accepts client connections and answers their calls with a
/// [`CompileService`].
///
/// Each accepted connection is served by its own task. A client connection
/// starts with `Hello` and may then carry any number of calls. Contexts
/// left behind by clients that exited are swept periodically.
#[derive(Clone)]
pub struct CompileServer {
    service: Arc<CompileService>,
    max_frame_size: u32,
    reap_interval: Duration,
    shutdown: Arc<Notify>,
}

impl CompileServer {
    pub fn new(service: Arc<CompileService>, config: &TransportConfig) -> Self {
        Self {
            service,
            max_frame_size: config.max_frame_size,
            reap_interval: config.client_reap_interval(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn service(&self) -> &Arc<CompileService> {
        &self.service
    }

    /// Stops [`Self::serve`] once notified. Also triggered by a client
    /// `Shutdown` call.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    pub async fn serve(self, listener: TcpListener) -> Result<(), TransportError> {
        let local_addr = listener.local_addr()?;
        info!("Starting compile server at {local_addr}.");
        let mut reap = tokio::time::interval(self.reap_interval);
        reap.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = reap.tick() => {
                    self.service.contexts().reap_exited_clients();
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(err) = server.handle_connection(stream, addr).await {
                                warn!("Error handling connection from {addr}: {err}");
                            } else {
                                debug!("Connection from {addr} closed");
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {e}");
                    }
                },
                _ = self.shutdown.notified() => {
                    info!("Compile server at {local_addr} shutting down.");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, addr: SocketAddr) -> Result<(), TransportError> {
        let mut connection_id = None;
        while let Some(message) = read_frame::<_, ClientMessage>(&mut stream, self.max_frame_size).await? {
            let is_shutdown = matches!(message, ClientMessage::Shutdown);
            let reply = match (connection_id, message) {
                (_, ClientMessage::Hello { connection_id: id, client_pid }) => {
                    connection_id = Some(id);
                    self.call(id, ClientMessage::Hello { connection_id: id, client_pid })
                        .await?
                }
                (Some(id), message) => self.call(id, message).await?,
                (None, message) => {
                    warn!("{addr} sent {} before Hello", message.name());
                    ServerMessage::Status {
                        code: u32::from(FailureReason::InvalidState),
                    }
                }
            };
            write_frame(&mut stream, &reply, self.max_frame_size).await?;
            if is_shutdown && connection_id.is_some() {
                info!("Shutdown requested by {addr}");
                self.shutdown.notify_one();
                break;
            }
        }
        Ok(())
    }

    /// Code generation is CPU-bound, so calls run on the blocking pool.
    async fn call(&self, connection_id: uuid::Uuid, message: ClientMessage) -> Result<ServerMessage, TransportError> {
        let service = Arc::clone(&self.service);
        tokio::task::spawn_blocking(move || service.handle(connection_id, message))
            .await
            .map_err(|e| TransportError::Runtime(e.to_string()))
    }
}

impl std::fmt::Debug for CompileServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompileServer")
            .field("service", &self.service)
            .field("max_frame_size", &self.max_frame_size)
            .field("reap_interval", &self.reap_interval)
            .finish()
    }
}
