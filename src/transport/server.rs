//! TCP Server
//!
//! Accepts connections from other members and dispatches their requests
//! to a [`RequestHandler`].

use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::{read_request, write_response, RequestHandler};
use crate::error::{Error, Result};

/// TCP server for cluster requests
pub struct TcpServer {
    bind_address: String,
    handler: Arc<dyn RequestHandler>,
    shutdown: watch::Sender<bool>,
}

impl TcpServer {
    pub fn new(bind_address: impl Into<String>, handler: Arc<dyn RequestHandler>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            bind_address: bind_address.into(),
            handler,
            shutdown,
        }
    }

    /// Bind the configured address and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("Replication server listening on {}", self.bind_address);
        self.serve(listener).await
    }

    /// Serve an already bound listener until stopped
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let handler = Arc::clone(&self.handler);
                            let shutdown_rx = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, &peer_addr, handler, shutdown_rx).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Replication server stopped");
        Ok(())
    }

    /// Stop accepting and close idle connections
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer_addr: &str,
    handler: Arc<dyn RequestHandler>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let request = tokio::select! {
            result = read_request(&mut reader) => result,
            _ = shutdown_rx.changed() => break,
        };

        match request {
            Ok(request) => {
                tracing::trace!("Received {} from {}", request.type_name(), peer_addr);
                let response = handler.handle(request).await;
                write_response(&mut writer, &response).await?;
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading request from {}: {}", peer_addr, e);
                break;
            }
        }
    }

    Ok(())
}
