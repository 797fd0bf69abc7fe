//! TCP server answering `Get` calls with the Echo Service.
//!
//! Accepts connections, decodes request frames and writes one response
//! frame per request.

use crate::config::ServerSettings;
use crate::protocol::{self, DecodeError, Frame};
use crate::service::EchoService;
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server instance
pub struct Server {
    listener: TcpListener,
    service: EchoService,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Bind the listening socket.
    pub async fn bind(settings: &ServerSettings) -> io::Result<Self> {
        let addr = tokio::net::lookup_host(&settings.listen)
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("no address found for '{}'", settings.listen),
                )
            })?;

        let listener = TcpListener::from_std(create_listener(addr)?)?;

        Ok(Server {
            listener,
            service: EchoService,
            connection_limit: Arc::new(Semaphore::new(settings.max_connections)),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> io::Result<()> {
        info!(address = %self.local_addr()?, "Server listening");

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.connection_limit.clone().acquire_owned() => {
                    permit.map_err(io::Error::other)?
                }
            };

            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
                    }

                    let service = self.service;
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, service).await {
                            debug!(peer = %addr, error = %e, "Connection error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    if !accept_backoff(&cancel).await {
                        break;
                    }
                }
            }
        }

        info!("Server stopped");
        Ok(())
    }
}

/// Wait before accepting again. Returns false if cancelled meanwhile.
async fn accept_backoff(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}

fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

/// Serve a single client connection.
///
/// Pipelined requests are answered in arrival order; everything decoded
/// from one read is flushed with a single write.
pub async fn handle_connection<S>(
    mut stream: S,
    service: EchoService,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut read_buf = BytesMut::with_capacity(BUFFER_SIZE);
    let mut write_buf = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        loop {
            match protocol::decode(&mut read_buf) {
                Ok(Some(Frame::Get { id, key })) => {
                    trace!(id, len = key.len(), "Get");
                    let value = service.get(key);
                    protocol::encode(&Frame::Value { id, value }, &mut write_buf);
                }
                Ok(Some(Frame::Quit)) => {
                    protocol::encode(&Frame::Ok, &mut write_buf);
                    stream.write_all_buf(&mut write_buf).await?;
                    return Ok(());
                }
                Ok(Some(frame)) => {
                    warn!(?frame, "Unexpected frame from client");
                    let id = match frame {
                        Frame::Value { id, .. } | Frame::Error { id, .. } => id,
                        _ => 0,
                    };
                    let message = "unexpected frame".to_string();
                    protocol::encode(&Frame::Error { id, message }, &mut write_buf);
                }
                Ok(None) => break,
                Err(DecodeError::Malformed(reason)) => {
                    warn!(error = %reason, "Parse error");
                    let error = Frame::Error {
                        id: 0,
                        message: reason,
                    };
                    protocol::encode(&error, &mut write_buf);
                }
                Err(e) => {
                    warn!(error = %e, "Closing connection");
                    let id = match e {
                        DecodeError::TooLarge { id, .. } => id,
                        DecodeError::Malformed(_) => 0,
                    };
                    let message = e.to_string();
                    protocol::encode(&Frame::Error { id, message }, &mut write_buf);
                    stream.write_all_buf(&mut write_buf).await?;
                    return Err(e.into());
                }
            }
        }

        if !write_buf.is_empty() {
            stream.write_all_buf(&mut write_buf).await?;
        }

        let n = stream.read_buf(&mut read_buf).await?;
        if n == 0 {
            trace!("Connection closed by client");
            return Ok(());
        }
    }
}
