//! IPC Server
//!
//! Serves the management socket of one [`ImsBridge`]. The listener and every
//! open connection share the bridge's lifecycle: when the bridge begins
//! shutting down the listener stops accepting, idle connections are closed
//! and the socket file is removed. A command already being handled still
//! gets its reply.
//!
//! [`IpcClient`] speaks the same framing for tools and tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::handler::IpcHandler;
use super::protocol::{
    decode_message, encode_message, ErrorCode, IpcCommand, IpcResponse, LENGTH_PREFIX_SIZE,
    MAX_MESSAGE_SIZE,
};
use crate::bridge::ImsBridge;
use crate::config::IpcConfig;
use crate::error::IpcError;

/// How long open connections get to finish a reply once the bridge stops
const CONNECTION_DRAIN: Duration = Duration::from_secs(1);

/// IPC server bound to a bridge
pub struct IpcServer {
    config: IpcConfig,
    bridge: Arc<ImsBridge>,
    handler: Arc<IpcHandler>,
}

impl IpcServer {
    /// Create a server that applies commands to `bridge`
    pub fn new(config: IpcConfig, bridge: Arc<ImsBridge>) -> Self {
        let handler = Arc::new(IpcHandler::new(Arc::clone(&bridge)));
        Self {
            config,
            bridge,
            handler,
        }
    }

    /// Serve the socket until the bridge shuts down
    ///
    /// Returns at once if IPC is disabled or the bridge has already stopped.
    ///
    /// # Errors
    ///
    /// Returns `IpcError` if the socket cannot be created or bound.
    pub async fn run(&self) -> Result<(), IpcError> {
        if !self.config.enabled {
            info!("IPC server disabled");
            return Ok(());
        }

        let mut shutdown = self.bridge.subscribe_shutdown();
        if self.bridge.is_stopped() {
            debug!("Bridge already stopped, IPC server not started");
            return Ok(());
        }

        let socket_path = &self.config.socket_path;
        let listener = bind_listener(&self.config)?;
        info!(path = ?socket_path, "IPC server listening");

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let conn_shutdown = self.bridge.subscribe_shutdown();
                        if self.bridge.is_stopped() {
                            break;
                        }
                        let conn = Connection {
                            stream,
                            handler: Arc::clone(&self.handler),
                            shutdown: conn_shutdown,
                            max_message_size: self.config.max_message_size,
                        };
                        connections.spawn(conn.serve());
                    }
                    Err(e) => error!("IPC accept error: {}", e),
                },
                Some(done) = connections.join_next(), if !connections.is_empty() => {
                    log_connection_end(done);
                }
                _ = shutdown.recv() => break,
            }
        }

        drop(listener);
        info!(open = connections.len(), "IPC server stopping with the bridge");
        let drained = tokio::time::timeout(CONNECTION_DRAIN, async {
            while let Some(done) = connections.join_next().await {
                log_connection_end(done);
            }
        })
        .await;
        if drained.is_err() {
            warn!(open = connections.len(), "Aborting IPC connections still busy");
            connections.shutdown().await;
        }

        if socket_path.exists() {
            let _ = std::fs::remove_file(socket_path);
        }
        Ok(())
    }
}

fn bind_listener(config: &IpcConfig) -> Result<UnixListener, IpcError> {
    let socket_path = &config.socket_path;
    let socket_error = |reason: String| IpcError::SocketCreation {
        path: socket_path.display().to_string(),
        reason,
    };

    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .map_err(|e| socket_error(format!("Failed to remove stale socket: {e}")))?;
    }
    if let Some(parent) = socket_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .map_err(|e| socket_error(format!("Failed to create parent directory: {e}")))?;
        }
    }

    let listener = UnixListener::bind(socket_path).map_err(|e| IpcError::BindError {
        path: socket_path.display().to_string(),
        reason: e.to_string(),
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(config.socket_mode);
        std::fs::set_permissions(socket_path, permissions)
            .map_err(|e| socket_error(format!("Failed to set permissions: {e}")))?;
    }

    Ok(listener)
}

fn log_connection_end(done: Result<Result<(), IpcError>, tokio::task::JoinError>) {
    match done {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("IPC connection error: {}", e),
        Err(e) => warn!("IPC connection task failed: {}", e),
    }
}

/// One client connection
struct Connection {
    stream: UnixStream,
    handler: Arc<IpcHandler>,
    shutdown: broadcast::Receiver<()>,
    max_message_size: usize,
}

impl Connection {
    async fn serve(mut self) -> Result<(), IpcError> {
        debug!("New IPC connection");

        loop {
            // Only waiting for a request is interrupted by shutdown
            let frame = tokio::select! {
                frame = read_frame(&mut self.stream, self.max_message_size) => frame?,
                _ = self.shutdown.recv() => {
                    debug!("Closing IPC connection, bridge stopping");
                    return Ok(());
                }
            };

            let body = match frame {
                Frame::Closed => {
                    debug!("IPC client disconnected");
                    return Ok(());
                }
                Frame::TooLarge(len) => {
                    warn!(len, max = self.max_message_size, "IPC message too large");
                    let response = IpcResponse::error(
                        ErrorCode::InvalidParameters,
                        format!("Message too large: {len} bytes"),
                    );
                    // The unread body makes the stream unusable
                    return write_frame(&mut self.stream, &response).await;
                }
                Frame::Message(body) => body,
            };

            let response = match decode_message::<IpcCommand>(&body) {
                Ok(command) => {
                    let name = command.name();
                    let response = self.handler.handle(command).await;
                    if response.is_error() {
                        debug!(command = name, "IPC command rejected");
                    }
                    response
                }
                Err(e) => {
                    warn!("Invalid IPC command: {}", e);
                    IpcResponse::error(
                        ErrorCode::InvalidCommand,
                        format!("Invalid command format: {e}"),
                    )
                }
            };
            write_frame(&mut self.stream, &response).await?;
        }
    }
}

/// Result of reading one length-prefixed frame
enum Frame {
    Message(Vec<u8>),
    /// Declared length exceeds the limit; the body was not read
    TooLarge(usize),
    /// Peer closed the stream between frames
    Closed,
}

async fn read_frame(stream: &mut UnixStream, max_len: usize) -> Result<Frame, IpcError> {
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(Frame::Closed),
        Err(e) => return Err(IpcError::from(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Ok(Frame::TooLarge(len));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Frame::Message(body))
}

async fn write_frame<T: Serialize>(stream: &mut UnixStream, message: &T) -> Result<(), IpcError> {
    let encoded = encode_message(message).map_err(|e| IpcError::serialization(e.to_string()))?;
    stream.write_all(&encoded).await?;
    stream.flush().await?;
    Ok(())
}

/// IPC client for connecting to the server
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    /// Create a new IPC client
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Send a command and receive a response
    ///
    /// # Errors
    ///
    /// Returns `IpcError` on connection failure or a malformed response.
    pub async fn send(&self, command: IpcCommand) -> Result<IpcResponse, IpcError> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| IpcError::ConnectionError(e.to_string()))?;

        write_frame(&mut stream, &command).await?;
        match read_frame(&mut stream, MAX_MESSAGE_SIZE).await? {
            Frame::Message(body) => {
                decode_message(&body).map_err(|e| IpcError::protocol(e.to_string()))
            }
            Frame::TooLarge(len) => Err(IpcError::protocol(format!(
                "Response too large: {len} bytes"
            ))),
            Frame::Closed => Err(IpcError::ConnectionError(
                "bridge closed the connection".into(),
            )),
        }
    }

    /// Send a ping command
    ///
    /// # Errors
    ///
    /// Returns `IpcError` if the server cannot be reached.
    pub async fn ping(&self) -> Result<bool, IpcError> {
        let response = self.send(IpcCommand::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }
}
