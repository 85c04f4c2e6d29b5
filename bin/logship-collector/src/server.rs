//! Wire protocol server
//!
//! One accept loop hands connections to a bounded pool of handlers; when the
//! pool is exhausted the loop stops accepting until a handler finishes. A
//! handler reads the client identity, then loops over framed requests:
//!
//! 1. payload above the receive buffer: `BUFFER_OVERFLOW`, abort
//! 2. sink unavailable: `BACKEND_UNAVAILABLE`, abort
//! 3. sequence id already applied: acknowledge without applying
//! 4. otherwise apply, record the sequence id, acknowledge
//!
//! A sink failure answers with the code of its error (`GENERIC` unless the
//! sink reports itself unavailable) and aborts without recording the id.

use crate::dedup::{DedupKey, DedupOutcome, DedupStore};
use crate::events::{EventListener, ServerEvent, ServerMetrics};
use crate::sink::Sink;
use bytes::Bytes;
use logship_common::config::ServerConfig;
use logship_common::{Ack, AckCode, ClientId, Error, Result};
use logship_proto::{FrameHeader, read_handshake, read_header, read_payload, write_ack};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Server settings
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen: String,
    /// Largest payload accepted in one frame
    pub max_buffer_size: u32,
    /// Connection handler pool size
    pub max_connections: usize,
    /// Idle read timeout; also bounds every ack write
    pub io_timeout: Duration,
}

impl From<&ServerConfig> for ServerSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            listen: config.listen.clone(),
            max_buffer_size: config.max_buffer_size,
            max_connections: config.max_connections.max(1),
            io_timeout: config.io_timeout(),
        }
    }
}

/// How a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disconnect {
    /// Peer closed between frames
    Eof,
    /// No frame within the idle timeout
    Idle,
    /// The server refused a frame and dropped the connection
    Aborted,
}

/// Collector side of the wire protocol
pub struct WireProtocolServer {
    settings: ServerSettings,
    sink: Arc<dyn Sink>,
    dedup: Arc<DedupStore>,
    listener: Arc<dyn EventListener>,
    metrics: Arc<ServerMetrics>,
    shutdown: watch::Sender<bool>,
}

impl WireProtocolServer {
    pub fn new(
        settings: ServerSettings,
        sink: Arc<dyn Sink>,
        dedup: Arc<DedupStore>,
        listener: Arc<dyn EventListener>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            settings,
            sink,
            dedup,
            listener,
            metrics,
            shutdown,
        }
    }

    pub const fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.settings.listen).await.map_err(|e| {
            Error::ConnectionFailed(format!("bind {}: {e}", self.settings.listen))
        })?;
        info!("Collector listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Spawn the accept loop on `listener`
    pub fn serve(self: &Arc<Self>, listener: TcpListener) -> JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move { server.accept_loop(listener).await })
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let permits = Arc::new(Semaphore::new(self.settings.max_connections));
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Accept error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
                _ = shutdown.changed() => break,
            };

            let server = Arc::clone(&self);
            let mut cancel = self.shutdown.subscribe();
            tokio::spawn(async move {
                let _permit = permit;
                server.metrics.connections_accepted.fetch_add(1, Ordering::Relaxed);
                server.metrics.connections_active.fetch_add(1, Ordering::Relaxed);
                tokio::select! {
                    result = server.handle_connection(stream, peer) => match result {
                        Ok(Disconnect::Eof) => debug!("Client {peer} disconnected"),
                        Ok(Disconnect::Idle) => debug!("Client {peer} idle, connection closed"),
                        Ok(Disconnect::Aborted) => debug!("Connection to {peer} aborted"),
                        Err(e) => warn!("Client {peer} error: {e}"),
                    },
                    _ = cancel.changed() => debug!("Connection to {peer} cancelled by shutdown"),
                }
                server.metrics.connections_active.fetch_sub(1, Ordering::Relaxed);
            });
        }
        info!("Collector accept loop stopped");
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<Disconnect> {
        stream.set_nodelay(true)?;
        let client = match self.with_timeout(read_handshake(&mut stream)).await {
            Some(result) => result?,
            None => return Ok(Disconnect::Idle),
        };
        info!("{client} connected from {peer}");

        loop {
            let header = match self.with_timeout(read_header(&mut stream)).await {
                None => return Ok(Disconnect::Idle),
                Some(Ok(None)) => return Ok(Disconnect::Eof),
                Some(Ok(Some(header))) => header,
                Some(Err(e)) => {
                    self.metrics.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            };

            if let Some(disconnect) = self.handle_request(&mut stream, client, header).await? {
                return Ok(disconnect);
            }
        }
    }

    /// Process one request; `Some` ends the connection
    async fn handle_request(
        &self,
        stream: &mut TcpStream,
        client: ClientId,
        header: FrameHeader,
    ) -> Result<Option<Disconnect>> {
        let FrameHeader {
            sequence_id,
            size,
            key,
        } = header;

        if let Err(e) = key.validate() {
            self.metrics.protocol_errors.fetch_add(1, Ordering::Relaxed);
            self.ack(stream, Ack::Rejected(AckCode::Generic)).await?;
            return Err(e.into());
        }

        if let Err(e) = self.admit(size) {
            self.ack(stream, Ack::Rejected(e.ack_code())).await?;
            let event = if matches!(e, Error::PayloadTooLarge { .. }) {
                ServerEvent::BufferOverflow { client, key, size }
            } else {
                ServerEvent::BackendUnavailable { client, key }
            };
            self.listener.on_event(&event);
            return Ok(Some(Disconnect::Aborted));
        }

        let payload = match self.with_timeout(read_payload(stream, size)).await {
            Some(result) => result?,
            None => return Err(Error::Timeout),
        };

        let dedup_key = DedupKey::new(client, key);
        let outcome = self
            .apply_blocking(dedup_key.clone(), sequence_id, payload)
            .await;

        match outcome {
            Ok(DedupOutcome::Applied) => {
                self.ack(stream, Ack::Accepted(size)).await?;
                self.listener.on_event(&ServerEvent::Applied {
                    client,
                    key: dedup_key.stream,
                    sequence_id,
                    size,
                });
                Ok(None)
            }
            Ok(DedupOutcome::Duplicate { last_applied }) => {
                self.ack(stream, Ack::Accepted(size)).await?;
                self.listener.on_event(&ServerEvent::AlreadyWritten {
                    client,
                    key: dedup_key.stream,
                    sequence_id,
                    last_applied,
                });
                Ok(None)
            }
            Err(e) => {
                self.listener.on_event(&ServerEvent::SinkFailed {
                    client,
                    key: dedup_key.stream,
                    reason: e.to_string(),
                });
                self.ack(stream, Ack::Rejected(e.ack_code())).await?;
                Ok(Some(Disconnect::Aborted))
            }
        }
    }

    /// Dedup check and sink write, run on the blocking pool
    async fn apply_blocking(
        &self,
        key: DedupKey,
        sequence_id: u64,
        payload: Bytes,
    ) -> Result<DedupOutcome> {
        let dedup = Arc::clone(&self.dedup);
        let sink = Arc::clone(&self.sink);
        tokio::task::spawn_blocking(move || {
            dedup.apply_if_new(&key, sequence_id, || {
                sink.apply(&key.stream, &payload).map(|_| ())
            })
        })
        .await
        .map_err(|e| Error::internal(format!("apply task failed: {e}")))?
    }

    /// Checks made before the payload is read
    fn admit(&self, size: u32) -> Result<()> {
        if size > self.settings.max_buffer_size {
            return Err(Error::PayloadTooLarge {
                size: size as usize,
                capacity: self.settings.max_buffer_size as usize,
            });
        }
        if !self.sink.availability().is_operational() {
            return Err(Error::BackendUnavailable(
                "sink refuses writes".to_string(),
            ));
        }
        Ok(())
    }

    async fn ack(&self, stream: &mut TcpStream, ack: Ack) -> Result<()> {
        self.with_timeout(write_ack(stream, ack))
            .await
            .unwrap_or(Err(Error::Timeout))
    }

    /// `None` when the I/O timeout elapsed
    async fn with_timeout<T>(&self, op: impl Future<Output = Result<T>>) -> Option<Result<T>> {
        tokio::time::timeout(self.settings.io_timeout, op).await.ok()
    }

    /// Stop accepting and cancel in-flight handlers
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
        info!("Collector server closing");
    }
}
