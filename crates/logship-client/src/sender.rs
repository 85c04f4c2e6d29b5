//! Shipping client
//!
//! Drains the ready queue of a [`ClientBufferStore`] over one TCP connection
//! on a fixed-delay timer. Every payload is framed with the stream's next
//! sequence id; the id is committed only after the collector acknowledges
//! it, so a retried payload is re-sent with the same id and deduplicated on
//! the other side.

use crate::store::ClientBufferStore;
use logship_common::config::ClientConfig;
use logship_common::{Ack, Availability, ClientId, Error, Result};
use logship_proto::{WireFrame, read_ack, write_handshake};
use std::fmt::Write;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shipping client settings
#[derive(Clone, Debug)]
pub struct SenderConfig {
    /// Collector address
    pub server_addr: String,
    /// Identity announced in the handshake
    pub client_id: ClientId,
    /// Delay between the end of one tick and the start of the next
    pub send_interval: Duration,
    /// Bound on connect, every socket write and every ack read
    pub io_timeout: Duration,
    /// Ready-queue length at which the client reports itself failed
    pub ready_queue_threshold: usize,
}

impl From<&ClientConfig> for SenderConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            server_addr: config.server_addr.clone(),
            client_id: ClientId::new(config.client_id),
            send_interval: config.send_interval(),
            io_timeout: config.io_timeout(),
            ready_queue_threshold: config.ready_queue_threshold,
        }
    }
}

/// Counters exported by the shipping client
#[derive(Debug, Default)]
pub struct ClientMetrics {
    pub frames_sent: AtomicU64,
    pub bytes_acked: AtomicU64,
    pub rejected: AtomicU64,
    pub dropped_overflow: AtomicU64,
    pub io_failures: AtomicU64,
    pub connects: AtomicU64,
}

impl ClientMetrics {
    /// Export metrics in Prometheus format
    pub fn export_prometheus(&self, client: ClientId, ready_len: usize, availability: Availability) -> String {
        let mut output = String::with_capacity(1024);
        let id = client.as_u8();

        let counters = [
            ("logship_client_frames_sent_total", "Frames acknowledged by the collector", &self.frames_sent),
            ("logship_client_bytes_acked_total", "Payload bytes acknowledged", &self.bytes_acked),
            ("logship_client_rejected_total", "Frames rejected with a negative ack", &self.rejected),
            ("logship_client_dropped_overflow_total", "Payloads dropped after BUFFER_OVERFLOW", &self.dropped_overflow),
            ("logship_client_io_failures_total", "Connection or socket failures", &self.io_failures),
            ("logship_client_connects_total", "Connections established", &self.connects),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(output, "# HELP {name} {help}");
            let _ = writeln!(output, "# TYPE {name} counter");
            let _ = writeln!(
                output,
                "{name}{{client_id=\"{id}\"}} {}",
                value.load(Ordering::Relaxed)
            );
        }

        let _ = writeln!(output, "# HELP logship_client_ready_buffers Payloads waiting to be shipped");
        let _ = writeln!(output, "# TYPE logship_client_ready_buffers gauge");
        let _ = writeln!(output, "logship_client_ready_buffers{{client_id=\"{id}\"}} {ready_len}");

        let _ = writeln!(output, "# HELP logship_client_available Client availability (1=operational, 0=failed)");
        let _ = writeln!(output, "# TYPE logship_client_available gauge");
        let _ = writeln!(
            output,
            "logship_client_available{{client_id=\"{id}\"}} {}",
            availability.as_value()
        );

        output
    }
}

/// Timer-driven client shipping ready payloads to the collector
pub struct WireProtocolClient {
    config: SenderConfig,
    store: Arc<ClientBufferStore>,
    connection: Mutex<Option<TcpStream>>,
    /// False after an I/O failure or negative ack, until the next success
    healthy: AtomicBool,
    metrics: ClientMetrics,
    shutdown: watch::Sender<bool>,
}

impl WireProtocolClient {
    pub fn new(config: SenderConfig, store: Arc<ClientBufferStore>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            store,
            connection: Mutex::new(None),
            healthy: AtomicBool::new(true),
            metrics: ClientMetrics::default(),
            shutdown,
        }
    }

    pub const fn metrics(&self) -> &ClientMetrics {
        &self.metrics
    }

    /// Health signal for the embedding process
    ///
    /// Operational only while the connection is healthy and the ready queue
    /// is below its threshold.
    pub fn availability(&self) -> Availability {
        if !self.healthy.load(Ordering::SeqCst) {
            return Availability::Failed;
        }
        if self.store.ready_len() >= self.config.ready_queue_threshold {
            return Availability::Failed;
        }
        Availability::Operational
    }

    /// Prometheus text for this client
    pub fn export_prometheus(&self) -> String {
        self.metrics.export_prometheus(
            self.config.client_id,
            self.store.ready_len(),
            self.availability(),
        )
    }

    /// Run one send pass; returns the number of acknowledged payloads
    ///
    /// The first failure closes the connection and ends the pass; the
    /// failed payload stays at the head of the queue unless the collector
    /// rejected it with a code that retrying cannot fix (`BUFFER_OVERFLOW`).
    ///
    /// A kept connection may have been closed by the collector while idle.
    /// If the first exchange on it fails, the client reconnects once and
    /// resends the same frame before counting a failure.
    pub async fn tick(&self) -> Result<usize> {
        self.store.flush_current();
        if self.store.ready_len() == 0 {
            return Ok(0);
        }

        let mut connection = self.connection.lock().await;
        let mut reused = connection.is_some();
        if connection.is_none() {
            match self.connect().await {
                Ok(stream) => *connection = Some(stream),
                Err(e) => {
                    self.record_failure();
                    return Err(e);
                }
            }
        }

        let mut sent = 0;
        while let Some(entry) = self.store.front() {
            let Some(stream) = connection.as_mut() else {
                return Err(Error::NotConnected);
            };
            let sequence_id = self.store.next_sequence(&entry.key);
            let frame = WireFrame::new(sequence_id, entry.key.clone(), entry.data.clone());

            match self.exchange(stream, &frame).await {
                Ok(Ack::Accepted(size)) => {
                    self.store.pop_front();
                    self.store.commit_sequence(&entry.key, sequence_id);
                    self.healthy.store(true, Ordering::SeqCst);
                    self.metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
                    self.metrics.bytes_acked.fetch_add(u64::from(size), Ordering::Relaxed);
                    sent += 1;
                    reused = false;
                }
                Ok(Ack::Rejected(code)) => {
                    self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                    let err = Error::Rejected(code);
                    if err.is_retryable() {
                        warn!("Collector rejected payload for {}: {}", entry.key, code);
                    } else {
                        warn!(
                            "Collector rejected {} bytes for {} ({}), dropping payload",
                            entry.data.len(),
                            entry.key,
                            code
                        );
                        self.store.pop_front();
                        self.metrics.dropped_overflow.fetch_add(1, Ordering::Relaxed);
                    }
                    self.healthy.store(false, Ordering::SeqCst);
                    *connection = None;
                    return Err(err);
                }
                Err(e) if reused && !matches!(e, Error::Timeout) => {
                    debug!(
                        "Idle connection to {} is gone ({}), reconnecting",
                        self.config.server_addr, e
                    );
                    reused = false;
                    match self.connect().await {
                        Ok(stream) => *connection = Some(stream),
                        Err(e) => {
                            self.record_failure();
                            *connection = None;
                            return Err(e);
                        }
                    }
                }
                Err(e) => {
                    warn!("Send to {} failed: {}", self.config.server_addr, e);
                    self.record_failure();
                    *connection = None;
                    return Err(e);
                }
            }
        }

        if sent > 0 {
            debug!("Shipped {} payloads to {}", sent, self.config.server_addr);
        }
        Ok(sent)
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = self.config.server_addr.as_str();
        let mut stream = with_timeout(self.config.io_timeout, async {
            TcpStream::connect(addr)
                .await
                .map_err(|e| Error::ConnectionFailed(format!("{addr}: {e}")))
        })
        .await?;
        stream.set_nodelay(true)?;
        with_timeout(
            self.config.io_timeout,
            write_handshake(&mut stream, self.config.client_id),
        )
        .await?;

        self.metrics.connects.fetch_add(1, Ordering::Relaxed);
        info!(
            "Connected to collector {} as {}",
            addr, self.config.client_id
        );
        Ok(stream)
    }

    async fn exchange(&self, stream: &mut TcpStream, frame: &WireFrame) -> Result<Ack> {
        with_timeout(self.config.io_timeout, frame.write_to(stream)).await?;
        with_timeout(self.config.io_timeout, read_ack(stream)).await
    }

    fn record_failure(&self) {
        self.healthy.store(false, Ordering::SeqCst);
        self.metrics.io_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Spawn the fixed-delay send loop
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(client.config.send_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = client.tick().await {
                            debug!("Send tick ended early: {}", e);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Send loop stopped");
        })
    }

    /// Stop the send loop and drop the connection
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        self.connection.lock().await.take();
        info!("Shipping client {} closed", self.config.client_id);
    }
}

async fn with_timeout<T>(limit: Duration, op: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(limit, op)
        .await
        .map_err(|_| Error::Timeout)?
}
