//! TCP link to the acquisition source.
//!
//! One connection at a time. A dedicated reader thread delivers byte
//! chunks in FIFO order through an event channel; on an unexpected drop
//! the link waits five seconds and reconnects by itself unless the
//! disconnect was caller-initiated. The protocol bootstrap packet goes
//! out exactly once per successful connect.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::error::{EngineError, Result};
use crate::protocol::commands::PROTOCOL_BOOTSTRAP;
use crate::shutdown::Shutdown;

/// Wait between an unexpected drop and the reconnect attempt.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Read timeout so the reader thread can observe shutdown.
const READ_POLL: Duration = Duration::from_millis(500);
const READ_BUF: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Remote endpoint parameters. Applied on the next connect.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
}

/// Counters snapshot for the health surface.
#[derive(Debug, Clone, Serialize)]
pub struct TransportStats {
    pub total_bytes: u64,
    pub total_packets: u64,
    pub bytes_per_sec: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_packet_at: Option<OffsetDateTime>,
    pub status: LinkStatus,
}

/// Serialised FIFO delivery from the reader thread.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A connection was (re)established; the decoder must reset before
    /// any following data is fed.
    Connected,
    Data(Bytes),
    Disconnected,
}

pub struct Transport {
    config: Mutex<TransportConfig>,
    status: Mutex<LinkStatus>,
    events_tx: Sender<TransportEvent>,
    writer: Mutex<Option<TcpStream>>,
    total_bytes: AtomicU64,
    total_packets: AtomicU64,
    window_bytes: AtomicU64,
    rate: AtomicU64,
    last_packet: Mutex<Option<OffsetDateTime>>,
    /// Suppresses auto-reconnect for a caller-initiated disconnect.
    user_disconnect: AtomicBool,
    /// Bumped on connect/disconnect; stale reader threads observe the
    /// change and exit.
    generation: AtomicU64,
    shutdown: Arc<Shutdown>,
    clock: SharedClock,
}

impl Transport {
    /// Creates the transport and hands back the event receiver the ingest
    /// loop consumes.
    pub fn new(
        config: TransportConfig,
        shutdown: Arc<Shutdown>,
        clock: SharedClock,
    ) -> (Arc<Self>, Receiver<TransportEvent>) {
        let (events_tx, events_rx) = channel();
        let transport = Arc::new(Self {
            config: Mutex::new(config),
            status: Mutex::new(LinkStatus::Disconnected),
            events_tx,
            writer: Mutex::new(None),
            total_bytes: AtomicU64::new(0),
            total_packets: AtomicU64::new(0),
            window_bytes: AtomicU64::new(0),
            rate: AtomicU64::new(0),
            last_packet: Mutex::new(None),
            user_disconnect: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            shutdown,
            clock,
        });
        (transport, events_rx)
    }

    /// Updates the endpoint; takes effect on the next connect cycle.
    pub fn set_config(&self, config: TransportConfig) {
        *self.config.lock() = config;
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.lock()
    }

    fn set_status(&self, status: LinkStatus) {
        *self.status.lock() = status;
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            total_packets: self.total_packets.load(Ordering::Relaxed),
            bytes_per_sec: self.rate.load(Ordering::Relaxed),
            last_packet_at: *self.last_packet.lock(),
            status: self.status(),
        }
    }

    /// Folds the current window into the published byte rate. Driven at
    /// 1 Hz by the maintenance loop.
    pub fn sample_rate(&self) -> u64 {
        let bytes = self.window_bytes.swap(0, Ordering::Relaxed);
        self.rate.store(bytes, Ordering::Relaxed);
        bytes
    }

    /// Opens the connection with the configured timeout and starts the
    /// reader thread. Clears any pending reconnect suppression.
    pub fn connect(self: &Arc<Self>) -> Result<()> {
        self.user_disconnect.store(false, Ordering::Release);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.open_connection(generation)
    }

    /// Caller-initiated disconnect; auto-reconnect stays off until the
    /// next `connect`.
    pub fn disconnect(&self) {
        self.user_disconnect.store(true, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(stream) = self.writer.lock().take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.set_status(LinkStatus::Disconnected);
        let _ = self.events_tx.send(TransportEvent::Disconnected);
        info!("transport disconnected");
    }

    /// Writes a command packet on the live connection.
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        let Some(stream) = writer.as_mut() else {
            return Err(EngineError::Transport("not connected".into()));
        };
        stream
            .write_all(bytes)
            .map_err(|err| EngineError::Transport(format!("send failed: {err}")))
    }

    fn open_connection(self: &Arc<Self>, generation: u64) -> Result<()> {
        let config = self.config.lock().clone();
        self.set_status(LinkStatus::Connecting);
        let addr = format!("{}:{}", config.host, config.port);
        let resolved = addr
            .to_socket_addrs()
            .map_err(|err| {
                self.set_status(LinkStatus::Error);
                EngineError::Transport(format!("resolve {addr}: {err}"))
            })?
            .next()
            .ok_or_else(|| {
                self.set_status(LinkStatus::Error);
                EngineError::Transport(format!("no address for {addr}"))
            })?;
        let stream = TcpStream::connect_timeout(&resolved, config.connect_timeout).map_err(
            |err| {
                self.set_status(LinkStatus::Error);
                EngineError::Transport(format!("connect {addr}: {err}"))
            },
        )?;
        stream
            .set_read_timeout(Some(READ_POLL))
            .map_err(EngineError::Io)?;
        let reader = stream
            .try_clone()
            .map_err(EngineError::Io)?;
        *self.writer.lock() = Some(stream);
        self.set_status(LinkStatus::Connected);
        let _ = self.events_tx.send(TransportEvent::Connected);
        info!(%addr, "transport connected");

        // One-shot dictionary announcement; failure is logged only.
        if let Err(err) = self.send(PROTOCOL_BOOTSTRAP) {
            warn!(%err, "protocol bootstrap send failed");
        }

        let transport = Arc::clone(self);
        thread::Builder::new()
            .name(format!("frigorec-link-{generation}"))
            .spawn(move || transport.reader_loop(reader, generation))
            .map_err(EngineError::Io)?;
        Ok(())
    }

    fn reader_loop(self: Arc<Self>, mut stream: TcpStream, generation: u64) {
        let mut buf = [0u8; READ_BUF];
        loop {
            if self.stale(generation) {
                return;
            }
            match stream.read(&mut buf) {
                Ok(0) => {
                    debug!("remote closed the connection");
                    break;
                }
                Ok(n) => {
                    self.total_bytes.fetch_add(n as u64, Ordering::Relaxed);
                    self.window_bytes.fetch_add(n as u64, Ordering::Relaxed);
                    self.total_packets.fetch_add(1, Ordering::Relaxed);
                    *self.last_packet.lock() = Some(self.clock.now());
                    if self
                        .events_tx
                        .send(TransportEvent::Data(Bytes::copy_from_slice(&buf[..n])))
                        .is_err()
                    {
                        return;
                    }
                }
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(err) => {
                    warn!(%err, "transport read error");
                    break;
                }
            }
        }
        if self.stale(generation) {
            return;
        }
        self.writer.lock().take();
        let _ = self.events_tx.send(TransportEvent::Disconnected);
        self.reconnect_loop(generation);
    }

    fn stale(&self, generation: u64) -> bool {
        self.shutdown.is_cancelled()
            || self.user_disconnect.load(Ordering::Acquire)
            || self.generation.load(Ordering::Acquire) != generation
    }

    /// Waits out the back-off and dials again until it works or the
    /// transport is told to stand down.
    fn reconnect_loop(self: &Arc<Self>, mut generation: u64) {
        loop {
            if self.stale(generation) {
                return;
            }
            self.set_status(LinkStatus::Reconnecting);
            if self.shutdown.wait_timeout(RECONNECT_DELAY) || self.stale(generation) {
                return;
            }
            // Each dial gets a fresh generation; this loop stays its owner
            // unless someone else (connect/disconnect) bumps it again.
            generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            match self.open_connection(generation) {
                Ok(()) => return,
                Err(err) => warn!(%err, "reconnect attempt failed"),
            }
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("status", &self.status())
            .finish()
    }
}
