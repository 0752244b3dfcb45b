//! CD1.1 outbound session: the sender/reader pair.
//!
//! The session owns one TCP connection to the collection center. The sender
//! half streams ring records in sequence order under an in-flight byte
//! budget and replays retransmission ranges as the backfill worker produces
//! them. The reader half parses inbound ACKNACK and ALERT frames, drives
//! the gap list, and rate-limits ack processing. Connection loss triggers
//! reconnection with capped exponential backoff.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use seisrelay_core::{EventSender, GapList, OpEvent};
use seisrelay_core::event::BackoffKind;
use seisrelay_ring::{RingError, RingStore};

use crate::error::{Cd11Error, Cd11Result};
use crate::frame::{decode_preamble, decode_raw_preamble, Frame, FrameBody, FrameType, PREAMBLE_SIZE};

/// Minimum interval between processed ACKNACK frames.
pub const ACK_MIN_INTERVAL: Duration = Duration::from_secs(118);

/// Initial reconnect delay.
const BACKOFF_INITIAL: Duration = Duration::from_secs(15);
/// Reconnect delay ceiling for connection-refused.
const BACKOFF_CAP_REFUSED: Duration = Duration::from_secs(5 * 60);
/// Reconnect delay ceiling for connect timeout.
const BACKOFF_CAP_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Collection-center host.
    pub host: String,
    /// Collection-center port.
    pub port: u16,
    /// Local address to bind before connecting; empty for the OS default.
    pub bind: String,
    /// Creator tag placed in outbound frames.
    pub creator: String,
    /// Destination tag placed in outbound frames.
    pub destination: String,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Read timeout on the session socket.
    pub read_timeout: Duration,
    /// Maximum bytes sent beyond the last acknowledged sequence.
    pub max_inflight_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            bind: String::new(),
            creator: String::new(),
            destination: "0".to_string(),
            connect_timeout_ms: 30_000,
            read_timeout: Duration::from_secs(150),
            max_inflight_bytes: 1 << 20,
        }
    }
}

/// Why a connection attempt failed, for backoff selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectFailure {
    Refused,
    Timeout,
}

/// Capped exponential reconnect backoff with one ceiling event per kind.
pub struct ReconnectBackoff {
    refused: Duration,
    timeout: Duration,
    refused_capped: bool,
    timeout_capped: bool,
    events: EventSender,
}

impl ReconnectBackoff {
    /// Creates a backoff at the initial delay.
    pub fn new(events: EventSender) -> Self {
        Self {
            refused: BACKOFF_INITIAL,
            timeout: BACKOFF_INITIAL,
            refused_capped: false,
            timeout_capped: false,
            events,
        }
    }

    /// Returns the delay to sleep for a refused connection, then doubles it.
    pub fn next_refused(&mut self) -> Duration {
        let delay = self.refused;
        self.refused = (self.refused * 2).min(BACKOFF_CAP_REFUSED);
        if self.refused == BACKOFF_CAP_REFUSED && !self.refused_capped {
            self.refused_capped = true;
            self.events.emit(OpEvent::BackoffCeiling {
                kind: BackoffKind::ConnectionRefused,
                delay: BACKOFF_CAP_REFUSED,
            });
        }
        delay
    }

    /// Returns the delay to sleep for a connect timeout, then doubles it.
    pub fn next_timeout(&mut self) -> Duration {
        let delay = self.timeout;
        self.timeout = (self.timeout * 2).min(BACKOFF_CAP_TIMEOUT);
        if self.timeout == BACKOFF_CAP_TIMEOUT && !self.timeout_capped {
            self.timeout_capped = true;
            self.events.emit(OpEvent::BackoffCeiling {
                kind: BackoffKind::ConnectionTimeout,
                delay: BACKOFF_CAP_TIMEOUT,
            });
        }
        delay
    }

    /// Resets both delays after a successful connection.
    pub fn reset(&mut self) {
        self.refused = BACKOFF_INITIAL;
        self.timeout = BACKOFF_INITIAL;
        self.refused_capped = false;
        self.timeout_capped = false;
    }
}

/// How a connected episode ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// I/O error or EOF: reconnect.
    Reconnect,
    /// Peer alert or local terminate: stop the session for good.
    Stop,
}

/// The outbound CD1.1 session for one station.
pub struct Cd11Session {
    config: SessionConfig,
    ring: Arc<RingStore>,
    gaps: Arc<Mutex<GapList>>,
    events: EventSender,
    terminate: watch::Receiver<bool>,
    retransmit_rx: mpsc::Receiver<(i64, i64)>,
    last_acked: Arc<AtomicI64>,
}

impl Cd11Session {
    /// Creates a session and the handle used to request retransmissions.
    pub fn new(
        config: SessionConfig,
        ring: Arc<RingStore>,
        gaps: Arc<Mutex<GapList>>,
        events: EventSender,
        terminate: watch::Receiver<bool>,
    ) -> (Self, mpsc::Sender<(i64, i64)>) {
        let (retransmit_tx, retransmit_rx) = mpsc::channel(64);
        let session = Self {
            config,
            ring,
            gaps,
            events,
            terminate,
            retransmit_rx,
            last_acked: Arc::new(AtomicI64::new(-1)),
        };
        (session, retransmit_tx)
    }

    /// Runs the session until terminated or the peer sends an alert.
    pub async fn run(mut self) -> Cd11Result<()> {
        let mut backoff = ReconnectBackoff::new(self.events.clone());
        let addr = format!("{}:{}", self.config.host, self.config.port);

        loop {
            if *self.terminate.borrow() {
                break;
            }
            let stream = match self.connect(&addr).await {
                Ok(stream) => {
                    backoff.reset();
                    stream
                }
                Err(failure) => {
                    let delay = match failure {
                        ConnectFailure::Refused => backoff.next_refused(),
                        ConnectFailure::Timeout => backoff.next_timeout(),
                    };
                    debug!(addr = %addr, ?delay, "connect failed, backing off");
                    if self.sleep_or_terminate(delay).await {
                        break;
                    }
                    continue;
                }
            };

            match self.run_connected(stream).await {
                Ok(SessionEnd::Stop) => break,
                Ok(SessionEnd::Reconnect) => continue,
                Err(e) => {
                    warn!(addr = %addr, error = %e, "session error, reconnecting");
                    continue;
                }
            }
        }

        self.ring.flush()?;
        info!(addr = %addr, "session closed");
        Ok(())
    }

    /// True if termination was requested while sleeping.
    async fn sleep_or_terminate(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.terminate.changed() => *self.terminate.borrow(),
        }
    }

    async fn connect(&self, addr: &str) -> Result<TcpStream, ConnectFailure> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        match tokio::time::timeout(timeout, self.connect_stream(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                info!(addr, "connected to collection center");
                Ok(stream)
            }
            Ok(Err(e)) => {
                debug!(addr, error = %e, "connection refused");
                Err(ConnectFailure::Refused)
            }
            Err(_) => {
                debug!(addr, "connection timed out");
                Err(ConnectFailure::Timeout)
            }
        }
    }

    /// Opens the stream, binding the configured local address first when
    /// one is set (`-b`).
    async fn connect_stream(&self, addr: &str) -> std::io::Result<TcpStream> {
        if self.config.bind.is_empty() {
            return TcpStream::connect(addr).await;
        }
        let remote = tokio::net::lookup_host(addr).await?.next().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no address for {addr}"),
            )
        })?;
        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        let local: SocketAddr = format!("{}:0", self.config.bind)
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        socket.bind(local)?;
        socket.connect(remote).await
    }

    /// One connected episode: handshake, then concurrent send/receive.
    async fn run_connected(&mut self, stream: TcpStream) -> Cd11Result<SessionEnd> {
        let (mut read, mut write) = stream.into_split();

        self.handshake(&mut read, &mut write).await?;

        let reader = ReaderState {
            gaps: Arc::clone(&self.gaps),
            events: self.events.clone(),
            last_acked: Arc::clone(&self.last_acked),
            read_timeout: self.config.read_timeout,
        };

        let mut reader_task = tokio::spawn(reader.run(read));
        let send_result = self.run_sender(&mut write, &mut reader_task).await;

        reader_task.abort();
        match send_result {
            Ok(end) => Ok(end),
            Err(Cd11Error::IoError(e)) => {
                debug!(error = %e, "send side closed");
                Ok(SessionEnd::Reconnect)
            }
            Err(e) => Err(e),
        }
    }

    /// Sends the connection request and waits for the response.
    async fn handshake(
        &self,
        read: &mut OwnedReadHalf,
        write: &mut OwnedWriteHalf,
    ) -> Cd11Result<()> {
        let request = Frame {
            creator: self.config.creator.clone(),
            destination: self.config.destination.clone(),
            sequence: 0,
            body: FrameBody::ConnectionRequest,
        };
        write.write_all(&request.encode()?).await?;
        write.flush().await?;

        let frame = read_frame(read, self.config.read_timeout).await?;
        match frame.body {
            FrameBody::ConnectionResponse => {
                debug!(creator = %frame.creator, "handshake complete");
                Ok(())
            }
            other => Err(Cd11Error::HandshakeFailed {
                reason: format!("expected connection response, got {other:?}"),
            }),
        }
    }

    /// Streams ring records in order, interleaving retransmissions.
    async fn run_sender(
        &mut self,
        write: &mut OwnedWriteHalf,
        reader_task: &mut tokio::task::JoinHandle<SessionEnd>,
    ) -> Cd11Result<SessionEnd> {
        // Sizes of sent-but-unacked records, for the in-flight budget.
        let mut outstanding: BTreeMap<i64, usize> = BTreeMap::new();
        let mut inflight: usize = 0;
        let mut next_to_send = match self.ring.readable_range() {
            Some((low, _)) => {
                let acked = self.last_acked.load(Ordering::Acquire);
                low.max(acked + 1)
            }
            None => 0,
        };

        loop {
            if *self.terminate.borrow() {
                return Ok(SessionEnd::Stop);
            }

            // Acked sequences no longer count against the budget.
            let acked = self.last_acked.load(Ordering::Acquire);
            let still_out = outstanding.split_off(&(acked + 1));
            for (_, len) in outstanding.iter() {
                inflight = inflight.saturating_sub(*len);
            }
            outstanding = still_out;
            next_to_send = next_to_send.max(acked + 1);

            // Retransmissions take priority over new realtime records.
            while let Ok((low, high)) = self.retransmit_rx.try_recv() {
                for seq in low..=high {
                    if let Err(e) = self.send_record(write, seq).await {
                        match e {
                            Cd11Error::Ring(RingError::NotFound { .. }) => continue,
                            other => return Err(other),
                        }
                    }
                }
            }

            let last = self.ring.last_seq_out();
            if next_to_send <= last && inflight < self.config.max_inflight_bytes {
                match self.send_record(write, next_to_send).await {
                    Ok(len) => {
                        outstanding.insert(next_to_send, len);
                        inflight += len;
                        next_to_send += 1;
                        continue;
                    }
                    Err(Cd11Error::Ring(RingError::NotFound { .. })) => {
                        // Aged past the ring tail; skip forward.
                        next_to_send += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            // Nothing sendable right now: wait for data, an ack window, a
            // retransmit request, or the reader ending the episode.
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                _ = self.terminate.changed() => {}
                end = &mut *reader_task => {
                    return Ok(end.unwrap_or(SessionEnd::Reconnect));
                }
            }
        }
    }

    /// Reads one record from the ring and writes it to the socket.
    /// Returns the framed length.
    async fn send_record(&self, write: &mut OwnedWriteHalf, sequence: i64) -> Cd11Result<usize> {
        let slot = self.ring.read(sequence)?;
        let (_, payload_len) = decode_preamble(&slot)?;
        let framed = PREAMBLE_SIZE + payload_len as usize;
        write.write_all(&slot[..framed]).await?;
        write.flush().await?;
        Ok(framed)
    }
}

/// State for the inbound half of the session.
struct ReaderState {
    gaps: Arc<Mutex<GapList>>,
    events: EventSender,
    last_acked: Arc<AtomicI64>,
    read_timeout: Duration,
}

impl ReaderState {
    async fn run(self, mut read: OwnedReadHalf) -> SessionEnd {
        let mut last_processed: Option<Instant> = None;
        loop {
            let frame = match read_frame(&mut read, self.read_timeout).await {
                Ok(frame) => frame,
                Err(Cd11Error::UnknownFrameType { raw }) => {
                    warn!(raw, "unknown frame type, ignoring");
                    continue;
                }
                Err(e) => {
                    debug!(error = %e, "read loop ended");
                    return SessionEnd::Reconnect;
                }
            };

            match frame.body {
                FrameBody::Acknack(ack) => {
                    // A peer acking faster than useful is ignored.
                    if let Some(at) = last_processed {
                        if at.elapsed() < ACK_MIN_INTERVAL {
                            debug!("acknack inside rate-limit window, dropped");
                            continue;
                        }
                    }
                    last_processed = Some(Instant::now());
                    self.events.emit(OpEvent::AckReceived {
                        low: ack.low_acked,
                        high: ack.high_acked,
                        gap_count: ack.gap_pairs.len(),
                    });
                    self.last_acked.store(ack.high_acked, Ordering::Release);
                    self.gaps.lock().receive_ack_set(
                        ack.low_acked,
                        ack.high_acked,
                        &ack.gap_pairs,
                    );
                }
                FrameBody::Alert { message } => {
                    warn!(message = %message, "peer alert, terminating session");
                    self.events.emit(OpEvent::AlertReceived { message });
                    return SessionEnd::Stop;
                }
                other => {
                    warn!(?other, "unexpected frame type, ignoring");
                }
            }
        }
    }
}

/// Reads one complete frame: preamble, then the declared payload.
///
/// The payload is consumed before the type code is classified, so an
/// unknown frame type leaves the stream positioned at the next preamble
/// and the caller can skip the frame.
async fn read_frame(read: &mut OwnedReadHalf, timeout: Duration) -> Cd11Result<Frame> {
    let mut preamble = [0u8; PREAMBLE_SIZE];
    tokio::time::timeout(timeout, read.read_exact(&mut preamble))
        .await
        .map_err(|_| {
            Cd11Error::IoError(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "read timeout",
            ))
        })??;
    let (raw_type, payload_len) = decode_raw_preamble(&preamble)?;
    let mut payload = vec![0u8; payload_len as usize];
    tokio::time::timeout(timeout, read.read_exact(&mut payload))
        .await
        .map_err(|_| {
            Cd11Error::IoError(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "read timeout",
            ))
        })??;
    let frame_type = FrameType::from_raw(raw_type)?;
    Frame::decode_body(frame_type, &payload)
}
