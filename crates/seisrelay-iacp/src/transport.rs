//! IACP connection: handshake, heartbeat, dispatch, throttled sends.
//!
//! One connection owns a TCP stream to an ISI server. Sends go through
//! the adaptive throttle; the read loop dispatches frames by payload type
//! and feeds the application range to the ISI decoder. Heartbeat NOPs and
//! the periodic latency poll run as a side task so a partially read frame
//! is never cancelled mid-stream.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use seisrelay_core::{EventSender, LatencySource, OpEvent};

use crate::error::{IacpError, IacpResult};
use crate::frame::{
    decode_alert, encode_alert, AlertCode, HandshakeParams, IacpFrame, PayloadKind,
    AUTH_HEADER_SIZE, MAX_AUTH_SIZE, PREAMBLE_SIZE,
};
use crate::isi::{seq_request_payloads, IsiDecoder, IsiHandler, SeqNo};
use crate::throttle::{AdaptiveThrottle, ThrottleAction, ThrottleConfig};

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct IacpConfig {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Station name used for latency lookups.
    pub station: String,
    /// Handshake parameters offered to the server.
    pub params: HandshakeParams,
    /// Connect timeout.
    pub connect_timeout: Duration,
    /// Interval between heartbeat NOPs.
    pub heartbeat_interval: Duration,
    /// Throttle configuration.
    pub throttle: ThrottleConfig,
}

impl Default for IacpConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            station: String::new(),
            params: HandshakeParams {
                pid: std::process::id(),
                timeout_secs: 30,
                sndbuf: 65536,
                rcvbuf: 65536,
            },
            connect_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(60),
            throttle: ThrottleConfig::default(),
        }
    }
}

/// Why the read loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    /// Local termination was requested.
    Terminated,
    /// The peer sent a fatal alert.
    PeerAlert(AlertCode),
    /// The throttle collapsed; disconnect and let realtime catch up.
    ThrottleDisconnect,
    /// I/O error or EOF on the socket.
    ConnectionLost,
}

/// Shared send-side state, used by both the caller and the side task.
struct SendState {
    write: tokio::sync::Mutex<OwnedWriteHalf>,
    next_seq: AtomicU32,
    throttle: Mutex<AdaptiveThrottle>,
}

impl SendState {
    /// Encodes and writes one frame, pacing through the throttle first.
    async fn send(&self, kind: PayloadKind, payload: Bytes) -> IacpResult<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let bytes = IacpFrame::new(seq, kind, payload).encode();
        let pause = self.throttle.lock().on_sent(bytes.len(), Instant::now());
        if let Some(pause) = pause {
            tokio::time::sleep(pause).await;
        }
        let mut write = self.write.lock().await;
        write.write_all(&bytes).await?;
        write.flush().await?;
        Ok(())
    }
}

/// One live IACP connection.
pub struct IacpConnection {
    read: OwnedReadHalf,
    send: Arc<SendState>,
    /// Parameters after the server's handshake response.
    params: HandshakeParams,
    station: String,
    read_timeout: Duration,
    heartbeat_interval: Duration,
    events: EventSender,
}

impl IacpConnection {
    /// Connects and completes the parameter handshake.
    pub async fn connect(config: &IacpConfig, events: EventSender) -> IacpResult<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| IacpError::HandshakeFailed {
                reason: format!("connect to {addr} timed out"),
            })??;
        let _ = stream.set_nodelay(true);
        let (mut read, mut write) = stream.into_split();

        let offered = config.params;
        let hello = IacpFrame::new(0, PayloadKind::Handshake, offered.encode());
        write.write_all(&hello.encode()).await?;
        write.flush().await?;

        let read_timeout = Duration::from_secs(u64::from(offered.timeout_secs.max(1)));
        let response = read_frame(&mut read, read_timeout).await?;
        if response.kind != PayloadKind::Handshake {
            return Err(IacpError::HandshakeFailed {
                reason: format!("expected handshake response, got {:?}", response.kind),
            });
        }
        let adopted = HandshakeParams::decode(&response.payload, offered)?;
        log_overrides(offered, adopted);
        info!(addr = %addr, timeout_secs = adopted.timeout_secs, "IACP connection established");

        Ok(Self {
            read,
            send: Arc::new(SendState {
                write: tokio::sync::Mutex::new(write),
                next_seq: AtomicU32::new(1),
                throttle: Mutex::new(AdaptiveThrottle::new(config.throttle)),
            }),
            params: adopted,
            station: config.station.clone(),
            read_timeout: Duration::from_secs(u64::from(adopted.timeout_secs.max(1))),
            heartbeat_interval: config.heartbeat_interval,
            events,
        })
    }

    /// The parameters in effect after server overrides.
    pub fn params(&self) -> HandshakeParams {
        self.params
    }

    /// Sends one frame, pacing through the throttle.
    pub async fn send(&self, kind: PayloadKind, payload: Bytes) -> IacpResult<()> {
        self.send.send(kind, payload).await
    }

    /// Sends a heartbeat NOP.
    pub async fn send_nop(&self) -> IacpResult<()> {
        self.send(PayloadKind::Nop, Bytes::new()).await
    }

    /// Sends an alert to the peer.
    pub async fn send_alert(&self, code: AlertCode) -> IacpResult<()> {
        self.send(PayloadKind::Alert, encode_alert(code)).await
    }

    /// Issues a sequence-range request: format, compression and range
    /// frames, then a NULL to start streaming.
    pub async fn send_seq_request(
        &self,
        start: SeqNo,
        end: SeqNo,
        format: u32,
        compression: u32,
    ) -> IacpResult<()> {
        for (kind, payload) in seq_request_payloads(start, end, format, compression) {
            self.send(kind, payload).await?;
        }
        debug!(
            start_sig = start.signature,
            end_sig = end.signature,
            "sequence request issued"
        );
        Ok(())
    }

    /// Runs the connection until a terminal condition.
    ///
    /// Application payloads go to `decoder`; decode failures drop the
    /// frame and the loop continues. Heartbeats, the latency poll and
    /// termination run as a side task sharing the send state.
    pub async fn run<H: IsiHandler>(
        self,
        decoder: &mut IsiDecoder<H>,
        latency: Arc<dyn LatencySource>,
        terminate: watch::Receiver<bool>,
    ) -> IacpResult<RunEnd> {
        let Self {
            mut read,
            send,
            params: _,
            station,
            read_timeout,
            heartbeat_interval,
            events,
        } = self;

        let mut side = tokio::spawn(side_task(
            Arc::clone(&send),
            events.clone(),
            latency,
            station,
            heartbeat_interval,
            terminate,
        ));

        let end = loop {
            tokio::select! {
                frame = read_frame(&mut read, read_timeout) => {
                    let frame = match frame {
                        Ok(frame) => frame,
                        Err(IacpError::UnknownPayloadType { raw }) => {
                            warn!(raw, "unknown payload type, frame dropped");
                            continue;
                        }
                        Err(e) => {
                            debug!(error = %e, "read loop ended");
                            break RunEnd::ConnectionLost;
                        }
                    };
                    if !frame.auth.is_empty() {
                        debug!(
                            key_id = frame.auth_key_id,
                            auth_len = frame.auth.len(),
                            "frame carried auth trailer"
                        );
                    }
                    match frame.kind {
                        PayloadKind::Null | PayloadKind::Nop => {
                            debug!(seq = frame.seq, kind = ?frame.kind, "keepalive");
                        }
                        PayloadKind::Handshake => {
                            warn!(seq = frame.seq, "handshake frame after negotiation, ignoring");
                        }
                        PayloadKind::Enosuch => {
                            warn!(seq = frame.seq, "peer reports no such entity");
                        }
                        PayloadKind::Alert => {
                            let code = match decode_alert(&frame.payload) {
                                Ok(code) => code,
                                Err(e) => {
                                    warn!(error = %e, "undecodable alert, frame dropped");
                                    continue;
                                }
                            };
                            events.emit(OpEvent::AlertReceived {
                                message: format!("{code:?}"),
                            });
                            if code.is_fatal() {
                                warn!(?code, "fatal alert from peer");
                                break RunEnd::PeerAlert(code);
                            }
                            info!(?code, "alert from peer");
                        }
                        PayloadKind::Application(_) => {
                            if let Err(e) = decoder.decode_payload(&frame.payload) {
                                warn!(seq = frame.seq, error = %e, "bad ISI payload, frame dropped");
                            }
                        }
                    }
                }
                end = &mut side => {
                    break end.unwrap_or(RunEnd::ConnectionLost);
                }
            }
        };
        side.abort();
        Ok(end)
    }
}

/// Heartbeat, latency poll and termination watcher for one connection.
async fn side_task(
    send: Arc<SendState>,
    events: EventSender,
    latency: Arc<dyn LatencySource>,
    station: String,
    heartbeat_interval: Duration,
    mut terminate: watch::Receiver<bool>,
) -> RunEnd {
    let check_interval = send.throttle.lock().check_interval();
    let now = tokio::time::Instant::now();
    let mut heartbeat = tokio::time::interval_at(now + heartbeat_interval, heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut latency_poll = tokio::time::interval_at(now + check_interval, check_interval);
    latency_poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if let Err(e) = send.send(PayloadKind::Nop, Bytes::new()).await {
                    debug!(error = %e, "heartbeat failed");
                    return RunEnd::ConnectionLost;
                }
            }
            _ = latency_poll.tick() => {
                match latency.latency(&station).await {
                    Ok(current) => {
                        let action = send
                            .throttle
                            .lock()
                            .on_latency_sample(current.as_secs_f64(), Instant::now());
                        match action {
                            ThrottleAction::None => {}
                            ThrottleAction::RateChanged(rate_bps) => {
                                events.emit(OpEvent::ThrottleChanged { rate_bps });
                            }
                            ThrottleAction::Disconnect => {
                                let _ = send
                                    .send(PayloadKind::Alert, encode_alert(AlertCode::Disconnect))
                                    .await;
                                return RunEnd::ThrottleDisconnect;
                            }
                        }
                    }
                    Err(e) => debug!(error = %e, "latency source unavailable"),
                }
            }
            changed = terminate.changed() => {
                if changed.is_err() || *terminate.borrow() {
                    let _ = send
                        .send(PayloadKind::Alert, encode_alert(AlertCode::Disconnect))
                        .await;
                    return RunEnd::Terminated;
                }
            }
        }
    }
}

fn log_overrides(offered: HandshakeParams, adopted: HandshakeParams) {
    if adopted.timeout_secs != offered.timeout_secs {
        info!(
            offered = offered.timeout_secs,
            adopted = adopted.timeout_secs,
            "server overrode timeout"
        );
    }
    if adopted.sndbuf != offered.sndbuf {
        info!(offered = offered.sndbuf, adopted = adopted.sndbuf, "server overrode sndbuf");
    }
    if adopted.rcvbuf != offered.rcvbuf {
        info!(offered = offered.rcvbuf, adopted = adopted.rcvbuf, "server overrode rcvbuf");
    }
}

/// Reads one complete frame: preamble, payload, auth trailer.
///
/// The payload and trailer are consumed before the type code is
/// classified, so an unknown payload type leaves the stream positioned at
/// the next preamble and the run loop can skip the frame.
async fn read_frame(read: &mut OwnedReadHalf, timeout: Duration) -> IacpResult<IacpFrame> {
    let mut preamble = [0u8; PREAMBLE_SIZE];
    read_exact_timed(read, &mut preamble, timeout).await?;
    let (seq, raw_type, payload_len) = crate::frame::decode_raw_preamble(&preamble)?;
    let mut payload = vec![0u8; payload_len as usize];
    read_exact_timed(read, &mut payload, timeout).await?;
    let mut auth_header = [0u8; AUTH_HEADER_SIZE];
    read_exact_timed(read, &mut auth_header, timeout).await?;
    let auth_key_id = u32::from_be_bytes(auth_header[0..4].try_into().unwrap_or_default());
    let auth_len = u32::from_be_bytes(auth_header[4..8].try_into().unwrap_or_default());
    if auth_len > MAX_AUTH_SIZE {
        return Err(IacpError::PayloadTooLarge {
            size: auth_len,
            max_size: MAX_AUTH_SIZE,
        });
    }
    let mut auth = vec![0u8; auth_len as usize];
    read_exact_timed(read, &mut auth, timeout).await?;
    let kind = PayloadKind::from_raw(raw_type)?;
    Ok(IacpFrame {
        seq,
        kind,
        payload: Bytes::from(payload),
        auth_key_id,
        auth: Bytes::from(auth),
    })
}

async fn read_exact_timed(
    read: &mut OwnedReadHalf,
    buf: &mut [u8],
    timeout: Duration,
) -> IacpResult<()> {
    tokio::time::timeout(timeout, read.read_exact(buf))
        .await
        .map_err(|_| {
            IacpError::IoError(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "read timeout",
            ))
        })??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isi::{encode_record, DataDesc, IsiRecord, ISI_DATA, TYPE_MINISEED};
    use seisrelay_core::CoreResult;
    use tokio::net::TcpListener;

    struct FixedLatency(Duration);

    #[async_trait::async_trait]
    impl LatencySource for FixedLatency {
        async fn latency(&self, _station: &str) -> CoreResult<Duration> {
            Ok(self.0)
        }
    }

    #[derive(Default)]
    struct Collect {
        miniseed: Vec<IsiRecord>,
        initial: Vec<SeqNo>,
    }

    impl IsiHandler for Collect {
        fn on_initial_sequence(&mut self, seqno: SeqNo) {
            self.initial.push(seqno);
        }
        fn on_miniseed(&mut self, record: IsiRecord) {
            self.miniseed.push(record);
        }
        fn on_legacy(&mut self, _record: IsiRecord) {}
        fn on_raw_status(&mut self, _status: &[u8]) {}
    }

    async fn serve_handshake(listener: TcpListener, response: HandshakeParams) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        // Consume the client hello.
        let mut preamble = [0u8; PREAMBLE_SIZE];
        stream.read_exact(&mut preamble).await.unwrap();
        let payload_len = u32::from_be_bytes(preamble[12..16].try_into().unwrap()) as usize;
        let mut rest = vec![0u8; payload_len + AUTH_HEADER_SIZE];
        stream.read_exact(&mut rest).await.unwrap();

        let reply = IacpFrame::new(0, PayloadKind::Handshake, response.encode());
        stream.write_all(&reply.encode()).await.unwrap();
        stream
    }

    fn test_config(port: u16) -> IacpConfig {
        IacpConfig {
            host: "127.0.0.1".to_string(),
            port,
            station: "anmo".to_string(),
            ..IacpConfig::default()
        }
    }

    #[tokio::test]
    async fn test_handshake_adopts_server_overrides() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let offered = IacpConfig::default().params;
        let server = tokio::spawn(serve_handshake(
            listener,
            HandshakeParams {
                timeout_secs: 90,
                ..offered
            },
        ));

        let conn = IacpConnection::connect(&test_config(port), EventSender::discard())
            .await
            .unwrap();
        assert_eq!(conn.params().timeout_secs, 90);
        assert_eq!(conn.params().pid, offered.pid);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_delivers_records_and_stops_on_alert() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let offered = IacpConfig::default().params;

        let record = IsiRecord {
            site: "anmo".to_string(),
            seqno: SeqNo {
                signature: 0x42,
                counter: 17,
            },
            desc: DataDesc {
                compression: 0,
                data_type: TYPE_MINISEED,
                byte_order: 1,
                sample_size: 4,
            },
            len_used: 8,
            len_native: 8,
            payload: Bytes::from_static(b"seismics"),
        };
        let wire_record = record.clone();

        let server = tokio::spawn(async move {
            let mut stream = serve_handshake(listener, offered).await;
            let data = IacpFrame::new(
                1,
                PayloadKind::Application(ISI_DATA),
                encode_record(&wire_record),
            );
            stream.write_all(&data.encode()).await.unwrap();
            let alert = IacpFrame::new(2, PayloadKind::Alert, encode_alert(AlertCode::Shutdown));
            stream.write_all(&alert.encode()).await.unwrap();
            // Hold the socket open until the client is done.
            let mut sink = vec![0u8; 1024];
            let _ = stream.read(&mut sink).await;
        });

        let conn = IacpConnection::connect(&test_config(port), EventSender::discard())
            .await
            .unwrap();
        let mut decoder = IsiDecoder::new(Collect::default());
        let (_tx, terminate) = watch::channel(false);
        let end = conn
            .run(
                &mut decoder,
                Arc::new(FixedLatency(Duration::from_secs(2))),
                terminate,
            )
            .await
            .unwrap();

        assert_eq!(end, RunEnd::PeerAlert(AlertCode::Shutdown));
        let handler = decoder.into_handler();
        assert_eq!(handler.miniseed, vec![record]);
        assert_eq!(handler.initial.len(), 1);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_skips_unknown_payload_type() {
        use bytes::BufMut;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let offered = IacpConfig::default().params;

        let record = IsiRecord {
            site: "anmo".to_string(),
            seqno: SeqNo {
                signature: 0x42,
                counter: 3,
            },
            desc: DataDesc {
                compression: 0,
                data_type: TYPE_MINISEED,
                byte_order: 1,
                sample_size: 4,
            },
            len_used: 4,
            len_native: 4,
            payload: Bytes::from_static(b"data"),
        };
        let wire_record = record.clone();

        let server = tokio::spawn(async move {
            let mut stream = serve_handshake(listener, offered).await;
            // A frame with an undefined payload type, carrying a payload
            // and a non-empty auth trailer.
            let mut junk = bytes::BytesMut::new();
            junk.put_slice(&crate::frame::SIGNATURE);
            junk.put_u32(1);
            junk.put_u32(500);
            junk.put_u32(4);
            junk.put_slice(&[0xAB; 4]);
            junk.put_u32(0);
            junk.put_u32(8);
            junk.put_slice(&[0xCD; 8]);
            stream.write_all(&junk).await.unwrap();
            // The record behind it must still be parsed cleanly.
            let data = IacpFrame::new(
                2,
                PayloadKind::Application(ISI_DATA),
                encode_record(&wire_record),
            );
            stream.write_all(&data.encode()).await.unwrap();
            let alert = IacpFrame::new(3, PayloadKind::Alert, encode_alert(AlertCode::Shutdown));
            stream.write_all(&alert.encode()).await.unwrap();
            let mut sink = vec![0u8; 1024];
            let _ = stream.read(&mut sink).await;
        });

        let conn = IacpConnection::connect(&test_config(port), EventSender::discard())
            .await
            .unwrap();
        let mut decoder = IsiDecoder::new(Collect::default());
        let (_tx, terminate) = watch::channel(false);
        let end = conn
            .run(
                &mut decoder,
                Arc::new(FixedLatency(Duration::from_secs(2))),
                terminate,
            )
            .await
            .unwrap();

        assert_eq!(end, RunEnd::PeerAlert(AlertCode::Shutdown));
        assert_eq!(decoder.into_handler().miniseed, vec![record]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_sends_disconnect_alert() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let offered = IacpConfig::default().params;

        let server = tokio::spawn(async move {
            let mut stream = serve_handshake(listener, offered).await;
            // Expect the client's disconnect alert.
            let mut preamble = [0u8; PREAMBLE_SIZE];
            stream.read_exact(&mut preamble).await.unwrap();
            let kind = u32::from_be_bytes(preamble[8..12].try_into().unwrap());
            assert_eq!(PayloadKind::from_raw(kind).unwrap(), PayloadKind::Alert);
        });

        let conn = IacpConnection::connect(&test_config(port), EventSender::discard())
            .await
            .unwrap();
        let mut decoder = IsiDecoder::new(Collect::default());
        let (tx, terminate) = watch::channel(false);
        let runner = tokio::spawn(async move {
            conn.run(
                &mut decoder,
                Arc::new(FixedLatency(Duration::from_secs(2))),
                terminate,
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let end = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(end, RunEnd::Terminated);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_seq_request_frames_on_wire() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let offered = IacpConfig::default().params;

        let server = tokio::spawn(async move {
            let mut stream = serve_handshake(listener, offered).await;
            let mut kinds = Vec::new();
            for _ in 0..4 {
                let mut preamble = [0u8; PREAMBLE_SIZE];
                stream.read_exact(&mut preamble).await.unwrap();
                let raw = u32::from_be_bytes(preamble[8..12].try_into().unwrap());
                let len = u32::from_be_bytes(preamble[12..16].try_into().unwrap()) as usize;
                let mut rest = vec![0u8; len + AUTH_HEADER_SIZE];
                stream.read_exact(&mut rest).await.unwrap();
                kinds.push(PayloadKind::from_raw(raw).unwrap());
            }
            kinds
        });

        let conn = IacpConnection::connect(&test_config(port), EventSender::discard())
            .await
            .unwrap();
        conn.send_seq_request(
            SeqNo {
                signature: crate::isi::SEQ_SIG_OLDEST,
                counter: 0,
            },
            SeqNo {
                signature: crate::isi::SEQ_SIG_KEEPUP,
                counter: u64::MAX,
            },
            1,
            0,
        )
        .await
        .unwrap();

        let kinds = server.await.unwrap();
        assert_eq!(
            kinds,
            vec![
                PayloadKind::Application(crate::isi::ISI_REQ_FORMAT),
                PayloadKind::Application(crate::isi::ISI_REQ_COMPRESS),
                PayloadKind::Application(crate::isi::ISI_REQ_SEQ_RANGE),
                PayloadKind::Null,
            ]
        );
    }
}
