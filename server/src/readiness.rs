//! Readiness-mode (reactor) connection driver.
//!
//! One task per connection on the owning worker's event loop. The task
//! multiplexes on socket readiness — always readable, writable only while
//! output is pending — and drives every transfer itself with `try_read`
//! and `try_write`, so partial transfers and `WouldBlock` are its problem
//! rather than the runtime's. Inbound bytes pass through fixed staging
//! (6-byte header, then a payload buffer sized from the validated header);
//! outbound bytes drain from the direct buffer first and then from the
//! overflow FIFO, re-queueing whatever a partial write leaves behind.

use crate::admission::Op;
use crate::connection::{Connection, DispatchError, Inbound, OutQueue};
use crate::worker::Worker;
use log::{debug, error};
use shared::codec::{self, CLIENT_HEADER_LEN};
use shared::packet::Packet;
use std::io;
use std::sync::Arc;
use tokio::io::Interest;
use tokio::net::TcpStream;

/// Stack chunk for draining the socket on each readable event.
const CHUNK_SIZE: usize = 4096;

/// A message mid-reassembly: header staging, then the payload it declared.
struct RecvStaging {
    header: [u8; CLIENT_HEADER_LEN],
    header_filled: usize,
    payload: Option<PendingPayload>,
}

struct PendingPayload {
    opcode: u16,
    buf: Vec<u8>,
    filled: usize,
}

impl RecvStaging {
    fn new() -> Self {
        Self {
            header: [0; CLIENT_HEADER_LEN],
            header_filled: 0,
            payload: None,
        }
    }
}

enum InputVerdict {
    /// Socket drained for now, connection stays up.
    Idle,
    /// Zero-length read: graceful close.
    PeerClosed,
    /// Protocol violation or dispatch failure.
    Dispatch(DispatchError),
    /// Unrecoverable socket error.
    Fatal(io::Error),
}

enum OutputVerdict {
    /// Everything drained; writable interest was dropped.
    Drained,
    /// Output still pending; keep writable interest.
    Pending,
    /// Unrecoverable socket error.
    Fatal(io::Error),
}

/// Drives one connection until it closes, then releases its bookkeeping.
pub async fn drive(conn: Arc<Connection>, worker: Arc<Worker>, stream: TcpStream) {
    // safer to send first
    conn.send_auth_challenge();

    let mut inbound = Inbound::new();
    let mut staging = RecvStaging::new();

    while conn.is_open() {
        let interest = if conn.write_armed() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };

        let ready = tokio::select! {
            _ = conn.wait_closed() => break,
            // a producer armed the writer; recompute our interest set
            _ = conn.wait_write_signal() => continue,
            ready = stream.ready(interest) => ready,
        };

        let ready = match ready {
            Ok(ready) => ready,
            Err(e) => {
                if conn.is_open() {
                    error!("{}: readiness wait failed: {}", conn.remote(), e);
                }
                break;
            }
        };

        if ready.is_readable() {
            tokio::select! {
                _ = conn.wait_closed() => break,
                _ = worker.admission().acquire(Op::Read) => {}
            }
            let verdict = handle_input(&conn, &mut inbound, &mut staging, &stream);
            worker.admission().complete();

            match verdict {
                InputVerdict::Idle => {}
                InputVerdict::PeerClosed => {
                    debug!("{}: peer closed connection", conn.remote());
                    break;
                }
                InputVerdict::Dispatch(e) => {
                    error!("{}: {}", conn.remote(), e);
                    break;
                }
                InputVerdict::Fatal(e) => {
                    if conn.is_open() {
                        error!("{}: read failed: {}", conn.remote(), e);
                    }
                    break;
                }
            }
        }

        if ready.is_writable() && conn.is_open() {
            tokio::select! {
                _ = conn.wait_closed() => break,
                _ = worker.admission().acquire(Op::Write) => {}
            }
            let verdict = handle_output(&conn, &stream);
            worker.admission().complete();

            match verdict {
                OutputVerdict::Drained | OutputVerdict::Pending => {}
                OutputVerdict::Fatal(e) => {
                    if conn.is_open() {
                        error!("{}: write failed: {}", conn.remote(), e);
                    }
                    break;
                }
            }
        }
    }

    conn.close();
    flush_remaining(&conn, &stream).await;
    conn.finalize();
    worker.remove_client();
    debug!("{}: connection closed", conn.remote());
}

/// Last-gasp drain so a final queued packet (an auth-failure status, say)
/// still reaches the peer before the socket goes away.
async fn flush_remaining(conn: &Arc<Connection>, stream: &TcpStream) {
    loop {
        match handle_output(conn, stream) {
            OutputVerdict::Drained | OutputVerdict::Fatal(_) => return,
            OutputVerdict::Pending => {
                if stream.writable().await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Pulls chunks off the socket until it would block, feeding each through
/// the staged reassembly.
fn handle_input(
    conn: &Arc<Connection>,
    inbound: &mut Inbound,
    staging: &mut RecvStaging,
    stream: &TcpStream,
) -> InputVerdict {
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        match stream.try_read(&mut chunk) {
            Ok(0) => return InputVerdict::PeerClosed,
            Ok(n) => {
                if let Err(e) = consume_chunk(conn, inbound, staging, &chunk[..n]) {
                    return InputVerdict::Dispatch(e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return InputVerdict::Idle,
            Err(e) => return InputVerdict::Fatal(e),
        }
    }
}

/// Copies fresh bytes into the header or payload staging, dispatching each
/// message the instant it completes. Zero-length payloads complete as soon
/// as their header does.
fn consume_chunk(
    conn: &Arc<Connection>,
    inbound: &mut Inbound,
    staging: &mut RecvStaging,
    mut bytes: &[u8],
) -> Result<(), DispatchError> {
    loop {
        if let Some(pending) = staging.payload.as_mut() {
            let want = pending.buf.len() - pending.filled;
            let take = want.min(bytes.len());
            pending.buf[pending.filled..pending.filled + take].copy_from_slice(&bytes[..take]);
            pending.filled += take;
            bytes = &bytes[take..];

            if pending.filled < pending.buf.len() {
                return Ok(());
            }

            if let Some(done) = staging.payload.take() {
                staging.header_filled = 0;
                conn.process_incoming(inbound, Packet::with_payload(done.opcode, done.buf))?;
            }
            continue;
        }

        if bytes.is_empty() {
            return Ok(());
        }

        let want = CLIENT_HEADER_LEN - staging.header_filled;
        let take = want.min(bytes.len());
        staging.header[staging.header_filled..staging.header_filled + take]
            .copy_from_slice(&bytes[..take]);
        staging.header_filled += take;
        bytes = &bytes[take..];

        if staging.header_filled < CLIENT_HEADER_LEN {
            return Ok(());
        }

        // The payload buffer is sized only after the header passes its
        // bounds checks.
        let header = codec::decode_client_header(&mut staging.header, &mut inbound.crypt)?;
        staging.payload = Some(PendingPayload {
            opcode: header.opcode,
            buf: vec![0; header.length as usize],
            filled: 0,
        });
    }
}

/// Drains pending output: the direct buffer first, then overflow blocks.
/// Partial writes stay queued; only a fully drained connection drops its
/// writable interest.
fn handle_output(conn: &Arc<Connection>, stream: &TcpStream) -> OutputVerdict {
    let mut out = conn.out().lock().unwrap();
    let (buffer, overflow, armed) = match &mut out.queue {
        OutQueue::Direct {
            buffer,
            overflow,
            armed,
        } => (buffer, overflow, armed),
        OutQueue::Swap { .. } => unreachable!("readiness driver on a completion connection"),
    };

    loop {
        if !buffer.is_empty() {
            match stream.try_write(buffer.readable()) {
                Ok(0) => {
                    return OutputVerdict::Fatal(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted no bytes",
                    ))
                }
                Ok(n) => {
                    buffer.advance_read(n);
                    if buffer.is_empty() {
                        buffer.reset();
                        continue;
                    }
                    buffer.crunch();
                    return OutputVerdict::Pending;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return OutputVerdict::Pending,
                Err(e) => return OutputVerdict::Fatal(e),
            }
        }

        match overflow.pop_front() {
            None => {
                *armed = false;
                return OutputVerdict::Drained;
            }
            Some(mut block) => match stream.try_write(&block) {
                Ok(n) if n == block.len() => continue,
                Ok(n) => {
                    block.drain(..n);
                    overflow.push_front(block);
                    return OutputVerdict::Pending;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    overflow.push_front(block);
                    return OutputVerdict::Pending;
                }
                Err(e) => return OutputVerdict::Fatal(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IoMode, NetConfig};
    use crate::connection::PacketSender;
    use crate::session::{AuthGrant, AuthHandler, Session};
    use shared::packet::{opcodes, AuthSession};
    use std::sync::Mutex;

    struct RecordingSession {
        packets: Mutex<Vec<Packet>>,
    }

    impl Session for RecordingSession {
        fn queue_packet(&self, packet: Packet) {
            self.packets.lock().unwrap().push(packet);
        }

        fn set_latency(&self, _latency: u32) {}
    }

    struct GrantAll {
        session: Arc<RecordingSession>,
    }

    impl AuthHandler for GrantAll {
        fn authenticate(
            &self,
            _request: &AuthSession,
            _remote: &str,
            _server_seed: u32,
            _sender: PacketSender,
        ) -> Result<AuthGrant, u8> {
            Ok(AuthGrant {
                session_key: b"staging test key".to_vec(),
                session: Arc::clone(&self.session) as Arc<dyn Session>,
            })
        }
    }

    fn test_conn() -> (Arc<Connection>, Arc<RecordingSession>) {
        let session = Arc::new(RecordingSession {
            packets: Mutex::new(Vec::new()),
        });
        let auth = Arc::new(GrantAll {
            session: Arc::clone(&session),
        });
        let conn = Connection::new(
            "127.0.0.1:8888".to_string(),
            IoMode::Readiness,
            &NetConfig::default(),
            auth,
        );
        (conn, session)
    }

    fn authenticated() -> (Arc<Connection>, Arc<RecordingSession>, Inbound, RecvStaging) {
        let (conn, session) = test_conn();
        let mut inbound = Inbound::new();
        let mut staging = RecvStaging::new();

        let packet = Packet::encode(
            opcodes::CMSG_AUTH_SESSION,
            &AuthSession {
                build: 9,
                account: "STAGED".to_string(),
                client_seed: 3,
                digest: [2; 20],
            },
        );
        let mut frame = codec::encode_client_header(packet.opcode, packet.payload.len()).to_vec();
        frame.extend_from_slice(&packet.payload);
        consume_chunk(&conn, &mut inbound, &mut staging, &frame).unwrap();
        assert!(inbound.crypt.is_initialized());

        (conn, session, inbound, staging)
    }

    fn encrypted_frame(opcode: u16, payload: &[u8]) -> Vec<u8> {
        let mut crypt = shared::HeaderCrypt::new();
        crypt.init(b"staging test key");
        let mut header = codec::encode_client_header(opcode, payload.len());
        crypt.encrypt(&mut header);
        let mut frame = header.to_vec();
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_reassembly_identical_across_splits() {
        let frame = encrypted_frame(0x444, b"reactor-payload");

        for split_at in [None, Some(1), Some(3), Some(7), Some(frame.len() - 1)] {
            let (conn, session, mut inbound, mut staging) = authenticated();
            match split_at {
                None => {
                    consume_chunk(&conn, &mut inbound, &mut staging, &frame).unwrap();
                }
                Some(at) => {
                    consume_chunk(&conn, &mut inbound, &mut staging, &frame[..at]).unwrap();
                    assert!(session.packets.lock().unwrap().is_empty());
                    consume_chunk(&conn, &mut inbound, &mut staging, &frame[at..]).unwrap();
                }
            }
            let packets = session.packets.lock().unwrap();
            assert_eq!(packets.len(), 1);
            assert_eq!(packets[0].opcode, 0x444);
            assert_eq!(packets[0].payload, b"reactor-payload");
        }
    }

    #[test]
    fn test_reassembly_byte_by_byte() {
        let frame = encrypted_frame(0x445, b"one-at-a-time");
        let (conn, session, mut inbound, mut staging) = authenticated();
        for byte in &frame {
            consume_chunk(&conn, &mut inbound, &mut staging, std::slice::from_ref(byte)).unwrap();
        }
        let packets = session.packets.lock().unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload, b"one-at-a-time");
    }

    #[test]
    fn test_several_messages_in_one_chunk() {
        let (conn, session, mut inbound, mut staging) = authenticated();

        let mut crypt = shared::HeaderCrypt::new();
        crypt.init(b"staging test key");
        let mut bytes = Vec::new();
        for i in 0..3u8 {
            let mut header = codec::encode_client_header(0x600 + i as u16, 2);
            crypt.encrypt(&mut header);
            bytes.extend_from_slice(&header);
            bytes.extend_from_slice(&[i, i]);
        }

        consume_chunk(&conn, &mut inbound, &mut staging, &bytes).unwrap();
        let packets = session.packets.lock().unwrap();
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[1].opcode, 0x601);
    }

    #[test]
    fn test_zero_length_payload_dispatches_at_header_end() {
        let (conn, session, mut inbound, mut staging) = authenticated();
        let frame = encrypted_frame(0x446, &[]);
        consume_chunk(&conn, &mut inbound, &mut staging, &frame).unwrap();
        let packets = session.packets.lock().unwrap();
        assert_eq!(packets.len(), 1);
        assert!(packets[0].payload.is_empty());
    }

    #[test]
    fn test_bounds_violation_rejected_before_allocation() {
        let (conn, _session) = test_conn();
        let mut inbound = Inbound::new();
        let mut staging = RecvStaging::new();

        let raw = codec::encode_client_header(0x444, 10241 - 4);
        let err = consume_chunk(&conn, &mut inbound, &mut staging, &raw).unwrap_err();
        assert!(matches!(err, DispatchError::Protocol(_)));
        assert!(staging.payload.is_none(), "no payload buffer was sized");
    }

    #[test]
    fn test_oversized_opcode_rejected() {
        let (conn, _session) = test_conn();
        let mut inbound = Inbound::new();
        let mut staging = RecvStaging::new();

        let mut raw = codec::encode_client_header(0, 4).to_vec();
        raw[2..6].copy_from_slice(&10241u32.to_le_bytes());
        let err = consume_chunk(&conn, &mut inbound, &mut staging, &raw).unwrap_err();
        assert!(matches!(err, DispatchError::Protocol(_)));
        assert!(staging.payload.is_none());
    }
}
