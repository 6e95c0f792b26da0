//! Per-client connection state shared by both I/O drivers.
//!
//! A `Connection` owns everything about one client that is independent of
//! how the socket is driven: the lifecycle flag, the session slot, the
//! outbound buffers and send-direction cipher, and the dispatcher that
//! routes reassembled messages. The receive direction ([`Inbound`]) is
//! deliberately *not* part of the shared state — it is owned by the driver
//! task and never crosses a thread, so the read path runs lock-free.
//!
//! `send_packet` is the one entry point reachable from foreign threads
//! (game logic calling back through its [`PacketSender`]); framing, header
//! encryption and the buffer append happen under a single per-connection
//! lock so interleaved sends can never interleave their bytes on the wire.

use crate::config::{IoMode, NetConfig};
use crate::session::{AuthHandler, Session};
use log::{debug, error, info};
use shared::buffer::Buffer;
use shared::codec::{self, ProtocolError};
use shared::packet::{opcodes, AuthChallenge, AuthResponse, AuthSession, Packet, Ping, Pong};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Notify;

/// Pings arriving faster than this feed the over-speed counter.
const PING_INTERVAL: Duration = Duration::from_secs(27);

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Why a connection had to be closed from the dispatch path.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0}")]
    Protocol(#[from] ProtocolError),
    #[error("received opcode {opcode:#06x} from unauthenticated peer")]
    NotAuthenticated { opcode: u16 },
    #[error("second auth session on an authenticated connection")]
    DuplicateAuth,
    #[error("kicked for over-speed pings")]
    PingFlood,
    #[error("authentication rejected (status {code})")]
    AuthRejected { code: u8 },
    #[error("closing for undecodable packet: {0}")]
    BadPacket(#[from] bincode::Error),
}

/// Receive-direction state. Owned by the driver task, never shared.
pub struct Inbound {
    pub(crate) crypt: shared::HeaderCrypt,
    last_ping: Option<Instant>,
    overspeed_pings: u32,
}

impl Inbound {
    pub fn new() -> Self {
        Self {
            crypt: shared::HeaderCrypt::new(),
            last_ping: None,
            overspeed_pings: 0,
        }
    }
}

impl Default for Inbound {
    fn default() -> Self {
        Self::new()
    }
}

/// Send-direction state behind the connection's outbound lock.
pub(crate) struct Outbound {
    pub(crate) crypt: shared::HeaderCrypt,
    pub(crate) queue: OutQueue,
}

/// Mode-specific outbound buffering.
pub(crate) enum OutQueue {
    /// Completion mode: `busy` is being drained by the in-flight write
    /// while producers append to `active`; they swap on completion.
    Swap {
        active: Buffer,
        busy: Buffer,
        sending: bool,
    },
    /// Readiness mode: one fixed direct buffer plus pre-framed overflow
    /// blocks for whatever did not fit; `armed` mirrors the writable
    /// interest subscription.
    Direct {
        buffer: Buffer,
        overflow: VecDeque<Vec<u8>>,
        armed: bool,
    },
}

/// Cloneable, non-owning handle that lets a session write back into its
/// connection from any thread. Sends on a dead connection are dropped.
#[derive(Clone)]
pub struct PacketSender(Weak<Connection>);

impl PacketSender {
    pub fn send(&self, packet: &Packet) -> bool {
        match self.0.upgrade() {
            Some(conn) => {
                conn.send_packet(packet);
                true
            }
            None => false,
        }
    }
}

pub struct Connection {
    remote: String,
    state: AtomicU8,
    closed: Notify,
    write_signal: Notify,
    session: Mutex<Option<Arc<dyn Session>>>,
    auth: Arc<dyn AuthHandler>,
    out: Mutex<Outbound>,
    server_seed: u32,
    max_overspeed_pings: u32,
    kick_on_bad_packet: bool,
}

impl Connection {
    pub fn new(
        remote: String,
        mode: IoMode,
        cfg: &NetConfig,
        auth: Arc<dyn AuthHandler>,
    ) -> Arc<Connection> {
        let queue = match mode {
            IoMode::Completion => OutQueue::Swap {
                active: Buffer::with_capacity(cfg.send_buffer),
                busy: Buffer::with_capacity(cfg.send_buffer),
                sending: false,
            },
            IoMode::Readiness => OutQueue::Direct {
                buffer: Buffer::with_capacity(cfg.send_buffer),
                overflow: VecDeque::new(),
                armed: false,
            },
        };

        Arc::new(Connection {
            remote,
            state: AtomicU8::new(OPEN),
            closed: Notify::new(),
            write_signal: Notify::new(),
            session: Mutex::new(None),
            auth,
            out: Mutex::new(Outbound {
                crypt: shared::HeaderCrypt::new(),
                queue,
            }),
            server_seed: rand::random(),
            max_overspeed_pings: cfg.max_overspeed_pings,
            kick_on_bad_packet: cfg.kick_on_bad_packet,
        })
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn server_seed(&self) -> u32 {
        self.server_seed
    }

    pub fn sender(self: &Arc<Self>) -> PacketSender {
        PacketSender(Arc::downgrade(self))
    }

    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN
    }

    /// Requests teardown. The first caller wins and returns true; every
    /// other path (peer disconnect, write error, explicit shutdown)
    /// collapses into a no-op. The owning driver observes the transition
    /// and performs the actual resource release exactly once.
    pub fn close(&self) -> bool {
        if self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        *self.session.lock().unwrap() = None;
        self.closed.notify_waiters();
        self.write_signal.notify_one();
        true
    }

    /// Terminal transition, called by the driver once all I/O has wound
    /// down and the socket is about to be released.
    pub(crate) fn finalize(&self) -> bool {
        self.state.swap(CLOSED, Ordering::AcqRel) != CLOSED
    }

    /// Resolves once `close` has been requested. Usable from `select!`
    /// against pending I/O.
    pub async fn wait_closed(&self) {
        let notified = self.closed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.is_open() {
            return;
        }
        notified.await;
    }

    /// Resolves when a producer has queued output (or close was
    /// requested). Completion mode's writer parks here while idle.
    pub(crate) async fn wait_write_signal(&self) {
        self.write_signal.notified().await;
    }

    pub(crate) fn out(&self) -> &Mutex<Outbound> {
        &self.out
    }

    /// Whether the readiness driver should hold writable interest.
    pub(crate) fn write_armed(&self) -> bool {
        match &self.out.lock().unwrap().queue {
            OutQueue::Direct { armed, .. } => *armed,
            OutQueue::Swap { .. } => false,
        }
    }

    /// Frames, encrypts and queues a packet for sending. Callable from any
    /// thread; silently drops the packet once the connection is closing.
    pub fn send_packet(&self, packet: &Packet) {
        if !self.is_open() {
            return;
        }

        let mut out = self.out.lock().unwrap();
        // Packets must hit the buffer in the same order their headers ran
        // through the cipher; everything below stays inside this lock.
        let (mut header, header_len) = codec::encode_server_header(packet.opcode, packet.payload.len());
        out.crypt.encrypt(&mut header[..header_len]);

        match &mut out.queue {
            OutQueue::Swap {
                active,
                busy,
                sending,
            } => {
                active.put(&header[..header_len]);
                active.put(&packet.payload);
                if !*sending {
                    *sending = true;
                    std::mem::swap(active, busy);
                    self.write_signal.notify_one();
                }
            }
            OutQueue::Direct {
                buffer,
                overflow,
                armed,
            } => {
                let total = header_len + packet.payload.len();
                if overflow.is_empty() && buffer.space() >= total {
                    buffer.put(&header[..header_len]);
                    buffer.put(&packet.payload);
                } else {
                    let mut block = Vec::with_capacity(total);
                    block.extend_from_slice(&header[..header_len]);
                    block.extend_from_slice(&packet.payload);
                    overflow.push_back(block);
                }
                if !*armed {
                    *armed = true;
                    self.write_signal.notify_one();
                }
            }
        }
    }

    /// Completion mode: hands the writer the next buffer to drain, or
    /// records the connection idle for writes. The returned buffer is
    /// owned by the writer until it comes back through `recycle_chunk`.
    pub(crate) fn next_write_chunk(&self) -> Option<Buffer> {
        let mut out = self.out.lock().unwrap();
        match &mut out.queue {
            OutQueue::Swap {
                active,
                busy,
                sending,
            } => {
                if busy.is_empty() {
                    if active.is_empty() {
                        *sending = false;
                        return None;
                    }
                    std::mem::swap(active, busy);
                }
                Some(std::mem::take(busy))
            }
            OutQueue::Direct { .. } => None,
        }
    }

    /// Returns a fully drained chunk's storage for reuse.
    pub(crate) fn recycle_chunk(&self, mut chunk: Buffer) {
        chunk.reset();
        let mut out = self.out.lock().unwrap();
        if let OutQueue::Swap { busy, .. } = &mut out.queue {
            *busy = chunk;
        }
    }

    /// First bytes on the wire: the server hello carrying the seed the
    /// client folds into its auth proof plus fresh encryption seeds.
    pub fn send_auth_challenge(&self) {
        let challenge = AuthChallenge {
            protocol: 1,
            server_seed: self.server_seed,
            seed1: rand::random(),
            seed2: rand::random(),
        };
        self.send_packet(&Packet::encode(opcodes::SMSG_AUTH_CHALLENGE, &challenge));
    }

    /// Routes one fully reassembled message. Ping, keep-alive and the auth
    /// handshake are handled inline; everything else needs a session. An
    /// error verdict closes the connection (the driver logs it once).
    pub fn process_incoming(
        self: &Arc<Self>,
        inbound: &mut Inbound,
        packet: Packet,
    ) -> Result<(), DispatchError> {
        debug!(
            "{}: received opcode {:#06x} ({} bytes)",
            self.remote,
            packet.opcode,
            packet.payload.len()
        );

        match packet.opcode {
            opcodes::CMSG_PING => self.handle_ping(inbound, &packet),
            opcodes::CMSG_AUTH_SESSION => self.handle_auth_session(inbound, &packet),
            opcodes::CMSG_KEEP_ALIVE => {
                debug!("{}: keep-alive", self.remote);
                Ok(())
            }
            opcode => {
                let session = self.session.lock().unwrap().clone();
                match session {
                    Some(session) => {
                        session.queue_packet(packet);
                        Ok(())
                    }
                    None => Err(DispatchError::NotAuthenticated { opcode }),
                }
            }
        }
    }

    fn handle_ping(self: &Arc<Self>, inbound: &mut Inbound, packet: &Packet) -> Result<(), DispatchError> {
        let ping: Ping = match packet.decode() {
            Ok(ping) => ping,
            Err(e) => return self.bad_packet(packet, e),
        };

        let now = Instant::now();
        if let Some(last) = inbound.last_ping.replace(now) {
            if now.duration_since(last) < PING_INTERVAL {
                inbound.overspeed_pings += 1;
                if self.max_overspeed_pings != 0 && inbound.overspeed_pings > self.max_overspeed_pings
                {
                    let privileged = self
                        .session
                        .lock()
                        .unwrap()
                        .as_ref()
                        .map_or(false, |s| s.is_privileged());
                    if !privileged {
                        return Err(DispatchError::PingFlood);
                    }
                }
            } else {
                inbound.overspeed_pings = 0;
            }
        }

        {
            let session = self.session.lock().unwrap();
            match session.as_ref() {
                Some(session) => session.set_latency(ping.latency),
                None => {
                    return Err(DispatchError::NotAuthenticated {
                        opcode: opcodes::CMSG_PING,
                    })
                }
            }
        }

        self.send_packet(&Packet::encode(
            opcodes::SMSG_PONG,
            &Pong {
                counter: ping.counter,
            },
        ));
        Ok(())
    }

    fn handle_auth_session(
        self: &Arc<Self>,
        inbound: &mut Inbound,
        packet: &Packet,
    ) -> Result<(), DispatchError> {
        if self.session.lock().unwrap().is_some() {
            return Err(DispatchError::DuplicateAuth);
        }

        let request: AuthSession = match packet.decode() {
            Ok(request) => request,
            Err(e) => return self.bad_packet(packet, e),
        };
        debug!(
            "{}: auth session: build {}, account {}",
            self.remote, request.build, request.account
        );

        match self
            .auth
            .authenticate(&request, &self.remote, self.server_seed, self.sender())
        {
            Ok(grant) => {
                // Header crypto switches on for both directions; every
                // header after this one is ciphered.
                inbound.crypt.init(&grant.session_key);
                self.out.lock().unwrap().crypt.init(&grant.session_key);
                *self.session.lock().unwrap() = Some(grant.session);
                info!("{}: authenticated", self.remote);
                Ok(())
            }
            Err(code) => {
                self.send_packet(&Packet::encode(
                    opcodes::SMSG_AUTH_RESPONSE,
                    &AuthResponse { code },
                ));
                Err(DispatchError::AuthRejected { code })
            }
        }
    }

    /// Decode failure on an otherwise well-framed packet. Always logged;
    /// closing is policy-gated.
    fn bad_packet(&self, packet: &Packet, err: bincode::Error) -> Result<(), DispatchError> {
        error!(
            "{}: failed to decode payload for opcode {:#06x}: {}",
            self.remote, packet.opcode, err
        );
        if log::log_enabled!(log::Level::Debug) {
            debug!("{}: offending payload:\n{}", self.remote, packet.hex_dump());
        }
        if self.kick_on_bad_packet {
            Err(DispatchError::BadPacket(err))
        } else {
            Ok(())
        }
    }

    #[cfg(test)]
    pub(crate) fn outbound_snapshot(&self) -> (Vec<u8>, Vec<Vec<u8>>) {
        let out = self.out.lock().unwrap();
        match &out.queue {
            OutQueue::Direct {
                buffer, overflow, ..
            } => (
                buffer.readable().to_vec(),
                overflow.iter().cloned().collect(),
            ),
            OutQueue::Swap { active, busy, .. } => {
                (busy.readable().to_vec(), vec![active.readable().to_vec()])
            }
        }
    }
}
