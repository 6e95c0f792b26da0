//! Collaborator seams: the game session and the authentication handshake.
//!
//! The connection engine never looks inside game packets and never checks
//! credentials itself. Once a client authenticates, decoded messages are
//! handed to a [`Session`]; the handshake itself is delegated to an
//! [`AuthHandler`] that either produces the session key plus a session, or
//! a status code the engine sends back before closing.

use crate::connection::PacketSender;
use log::info;
use shared::packet::{auth_result, AuthSession, Packet};
use std::sync::Arc;

/// An authenticated game session. Implementations live outside the
/// connection engine; packet handoff is fire-and-forget.
pub trait Session: Send + Sync {
    /// Takes ownership of a decoded, non-connection-layer packet.
    fn queue_packet(&self, packet: Packet);

    /// Records the latency the client reported in its last ping.
    fn set_latency(&self, latency: u32);

    /// Privileged sessions are exempt from the ping-flood kick.
    fn is_privileged(&self) -> bool {
        false
    }
}

/// Successful handshake outcome: the key that arms header encryption and
/// the session that takes over packet handling.
pub struct AuthGrant {
    pub session_key: Vec<u8>,
    pub session: Arc<dyn Session>,
}

/// Verifies a decoded authentication handshake.
pub trait AuthHandler: Send + Sync {
    /// `Ok` yields the grant; `Err` carries the one-byte status code sent
    /// to the peer before the connection closes. `sender` lets the created
    /// session write back into the connection from any thread.
    fn authenticate(
        &self,
        request: &AuthSession,
        remote: &str,
        server_seed: u32,
        sender: PacketSender,
    ) -> Result<AuthGrant, u8>;
}

/// Stand-in collaborator for the demo binary and tests: accepts any
/// non-empty account, derives the session key from the account name, and
/// echoes every queued packet back to the peer.
pub struct EchoAuth;

impl AuthHandler for EchoAuth {
    fn authenticate(
        &self,
        request: &AuthSession,
        remote: &str,
        _server_seed: u32,
        sender: PacketSender,
    ) -> Result<AuthGrant, u8> {
        if request.account.is_empty() {
            return Err(auth_result::UNKNOWN_ACCOUNT);
        }
        info!("{}: account {} logged in", remote, request.account);
        Ok(AuthGrant {
            session_key: request.account.as_bytes().to_vec(),
            session: Arc::new(EchoSession { sender }),
        })
    }
}

/// Session that reflects every packet straight back on the wire.
pub struct EchoSession {
    sender: PacketSender,
}

impl Session for EchoSession {
    fn queue_packet(&self, packet: Packet) {
        self.sender.send(&packet);
    }

    fn set_latency(&self, _latency: u32) {}
}
