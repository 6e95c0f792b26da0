//! Opcode-tagged message container and the payloads carried by the
//! connection layer itself.
//!
//! Framing is manual (see [`crate::codec`]); payload bodies are plain
//! bincode-encoded serde structs. Only the handful of messages the engine
//! handles inline are defined here — everything else is opaque bytes that
//! belong to the game session.

use serde::{Deserialize, Serialize};

/// Opcodes the connection layer knows about. All other values are routed
/// to the session once one exists.
pub mod opcodes {
    pub const CMSG_PING: u16 = 0x1DC;
    pub const SMSG_PONG: u16 = 0x1DD;
    pub const SMSG_AUTH_CHALLENGE: u16 = 0x1EC;
    pub const CMSG_AUTH_SESSION: u16 = 0x1ED;
    pub const SMSG_AUTH_RESPONSE: u16 = 0x1EE;
    pub const CMSG_KEEP_ALIVE: u16 = 0x406;
}

/// Status codes carried by the one-byte auth response.
pub mod auth_result {
    pub const OK: u8 = 12;
    pub const FAILED: u8 = 13;
    pub const BANNED: u8 = 21;
    pub const UNKNOWN_ACCOUNT: u8 = 22;
    pub const VERSION_MISMATCH: u8 = 26;
}

/// A decoded message: opcode plus owned payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub opcode: u16,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(opcode: u16) -> Self {
        Self {
            opcode,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(opcode: u16, payload: Vec<u8>) -> Self {
        Self { opcode, payload }
    }

    /// Builds a packet from a serializable body.
    pub fn encode<T: Serialize>(opcode: u16, body: &T) -> Self {
        let payload =
            bincode::serialize(body).expect("connection-layer payloads always serialize");
        Self { opcode, payload }
    }

    /// Decodes the payload as `T`.
    pub fn decode<'a, T: Deserialize<'a>>(&'a self) -> bincode::Result<T> {
        bincode::deserialize(&self.payload)
    }

    /// Hex dump of the payload for diagnostics, 16 bytes per line.
    pub fn hex_dump(&self) -> String {
        let mut out = String::new();
        for chunk in self.payload.chunks(16) {
            for byte in chunk {
                out.push_str(&format!("{:02X} ", byte));
            }
            out.push('\n');
        }
        out
    }
}

/// Client ping: a running counter and the client's measured latency.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Ping {
    pub counter: u32,
    pub latency: u32,
}

/// Server reply echoing the ping counter.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Pong {
    pub counter: u32,
}

/// Unsolicited server hello, the first packet on every connection. Carries
/// the server seed the client folds into its auth proof plus two fresh
/// encryption seeds.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub protocol: u32,
    pub server_seed: u32,
    pub seed1: [u8; 16],
    pub seed2: [u8; 16],
}

/// The client's fixed-format authentication handshake.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub build: u32,
    pub account: String,
    pub client_seed: u32,
    pub digest: [u8; 20],
}

/// One-byte auth status sent before closing a rejected connection.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct AuthResponse {
    pub code: u8,
}
