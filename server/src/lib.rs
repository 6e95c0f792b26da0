//! # World Server Connection Engine
//!
//! The connection-layer network engine for the multiplayer world server:
//! it accepts TCP clients, frames and encrypts the wire protocol, buffers
//! partial transfers, throttles in-flight I/O per worker, and balances
//! live connections across a fixed pool of I/O threads.
//!
//! ## Two engines, one contract
//!
//! The engine runs in one of two interchangeable modes selected at
//! startup:
//!
//! - **Completion mode** (`completion`): the runtime reports whole
//!   read/write completions and the driver reacts to finished transfers.
//! - **Readiness mode** (`readiness`): the runtime reports only that a
//!   socket is readable or writable and the driver performs the possibly
//!   partial transfers itself.
//!
//! Both modes share the same connection core, framing codec, header
//! cipher and dispatcher, so their externally observable protocol
//! behavior is identical. The [`engine::NetworkEngine`] façade tries the
//! preferred mode and falls back to the other on startup failure.
//!
//! ## Module Organization
//!
//! - [`engine`] — Start/Stop/Wait façade and the injected context object
//! - [`manager`] — worker pool ownership, load balancing, accept loop
//! - [`worker`] — one event-loop thread per worker
//! - [`admission`] — per-worker in-flight operation budget
//! - [`connection`] — shared per-client state machine and dispatcher
//! - [`completion`] / [`readiness`] — the two I/O drivers
//! - [`session`] — collaborator traits for auth and game sessions
//! - [`config`] — engine tunables
//!
//! Game logic, account storage and handshake verification live behind the
//! [`session::Session`] and [`session::AuthHandler`] seams; the engine
//! only moves and frames bytes.

pub mod admission;
pub mod completion;
pub mod config;
pub mod connection;
pub mod engine;
pub mod manager;
pub mod readiness;
pub mod session;
pub mod worker;
