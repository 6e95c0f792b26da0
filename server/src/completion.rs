//! Completion-mode (proactor) connection driver.
//!
//! Two tasks per connection on the owning worker's event loop: a reader
//! that issues whole-buffer reads and walks the reassembly loop over
//! whatever each completion delivered, and a writer that drains the
//! double-buffered outbound state, reissuing after short writes and
//! swapping buffers when producers queued more behind the in-flight
//! operation. At most one read and one write are ever outstanding, and
//! each is wrapped in the worker's admission gate.

use crate::admission::Op;
use crate::connection::{Connection, DispatchError, Inbound};
use crate::worker::Worker;
use log::{debug, error};
use shared::buffer::Buffer;
use shared::codec::{self, ClientHeader, CLIENT_HEADER_LEN, MAX_CLIENT_LENGTH};
use shared::packet::Packet;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Crunch the receive buffer once free space falls below this.
const LOW_WATERMARK: usize = 1024;

/// Drives one connection until it closes, then releases its bookkeeping.
pub async fn drive(
    conn: Arc<Connection>,
    worker: Arc<Worker>,
    stream: TcpStream,
    recv_capacity: usize,
) {
    let (read_half, write_half) = stream.into_split();

    let writer = {
        let conn = Arc::clone(&conn);
        let worker = Arc::clone(&worker);
        tokio::spawn(write_loop(conn, worker, write_half))
    };

    // safer to send first
    conn.send_auth_challenge();

    read_loop(&conn, &worker, read_half, recv_capacity).await;

    conn.close();
    let _ = writer.await;
    conn.finalize();
    worker.remove_client();
    debug!("{}: connection closed", conn.remote());
}

async fn read_loop(
    conn: &Arc<Connection>,
    worker: &Worker,
    mut sock: OwnedReadHalf,
    recv_capacity: usize,
) {
    let mut inbound = Inbound::new();
    // the buffer must always fit one maximal message after a crunch
    let mut buf = Buffer::with_capacity(recv_capacity.max(4 * MAX_CLIENT_LENGTH as usize));
    let mut pending: Option<ClientHeader> = None;

    while conn.is_open() {
        tokio::select! {
            _ = conn.wait_closed() => return,
            _ = worker.admission().acquire(Op::Read) => {}
        }

        let result = tokio::select! {
            _ = conn.wait_closed() => {
                worker.admission().complete();
                return;
            }
            result = sock.read(buf.writable()) => result,
        };
        worker.admission().complete();

        match result {
            Ok(0) => {
                debug!("{}: peer closed connection", conn.remote());
                return;
            }
            Ok(n) => buf.advance_write(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => {
                if conn.is_open() {
                    error!("{}: read failed: {}", conn.remote(), e);
                }
                return;
            }
        }

        if let Err(e) = drain_messages(conn, &mut inbound, &mut buf, &mut pending) {
            error!("{}: {}", conn.remote(), e);
            return;
        }

        // Buffer hygiene: rewind for free when everything was consumed,
        // compact when space runs low or the known-incomplete message
        // would not fit behind the dead region.
        if buf.is_empty() {
            buf.reset();
        } else if buf.space() < LOW_WATERMARK
            || pending.is_some_and(|h| h.length as usize > buf.len() + buf.space())
        {
            buf.crunch();
        }
    }
}

/// Walks every complete message currently buffered. Several messages can
/// be dispatched from a single completion; a trailing partial header or
/// payload is left in place (the header, once decoded, is remembered in
/// `pending` because the cipher cursor has already moved past it).
fn drain_messages(
    conn: &Arc<Connection>,
    inbound: &mut Inbound,
    buf: &mut Buffer,
    pending: &mut Option<ClientHeader>,
) -> Result<(), DispatchError> {
    loop {
        let header = match pending.take() {
            Some(header) => header,
            None => {
                if buf.len() < CLIENT_HEADER_LEN {
                    return Ok(());
                }
                let mut raw = [0u8; CLIENT_HEADER_LEN];
                raw.copy_from_slice(&buf.readable()[..CLIENT_HEADER_LEN]);
                buf.advance_read(CLIENT_HEADER_LEN);
                codec::decode_client_header(&mut raw, &mut inbound.crypt)?
            }
        };

        if buf.len() < header.length as usize {
            *pending = Some(header);
            return Ok(());
        }

        let payload = buf.readable()[..header.length as usize].to_vec();
        buf.advance_read(header.length as usize);
        conn.process_incoming(inbound, Packet::with_payload(header.opcode, payload))?;
    }
}

async fn write_loop(conn: Arc<Connection>, worker: Arc<Worker>, mut sock: OwnedWriteHalf) {
    loop {
        conn.wait_write_signal().await;

        // Drain everything queued before honoring a close request, so a
        // final packet (an auth-failure status, say) still reaches the
        // peer. Close requests park no new data; producers are cut off.
        while let Some(mut chunk) = conn.next_write_chunk() {
            while !chunk.is_empty() {
                worker.admission().acquire(Op::Write).await;
                let result = sock.write(chunk.readable()).await;
                worker.admission().complete();

                match result {
                    Ok(0) => {
                        conn.close();
                        return;
                    }
                    // a short write leaves the remainder for the next pass
                    Ok(n) => chunk.advance_read(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => {
                        if conn.is_open() {
                            error!("{}: write failed: {}", conn.remote(), e);
                        }
                        conn.close();
                        return;
                    }
                }
            }
            conn.recycle_chunk(chunk);
        }

        if !conn.is_open() {
            return;
        }
    }
}
