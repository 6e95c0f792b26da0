//! Worker pool ownership, load balancing and the accept loop.
//!
//! The manager owns the fixed set of workers. Assignment scans for the
//! least-loaded worker under a single lock (the acceptor is the only
//! caller, but the lock keeps the count-read/count-bump pair atomic
//! against concurrent removals); teardown is just a lock-free decrement
//! from whichever task noticed the connection die, so the hot read/write
//! paths never touch a global registry.

use crate::completion;
use crate::config::IoMode;
use crate::connection::Connection;
use crate::engine::EngineContext;
use crate::readiness;
use crate::worker::Worker;
use log::{error, info};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

pub struct SocketMgr {
    workers: Vec<Arc<Worker>>,
    assign_lock: Mutex<()>,
}

impl SocketMgr {
    pub fn new(workers: Vec<Arc<Worker>>) -> Self {
        assert!(!workers.is_empty(), "worker pool must not be empty");
        Self {
            workers,
            assign_lock: Mutex::new(()),
        }
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    /// Picks the worker with the fewest live connections and claims a slot
    /// on it. A worker with zero connections short-circuits the scan; ties
    /// go to the first worker encountered.
    pub fn assign(&self) -> Arc<Worker> {
        let _guard = self.assign_lock.lock().unwrap();

        let mut chosen = &self.workers[0];
        let mut low = u32::MAX;
        for worker in &self.workers {
            let count = worker.count();
            if count < low {
                chosen = worker;
                if count == 0 {
                    break;
                }
                low = count;
            }
        }

        chosen.add_client();
        Arc::clone(chosen)
    }

    /// Releases a closed connection's slot. Called from whichever task
    /// noticed the closure; deliberately lock-free.
    pub fn remove(&self, worker: &Worker) {
        worker.remove_client();
    }
}

/// Accepts connections forever, handing each to the least-loaded worker.
pub async fn accept_loop(
    listener: TcpListener,
    mgr: Arc<SocketMgr>,
    ctx: Arc<EngineContext>,
    mode: IoMode,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => accept_one(stream, addr, &mgr, &ctx, mode),
            Err(e) => {
                error!("accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

fn accept_one(
    stream: TcpStream,
    addr: SocketAddr,
    mgr: &Arc<SocketMgr>,
    ctx: &Arc<EngineContext>,
    mode: IoMode,
) {
    // socket options first; failures are logged but not fatal
    if let Some(bytes) = ctx.cfg.send_buffer_os {
        if let Err(e) = socket2::SockRef::from(&stream).set_send_buffer_size(bytes) {
            error!("{}: setting SO_SNDBUF failed: {}", addr, e);
        }
    }
    if ctx.cfg.tcp_nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            error!("{}: setting TCP_NODELAY failed: {}", addr, e);
        }
    }

    let worker = mgr.assign();
    let conn = Connection::new(addr.to_string(), mode, &ctx.cfg, Arc::clone(&ctx.auth));
    info!("accepted connection from {}", addr);

    match mode {
        IoMode::Completion => {
            let recv_capacity = ctx.cfg.recv_buffer;
            worker.spawn(completion::drive(
                conn,
                Arc::clone(&worker),
                stream,
                recv_capacity,
            ));
        }
        IoMode::Readiness => {
            worker.spawn(readiness::drive(conn, Arc::clone(&worker), stream));
        }
    }
}
