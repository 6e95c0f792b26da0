//! Engine façade: one Start/Stop/Wait surface over the two I/O modes.
//!
//! `NetworkEngine::start` brings up the completion engine when the
//! configuration prefers it and falls back to the readiness engine if
//! that fails; if neither comes up the error propagates and the process
//! is expected to exit with a distinct status rather than run degraded.
//! Whatever mode actually started owns its worker threads and the
//! dedicated acceptor thread, and `stop`/`wait` delegate there.

use crate::config::{IoMode, NetConfig};
use crate::manager::{self, SocketMgr};
use crate::session::AuthHandler;
use crate::worker::Worker;
use log::{error, info};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Everything a connection needs injected at creation: configuration plus
/// the authentication collaborator. Explicitly constructed and passed
/// down; there are no global managers.
pub struct EngineContext {
    pub cfg: NetConfig,
    pub auth: Arc<dyn AuthHandler>,
}

pub struct NetworkEngine {
    mode: IoMode,
    mgr: Arc<SocketMgr>,
    acceptor: Worker,
    local_addr: SocketAddr,
}

impl NetworkEngine {
    /// Starts the engine on `bind:port`. Tries completion mode first when
    /// configured, falling back to readiness mode on failure.
    pub fn start(ctx: EngineContext, bind: &str, port: u16) -> io::Result<NetworkEngine> {
        let ctx = Arc::new(ctx);

        if ctx.cfg.prefer_completion {
            match Self::start_mode(Arc::clone(&ctx), IoMode::Completion, bind, port) {
                Ok(engine) => return Ok(engine),
                Err(e) => {
                    error!(
                        "failed to start completion-mode engine, falling back to readiness mode: {}",
                        e
                    );
                }
            }
        }

        Self::start_mode(ctx, IoMode::Readiness, bind, port)
    }

    fn start_mode(
        ctx: Arc<EngineContext>,
        mode: IoMode,
        bind: &str,
        port: u16,
    ) -> io::Result<NetworkEngine> {
        // worker pool first; roll back the ones already running on failure
        let mut workers: Vec<Arc<Worker>> = Vec::new();
        for i in 0..ctx.cfg.worker_threads() {
            match Worker::start(format!("net-worker-{}", i), ctx.cfg.op_limit) {
                Ok(worker) => workers.push(Arc::new(worker)),
                Err(e) => {
                    shutdown_workers(&workers);
                    return Err(e);
                }
            }
        }

        let listener = match bind_listener(bind, port) {
            Ok(listener) => listener,
            Err(e) => {
                shutdown_workers(&workers);
                return Err(e);
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                shutdown_workers(&workers);
                return Err(e);
            }
        };

        let acceptor = match Worker::start("net-acceptor".to_string(), 0) {
            Ok(acceptor) => acceptor,
            Err(e) => {
                shutdown_workers(&workers);
                return Err(e);
            }
        };

        let mgr = Arc::new(SocketMgr::new(workers));
        {
            let mgr = Arc::clone(&mgr);
            acceptor.spawn(async move {
                let listener = match TcpListener::from_std(listener) {
                    Ok(listener) => listener,
                    Err(e) => {
                        error!("failed to register listener with the acceptor loop: {}", e);
                        return;
                    }
                };
                manager::accept_loop(listener, mgr, ctx, mode).await;
            });
        }

        info!(
            "network engine up: {} mode, {} worker(s), listening on {}",
            mode,
            mgr.workers().len(),
            local_addr
        );

        Ok(NetworkEngine {
            mode,
            mgr,
            acceptor,
            local_addr,
        })
    }

    pub fn mode(&self) -> IoMode {
        self.mode
    }

    /// The address actually bound; differs from the request when port 0
    /// was asked for.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, then winds down every worker event loop.
    pub fn stop(&self) {
        self.acceptor.stop();
        self.acceptor.join();
        for worker in self.mgr.workers() {
            worker.stop();
        }
    }

    /// Blocks until all worker threads have exited.
    pub fn wait(&self) {
        for worker in self.mgr.workers() {
            worker.join();
        }
    }
}

fn bind_listener(bind: &str, port: u16) -> io::Result<std::net::TcpListener> {
    let listener = std::net::TcpListener::bind((bind, port))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn shutdown_workers(workers: &[Arc<Worker>]) {
    for worker in workers {
        worker.stop();
        worker.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::EchoAuth;

    fn test_ctx(prefer_completion: bool) -> EngineContext {
        let mut cfg = NetConfig::default();
        cfg.prefer_completion = prefer_completion;
        cfg.threads = 2;
        EngineContext {
            cfg,
            auth: Arc::new(EchoAuth),
        }
    }

    #[test]
    fn test_starts_in_completion_mode() {
        let engine = NetworkEngine::start(test_ctx(true), "127.0.0.1", 0).unwrap();
        assert_eq!(engine.mode(), IoMode::Completion);
        assert_ne!(engine.local_addr().port(), 0);
        engine.stop();
        engine.wait();
    }

    #[test]
    fn test_starts_in_readiness_mode() {
        let engine = NetworkEngine::start(test_ctx(false), "127.0.0.1", 0).unwrap();
        assert_eq!(engine.mode(), IoMode::Readiness);
        engine.stop();
        engine.wait();
    }

    #[test]
    fn test_unbindable_address_fails_both_modes() {
        // completion fails on the bind, the fallback fails the same way
        let result = NetworkEngine::start(test_ctx(true), "192.0.2.255", 4);
        assert!(result.is_err());
    }

    #[test]
    fn test_workers_match_configuration() {
        let mut ctx = test_ctx(true);
        ctx.cfg.threads = 3;
        let engine = NetworkEngine::start(ctx, "127.0.0.1", 0).unwrap();
        assert_eq!(engine.mgr.workers().len(), 3);
        engine.stop();
        engine.wait();
    }
}
