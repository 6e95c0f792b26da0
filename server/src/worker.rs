//! I/O worker threads.
//!
//! Each worker is one OS thread running its own single-threaded tokio
//! runtime: an independent event loop, exactly like the other workers,
//! with no shared executor state between them. Connections are pinned to
//! one worker for life; the worker's live-connection count exists only so
//! the manager can balance new assignments, and its admission gate caps
//! the in-flight operations its connections may hold against the OS.

use crate::admission::Admission;
use log::error;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::thread;
use tokio::runtime;
use tokio::sync::oneshot;

pub struct Worker {
    handle: runtime::Handle,
    admission: Admission,
    connections: AtomicU32,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Worker {
    /// Spawns a named thread running a fresh current-thread runtime and
    /// waits until the event loop is up.
    pub fn start(name: String, op_limit: u32) -> io::Result<Worker> {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new().name(name).spawn(move || {
            let rt = match runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = handle_tx.send(Err(e));
                    return;
                }
            };
            let _ = handle_tx.send(Ok(rt.handle().clone()));

            // Park on the shutdown signal; connection tasks spawned onto
            // this runtime keep running on this thread until then.
            rt.block_on(async {
                let _ = shutdown_rx.await;
            });
            // Dropping the runtime cancels whatever is still in flight.
        })?;

        let handle = match handle_rx.recv() {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "worker thread died during startup",
                ));
            }
        };

        Ok(Worker {
            handle,
            admission: Admission::new(op_limit),
            connections: AtomicU32::new(0),
            shutdown: Mutex::new(Some(shutdown_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Runs a future on this worker's event loop.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future);
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    /// Live connections, for load balancing only.
    pub fn count(&self) -> u32 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn add_client(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_client(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Asks the event loop to wind down. Idempotent.
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    /// Blocks until the worker thread has exited. Idempotent.
    pub fn join(&self) {
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("worker thread panicked during shutdown");
            }
        }
    }
}

// Drop only signals shutdown: the last Arc<Worker> can be released by a
// cancelled task on the worker thread itself, where a join would deadlock.
impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_worker_runs_spawned_futures() {
        let worker = Worker::start("test-worker".to_string(), 0).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        worker.spawn(async move {
            flag.store(true, Ordering::SeqCst);
        });

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !ran.load(Ordering::SeqCst) {
            assert!(std::time::Instant::now() < deadline, "task never ran");
            thread::sleep(Duration::from_millis(5));
        }

        worker.stop();
        worker.join();
    }

    #[test]
    fn test_client_count_tracks_adds_and_removes() {
        let worker = Worker::start("test-count".to_string(), 0).unwrap();
        assert_eq!(worker.count(), 0);
        worker.add_client();
        worker.add_client();
        assert_eq!(worker.count(), 2);
        worker.remove_client();
        assert_eq!(worker.count(), 1);
    }

    #[test]
    fn test_stop_and_join_are_idempotent() {
        let worker = Worker::start("test-stop".to_string(), 0).unwrap();
        worker.stop();
        worker.stop();
        worker.join();
        worker.join();
    }
}
