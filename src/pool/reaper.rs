//! Background thread that closes long-idle pooled connections.

use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{ConnectionPool, PoolPhase};

/// Reaper schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperConfig {
    /// Time between sweeps
    pub interval: Duration,
    /// Idle time after which a connection may be closed
    pub max_idle: Duration,
    /// Idle connections always kept open
    pub min_idle: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_idle: Duration::from_secs(300),
            min_idle: 1,
        }
    }
}

/// Handle to a running reaper thread.
///
/// The thread holds only a weak reference, so it never keeps the pool alive.
/// It exits when stopped, when the handle is dropped, or once the pool has
/// shut down.
#[derive(Debug)]
pub struct IdleReaper {
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl IdleReaper {
    /// Spawn a reaper for `pool`.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start(pool: &Arc<ConnectionPool>, config: ReaperConfig) -> io::Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel();
        let pool = Arc::downgrade(pool);

        let handle = thread::Builder::new()
            .name("cistern-reaper".to_string())
            .spawn(move || run(&pool, config, &stop_rx))?;

        tracing::debug!(
            interval_ms = config.interval.as_millis() as u64,
            max_idle_ms = config.max_idle.as_millis() as u64,
            min_idle = config.min_idle,
            "Started idle reaper"
        );

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.join();
    }

    fn join(&mut self) {
        // Disconnecting the channel wakes the thread
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Idle reaper thread panicked");
            }
        }
    }
}

impl Drop for IdleReaper {
    fn drop(&mut self) {
        self.join();
    }
}

fn run(pool: &Weak<ConnectionPool>, config: ReaperConfig, stop_rx: &mpsc::Receiver<()>) {
    loop {
        match stop_rx.recv_timeout(config.interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                if pool.status().phase != PoolPhase::Active {
                    break;
                }
                pool.reap_idle(config.max_idle, config.min_idle);
            }
        }
    }
    tracing::debug!("Idle reaper stopped");
}
