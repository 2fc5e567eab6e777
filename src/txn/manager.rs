//! Transaction dispatch
//!
//! Mutations collect their records in a [`TxBatch`] while they hold region
//! locks, and hand the batch to the [`TransactionManager`] once every lock is
//! released.
//!
//! ## Modes
//! - `Disabled`: batches are dropped
//! - `Sync`: the handler runs on the calling thread
//! - `Async`: batches go onto the region queue and a worker pool applies them
//!
//! Failed groups land on a LIFO recovery queue in the region;
//! [`TransactionManager::retry_failed`] re-applies them.
//!
//! ## Concurrency:
//! - Workers block on a crossbeam channel with a poll timeout, so records
//!   pushed by other processes are picked up too
//! - `in_flight` is raised before a pop so an idle check never misses a group
//!   that left the queue but has not been applied yet

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::TransactionMode;
use crate::error::{Result, SubKvError};
use crate::region::RegionCore;

use super::handler::TransactionHandler;
use super::queue::{QueueOrder, RegionQueue};
use super::record::{decode_group, encode_group, TxRecord};

const PENDING_QUEUE: &str = "txq";
const RECOVERY_QUEUE: &str = "txr";

/// Records of one logical operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxBatch {
    records: Vec<TxRecord>,
}

impl TxBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: TxRecord) {
        self.records.push(record);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[TxRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<TxRecord> {
        self.records
    }
}

/// Snapshot of the dispatch counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxStats {
    /// Groups handed to the manager
    pub dispatched: u64,
    /// Groups the handler accepted
    pub applied: u64,
    /// Groups the handler rejected
    pub failed: u64,
    /// Groups re-applied by `retry_failed`
    pub retried: u64,
    /// Groups waiting in the region queue
    pub pending: u64,
    /// Groups waiting in the recovery queue
    pub recovery: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

/// State shared with the async workers
struct Shared {
    handler: Arc<dyn TransactionHandler>,
    pending: RegionQueue,
    recovery: RegionQueue,
    counters: Counters,
    in_flight: AtomicUsize,
    shutdown: AtomicBool,
    idle_lock: Mutex<()>,
    idle: Condvar,
    poll: Duration,
}

impl Shared {
    fn apply(&self, records: &[TxRecord]) -> bool {
        match self.handler.apply_group(records) {
            Ok(()) => {
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, records = records.len(), "transaction handler failed");
                false
            }
        }
    }

    /// Keep a failed group for `retry_failed`
    fn park(&self, blob: &[u8]) {
        if let Err(e) = self.recovery.push(blob) {
            error!(error = %e, "failed group could not be kept for recovery");
        }
    }

    fn apply_blob(&self, blob: &[u8]) {
        let records = match decode_group(blob) {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, bytes = blob.len(), "undecodable queued group dropped");
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if !self.apply(&records) {
            self.park(blob);
        }
    }

    /// Pop and apply one pending group; false when the queue was empty
    fn work_once(&self) -> Result<bool> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let popped = self.pending.pop();
        let worked = match popped {
            Ok(Some(blob)) => {
                self.apply_blob(&blob);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => Err(e),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let _guard = self.idle_lock.lock();
        self.idle.notify_all();
        worked
    }

    fn is_idle(&self) -> Result<bool> {
        Ok(self.in_flight.load(Ordering::SeqCst) == 0 && self.pending.len()? == 0)
    }
}

/// Dispatches committed record groups to the configured handler
pub struct TransactionManager {
    mode: TransactionMode,
    shared: Option<Arc<Shared>>,
    wake: Option<Sender<()>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TransactionManager {
    /// Manager that drops every batch
    pub(crate) fn disabled() -> Self {
        Self {
            mode: TransactionMode::Disabled,
            shared: None,
            wake: None,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Start dispatching in `mode`; async mode spawns its workers here
    pub(crate) fn start(
        mode: TransactionMode,
        handler: Arc<dyn TransactionHandler>,
        core: Arc<RegionCore>,
        poll: Duration,
    ) -> Result<Self> {
        if mode == TransactionMode::Disabled {
            return Ok(Self::disabled());
        }

        let shared = Arc::new(Shared {
            handler,
            pending: RegionQueue::new(core.clone(), PENDING_QUEUE, QueueOrder::Fifo),
            recovery: RegionQueue::new(core, RECOVERY_QUEUE, QueueOrder::Lifo),
            counters: Counters::default(),
            in_flight: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
            poll,
        });

        let TransactionMode::Async { workers } = mode else {
            return Ok(Self {
                mode,
                shared: Some(shared),
                wake: None,
                workers: Mutex::new(Vec::new()),
            });
        };

        let (tx, rx) = channel::unbounded();
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let shared = shared.clone();
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("subkv-txn-{}", id))
                .spawn(move || worker_loop(id, shared, rx))?;
            handles.push(handle);
        }
        info!(workers, "transaction workers started");

        Ok(Self {
            mode,
            shared: Some(shared),
            wake: Some(tx),
            workers: Mutex::new(handles),
        })
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// Hand over a committed batch. Handler failures never undo the mutation.
    pub fn dispatch(&self, batch: TxBatch) -> Result<()> {
        let Some(shared) = &self.shared else {
            return Ok(());
        };
        if batch.is_empty() {
            return Ok(());
        }
        shared.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        match self.mode {
            TransactionMode::Disabled => Ok(()),
            TransactionMode::Sync => {
                if !shared.apply(batch.records()) {
                    shared.park(&encode_group(batch.records()));
                }
                Ok(())
            }
            TransactionMode::Async { .. } => {
                if shared.shutdown.load(Ordering::SeqCst) {
                    return Err(SubKvError::Transaction("transaction workers stopped".into()));
                }
                shared.pending.push(&encode_group(batch.records()))?;
                if let Some(wake) = &self.wake {
                    // Workers also poll, a lost wakeup only delays the group
                    let _ = wake.send(());
                }
                Ok(())
            }
        }
    }

    /// Re-apply groups from the recovery queue, newest first
    ///
    /// Returns how many groups the handler accepted; the rest go back.
    pub fn retry_failed(&self) -> Result<usize> {
        let Some(shared) = &self.shared else {
            return Ok(0);
        };

        let mut still_failing = Vec::new();
        let mut applied = 0;
        while let Some(blob) = shared.recovery.pop()? {
            let records = decode_group(&blob)?;
            match shared.handler.apply_group(&records) {
                Ok(()) => {
                    applied += 1;
                    shared.counters.retried.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(error = %e, "recovered group failed again");
                    still_failing.push(blob);
                }
            }
        }

        // Oldest first so the LIFO order is preserved
        for blob in still_failing.iter().rev() {
            shared.recovery.push(blob)?;
        }
        Ok(applied)
    }

    pub fn stats(&self) -> Result<TxStats> {
        let Some(shared) = &self.shared else {
            return Ok(TxStats::default());
        };
        Ok(TxStats {
            dispatched: shared.counters.dispatched.load(Ordering::Relaxed),
            applied: shared.counters.applied.load(Ordering::Relaxed),
            failed: shared.counters.failed.load(Ordering::Relaxed),
            retried: shared.counters.retried.load(Ordering::Relaxed),
            pending: shared.pending.len()?,
            recovery: shared.recovery.len()?,
        })
    }

    /// Wait until the pending queue is drained
    ///
    /// `None` waits indefinitely. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> Result<bool> {
        let Some(shared) = &self.shared else {
            return Ok(true);
        };
        if self.wake.is_none() {
            return Ok(true);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if shared.is_idle()? {
                return Ok(true);
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    (deadline - now).min(shared.poll)
                }
                None => shared.poll,
            };
            let mut guard = shared.idle_lock.lock();
            shared.idle.wait_for(&mut guard, wait);
        }
    }

    /// Drain (bounded by `timeout`), stop the workers and flush the handler
    ///
    /// Returns false if records were left in the queue.
    pub fn shutdown(&self, timeout: Option<Duration>) -> Result<bool> {
        let drained = self.wait_idle(timeout)?;
        self.stop_workers();
        if let Some(shared) = &self.shared {
            shared.handler.flush()?;
        }
        if !drained {
            warn!("transaction queue not drained before shutdown");
        }
        Ok(drained)
    }

    fn stop_workers(&self) {
        let Some(shared) = &self.shared else {
            return;
        };
        shared.shutdown.store(true, Ordering::SeqCst);

        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        if let Some(wake) = &self.wake {
            for _ in 0..handles.len() {
                let _ = wake.send(());
            }
        }
        for handle in handles {
            if handle.join().is_err() {
                error!("transaction worker panicked");
            }
        }
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

fn worker_loop(id: usize, shared: Arc<Shared>, wake: Receiver<()>) {
    debug!(worker = id, "transaction worker running");
    while !shared.shutdown.load(Ordering::SeqCst) {
        match shared.work_once() {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => error!(worker = id, error = %e, "transaction queue unreadable"),
        }

        match wake.recv_timeout(shared.poll) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(worker = id, "transaction worker stopped");
}
