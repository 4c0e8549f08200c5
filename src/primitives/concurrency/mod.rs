#![forbid(unsafe_code)]
//! Session coordination between the writer, checkpoints, cleanup, and close,
//! plus the sequence-locked cell readers use to observe the root.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::types::{GbpTreeError, Result};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
enum CleanupPhase {
    #[default]
    Idle,
    Running,
    Failed(String),
}

#[derive(Default, Debug)]
struct SessionState {
    writer: bool,
    checkpoint: bool,
    cleanup: CleanupPhase,
    closing: bool,
    closed: bool,
}

/// Snapshot of session state for observability.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Whether a writer session is open.
    pub writer: bool,
    /// Whether a checkpoint is in progress.
    pub checkpoint: bool,
    /// Whether the recovery cleanup job is still running.
    pub cleanup_running: bool,
    /// Whether the cleanup job ended with an error.
    pub cleanup_failed: bool,
    /// Whether close has started.
    pub closed: bool,
}

/// Mutual exclusion between the single writer, checkpoints, the cleanup job,
/// and close. Readers never touch this lock.
#[derive(Default)]
pub struct SessionLock {
    state: Mutex<SessionState>,
    changed: Condvar,
}

/// Held while a writer session is open; releases the slot on drop.
pub struct WriterSession<'a> {
    lock: &'a SessionLock,
}

/// Held for the duration of a checkpoint.
pub struct CheckpointPermit<'a> {
    lock: &'a SessionLock,
}

/// Held while close runs. New sessions are refused meanwhile; dropping the
/// permit without [`ClosePermit::complete`] reopens the session so a later
/// close can try again.
pub struct ClosePermit<'a> {
    lock: &'a SessionLock,
    cleanup_failed: bool,
    completed: bool,
}

impl SessionLock {
    /// Creates an idle session lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the writer slot.
    ///
    /// A second writer is rejected immediately with
    /// [`GbpTreeError::WriterAlreadyOpen`]. Acquisition waits while a
    /// checkpoint or the cleanup job runs.
    pub fn acquire_writer(&self) -> Result<WriterSession<'_>> {
        let mut state = self.state.lock();
        loop {
            if state.closed || state.closing {
                return Err(GbpTreeError::Closed);
            }
            if state.writer {
                return Err(GbpTreeError::WriterAlreadyOpen);
            }
            if state.checkpoint || state.cleanup == CleanupPhase::Running {
                self.changed.wait(&mut state);
                continue;
            }
            break;
        }
        state.writer = true;
        Ok(WriterSession { lock: self })
    }

    /// Waits for the writer and the cleanup job, then marks a checkpoint as running.
    pub fn begin_checkpoint(&self) -> Result<CheckpointPermit<'_>> {
        let mut state = self.state.lock();
        loop {
            if state.closed || state.closing {
                return Err(GbpTreeError::Closed);
            }
            if state.writer || state.checkpoint || state.cleanup == CleanupPhase::Running {
                self.changed.wait(&mut state);
                continue;
            }
            if let CleanupPhase::Failed(reason) = &state.cleanup {
                return Err(GbpTreeError::CleanupFailed(reason.clone()));
            }
            break;
        }
        state.checkpoint = true;
        Ok(CheckpointPermit { lock: self })
    }

    /// Marks the cleanup job as running. Writers and checkpoints wait for it.
    pub fn begin_cleanup(&self) {
        let mut state = self.state.lock();
        state.cleanup = CleanupPhase::Running;
    }

    /// Records the cleanup outcome and wakes waiters.
    pub fn finish_cleanup(&self, outcome: std::result::Result<(), String>) {
        let mut state = self.state.lock();
        state.cleanup = match outcome {
            Ok(()) => CleanupPhase::Idle,
            Err(reason) => CleanupPhase::Failed(reason),
        };
        drop(state);
        self.changed.notify_all();
    }

    /// Blocks until the cleanup job is no longer running.
    pub fn wait_for_cleanup(&self) {
        let mut state = self.state.lock();
        while state.cleanup == CleanupPhase::Running {
            self.changed.wait(&mut state);
        }
    }

    /// Waits for the writer, any checkpoint, the cleanup job, and any other
    /// close in progress. Returns `None` when the session is already closed.
    pub fn begin_close(&self) -> Option<ClosePermit<'_>> {
        let mut state = self.state.lock();
        while state.writer
            || state.checkpoint
            || state.closing
            || state.cleanup == CleanupPhase::Running
        {
            self.changed.wait(&mut state);
        }
        if state.closed {
            return None;
        }
        state.closing = true;
        let cleanup_failed = matches!(state.cleanup, CleanupPhase::Failed(_));
        Some(ClosePermit {
            lock: self,
            cleanup_failed,
            completed: false,
        })
    }

    /// Closes the session outright. Returns `false` when it was already closed.
    pub fn close(&self) -> bool {
        match self.begin_close() {
            Some(permit) => {
                permit.complete();
                true
            }
            None => false,
        }
    }

    /// Returns true once close has started.
    pub fn is_closed(&self) -> bool {
        let state = self.state.lock();
        state.closed || state.closing
    }

    /// Captures the current state.
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        SessionSnapshot {
            writer: state.writer,
            checkpoint: state.checkpoint,
            cleanup_running: state.cleanup == CleanupPhase::Running,
            cleanup_failed: matches!(state.cleanup, CleanupPhase::Failed(_)),
            closed: state.closed || state.closing,
        }
    }

    fn release(&self, apply: impl FnOnce(&mut SessionState)) {
        let mut state = self.state.lock();
        apply(&mut state);
        drop(state);
        self.changed.notify_all();
    }
}

impl Drop for WriterSession<'_> {
    fn drop(&mut self) {
        self.lock.release(|state| state.writer = false);
    }
}

impl Drop for CheckpointPermit<'_> {
    fn drop(&mut self) {
        self.lock.release(|state| state.checkpoint = false);
    }
}

impl ClosePermit<'_> {
    /// Whether the recovery cleanup job ended with an error. Such a tree
    /// must not be recorded as cleanly shut down.
    pub fn cleanup_failed(&self) -> bool {
        self.cleanup_failed
    }

    /// Marks the session closed for good.
    pub fn complete(mut self) {
        self.completed = true;
        self.lock.release(|state| {
            state.closing = false;
            state.closed = true;
        });
    }
}

impl Drop for ClosePermit<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.lock.release(|state| state.closing = false);
        }
    }
}

/// Two `u64` values published together under a sequence counter.
///
/// Stores must be serialized by the caller; loads never block and retry
/// while a store is in flight.
#[derive(Debug, Default)]
pub struct SeqPair {
    seq: AtomicU64,
    first: AtomicU64,
    second: AtomicU64,
}

impl SeqPair {
    /// Creates a cell holding `(first, second)`.
    pub fn new(first: u64, second: u64) -> Self {
        Self {
            seq: AtomicU64::new(0),
            first: AtomicU64::new(first),
            second: AtomicU64::new(second),
        }
    }

    /// Reads a consistent pair.
    pub fn load(&self) -> (u64, u64) {
        loop {
            let before = self.seq.load(Ordering::SeqCst);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let first = self.first.load(Ordering::SeqCst);
            let second = self.second.load(Ordering::SeqCst);
            if self.seq.load(Ordering::SeqCst) == before {
                return (first, second);
            }
        }
    }

    /// Publishes a new pair.
    pub fn store(&self, first: u64, second: u64) {
        self.seq.fetch_add(1, Ordering::SeqCst);
        self.first.store(first, Ordering::SeqCst);
        self.second.store(second, Ordering::SeqCst);
        self.seq.fetch_add(1, Ordering::SeqCst);
    }
}
