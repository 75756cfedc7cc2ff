//! Buffered disk logging with a background flush worker.
//!
//! Observations accumulate in a [`DiskBuffer`] on the caller's thread. When
//! the buffer fills, its snapshot is handed to a single worker thread that
//! appends it to the paired x/y logs. Because there is exactly one worker fed
//! by a FIFO channel, flushes are serialized and rows land on disk in call
//! order. While a flush is outstanding, new rows keep accumulating in the
//! foreground buffer and go out with the next trigger.
//!
//! A failed append is rolled back on both files, kept by the worker ahead of
//! any later rows, and retried with the next flush. The failure is available
//! through [`DataProcessingStrategy::last_error`] until an append succeeds
//! again. While the disk keeps failing, retained rows are capped at the
//! retention limit (by default [`DEFAULT_RETAINED_BUFFERS`] full buffers);
//! past it, `process` refuses new rows with the stored error.

use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use ndarray::ArrayView1;
use super::{check_observation, DataProcessingStrategy};
use crate::data::{PersistedLog, RawDatapoint};
use crate::error::{ResidualError, ResidualResult};
use crate::gp::GpPredictor;
use crate::logging::{log_flush, timestamp_ms, FlushLogEntry, FlushStatus};
use crate::selector::FeatureSelector;

/// Rows buffered before a background flush is triggered when no size is given.
pub const DEFAULT_BUFFER_SIZE: usize = 20;

/// Full buffers worth of unpersisted rows kept while appends are failing.
pub const DEFAULT_RETAINED_BUFFERS: usize = 4;

/// In-memory queue of raw observations awaiting persistence.
#[derive(Debug, Clone)]
pub struct DiskBuffer {
    rows: Vec<RawDatapoint>,
    capacity: usize,
}

impl DiskBuffer {
    pub fn new(capacity: usize) -> ResidualResult<Self> {
        if capacity == 0 {
            return Err(ResidualError::configuration(
                "buffer_size",
                "0",
                "disk buffer must hold at least one row",
            ));
        }
        Ok(Self {
            rows: Vec::with_capacity(capacity),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.capacity
    }

    pub fn push(&mut self, row: RawDatapoint) {
        self.rows.push(row);
    }

    /// Take the whole queue, leaving a fresh empty buffer behind.
    pub fn take(&mut self) -> Vec<RawDatapoint> {
        mem::replace(&mut self.rows, Vec::with_capacity(self.capacity))
    }

    /// Put rows back at the front, ahead of anything buffered since.
    fn restore(&mut self, mut rows: Vec<RawDatapoint>) {
        rows.append(&mut self.rows);
        self.rows = rows;
    }
}

/// Snapshot of a [`RecordDataStrategy`]'s progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordStats {
    /// Rows in the foreground buffer, not yet handed to the worker.
    pub rows_buffered: usize,
    /// Rows handed to the worker and not yet on disk.
    pub rows_pending: usize,
    pub rows_persisted: u64,
    pub flushes_completed: u64,
    pub flushes_failed: u64,
}

enum Command {
    Flush(Vec<RawDatapoint>),
    /// Retry anything pending, then report how many rows remain unpersisted.
    Drain(Sender<usize>),
}

#[derive(Debug, Default)]
struct Shared {
    outstanding_flushes: AtomicUsize,
    rows_pending: AtomicUsize,
    rows_persisted: AtomicU64,
    flushes_completed: AtomicU64,
    flushes_failed: AtomicU64,
    /// Set by a failed append, cleared once the worker has nothing pending.
    last_error: Mutex<Option<ResidualError>>,
    /// Held by tests to park the worker before it appends.
    #[cfg(test)]
    hold: Mutex<()>,
}

impl Shared {
    fn record_error(&self, err: ResidualError) {
        let mut slot = match self.last_error.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(err);
    }

    fn last_error(&self) -> Option<ResidualError> {
        match self.last_error.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn clear_error(&self) {
        match self.last_error.lock() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }
}

/// Logs raw observations to disk without touching the predictor.
///
/// Dropping the strategy drains the buffer and joins the worker; call
/// [`DataProcessingStrategy::flush`] to observe the outcome instead of relying
/// on drop.
pub struct RecordDataStrategy {
    log: PersistedLog,
    journal: Option<PathBuf>,
    buffer: DiskBuffer,
    retention_limit: usize,
    shared: Arc<Shared>,
    sender: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl RecordDataStrategy {
    /// Log to `x_path`/`y_path` with [`DEFAULT_BUFFER_SIZE`].
    pub fn new<P, Q>(x_path: P, y_path: Q) -> ResidualResult<Self>
    where
        P: Into<PathBuf>,
        Q: Into<PathBuf>,
    {
        Self::with_buffer_size(x_path, y_path, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size<P, Q>(x_path: P, y_path: Q, buffer_size: usize) -> ResidualResult<Self>
    where
        P: Into<PathBuf>,
        Q: Into<PathBuf>,
    {
        let buffer = DiskBuffer::new(buffer_size)?;
        let log = PersistedLog::open(x_path, y_path)?;
        Ok(Self {
            log,
            journal: None,
            retention_limit: buffer_size.saturating_mul(DEFAULT_RETAINED_BUFFERS),
            buffer,
            shared: Arc::new(Shared::default()),
            sender: None,
            worker: None,
        })
    }

    /// Append a JSON line per flush outcome to `path`.
    ///
    /// Takes effect only before the first flush starts the worker.
    pub fn with_journal<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.journal = Some(path.into());
        self
    }

    /// Cap on rows kept in memory (buffered plus pending) while appends fail.
    ///
    /// Must be at least the buffer size.
    pub fn with_retention_limit(mut self, rows: usize) -> ResidualResult<Self> {
        if rows < self.buffer.capacity() {
            return Err(ResidualError::configuration(
                "max_retained_rows",
                rows.to_string(),
                format!("must hold at least one full buffer ({} rows)", self.buffer.capacity()),
            ));
        }
        self.retention_limit = rows;
        Ok(self)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn retention_limit(&self) -> usize {
        self.retention_limit
    }

    pub fn x_path(&self) -> &Path {
        self.log.x_path()
    }

    pub fn y_path(&self) -> &Path {
        self.log.y_path()
    }

    pub fn stats(&self) -> RecordStats {
        RecordStats {
            rows_buffered: self.buffer.len(),
            rows_pending: self.shared.rows_pending.load(Ordering::Acquire),
            rows_persisted: self.shared.rows_persisted.load(Ordering::Acquire),
            flushes_completed: self.shared.flushes_completed.load(Ordering::Acquire),
            flushes_failed: self.shared.flushes_failed.load(Ordering::Acquire),
        }
    }

    fn ensure_worker(&mut self) -> ResidualResult<Sender<Command>> {
        if let Some(sender) = &self.sender {
            return Ok(sender.clone());
        }

        let (sender, receiver) = mpsc::channel();
        let worker = FlushWorker {
            log: self.log.clone(),
            journal: self.journal.clone(),
            shared: Arc::clone(&self.shared),
            pending: Vec::new(),
            sequence: 0,
        };
        let handle = thread::Builder::new()
            .name("residual-flush".into())
            .spawn(move || worker.run(receiver))
            .map_err(|err| ResidualError::io("spawning flush worker", &err))?;

        self.worker = Some(handle);
        self.sender = Some(sender.clone());
        Ok(sender)
    }

    /// Hand the current buffer to the worker. On failure the rows go back
    /// into the buffer untouched.
    fn dispatch(&mut self) -> ResidualResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let sender = self.ensure_worker()?;
        let rows = self.buffer.take();
        let count = rows.len();

        self.shared.outstanding_flushes.fetch_add(1, Ordering::AcqRel);
        self.shared.rows_pending.fetch_add(count, Ordering::AcqRel);
        if let Err(mpsc::SendError(command)) = sender.send(Command::Flush(rows)) {
            self.shared.outstanding_flushes.fetch_sub(1, Ordering::AcqRel);
            self.shared.rows_pending.fetch_sub(count, Ordering::AcqRel);
            if let Command::Flush(rows) = command {
                self.buffer.restore(rows);
            }
            return Err(worker_stopped());
        }
        tracing::debug!(rows = count, "queued disk flush");
        Ok(())
    }

    /// Refuse a new row when the disk is failing and the backlog is full.
    fn check_backlog(&self) -> ResidualResult<()> {
        let backlog = self.buffer.len() + self.shared.rows_pending.load(Ordering::Acquire);
        if backlog < self.retention_limit {
            return Ok(());
        }
        match self.shared.last_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn shutdown(&mut self) {
        if let Err(err) = self.flush() {
            tracing::error!(
                error = %err,
                x = %self.log.x_path().display(),
                "rows left unpersisted at shutdown"
            );
        }
        self.sender = None;
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                tracing::error!("flush worker panicked");
            }
        }
    }
}

impl DataProcessingStrategy for RecordDataStrategy {
    fn process(
        &mut self,
        x: ArrayView1<'_, f64>,
        y: ArrayView1<'_, f64>,
        selector: &FeatureSelector,
        gp: &mut dyn GpPredictor,
    ) -> ResidualResult<()> {
        check_observation(x, y, selector, gp)?;
        self.check_backlog()?;
        self.buffer.push(RawDatapoint::new(x, y));

        let idle = self.shared.outstanding_flushes.load(Ordering::Acquire) == 0;
        if self.buffer.is_full() && idle {
            self.dispatch()?;
        }
        Ok(())
    }

    /// Queue the partial buffer, wait for the worker to finish everything
    /// queued so far, and fail if any row is still unpersisted.
    fn flush(&mut self) -> ResidualResult<()> {
        if self.buffer.is_empty() && self.sender.is_none() {
            return Ok(());
        }
        self.dispatch()?;

        let sender = self.ensure_worker()?;
        let (ack_tx, ack_rx) = mpsc::channel();
        sender
            .send(Command::Drain(ack_tx))
            .map_err(|_| worker_stopped())?;
        let remaining = ack_rx.recv().map_err(|_| worker_stopped())?;

        if remaining == 0 {
            return Ok(());
        }
        Err(self.shared.last_error().unwrap_or_else(|| {
            ResidualError::io(
                "draining disk buffer",
                &io::Error::new(
                    io::ErrorKind::Other,
                    format!("{remaining} rows remain unpersisted"),
                ),
            )
        }))
    }

    fn last_error(&self) -> Option<ResidualError> {
        self.shared.last_error()
    }
}

impl Drop for RecordDataStrategy {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for RecordDataStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordDataStrategy")
            .field("log", &self.log)
            .field("journal", &self.journal)
            .field("buffer_size", &self.buffer.capacity())
            .field("retention_limit", &self.retention_limit)
            .field("stats", &self.stats())
            .finish()
    }
}

fn worker_stopped() -> ResidualError {
    ResidualError::io(
        "flush worker",
        &io::Error::new(io::ErrorKind::BrokenPipe, "flush worker is no longer running"),
    )
}

struct FlushWorker {
    log: PersistedLog,
    journal: Option<PathBuf>,
    shared: Arc<Shared>,
    /// Rows from failed attempts, oldest first.
    pending: Vec<RawDatapoint>,
    sequence: u64,
}

impl FlushWorker {
    fn run(mut self, receiver: Receiver<Command>) {
        for command in receiver {
            match command {
                Command::Flush(mut rows) => {
                    self.pending.append(&mut rows);
                    self.attempt();
                    self.shared.outstanding_flushes.fetch_sub(1, Ordering::AcqRel);
                }
                Command::Drain(ack) => {
                    if !self.pending.is_empty() {
                        self.attempt();
                    }
                    // The requester may have given up waiting.
                    let _ = ack.send(self.pending.len());
                }
            }
        }
        if !self.pending.is_empty() {
            tracing::error!(rows = self.pending.len(), "flush worker exiting with unpersisted rows");
        }
    }

    fn attempt(&mut self) {
        #[cfg(test)]
        let _held = self.shared.hold.lock();

        self.sequence += 1;
        let rows = self.pending.len();
        tracing::debug!(sequence = self.sequence, rows, "flushing disk buffer");

        let outcome = self.log.append_rows(&self.pending);
        let status = match &outcome {
            Ok(written) => {
                self.pending.clear();
                self.shared.rows_pending.fetch_sub(*written, Ordering::AcqRel);
                self.shared.rows_persisted.fetch_add(*written as u64, Ordering::AcqRel);
                self.shared.flushes_completed.fetch_add(1, Ordering::AcqRel);
                self.shared.clear_error();
                tracing::debug!(sequence = self.sequence, rows = written, "disk flush complete");
                FlushStatus::Persisted
            }
            Err(err) => {
                self.shared.flushes_failed.fetch_add(1, Ordering::AcqRel);
                self.shared.record_error(err.clone());
                tracing::error!(
                    sequence = self.sequence,
                    rows,
                    error = %err,
                    "disk flush failed; rows kept for retry"
                );
                FlushStatus::Failed
            }
        };

        if let Some(journal) = &self.journal {
            let entry = FlushLogEntry {
                sequence: self.sequence,
                rows,
                x_path: self.log.x_path().display().to_string(),
                y_path: self.log.y_path().display().to_string(),
                status,
                timestamp_ms: timestamp_ms(),
                error: outcome.err().map(|err| err.to_string()),
            };
            if let Err(err) = log_flush(journal, &entry) {
                tracing::warn!(journal = %journal.display(), error = %err, "could not write flush journal");
            }
        }
    }
}
