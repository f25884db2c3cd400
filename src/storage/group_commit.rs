//! Write-behind queue with group commit.
//!
//! Callers enqueue [`WriteOp`]s and get a [`CommitHandle`] back. A single
//! drain task collects operations into a batch until `batch_threshold`
//! operations are queued or `batch_interval` has passed since the first one,
//! then commits the whole batch with one durable flush:
//!
//! 1. seal every operation (a cancelled one is dropped and its pages released)
//! 2. verify payload checksums
//! 3. [`CommitSink::persist`]: write payloads, append journal records, sync
//! 4. [`CommitSink::apply`]: publish the new locations in the registry
//! 5. resolve the handles
//!
//! Batches are committed strictly in order, so batch N is durable before any
//! handle of batch N+1 resolves. If a batch cannot be persisted after
//! `max_retries` retries, every handle in it fails with an I/O error and none
//! of its operations become visible.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use log::{debug, error, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::WriterConfig;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::Extent;
use crate::storage::registry::Location;
use crate::storage::shutdown::Shutdown;
use crate::storage::wal::{WalRecord, LSN};

const PENDING: u8 = 0;
const SEALED: u8 = 1;
const CANCELLED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Put,
    Delete,
}

/// A queued logical write.
#[derive(Debug, Clone)]
pub struct WriteOp {
    pub kind: OpKind,
    pub name: String,
    pub payload: Bytes,
    pub checksum: u32,
    /// Pages reserved for the payload. Always set for puts.
    pub extent: Option<Extent>,
    pub generation: u64,
}

impl WriteOp {
    pub fn put(name: impl Into<String>, payload: Bytes, extent: Extent, generation: u64) -> Self {
        WriteOp {
            kind: OpKind::Put,
            name: name.into(),
            checksum: crc32fast::hash(&payload),
            payload,
            extent: Some(extent),
            generation,
        }
    }

    pub fn delete(name: impl Into<String>) -> Self {
        WriteOp {
            kind: OpKind::Delete,
            name: name.into(),
            payload: Bytes::new(),
            checksum: 0,
            extent: None,
            generation: 0,
        }
    }

    /// Location the payload will occupy once committed.
    pub fn location(&self) -> Option<Location> {
        match (self.kind, self.extent) {
            (OpKind::Put, Some(extent)) => Some(Location {
                offset: extent.byte_offset(),
                length: self.payload.len() as u64,
                checksum: self.checksum,
                generation: self.generation,
            }),
            _ => None,
        }
    }

    /// Check that the payload still matches the checksum taken at enqueue time
    /// and fits its extent.
    pub fn verify(&self) -> StorageResult<()> {
        if self.kind == OpKind::Delete {
            return Ok(());
        }
        let extent = self.extent.ok_or_else(|| {
            StorageError::InvalidArgument(format!("put of '{}' has no extent", self.name))
        })?;
        if self.payload.len() as u64 > extent.byte_len() {
            return Err(StorageError::InvalidArgument(format!(
                "payload of '{}' ({} bytes) does not fit {}",
                self.name,
                self.payload.len(),
                extent
            )));
        }
        let actual = crc32fast::hash(&self.payload);
        if actual != self.checksum {
            return Err(StorageError::checksum_mismatch(
                format!("queued write '{}'", self.name),
                self.checksum,
                actual,
            ));
        }
        Ok(())
    }

    pub fn to_record(&self, lsn: LSN) -> WalRecord {
        match self.location() {
            Some(location) => WalRecord::put(lsn, self.name.clone(), location),
            None => WalRecord::remove(lsn, self.name.clone()),
        }
    }
}

/// Where sealed batches go.
///
/// Every method is blocking and is called from `spawn_blocking`.
pub trait CommitSink: Send + Sync + 'static {
    /// Make the batch durable. Nothing may become visible to readers yet.
    fn persist(&self, lsn: LSN, ops: &[WriteOp]) -> StorageResult<()>;

    /// Undo whatever a failed `persist` of `lsn` left behind.
    fn abort(&self, lsn: LSN) -> StorageResult<()>;

    /// Publish a durable batch. Returns, per operation, the location it
    /// displaced.
    fn apply(&self, lsn: LSN, ops: &[WriteOp]) -> Vec<Option<Location>>;

    /// Release what an operation reserved; it will never be published.
    fn discard(&self, op: &WriteOp);

    /// Persist all published state (called once the queue is drained).
    fn checkpoint(&self) -> StorageResult<()>;
}

/// Completion of one enqueued operation.
///
/// Resolves to where the block now lives for a put, and where it used to
/// live (if anywhere) for a delete.
pub struct CommitHandle {
    seq: u64,
    state: Arc<AtomicU8>,
    rx: oneshot::Receiver<StorageResult<Option<Location>>>,
}

impl CommitHandle {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Withdraw the operation. Only possible until it is sealed into a batch.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_sealed(&self) -> bool {
        self.state.load(Ordering::Acquire) == SEALED
    }
}

impl Future for CommitHandle {
    type Output = StorageResult<Option<Location>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => {
                if self.state.load(Ordering::Acquire) == CANCELLED {
                    Poll::Ready(Err(StorageError::Cancelled { seq: self.seq }))
                } else {
                    Poll::Ready(Err(StorageError::Closed))
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Debug, Default)]
pub struct WriterStats {
    ops: AtomicU64,
    batches: AtomicU64,
    flushes: AtomicU64,
    max_batch: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// Point-in-time copy of the writer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriterStatsSnapshot {
    pub ops: u64,
    pub batches: u64,
    /// Successful durable flushes (one per committed batch).
    pub flushes: u64,
    pub max_batch: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl WriterStats {
    pub fn snapshot(&self) -> WriterStatsSnapshot {
        WriterStatsSnapshot {
            ops: self.ops.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            max_batch: self.max_batch.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

struct PendingOp {
    seq: u64,
    op: WriteOp,
    state: Arc<AtomicU8>,
    done: oneshot::Sender<StorageResult<Option<Location>>>,
}

enum Command {
    Op(PendingOp),
    Flush(oneshot::Sender<StorageResult<()>>),
}

pub struct GroupCommitWriter {
    tx: mpsc::Sender<Command>,
    sink: Arc<dyn CommitSink>,
    next_seq: AtomicU64,
    stats: Arc<WriterStats>,
}

impl GroupCommitWriter {
    /// Spawn the drain task. Batches are numbered after `last_lsn`.
    pub fn start(
        config: WriterConfig,
        sink: Arc<dyn CommitSink>,
        shutdown: watch::Receiver<Shutdown>,
        last_lsn: LSN,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let stats = Arc::new(WriterStats::default());

        let drain = DrainLoop {
            config,
            sink: sink.clone(),
            rx,
            shutdown,
            last_lsn,
            stats: stats.clone(),
        };
        let task = tokio::spawn(drain.run());

        let writer = GroupCommitWriter {
            tx,
            sink,
            next_seq: AtomicU64::new(1),
            stats,
        };
        (writer, task)
    }

    /// Queue an operation. Waits only if the submission queue is full.
    pub async fn enqueue(&self, op: WriteOp) -> StorageResult<CommitHandle> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(AtomicU8::new(PENDING));
        let (done, rx) = oneshot::channel();

        let pending = PendingOp {
            seq,
            op,
            state: state.clone(),
            done,
        };
        if let Err(mpsc::error::SendError(command)) = self.tx.send(Command::Op(pending)).await {
            if let Command::Op(pending) = command {
                self.sink.discard(&pending.op);
            }
            return Err(StorageError::Closed);
        }

        Ok(CommitHandle { seq, state, rx })
    }

    /// Commit everything queued before this call, regardless of thresholds.
    pub async fn force_flush(&self) -> StorageResult<()> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(ack))
            .await
            .map_err(|_| StorageError::Closed)?;
        rx.await.map_err(|_| StorageError::Closed)?
    }

    pub fn stats(&self) -> WriterStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct DrainLoop {
    config: WriterConfig,
    sink: Arc<dyn CommitSink>,
    rx: mpsc::Receiver<Command>,
    shutdown: watch::Receiver<Shutdown>,
    last_lsn: LSN,
    stats: Arc<WriterStats>,
}

impl DrainLoop {
    async fn run(mut self) {
        let mut batch: Vec<PendingOp> = Vec::new();
        let mut deadline: Option<Instant> = None;

        loop {
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                changed = self.shutdown.changed() => {
                    let signal = match changed {
                        Ok(()) => *self.shutdown.borrow(),
                        Err(_) => Shutdown::Drain,
                    };
                    match signal {
                        Shutdown::Running => continue,
                        Shutdown::Drain => {
                            self.drain(batch).await;
                            return;
                        }
                        Shutdown::Halt => {
                            self.rx.close();
                            debug!(
                                "group-commit writer halted, {} queued operations abandoned",
                                batch.len()
                            );
                            return;
                        }
                    }
                }
                command = self.rx.recv() => match command {
                    Some(Command::Op(pending)) => {
                        batch.push(pending);
                        if deadline.is_none() {
                            deadline = Some(Instant::now() + self.config.batch_interval);
                        }
                        if batch.len() >= self.config.batch_threshold {
                            let _ = self.commit(std::mem::take(&mut batch)).await;
                            deadline = None;
                        }
                    }
                    Some(Command::Flush(ack)) => {
                        let result = self.commit(std::mem::take(&mut batch)).await;
                        deadline = None;
                        let _ = ack.send(result);
                    }
                    None => {
                        self.drain(batch).await;
                        return;
                    }
                },
                _ = timer => {
                    let _ = self.commit(std::mem::take(&mut batch)).await;
                    deadline = None;
                }
            }
        }
    }

    /// Commit everything still queued, then checkpoint.
    async fn drain(&mut self, mut batch: Vec<PendingOp>) {
        self.rx.close();
        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Op(pending) => {
                    batch.push(pending);
                    if batch.len() >= self.config.batch_threshold {
                        let _ = self.commit(std::mem::take(&mut batch)).await;
                    }
                }
                Command::Flush(ack) => {
                    let result = self.commit(std::mem::take(&mut batch)).await;
                    let _ = ack.send(result);
                }
            }
        }
        let _ = self.commit(batch).await;

        let sink = self.sink.clone();
        match tokio::task::spawn_blocking(move || sink.checkpoint()).await {
            Ok(Ok(())) => debug!("group-commit writer drained"),
            Ok(Err(e)) => error!("final checkpoint failed: {}", e),
            Err(e) => error!("final checkpoint task failed: {}", e),
        }
    }

    async fn commit(&mut self, batch: Vec<PendingOp>) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut sealed = Vec::with_capacity(batch.len());
        for pending in batch {
            let claimed = pending
                .state
                .compare_exchange(PENDING, SEALED, Ordering::AcqRel, Ordering::Acquire);
            if claimed.is_err() {
                self.sink.discard(&pending.op);
                self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                let _ = pending.done.send(Err(StorageError::Cancelled { seq: pending.seq }));
                continue;
            }
            if let Err(e) = pending.op.verify() {
                warn!("rejecting queued write '{}': {}", pending.op.name, e);
                self.sink.discard(&pending.op);
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                let _ = pending.done.send(Err(e));
                continue;
            }
            sealed.push(pending);
        }
        if sealed.is_empty() {
            return Ok(());
        }

        let lsn = self.last_lsn.next();
        self.last_lsn = lsn;
        let ops: Arc<Vec<WriteOp>> = Arc::new(sealed.iter().map(|p| p.op.clone()).collect());

        if let Err(e) = self.persist_with_retry(lsn, ops.clone()).await {
            error!(
                "batch {} of {} operations failed, all waiters notified: {}",
                lsn,
                sealed.len(),
                e
            );
            self.stats
                .failed
                .fetch_add(sealed.len() as u64, Ordering::Relaxed);
            for pending in sealed {
                self.sink.discard(&pending.op);
                let _ = pending.done.send(Err(batch_failure(&e)));
            }
            return Err(batch_failure(&e));
        }

        let sink = self.sink.clone();
        let applied = ops.clone();
        let displaced = match tokio::task::spawn_blocking(move || sink.apply(lsn, &applied)).await {
            Ok(displaced) => displaced,
            Err(e) => {
                // The batch is durable in the journal; it becomes visible on reopen.
                error!("applying batch {} failed: {}", lsn, e);
                let err = StorageError::Io(io::Error::other(e.to_string()));
                for pending in sealed {
                    let _ = pending.done.send(Err(batch_failure(&err)));
                }
                return Err(err);
            }
        };

        let size = sealed.len() as u64;
        self.stats.ops.fetch_add(size, Ordering::Relaxed);
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        self.stats.max_batch.fetch_max(size, Ordering::Relaxed);
        debug!("committed batch {} with {} operations", lsn, size);

        for (pending, previous) in sealed.into_iter().zip(displaced) {
            let outcome = match pending.op.kind {
                OpKind::Put => pending.op.location(),
                OpKind::Delete => previous,
            };
            let _ = pending.done.send(Ok(outcome));
        }
        Ok(())
    }

    async fn persist_with_retry(&self, lsn: LSN, ops: Arc<Vec<WriteOp>>) -> StorageResult<()> {
        let mut attempt = 0u32;
        loop {
            let sink = self.sink.clone();
            let batch = ops.clone();
            let outcome = tokio::task::spawn_blocking(move || match sink.persist(lsn, &batch) {
                Ok(()) => Ok(()),
                Err(e) => {
                    if let Err(abort_err) = sink.abort(lsn) {
                        error!("rolling back batch {} failed: {}", lsn, abort_err);
                    }
                    Err(e)
                }
            })
            .await
            .unwrap_or_else(|e| {
                Err(StorageError::Io(io::Error::other(format!(
                    "commit task failed: {e}"
                ))))
            });

            match outcome {
                Ok(()) => {
                    self.stats.flushes.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e @ StorageError::Io(_)) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        "batch {} write failed (attempt {} of {}): {}",
                        lsn,
                        attempt,
                        self.config.max_retries + 1,
                        e
                    );
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// The error each waiter of a failed batch receives.
fn batch_failure(err: &StorageError) -> StorageError {
    match err {
        StorageError::Io(e) => StorageError::io_like(e),
        other => StorageError::Io(io::Error::other(other.to_string())),
    }
}
