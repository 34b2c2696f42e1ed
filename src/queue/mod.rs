//! Durable FIFO queue with an in-memory fast path and a disk-backed
//! overflow tier
//!
//! Behaves like a plain channel while the consumer keeps up, spills to a
//! segmented on-disk log when it does not, and survives restarts by
//! replaying whatever the log still holds.
//!
//! # Tiers
//!
//! ```text
//! enqueue ──► fast path ──────────────► consumer   (consumer waiting,
//!         │                                         nothing pending)
//!         └─► memory deque ──spill──► disk log ──► consumer
//! ```
//!
//! Drain order is always disk first, then memory: a record reaches disk
//! only by overflowing out of memory, so everything on disk predates
//! everything in memory. Backlog persisted by a previous run is yielded
//! before anything enqueued in this one.
//!
//! # Ownership
//!
//! All queue state lives in one spawned task. The handle side is a
//! cloneable [`QueueWriter`] feeding a bounded inbox (the system's
//! backpressure point) and a [`QueueReader`] that requests records one at
//! a time. A record leaves the task only when a consumer is actually
//! waiting for it; a handoff that fails mid-flight puts the record back,
//! so closing the reader never strands records.

mod segment;

use crate::error::{PeiliError, Result};
use crate::metrics::Metrics;
use crate::record::Record;
use bytes::Bytes;
use segment::DiskLog;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Headroom on top of `max_msg_size` for method and url framing when
/// judging whether an on-disk length header is plausible.
const FRAME_OVERHEAD: u32 = 64 * 1024;

/// Memory tier may grow to this many high-water marks while the disk is
/// refusing writes before intake pauses and backpressure reaches ingress.
const MEM_PRESSURE_FACTOR: usize = 4;

/// Tuning for one durable queue.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Endpoint group name; used for logging and metric labels
    pub name: String,
    /// Directory owned exclusively by this queue
    pub dir: PathBuf,
    /// Segment rotation threshold
    pub max_bytes_per_file: u64,
    /// Smallest accepted record body
    pub min_msg_size: u32,
    /// Largest accepted record body
    pub max_msg_size: u32,
    /// Sync after this many appends/reads
    pub sync_every: u64,
    /// Sync at least this often while dirty
    pub sync_timeout: Duration,
    /// Bound of the inbox channel
    pub inbox_capacity: usize,
    /// Memory tier size that triggers a spill to disk
    pub spill_high_water: usize,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>, max_msg_size: u32) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            max_bytes_per_file: 1024 * 1024 * 1024,
            min_msg_size: 0,
            max_msg_size,
            sync_every: 10_000,
            sync_timeout: Duration::from_secs(10),
            inbox_capacity: 1024,
            spill_high_water: 256,
        }
    }
}

/// Producer handle. Cloned by the ingress handler and by workers
/// re-enqueueing failed dispatches.
#[derive(Clone)]
pub struct QueueWriter {
    name: String,
    min_msg_size: u32,
    max_msg_size: u32,
    tx: mpsc::Sender<Record>,
}

impl QueueWriter {
    /// Name of the queue this writer feeds.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a record, waiting for inbox room if the queue is busy.
    ///
    /// Rejects bodies outside the configured bounds without touching the
    /// queue.
    pub async fn enqueue(&self, record: Record) -> Result<()> {
        let size = record.body.len();
        if size < self.min_msg_size as usize || size > self.max_msg_size as usize {
            return Err(PeiliError::OversizedRecord {
                size,
                min: self.min_msg_size,
                max: self.max_msg_size,
            });
        }
        self.tx
            .send(record)
            .await
            .map_err(|_| PeiliError::QueueClosed(self.name.clone()))
    }
}

/// Consumer handle; single consumer per queue.
pub struct QueueReader {
    req_tx: mpsc::Sender<oneshot::Sender<Record>>,
}

impl QueueReader {
    /// Yield the next record in FIFO order, suspending until one is
    /// available. Returns `None` once the queue has shut down.
    pub async fn next(&mut self) -> Option<Record> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.req_tx.send(reply_tx).await.ok()?;
        reply_rx.await.ok()
    }
}

/// A running durable queue: its two handles plus the owning task.
pub struct DurableQueue {
    pub writer: QueueWriter,
    pub reader: QueueReader,
    pub task: JoinHandle<()>,
}

impl DurableQueue {
    /// Open (or replay) the queue rooted at `config.dir` and spawn its
    /// task. The directory must already exist.
    pub fn open(config: QueueConfig) -> Result<DurableQueue> {
        let frame_limit = config.max_msg_size.saturating_add(FRAME_OVERHEAD);
        let mut disk = DiskLog::open(&config.dir, &config.name, config.max_bytes_per_file, frame_limit)?;
        if disk.dirty() {
            disk.sync()?;
        }

        let (in_tx, in_rx) = mpsc::channel(config.inbox_capacity.max(1));
        let (req_tx, req_rx) = mpsc::channel(1);

        let writer = QueueWriter {
            name: config.name.clone(),
            min_msg_size: config.min_msg_size,
            max_msg_size: config.max_msg_size,
            tx: in_tx,
        };
        let reader = QueueReader { req_tx };

        let task = QueueTask {
            name: config.name,
            sync_every: config.sync_every,
            sync_timeout: config.sync_timeout,
            spill_high_water: config.spill_high_water.max(1),
            disk,
            mem: VecDeque::new(),
            waiting: None,
            in_rx,
            req_rx,
        };
        let task = tokio::spawn(task.run());

        Ok(DurableQueue {
            writer,
            reader,
            task,
        })
    }
}

struct QueueTask {
    name: String,
    sync_every: u64,
    sync_timeout: Duration,
    spill_high_water: usize,
    disk: DiskLog,
    mem: VecDeque<Record>,
    /// A consumer parked in `next()`, if any
    waiting: Option<oneshot::Sender<Record>>,
    in_rx: mpsc::Receiver<Record>,
    req_rx: mpsc::Receiver<oneshot::Sender<Record>>,
}

impl QueueTask {
    async fn run(mut self) {
        let period = if self.sync_timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            self.sync_timeout
        };
        let mut sync_tick = tokio::time::interval(period);
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mem_limit = self.spill_high_water * MEM_PRESSURE_FACTOR;
        let mut reader_open = true;

        loop {
            // Serve a parked consumer from the backlog before anything else.
            if self.waiting.is_some() && self.backlog() {
                match self.pop_next() {
                    Ok(Some(record)) => self.hand_over(record),
                    Ok(None) => {} // corrupt frames drained away, nothing to serve
                    Err(e) => {
                        error!(queue = %self.name, error = %e, "fatal disk read error, stopping queue");
                        break;
                    }
                }
            }

            if self.disk.dirty() && self.disk.ops_since_sync() >= self.sync_every {
                self.sync_logged();
            }
            self.publish_depth();

            tokio::select! {
                biased;

                req = self.req_rx.recv(), if reader_open && self.waiting.is_none() => {
                    match req {
                        Some(reply) => self.waiting = Some(reply),
                        None => reader_open = false,
                    }
                }

                maybe = self.in_rx.recv(), if self.mem.len() < mem_limit => {
                    match maybe {
                        Some(record) => self.accept(record),
                        None => break, // all producers gone: shut down
                    }
                }

                _ = sync_tick.tick() => {
                    if self.disk.dirty() {
                        self.sync_logged();
                    }
                }
            }
        }

        self.close();
    }

    fn backlog(&self) -> bool {
        self.disk.depth() > 0 || !self.mem.is_empty()
    }

    /// Take in a freshly enqueued record: straight to a waiting consumer
    /// when nothing is pending, otherwise onto the memory tier.
    fn accept(&mut self, record: Record) {
        let record = if self.disk.depth() == 0 && self.mem.is_empty() {
            match self.waiting.take() {
                Some(reply) => match reply.send(record) {
                    Ok(()) => return,
                    Err(record) => record, // consumer gave up while parked
                },
                None => record,
            }
        } else {
            record
        };

        self.mem.push_back(record);
        if self.mem.len() >= self.spill_high_water {
            self.spill();
        }
    }

    /// Oldest pending record: disk first, memory second.
    fn pop_next(&mut self) -> Result<Option<Record>> {
        if self.disk.depth() > 0 {
            match self.disk.read_next()? {
                Some(frame) => {
                    return match Record::decode(Bytes::from(frame)) {
                        Ok(record) => Ok(Some(record)),
                        Err(e) => {
                            warn!(queue = %self.name, error = %e, "dropping undecodable frame");
                            Ok(None)
                        }
                    };
                }
                None => {} // depth drained by corruption handling
            }
        }
        Ok(self.mem.pop_front())
    }

    fn hand_over(&mut self, record: Record) {
        match self.waiting.take() {
            Some(reply) => {
                if let Err(record) = reply.send(record) {
                    // The consumer vanished between asking and receiving;
                    // the record goes back to the head of the line.
                    self.mem.push_front(record);
                }
            }
            None => self.mem.push_front(record),
        }
    }

    /// Drain the memory tier onto the disk log. Records stay in memory if
    /// the disk refuses them; the next spill tries again.
    fn spill(&mut self) {
        let mut spilled = 0u64;
        while let Some(record) = self.mem.pop_front() {
            let frame = record.encode();
            if let Err(e) = self.disk.append(&frame) {
                warn!(queue = %self.name, error = %e, "disk append failed, record stays in memory");
                self.mem.push_front(record);
                break;
            }
            spilled += 1;
        }
        if spilled > 0 {
            debug!(queue = %self.name, spilled, "spilled memory tier to disk");
            if let Some(m) = Metrics::get() {
                m.record_spill(&self.name, spilled);
            }
        }
    }

    fn sync_logged(&mut self) {
        if let Err(e) = self.disk.sync() {
            warn!(queue = %self.name, error = %e, "sync failed, will retry");
        }
    }

    fn publish_depth(&self) {
        if let Some(m) = Metrics::get() {
            m.set_queue_depth(&self.name, self.disk.depth() + self.mem.len() as u64);
        }
    }

    /// Spill whatever memory still holds, then sync and release the log.
    fn close(mut self) {
        if !self.mem.is_empty() {
            info!(queue = %self.name, remaining = self.mem.len(), "persisting memory tier before close");
            self.spill();
            if !self.mem.is_empty() {
                error!(
                    queue = %self.name,
                    lost = self.mem.len(),
                    "disk unavailable at close, in-memory records lost"
                );
            }
        }
        self.publish_depth();
        if let Err(e) = self.disk.close() {
            error!(queue = %self.name, error = %e, "closing disk log failed");
        }
    }
}
