//! Endpoint pipeline - one per configured endpoint group
//!
//! Ties together the inbox, the durable queue, and the worker pool:
//!
//! ```text
//! ingress ──► inbox ──► durable queue ──► dispatcher ──► workers ──► hosts
//!                ▲                                          │
//!                └────────────── re-enqueue on failure ─────┘
//! ```
//!
//! The dispatcher starts draining the queue the moment the pipeline comes
//! up, so backlog persisted by a previous run replays without waiting for
//! new traffic. Shutdown runs back to front: the dispatcher stops feeding
//! the worker channel, workers finish what the channel still holds
//! (delivering or re-enqueueing), and only then does the queue close and
//! sync. Whatever is still on disk stays there for the next run.

use crate::error::Result;
use crate::queue::{DurableQueue, QueueConfig, QueueWriter};
use crate::worker::{WorkerContext, build_client, run_worker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Runtime description of one endpoint group.
#[derive(Clone, Debug)]
pub struct EndpointGroup {
    pub name: String,
    pub hosts: Vec<String>,
    /// Total deadline for each upstream call
    pub timeout: Duration,
    /// Number of workers in this group's pool
    pub concurrency: usize,
}

/// A running pipeline and the handles needed to stop it.
pub struct Pipeline {
    name: String,
    inbox: QueueWriter,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    queue_task: JoinHandle<()>,
}

impl Pipeline {
    /// Create the group's data directory, open and replay its durable
    /// queue, and spawn the dispatcher plus `concurrency` workers.
    pub fn start(
        group: EndpointGroup,
        queue_config: QueueConfig,
        danger_accept_invalid_certs: bool,
    ) -> Result<Pipeline> {
        std::fs::create_dir_all(&queue_config.dir)?;

        let DurableQueue {
            writer,
            mut reader,
            task: queue_task,
        } = DurableQueue::open(queue_config)?;

        let client = build_client(group.timeout, danger_accept_invalid_certs)?;
        let concurrency = group.concurrency.max(1);
        let (worker_tx, worker_rx) = mpsc::channel(concurrency);
        let worker_rx = Arc::new(Mutex::new(worker_rx));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let hosts = Arc::new(group.hosts);

        let mut tasks = Vec::with_capacity(concurrency + 1);
        for _ in 0..concurrency {
            let ctx = WorkerContext {
                name: group.name.clone(),
                hosts: Arc::clone(&hosts),
                client: client.clone(),
                retry: writer.clone(),
            };
            tasks.push(tokio::spawn(run_worker(ctx, Arc::clone(&worker_rx))));
        }

        // The dispatcher begins draining immediately so that backlog from a
        // previous run replays before ingress produces anything new.
        let name = group.name.clone();
        tasks.push(tokio::spawn(async move {
            let mut moved = 0u64;
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    maybe = reader.next() => match maybe {
                        Some(record) => {
                            if worker_tx.send(record).await.is_err() {
                                break;
                            }
                            moved += 1;
                            if moved % 1000 == 0 {
                                debug!(endpoint = %name, moved, "dispatcher progress");
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!(endpoint = %name, "dispatcher stopped");
        }));

        info!(
            endpoint = %group.name,
            hosts = ?hosts,
            concurrency,
            "registered endpoint group"
        );

        Ok(Pipeline {
            name: group.name,
            inbox: writer,
            shutdown: shutdown_tx,
            tasks,
            queue_task,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A producer handle into this pipeline's inbox.
    pub fn inbox(&self) -> QueueWriter {
        self.inbox.clone()
    }

    /// Stop the pipeline: workers drain the worker channel, the queue
    /// spills and syncs, all tasks join.
    ///
    /// Ingress handles cloned from [`inbox`](Self::inbox) must be dropped
    /// first, or the queue will keep waiting for producers.
    pub async fn shutdown(self) {
        info!(endpoint = %self.name, "pipeline shutting down");
        let _ = self.shutdown.send(true);
        drop(self.inbox);
        for task in self.tasks {
            let _ = task.await;
        }
        let _ = self.queue_task.await;
        info!(endpoint = %self.name, "pipeline stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::record::Record;
    use bytes::Bytes;

    fn group(name: &str, hosts: Vec<String>) -> EndpointGroup {
        EndpointGroup {
            name: name.to_string(),
            hosts,
            timeout: Duration::from_millis(500),
            concurrency: 2,
        }
    }

    #[tokio::test]
    async fn test_start_creates_data_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("audit");
        let config = QueueConfig::new("audit", &dir, 1024);

        let pipeline = Pipeline::start(
            group("audit", vec!["http://127.0.0.1:1".to_string()]),
            config,
            false,
        )
        .unwrap();

        assert!(dir.is_dir());
        assert_eq!(pipeline.name(), "audit");
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_persists_unsent_records() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("mirror");

        // No listener on the host: every dispatch fails and re-enqueues.
        let pipeline = Pipeline::start(
            group("mirror", vec!["http://127.0.0.1:1".to_string()]),
            QueueConfig::new("mirror", &dir, 1024),
            false,
        )
        .unwrap();

        let inbox = pipeline.inbox();
        for i in 0..10u32 {
            inbox
                .enqueue(Record::new("POST", "/x", Bytes::from(format!("b{i}"))))
                .await
                .unwrap();
        }
        drop(inbox);
        pipeline.shutdown().await;

        // Everything must still be queued on disk for the next run.
        let mut queue = DurableQueue::open(QueueConfig::new("mirror", &dir, 1024)).unwrap();
        let mut recovered = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_millis(200), queue.reader.next()).await {
                Ok(Some(record)) => recovered.push(record),
                _ => break,
            }
        }
        assert_eq!(recovered.len(), 10, "no record may be dropped by shutdown");
    }
}
