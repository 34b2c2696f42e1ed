//! Worker pool - upstream HTTP dispatch for one endpoint group
//!
//! Workers pull records off the shared worker channel and replay them
//! against the group's hosts, round-robin per worker. Delivery is judged
//! at the transport level only: any response, 5xx included, counts as
//! delivered - this is a mirror, not a client. Transport errors (timeout,
//! refused connection, DNS, TLS) put the record back into the pipeline
//! inbox, behind whatever is already queued; the queue's FIFO discipline
//! is the only retry spacing.

use crate::error::Result;
use crate::metrics::Metrics;
use crate::queue::QueueWriter;
use crate::record::Record;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

/// Everything one worker needs to dispatch.
pub struct WorkerContext {
    /// Endpoint group name, for logs and metric labels
    pub name: String,
    /// Upstream base URLs, validated at startup
    pub hosts: Arc<Vec<String>>,
    /// Shared client carrying the group timeout and TLS policy
    pub client: Client,
    /// Re-enqueue path back into the pipeline inbox
    pub retry: QueueWriter,
}

/// Build the upstream client for an endpoint group.
///
/// The timeout is the total deadline for a dispatch. Certificate
/// verification stays on unless the operator opted into the permissive
/// mode for self-signed upstreams.
pub fn build_client(timeout: Duration, danger_accept_invalid_certs: bool) -> Result<Client> {
    let client = Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(danger_accept_invalid_certs)
        .build()?;
    Ok(client)
}

/// Worker loop: pull, dispatch, repeat until the channel closes.
///
/// The receiver is shared across the pool; holding the lock only spans
/// the pull itself, so one slow upstream call never blocks the others.
pub async fn run_worker(ctx: WorkerContext, rx: Arc<Mutex<mpsc::Receiver<Record>>>) {
    let mut cursor = 0usize;
    loop {
        let record = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(record) = record else { break };
        dispatch(&ctx, &mut cursor, record).await;
    }
    debug!(endpoint = %ctx.name, "worker stopped");
}

async fn dispatch(ctx: &WorkerContext, cursor: &mut usize, record: Record) {
    let host = pick_host(&ctx.hosts, cursor);
    let target = target_url(host, &record.url);

    let method = match reqwest::Method::from_bytes(record.method.as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            // Only a replayed frame can carry a method ingress never saw;
            // it still stays inside the retry loop.
            if let Some(m) = Metrics::get() {
                m.record_dispatch(&ctx.name, 0.0, false);
            }
            warn!(endpoint = %ctx.name, method = %record.method, "unusable method, re-enqueueing");
            if let Err(e) = ctx.retry.enqueue(record).await {
                warn!(endpoint = %ctx.name, error = %e, "queue gone, record abandoned");
            }
            return;
        }
    };

    let start = Instant::now();
    let result = ctx
        .client
        .request(method, &target)
        .body(record.body.clone())
        .send()
        .await;
    let elapsed_us = start.elapsed().as_micros() as f64;

    match result {
        Ok(response) => {
            if let Some(m) = Metrics::get() {
                m.record_dispatch(&ctx.name, elapsed_us, true);
            }
            let status = response.status();
            // Drain and discard; only arrival matters.
            let _ = response.bytes().await;
            debug!(endpoint = %ctx.name, %status, url = %target, "delivered");
        }
        Err(e) => {
            if let Some(m) = Metrics::get() {
                m.record_dispatch(&ctx.name, elapsed_us, false);
            }
            debug!(endpoint = %ctx.name, error = %e, url = %target, "dispatch failed, re-enqueueing");
            if let Err(e) = ctx.retry.enqueue(record).await {
                warn!(endpoint = %ctx.name, error = %e, "queue gone, record abandoned");
            }
        }
    }
}

/// Round-robin over the group's hosts, counter private to each worker.
fn pick_host<'a>(hosts: &'a [String], cursor: &mut usize) -> &'a str {
    let host = &hosts[*cursor % hosts.len()];
    *cursor = cursor.wrapping_add(1);
    host
}

fn target_url(host: &str, path: &str) -> String {
    format!("{}{}", host.trim_end_matches('/'), path)
}
