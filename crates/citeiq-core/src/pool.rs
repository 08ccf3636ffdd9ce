//! Bounded worker pool for reference enrichment.
//!
//! `num_workers` coordinator tasks pull [`EnrichJob`]s from a shared
//! channel. Each coordinator enriches one reference at a time (fanning out
//! to every provider concurrently) and hands the finished
//! [`ProviderResults`] back through the job's oneshot. Provider traffic
//! across all coordinators is bounded by the context's request semaphore.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ProgressEvent;
use crate::model::{RawReference, RefId};
use crate::orchestrator::{EnrichmentContext, ProgressFn, enrich_reference};
use crate::provider::{AbsentReason, ProviderResults};

/// A reference enrichment job submitted to the pool.
pub struct EnrichJob {
    pub reference: Arc<RawReference>,
    pub result_tx: oneshot::Sender<ProviderResults>,
    /// Batch size, for progress reporting.
    pub total: usize,
    pub progress: ProgressFn,
}

/// A pool of coordinator tasks that process enrichment jobs.
///
/// Submit jobs via [`submit()`](EnrichmentPool::submit), receive results via
/// the oneshot receiver paired with each job.
pub struct EnrichmentPool {
    job_tx: async_channel::Sender<EnrichJob>,
    pool_handle: JoinHandle<()>,
}

impl EnrichmentPool {
    /// Create a new pool with `num_workers` coordinator tasks.
    pub fn new(ctx: Arc<EnrichmentContext>, cancel: CancellationToken, num_workers: usize) -> Self {
        let (job_tx, job_rx) = async_channel::unbounded::<EnrichJob>();

        let pool_handle = tokio::spawn(async move {
            let mut handles = Vec::with_capacity(num_workers.max(1));
            for _ in 0..num_workers.max(1) {
                handles.push(tokio::spawn(coordinator_loop(
                    job_rx.clone(),
                    ctx.clone(),
                    cancel.clone(),
                )));
            }

            // Coordinators hold the only remaining receivers
            drop(job_rx);

            for h in handles {
                let _ = h.await;
            }
        });

        Self {
            job_tx,
            pool_handle,
        }
    }

    /// Get a cloneable sender for submitting jobs from multiple tasks.
    pub fn sender(&self) -> async_channel::Sender<EnrichJob> {
        self.job_tx.clone()
    }

    /// Submit a job to the pool.
    pub async fn submit(&self, job: EnrichJob) {
        let _ = self.job_tx.send(job).await;
    }

    /// Close the pool and wait for all coordinators to finish.
    pub async fn shutdown(self) {
        self.job_tx.close();
        let _ = self.pool_handle.await;
    }
}

async fn coordinator_loop(
    job_rx: async_channel::Receiver<EnrichJob>,
    ctx: Arc<EnrichmentContext>,
    cancel: CancellationToken,
) {
    while let Ok(job) = job_rx.recv().await {
        let EnrichJob {
            reference,
            result_tx,
            total,
            progress,
        } = job;
        let ref_index = reference.input_index;

        // Cancelled jobs still get an answer so no caller waits forever
        let results = if cancel.is_cancelled() {
            tracing::debug!(ref_index, "skipping: cancelled");
            cancelled()
        } else {
            progress(ProgressEvent::Enriching {
                ref_index,
                total,
                title: reference.title.clone().unwrap_or_default(),
            });
            tokio::select! {
                results = enrich_reference(ctx.clone(), reference, progress.clone()) => results,
                _ = cancel.cancelled() => cancelled(),
            }
        };

        progress(ProgressEvent::Enriched {
            ref_index,
            total,
        });
        let _ = result_tx.send(results);
    }
}

fn cancelled() -> ProviderResults {
    ProviderResults::all_absent(AbsentReason::Skipped("cancelled".into()))
}

/// Enrich a whole batch through a fresh pool.
///
/// Results are keyed by reference id, independent of completion order.
/// Every reference gets an entry even if its job was cancelled or lost.
pub async fn enrich_all(
    refs: &[RawReference],
    ctx: Arc<EnrichmentContext>,
    num_workers: usize,
    progress: ProgressFn,
    cancel: CancellationToken,
) -> BTreeMap<RefId, ProviderResults> {
    let pool = EnrichmentPool::new(ctx, cancel, num_workers);
    let total = refs.len();

    let mut receivers = Vec::with_capacity(total);
    for reference in refs {
        let (tx, rx) = oneshot::channel();
        pool.submit(EnrichJob {
            reference: Arc::new(reference.clone()),
            result_tx: tx,
            total,
            progress: progress.clone(),
        })
        .await;
        receivers.push((reference.id(), rx));
    }

    let mut collected = BTreeMap::new();
    for (id, rx) in receivers {
        let results = rx.await.unwrap_or_else(|_| {
            tracing::warn!(ref_id = id, "enrichment job dropped without a result");
            ProviderResults::all_absent(AbsentReason::Error("worker exited".into()))
        });
        collected.insert(id, results);
    }

    pool.shutdown().await;
    collected
}
