//! Batch scheduler: packs per-frame work into batches, spreads them over the
//! accelerator pool and reassembles results in sequence order.

mod executor;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use candle_core::Tensor;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::accelerator::{AcceleratorPool, LoadTicket};
use crate::cache::FeatureBundle;
use crate::config::{batch_size_for_free_memory, MemoryTier, ServeConfig};
use crate::error::Result;

use executor::{execute_batch, BatchOutcome};

/// One output frame to render.
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Position in the job's output sequence
    pub index: usize,
    /// Per-frame conditioning feature from the audio extractor
    pub conditioning: Tensor,
    /// Bundle cycle position the frame is composited against
    pub cycle_index: usize,
}

impl WorkItem {
    /// Number the features `0..n` and map frame `start_frame + i` onto the
    /// bundle's cycle.
    pub fn sequence(features: Vec<Tensor>, bundle: &FeatureBundle, start_frame: usize) -> Vec<Self> {
        features
            .into_iter()
            .enumerate()
            .map(|(index, conditioning)| Self {
                index,
                conditioning,
                cycle_index: bundle.cycle_index(start_frame + index),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub enum FrameOutcome {
    Rendered(Tensor),
    /// Rendering failed; the reason is reported per item
    Failed(String),
    /// The job was cancelled before the batch reached an accelerator
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct FrameResult {
    pub index: usize,
    pub cycle_index: usize,
    pub accelerator: Option<usize>,
    pub outcome: FrameOutcome,
}

impl FrameResult {
    fn new(item: &WorkItem, accelerator: Option<usize>, outcome: FrameOutcome) -> Self {
        Self {
            index: item.index,
            cycle_index: item.cycle_index,
            accelerator,
            outcome,
        }
    }

    pub fn region(&self) -> Option<&Tensor> {
        match &self.outcome {
            FrameOutcome::Rendered(region) => Some(region),
            _ => None,
        }
    }

    pub fn is_rendered(&self) -> bool {
        matches!(self.outcome, FrameOutcome::Rendered(_))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub batches_per_accelerator: BTreeMap<usize, usize>,
    pub batch_size: usize,
    pub oom_retries: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct JobOutput {
    /// One entry per work item, sorted by `index`
    pub results: Vec<FrameResult>,
    pub report: JobReport,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub batch_size: Option<usize>,
    pub max_batch_size: usize,
    pub memory_tiers: Vec<MemoryTier>,
    pub oom_retry_limit: usize,
    pub inflight_per_accelerator: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&ServeConfig::default())
    }
}

impl From<&ServeConfig> for SchedulerConfig {
    fn from(config: &ServeConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            max_batch_size: config.max_batch_size,
            memory_tiers: config.memory_tiers.clone(),
            oom_retry_limit: config.oom_retry_limit,
            inflight_per_accelerator: config.inflight_per_accelerator,
        }
    }
}

/// Process-wide counters.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    jobs: AtomicU64,
    frames_rendered: AtomicU64,
    frames_failed: AtomicU64,
    frames_cancelled: AtomicU64,
    oom_retries: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub jobs: u64,
    pub frames_rendered: u64,
    pub frames_failed: u64,
    pub frames_cancelled: u64,
    pub oom_retries: u64,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            jobs: self.jobs.load(Ordering::Relaxed),
            frames_rendered: self.frames_rendered.load(Ordering::Relaxed),
            frames_failed: self.frames_failed.load(Ordering::Relaxed),
            frames_cancelled: self.frames_cancelled.load(Ordering::Relaxed),
            oom_retries: self.oom_retries.load(Ordering::Relaxed),
        }
    }
}

pub struct BatchScheduler {
    pool: Arc<AcceleratorPool>,
    config: SchedulerConfig,
    stats: SchedulerStats,
}

impl BatchScheduler {
    pub fn new(pool: Arc<AcceleratorPool>, config: SchedulerConfig) -> Self {
        Self {
            pool,
            config,
            stats: SchedulerStats::default(),
        }
    }

    pub fn pool(&self) -> &Arc<AcceleratorPool> {
        &self.pool
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Explicit target, then the configured override, then the memory tier
    /// for the smallest free memory in the pool.
    pub fn batch_size(&self, target: Option<usize>) -> usize {
        target
            .or(self.config.batch_size)
            .unwrap_or_else(|| {
                batch_size_for_free_memory(
                    &self.config.memory_tiers,
                    self.config.max_batch_size,
                    self.pool.min_free_memory(),
                )
            })
            .max(1)
    }

    /// Render every item and return one result per item, sorted by index.
    ///
    /// Per-item failures (exhausted OOM retries, backend errors, acquire
    /// timeouts) are reported in the results rather than failing the job.
    pub async fn run(
        &self,
        items: Vec<WorkItem>,
        bundle: Arc<FeatureBundle>,
        target_batch_size: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<JobOutput> {
        let started = Instant::now();
        self.stats.jobs.fetch_add(1, Ordering::Relaxed);

        let total = items.len();
        let batch_size = self.batch_size(target_batch_size).min(total.max(1));
        let mut report = JobReport {
            batch_size,
            ..Default::default()
        };
        if items.is_empty() {
            return Ok(JobOutput {
                results: Vec::new(),
                report,
            });
        }

        let expected: Vec<(usize, usize)> = items.iter().map(|i| (i.index, i.cycle_index)).collect();
        let inflight = Arc::new(Semaphore::new(
            self.pool.len().max(1) * self.config.inflight_per_accelerator.max(1),
        ));

        let mut tasks = JoinSet::new();
        let mut items = items.into_iter().peekable();
        let mut batch_id = 0usize;
        while items.peek().is_some() {
            let chunk: Vec<WorkItem> = items.by_ref().take(batch_size).collect();
            let ticket = self.pool.assign_least_loaded();
            *report
                .batches_per_accelerator
                .entry(ticket.accelerator())
                .or_insert(0) += 1;
            debug!(
                "Batch {} ({} item(s)) assigned to accelerator {}",
                batch_id,
                chunk.len(),
                ticket.accelerator()
            );

            tasks.spawn(run_batch(BatchTask {
                pool: self.pool.clone(),
                bundle: bundle.clone(),
                inflight: inflight.clone(),
                cancel: cancel.clone(),
                retry_limit: self.config.oom_retry_limit,
                items: chunk,
                ticket,
            }));
            batch_id += 1;
        }

        let mut results = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    report.oom_retries += outcome.oom_retries;
                    results.extend(outcome.results);
                }
                Err(e) => error!("Batch task failed: {}", e),
            }
        }

        // A panicked batch task loses its items; report them as failed.
        if results.len() < total {
            let seen: HashSet<usize> = results.iter().map(|r| r.index).collect();
            for (index, cycle_index) in expected {
                if !seen.contains(&index) {
                    results.push(FrameResult {
                        index,
                        cycle_index,
                        accelerator: None,
                        outcome: FrameOutcome::Failed("batch task failed".to_string()),
                    });
                }
            }
        }
        results.sort_by_key(|r| r.index);

        let mut rendered = 0;
        for result in &results {
            match result.outcome {
                FrameOutcome::Rendered(_) => rendered += 1,
                FrameOutcome::Failed(_) => report.failed += 1,
                FrameOutcome::Cancelled => report.cancelled += 1,
            }
        }
        report.elapsed = started.elapsed();

        self.stats.frames_rendered.fetch_add(rendered, Ordering::Relaxed);
        self.stats.frames_failed.fetch_add(report.failed as u64, Ordering::Relaxed);
        self.stats
            .frames_cancelled
            .fetch_add(report.cancelled as u64, Ordering::Relaxed);
        self.stats
            .oom_retries
            .fetch_add(report.oom_retries as u64, Ordering::Relaxed);

        info!(
            "Rendered {}/{} frame(s) in {:.2}s (batch size {}, {} failed, {} cancelled, {} OOM retries)",
            rendered,
            total,
            report.elapsed.as_secs_f32(),
            batch_size,
            report.failed,
            report.cancelled,
            report.oom_retries
        );

        Ok(JobOutput { results, report })
    }
}

struct BatchTask {
    pool: Arc<AcceleratorPool>,
    bundle: Arc<FeatureBundle>,
    inflight: Arc<Semaphore>,
    cancel: CancellationToken,
    retry_limit: usize,
    items: Vec<WorkItem>,
    ticket: LoadTicket,
}

/// Wait for an in-flight slot and the assigned accelerator, then execute.
/// Cancellation only takes effect before the accelerator is acquired.
async fn run_batch(task: BatchTask) -> BatchOutcome {
    let BatchTask {
        pool,
        bundle,
        inflight,
        cancel,
        retry_limit,
        items,
        ticket,
    } = task;
    let accelerator = ticket.accelerator();

    let _slot = tokio::select! {
        biased;
        _ = cancel.cancelled() => return cancelled(&items),
        slot = inflight.acquire_owned() => slot.ok(),
    };

    let guard = tokio::select! {
        biased;
        _ = cancel.cancelled() => return cancelled(&items),
        guard = pool.acquire(accelerator) => guard,
    };
    let guard = match guard {
        Ok(guard) => guard,
        Err(e) => {
            error!("Batch could not start on accelerator {}: {}", accelerator, e);
            let reason = e.to_string();
            return BatchOutcome {
                results: items
                    .iter()
                    .map(|item| FrameResult::new(item, Some(accelerator), FrameOutcome::Failed(reason.clone())))
                    .collect(),
                oom_retries: 0,
            };
        }
    };

    let keys: Vec<(usize, usize)> = items.iter().map(|i| (i.index, i.cycle_index)).collect();
    let outcome =
        tokio::task::spawn_blocking(move || execute_batch(guard, &bundle, items, retry_limit)).await;
    drop(ticket);

    outcome.unwrap_or_else(|e| {
        error!("Batch worker on accelerator {} failed: {}", accelerator, e);
        BatchOutcome {
            results: keys
                .into_iter()
                .map(|(index, cycle_index)| FrameResult {
                    index,
                    cycle_index,
                    accelerator: Some(accelerator),
                    outcome: FrameOutcome::Failed("batch worker failed".to_string()),
                })
                .collect(),
            oom_retries: 0,
        }
    })
}

fn cancelled(items: &[WorkItem]) -> BatchOutcome {
    BatchOutcome {
        results: items
            .iter()
            .map(|item| FrameResult::new(item, None, FrameOutcome::Cancelled))
            .collect(),
        oom_retries: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PreprocessParams;
    use crate::testing::{first_value, prepared_template, OomMode, StubBehavior, StubLoader, FEATURE_DIM};
    use candle_core::Device;
    use std::path::PathBuf;

    async fn scheduler(accelerators: usize, behavior: StubBehavior) -> (BatchScheduler, Arc<StubLoader>) {
        let loader = Arc::new(StubLoader::new(behavior));
        let ids: Vec<usize> = (0..accelerators).collect();
        let (pool, _) = AcceleratorPool::initialize(&ids, loader.clone(), Duration::from_secs(5))
            .await
            .unwrap();
        let config = SchedulerConfig {
            oom_retry_limit: 3,
            ..Default::default()
        };
        (BatchScheduler::new(Arc::new(pool), config), loader)
    }

    fn bundle() -> Arc<FeatureBundle> {
        Arc::new(
            FeatureBundle::from_prepared(
                "alice",
                PathBuf::from("alice.jpg"),
                PreprocessParams::default(),
                prepared_template(3),
            )
            .unwrap(),
        )
    }

    fn items(count: usize, bundle: &FeatureBundle) -> Vec<WorkItem> {
        let features = (0..count)
            .map(|i| Tensor::full(i as f32, FEATURE_DIM, &Device::Cpu).unwrap())
            .collect();
        WorkItem::sequence(features, bundle, 0)
    }

    #[tokio::test]
    async fn test_results_follow_sequence_order() {
        let behavior = StubBehavior {
            jitter: true,
            ..Default::default()
        };
        let (scheduler, _) = scheduler(3, behavior).await;
        let bundle = bundle();
        let mut work = items(40, &bundle);
        work.reverse();

        let output = scheduler
            .run(work, bundle, Some(3), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.results.len(), 40);
        for (position, result) in output.results.iter().enumerate() {
            assert_eq!(result.index, position);
            assert_eq!(result.cycle_index, position % 6);
            assert_eq!(first_value(result.region().unwrap()), position as f32);
        }
    }

    #[tokio::test]
    async fn test_batches_are_balanced_across_accelerators() {
        for (accelerators, count, batch) in [(2, 50, 4), (3, 17, 2), (4, 50, 4)] {
            let (scheduler, _) = scheduler(accelerators, StubBehavior::default()).await;
            let bundle = bundle();
            let output = scheduler
                .run(items(count, &bundle), bundle, Some(batch), &CancellationToken::new())
                .await
                .unwrap();

            let counts: Vec<usize> = output.report.batches_per_accelerator.values().copied().collect();
            assert_eq!(counts.len(), accelerators);
            let spread = counts.iter().max().unwrap() - counts.iter().min().unwrap();
            assert!(spread <= 1, "counts {counts:?}");
            assert_eq!(scheduler.pool().total_load(), 0);
        }
    }

    #[tokio::test]
    async fn test_accelerator_never_runs_two_batches_at_once() {
        let behavior = StubBehavior {
            delay: Duration::from_millis(5),
            ..Default::default()
        };
        let (scheduler, loader) = scheduler(2, behavior).await;
        let bundle = bundle();
        scheduler
            .run(items(24, &bundle), bundle, Some(2), &CancellationToken::new())
            .await
            .unwrap();

        for id in 0..2 {
            let backend = loader.backend(id).unwrap();
            assert!(backend.calls() > 0);
            assert_eq!(backend.max_active(), 1);
        }
    }

    #[tokio::test]
    async fn test_persistent_oom_fails_items_within_retry_budget() {
        let behavior = StubBehavior {
            oom: OomMode::Always,
            ..Default::default()
        };
        let (scheduler, loader) = scheduler(1, behavior).await;
        let bundle = bundle();

        let output = tokio::time::timeout(
            Duration::from_secs(10),
            scheduler.run(items(8, &bundle), bundle, Some(8), &CancellationToken::new()),
        )
        .await
        .expect("scheduler hung on OOM")
        .unwrap();

        assert_eq!(output.results.len(), 8);
        assert!(output
            .results
            .iter()
            .all(|r| matches!(r.outcome, FrameOutcome::Failed(_))));
        assert_eq!(output.report.failed, 8);
        assert_eq!(output.report.oom_retries, 3);
        let backend = loader.backend(0).unwrap();
        assert_eq!(backend.calls(), 4);
        assert_eq!(backend.clears(), 3);
        assert_eq!(backend.batch_sizes(), vec![8, 4, 2, 1]);
    }

    #[tokio::test]
    async fn test_oom_backoff_recovers_with_smaller_slices() {
        let behavior = StubBehavior {
            oom: OomMode::AboveBatch(2),
            ..Default::default()
        };
        let (scheduler, loader) = scheduler(1, behavior).await;
        let bundle = bundle();

        let output = scheduler
            .run(items(8, &bundle), bundle, Some(8), &CancellationToken::new())
            .await
            .unwrap();

        assert!(output.results.iter().all(FrameResult::is_rendered));
        assert_eq!(output.report.oom_retries, 2);
        assert_eq!(loader.backend(0).unwrap().batch_sizes(), vec![8, 4, 2, 2, 2, 2]);
    }

    #[tokio::test]
    async fn test_backend_failure_is_reported_per_item() {
        let behavior = StubBehavior {
            fail: true,
            ..Default::default()
        };
        let (scheduler, _) = scheduler(2, behavior).await;
        let bundle = bundle();

        let output = scheduler
            .run(items(6, &bundle), bundle, Some(2), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.report.failed, 6);
        assert_eq!(scheduler.stats().frames_failed, 6);
        assert_eq!(scheduler.pool().total_load(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_job_dispatches_nothing() {
        let (scheduler, loader) = scheduler(2, StubBehavior::default()).await;
        let bundle = bundle();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let output = scheduler
            .run(items(10, &bundle), bundle, Some(2), &cancel)
            .await
            .unwrap();
        assert_eq!(output.report.cancelled, 10);
        assert_eq!(loader.backend(0).unwrap().calls(), 0);
        assert_eq!(loader.backend(1).unwrap().calls(), 0);
        assert_eq!(scheduler.pool().total_load(), 0);
    }

    #[tokio::test]
    async fn test_batch_size_derives_from_free_memory() {
        let (scheduler, _) = scheduler(2, StubBehavior::default()).await;
        // The stub reports 8 GiB free.
        assert_eq!(scheduler.batch_size(None), 8);
        assert_eq!(scheduler.batch_size(Some(3)), 3);

        let bundle = bundle();
        let output = scheduler
            .run(items(5, &bundle), bundle, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.report.batch_size, 5);
    }

    #[tokio::test]
    async fn test_empty_job() {
        let (scheduler, _) = scheduler(1, StubBehavior::default()).await;
        let output = scheduler
            .run(Vec::new(), bundle(), None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(output.results.is_empty());
    }
}
