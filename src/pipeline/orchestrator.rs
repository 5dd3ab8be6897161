//! Drives batches through inference, reassembly, scoring and hooks.
//!
//! The main path is synchronous: one batch at a time, entities handled in the
//! order they complete. Only persistence runs in the background, and the run
//! joins it exactly once while draining.

use crate::assembly::{ChunkPrediction, EntityAssembler};
use crate::data::{EntityId, TestDataset};
use crate::error::{ConfigurationError, PersistenceError, RunError};
use crate::hooks::{HookChain, Reduced};
use crate::io::{AsyncWriteBack, WriteBackReport};
use crate::pipeline::context::{BatchContext, EntityContext, TaskContext};
use crate::pipeline::metrics::{MetricsSnapshot, RunMetrics};
use crate::pipeline::steps::{BatchStep, EntityStep};
use ndarray::Axis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Lifecycle of a single run. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Draining,
    Done,
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Draining => "draining",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What happens to pending writes when a run is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPolicy {
    /// Let scheduled writes finish
    #[default]
    Flush,
    /// Abort scheduled writes
    Abort,
}

/// Cooperative cancellation flag, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Run-level policy knobs.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Background write failures tolerated before the run fails
    pub write_failure_tolerance: usize,
    pub cancel_policy: CancelPolicy,
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Entities in completion order
    pub entities: Vec<EntityId>,
    pub batches: usize,
    pub chunks: usize,
    /// Hook-produced values per entity
    pub entity_stats: BTreeMap<EntityId, Reduced>,
    pub write_report: WriteBackReport,
    pub metrics: MetricsSnapshot,
}

/// Counters accumulated while batches are processed.
#[derive(Debug, Default)]
struct Progress {
    entities: Vec<EntityId>,
    batches: usize,
    chunks: usize,
    entity_stats: BTreeMap<EntityId, Reduced>,
}

/// Orchestrates one evaluation run. Not reusable: a second `run` is rejected.
pub struct TestOrchestrator {
    batch_steps: Vec<Box<dyn BatchStep>>,
    entity_steps: Vec<Box<dyn EntityStep>>,
    hooks: HookChain,
    write_back: Arc<AsyncWriteBack>,
    metrics: Arc<RunMetrics>,
    options: RunOptions,
    cancel: CancelToken,
    state: RunState,
}

impl TestOrchestrator {
    pub fn new(
        batch_steps: Vec<Box<dyn BatchStep>>,
        entity_steps: Vec<Box<dyn EntityStep>>,
        hooks: HookChain,
        write_back: Arc<AsyncWriteBack>,
        metrics: Arc<RunMetrics>,
        options: RunOptions,
    ) -> Self {
        Self {
            batch_steps,
            entity_steps,
            hooks,
            write_back,
            metrics,
            options,
            cancel: CancelToken::new(),
            state: RunState::Idle,
        }
    }

    /// Share an existing cancellation token with this run.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels this run from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Process every batch of `dataset`, then drain: run-end hooks, assembler
    /// completeness check, and a single join of the background writes.
    ///
    /// Must be called from outside the write-back runtime.
    pub fn run(&mut self, dataset: &mut dyn TestDataset, task: &mut TaskContext) -> Result<RunSummary, RunError> {
        if self.state != RunState::Idle {
            return Err(ConfigurationError::NotReusable(self.state.to_string()).into());
        }
        self.state = RunState::Running;
        tracing::info!(
            "Starting evaluation: {} batch step(s), {} entity step(s), {} hook(s)",
            self.batch_steps.len(),
            self.entity_steps.len(),
            self.hooks.len()
        );

        let mut assembler = EntityAssembler::new(dataset.layout());
        let mut progress = Progress::default();

        if let Err(e) = self.process_batches(dataset, task, &mut assembler, &mut progress) {
            return Err(self.fail(e));
        }

        self.state = RunState::Draining;
        tracing::info!(
            "All {} batches processed ({} entities), draining",
            progress.batches,
            progress.entities.len()
        );

        if let Err(source) = self.hooks.run_end(task) {
            return Err(self.fail(RunError::Hook {
                scope: "run end".to_string(),
                source,
            }));
        }
        if let Err(source) = assembler.finish() {
            return Err(self.fail(RunError::Assembler {
                batch: progress.batches,
                source,
            }));
        }

        let report = self.write_back.join_all();
        for _ in &report.failures {
            self.metrics.add_write_failure();
        }

        if report.failures.len() > self.options.write_failure_tolerance {
            self.state = RunState::Failed;
            let err = PersistenceError {
                failures: report.failures,
                tolerance: self.options.write_failure_tolerance,
            };
            tracing::error!("Run failed: {}", err);
            return Err(err.into());
        }
        for failure in &report.failures {
            tracing::warn!("Tolerated write failure: {}", failure);
        }

        self.state = RunState::Done;
        let metrics = self.metrics.snapshot();
        tracing::info!("Evaluation complete: {}", metrics);

        Ok(RunSummary {
            entities: progress.entities,
            batches: progress.batches,
            chunks: progress.chunks,
            entity_stats: progress.entity_stats,
            write_report: report,
            metrics,
        })
    }

    /// Settle background writes once, then mark the run failed.
    fn fail(&mut self, err: RunError) -> RunError {
        let report = match (&err, self.options.cancel_policy) {
            (RunError::Cancelled { .. }, CancelPolicy::Abort) => self.write_back.abort_all(),
            _ => self.write_back.join_all(),
        };
        for _ in &report.failures {
            self.metrics.add_write_failure();
        }

        self.state = RunState::Failed;
        tracing::error!("Run failed: {} (pending writes: {})", err, report);
        err
    }

    fn process_batches(
        &mut self,
        dataset: &mut dyn TestDataset,
        task: &mut TaskContext,
        assembler: &mut EntityAssembler,
        progress: &mut Progress,
    ) -> Result<(), RunError> {
        dataset.restart().map_err(|source| RunError::ExhaustedSource { batches: 0, source })?;

        loop {
            if self.cancel.is_cancelled() {
                tracing::warn!("Cancellation requested after {} batches", progress.batches);
                return Err(RunError::Cancelled {
                    batches: progress.batches,
                });
            }

            let batch = match dataset.next_batch() {
                Ok(Some(batch)) => batch,
                Ok(None) => return Ok(()),
                Err(source) => {
                    return Err(RunError::ExhaustedSource {
                        batches: progress.batches,
                        source,
                    })
                }
            };

            progress.batches += 1;
            progress.chunks += batch.len();
            self.process_batch(BatchContext::new(batch), task, assembler, progress)?;
        }
    }

    fn process_batch(
        &mut self,
        mut ctx: BatchContext,
        task: &mut TaskContext,
        assembler: &mut EntityAssembler,
        progress: &mut Progress,
    ) -> Result<(), RunError> {
        let batch_index = ctx.batch.index;
        task.batch_index = Some(batch_index);
        self.metrics.add_batch();
        tracing::debug!("Batch {}: {} chunk(s)", batch_index, ctx.batch.len());

        let start = Instant::now();
        for step in &mut self.batch_steps {
            step.run(&mut ctx, task).map_err(|source| RunError::BatchStep {
                step: step.name().to_string(),
                batch: batch_index,
                source,
            })?;
        }
        self.metrics.add_inference_time(start.elapsed());

        let chunks = split_batch(&ctx)?;

        let start = Instant::now();
        self.hooks.batch_end(&ctx, task).map_err(|source| RunError::Hook {
            scope: format!("batch {}", batch_index),
            source,
        })?;
        self.metrics.add_hooks_time(start.elapsed());

        self.metrics.add_chunks(chunks.len() as u64);
        for chunk in chunks {
            let completed = assembler.submit(chunk).map_err(|source| RunError::Assembler {
                batch: batch_index,
                source,
            })?;

            if let Some(entity) = completed {
                self.process_entity(EntityContext::new(entity), task, progress)?;
            }
        }
        Ok(())
    }

    fn process_entity(
        &mut self,
        mut ctx: EntityContext,
        task: &mut TaskContext,
        progress: &mut Progress,
    ) -> Result<(), RunError> {
        task.entity_index += 1;
        let id = ctx.id().clone();
        tracing::debug!("Entity {} complete ({} chunks)", id, ctx.entity.placements.len());

        let start = Instant::now();
        for step in &mut self.entity_steps {
            step.run(&mut ctx, task).map_err(|source| RunError::EntityStep {
                step: step.name().to_string(),
                entity: id.clone(),
                source,
            })?;
        }
        self.metrics.add_evaluation_time(start.elapsed());

        let start = Instant::now();
        let reduced = self
            .hooks
            .entity_end(&ctx, task, &Reduced::new())
            .map_err(|source| RunError::Hook {
                scope: format!("entity {}", id),
                source,
            })?;
        self.metrics.add_hooks_time(start.elapsed());
        self.metrics.add_entity();

        progress.entity_stats.insert(id.clone(), reduced);
        progress.entities.push(id);
        Ok(())
    }
}

/// Split channel-last batch probabilities into per-chunk predictions.
fn split_batch(ctx: &BatchContext) -> Result<Vec<ChunkPrediction>, RunError> {
    let batch_index = ctx.batch.index;
    let probabilities = ctx.probabilities.as_ref().ok_or_else(|| RunError::BatchOutput {
        batch: batch_index,
        reason: "batch steps produced no probabilities".to_string(),
    })?;

    if probabilities.ndim() < 2 || probabilities.len_of(Axis(0)) != ctx.batch.len() {
        return Err(RunError::BatchOutput {
            batch: batch_index,
            reason: format!(
                "probabilities {:?} do not match {} chunk(s)",
                probabilities.shape(),
                ctx.batch.len()
            ),
        });
    }

    let mut chunks = Vec::with_capacity(ctx.batch.len());
    for (i, meta) in ctx.batch.chunks.iter().enumerate() {
        let chunk_probs = probabilities.index_axis(Axis(0), i);
        let labels = ctx.batch.labels.index_axis(Axis(0), i);

        let spatial = &chunk_probs.shape()[..chunk_probs.ndim() - 1];
        if spatial != labels.shape() {
            return Err(RunError::BatchOutput {
                batch: batch_index,
                reason: format!(
                    "chunk {} probabilities {:?} do not match labels {:?}",
                    i,
                    chunk_probs.shape(),
                    labels.shape()
                ),
            });
        }

        chunks.push(ChunkPrediction {
            entity: meta.entity.clone(),
            placement: meta.placement,
            probabilities: chunk_probs.to_owned(),
            labels: labels.to_owned(),
        });
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Batch, ChunkMeta};
    use ndarray::{ArrayD, IxDyn};

    fn ctx_with(probabilities: Option<ArrayD<f32>>) -> BatchContext {
        let batch = Batch::new(
            4,
            ArrayD::zeros(IxDyn(&[2, 1, 2, 2])),
            ArrayD::zeros(IxDyn(&[2, 2, 2])),
            vec![ChunkMeta::new("A", 0), ChunkMeta::new("B", 0)],
        )
        .unwrap();
        let mut ctx = BatchContext::new(batch);
        ctx.probabilities = probabilities;
        ctx
    }

    #[test]
    fn test_split_batch() {
        let ctx = ctx_with(Some(ArrayD::zeros(IxDyn(&[2, 2, 2, 3]))));
        let chunks = split_batch(&ctx).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].entity, EntityId::from("B"));
        assert_eq!(chunks[0].probabilities.shape(), &[2, 2, 3]);
        assert_eq!(chunks[0].labels.shape(), &[2, 2]);
    }

    #[test]
    fn test_split_batch_rejects_bad_output() {
        assert!(matches!(
            split_batch(&ctx_with(None)),
            Err(RunError::BatchOutput { batch: 4, .. })
        ));
        // Class axis still in position 1
        assert!(matches!(
            split_batch(&ctx_with(Some(ArrayD::zeros(IxDyn(&[2, 3, 2, 2]))))),
            Err(RunError::BatchOutput { .. })
        ));
        assert!(matches!(
            split_batch(&ctx_with(Some(ArrayD::zeros(IxDyn(&[1, 2, 2, 3]))))),
            Err(RunError::BatchOutput { .. })
        ));
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_policy_serde() {
        let policy: CancelPolicy = serde_yaml::from_str("abort").unwrap();
        assert_eq!(policy, CancelPolicy::Abort);
        assert_eq!(CancelPolicy::default(), CancelPolicy::Flush);
    }
}
