use crate::data::SourceResolver;
use crate::hooks::stats::foreground_class;
use crate::hooks::{Reduced, TestLoopHook};
use crate::io::{ArtifactWriter, AsyncWriteBack, PendingWrite};
use crate::pipeline::{EntityContext, RunMetrics, TaskContext};
use anyhow::{Context, Result};
use ndarray::Axis;
use std::sync::Arc;
use std::time::Instant;

/// Hands each completed entity's artifacts to the background writer.
///
/// Returns as soon as the write is scheduled; failures surface at the join.
pub struct ArtifactWriteHook {
    writer: Arc<ArtifactWriter>,
    write_back: Arc<AsyncWriteBack>,
    resolver: Arc<dyn SourceResolver>,
    metrics: Arc<RunMetrics>,
}

impl ArtifactWriteHook {
    pub fn new(
        writer: Arc<ArtifactWriter>,
        write_back: Arc<AsyncWriteBack>,
        resolver: Arc<dyn SourceResolver>,
        metrics: Arc<RunMetrics>,
    ) -> Self {
        Self {
            writer,
            write_back,
            resolver,
            metrics,
        }
    }
}

impl TestLoopHook for ArtifactWriteHook {
    fn name(&self) -> &str {
        "artifact_write"
    }

    fn on_entity_end(&mut self, entity: &EntityContext, _task: &TaskContext, _upstream: &Reduced) -> Result<Reduced> {
        let prediction = entity
            .prediction
            .clone()
            .context("No prediction to persist (argmax step missing?)")?;

        let probabilities = &entity.entity.probabilities;
        let class_axis = Axis(probabilities.ndim().saturating_sub(1));
        let foreground = probabilities
            .index_axis(class_axis, foreground_class(entity.entity.num_classes()))
            .to_owned();

        let pending = PendingWrite {
            entity: entity.id().clone(),
            foreground,
            prediction,
            sources: self.resolver.sources(entity.id()),
        };

        let writer = self.writer.clone();
        let metrics = self.metrics.clone();
        self.write_back.submit(entity.id().to_string(), async move {
            let start = Instant::now();
            let bytes = writer.write(pending).await?;
            metrics.add_write(bytes);
            metrics.add_write_time(start.elapsed());
            Ok(())
        });

        Ok(Reduced::new())
    }
}
