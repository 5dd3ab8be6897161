use crate::eval::{summarize, MetricValues};
use crate::hooks::{Reduced, TestLoopHook};
use crate::pipeline::{EntityContext, TaskContext};
use anyhow::Result;

/// Logs one line per completed entity and a per-metric summary at run end.
#[derive(Debug, Default)]
pub struct ConsoleLogHook {
    total_entities: Option<usize>,
}

impl ConsoleLogHook {
    pub fn new(total_entities: Option<usize>) -> Self {
        Self { total_entities }
    }
}

fn format_values(values: &MetricValues) -> String {
    values
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join(" ")
}

impl TestLoopHook for ConsoleLogHook {
    fn name(&self) -> &str {
        "console"
    }

    fn on_entity_end(&mut self, entity: &EntityContext, task: &TaskContext, upstream: &Reduced) -> Result<Reduced> {
        let progress = match self.total_entities {
            Some(total) => format!("[{}/{}]", task.entity_index, total),
            None => format!("[{}]", task.entity_index),
        };

        if upstream.is_empty() {
            tracing::info!("{} {} | {}", progress, entity.id(), format_values(&entity.metrics));
        } else {
            tracing::info!(
                "{} {} | {} | {}",
                progress,
                entity.id(),
                format_values(&entity.metrics),
                format_values(upstream)
            );
        }
        Ok(Reduced::new())
    }

    fn on_run_end(&mut self, task: &TaskContext) -> Result<()> {
        let summary = summarize(&task.metrics);
        tracing::info!("Evaluated {} entities", task.metrics.len());
        for (column, stats) in &summary {
            tracing::info!(
                "  {:<24} mean {:.4} +/- {:.4} (min {:.4}, max {:.4}, n={})",
                column,
                stats.mean,
                stats.std,
                stats.min,
                stats.max,
                stats.count
            );
        }
        Ok(())
    }
}
