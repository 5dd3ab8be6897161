//! Hook contract and ordered composition.

use crate::error::{HookError, HookEvent};
use crate::eval::MetricValue;
use crate::pipeline::{BatchContext, EntityContext, TaskContext};
use anyhow::Result;
use std::collections::BTreeMap;

/// Values a hook produces for downstream hooks of the same event.
pub type Reduced = BTreeMap<String, MetricValue>;

/// Observer of test-loop lifecycle events.
///
/// All methods run synchronously on the main path; an error aborts the run.
pub trait TestLoopHook {
    fn name(&self) -> &str;

    fn on_batch_end(&mut self, _batch: &BatchContext, _task: &TaskContext) -> Result<()> {
        Ok(())
    }

    /// `upstream` holds values produced by earlier hooks for this entity.
    fn on_entity_end(&mut self, _entity: &EntityContext, _task: &TaskContext, _upstream: &Reduced) -> Result<Reduced> {
        Ok(Reduced::new())
    }

    fn on_run_end(&mut self, _task: &TaskContext) -> Result<()> {
        Ok(())
    }
}

/// Ordered list of hooks, delivered in insertion order.
///
/// The first failing hook stops delivery of the event; hooks already called
/// are not rolled back.
pub struct HookChain {
    name: String,
    hooks: Vec<Box<dyn TestLoopHook>>,
    reducing: bool,
}

impl HookChain {
    /// Plain chain: every hook sees the caller's upstream values.
    pub fn new(hooks: Vec<Box<dyn TestLoopHook>>) -> Self {
        Self {
            name: "chain".to_string(),
            hooks,
            reducing: false,
        }
    }

    /// Reducing chain: each hook's output is merged and passed to later hooks.
    pub fn reducing(hooks: Vec<Box<dyn TestLoopHook>>) -> Self {
        Self {
            name: "reducing_chain".to_string(),
            hooks,
            reducing: true,
        }
    }

    pub fn push(&mut self, hook: Box<dyn TestLoopHook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn batch_end(&mut self, batch: &BatchContext, task: &TaskContext) -> Result<(), HookError> {
        for hook in &mut self.hooks {
            hook.on_batch_end(batch, task).map_err(|source| HookError {
                hook: hook.name().to_string(),
                event: HookEvent::BatchEnd,
                source,
            })?;
        }
        Ok(())
    }

    /// Returns the merged outputs of every hook.
    pub fn entity_end(
        &mut self,
        entity: &EntityContext,
        task: &TaskContext,
        upstream: &Reduced,
    ) -> Result<Reduced, HookError> {
        let mut accumulated = upstream.clone();
        let mut produced = Reduced::new();

        for hook in &mut self.hooks {
            let visible = if self.reducing { &accumulated } else { upstream };
            let output = hook.on_entity_end(entity, task, visible).map_err(|source| HookError {
                hook: hook.name().to_string(),
                event: HookEvent::EntityEnd,
                source,
            })?;

            if self.reducing {
                accumulated.extend(output.clone());
            }
            produced.extend(output);
        }
        Ok(produced)
    }

    pub fn run_end(&mut self, task: &TaskContext) -> Result<(), HookError> {
        for hook in &mut self.hooks {
            hook.on_run_end(task).map_err(|source| HookError {
                hook: hook.name().to_string(),
                event: HookEvent::RunEnd,
                source,
            })?;
        }
        Ok(())
    }
}

/// A chain nests inside another chain like any other hook.
impl TestLoopHook for HookChain {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_batch_end(&mut self, batch: &BatchContext, task: &TaskContext) -> Result<()> {
        Ok(self.batch_end(batch, task)?)
    }

    fn on_entity_end(&mut self, entity: &EntityContext, task: &TaskContext, upstream: &Reduced) -> Result<Reduced> {
        Ok(self.entity_end(entity, task, upstream)?)
    }

    fn on_run_end(&mut self, task: &TaskContext) -> Result<()> {
        Ok(self.run_end(task)?)
    }
}
