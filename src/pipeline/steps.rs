//! Batch and entity processing steps.
//!
//! Batch steps turn model inputs into channel-last class probabilities; entity
//! steps turn an assembled entity into a prediction and its scores.

use crate::eval::MetricsEvaluator;
use crate::model::{argmax, EnsembleInference, Reduction, CLASS_AXIS};
use crate::pipeline::context::{BatchContext, EntityContext, TaskContext};
use anyhow::{Context, Result};
use ndarray::{ArrayD, Axis};

/// One transformation applied to every batch, in order.
pub trait BatchStep {
    fn name(&self) -> &str;

    fn run(&mut self, ctx: &mut BatchContext, task: &mut TaskContext) -> Result<()>;
}

/// One transformation applied to every completed entity, in order.
pub trait EntityStep {
    fn name(&self) -> &str;

    fn run(&mut self, ctx: &mut EntityContext, task: &mut TaskContext) -> Result<()>;
}

/// Runs every ensemble member on the batch images.
pub struct EnsemblePredictionStep {
    ensemble: EnsembleInference,
}

impl EnsemblePredictionStep {
    pub fn new(ensemble: EnsembleInference) -> Self {
        Self { ensemble }
    }
}

impl BatchStep for EnsemblePredictionStep {
    fn name(&self) -> &str {
        "ensemble_prediction"
    }

    fn run(&mut self, ctx: &mut BatchContext, _task: &mut TaskContext) -> Result<()> {
        ctx.ensemble = Some(self.ensemble.predict(&ctx.batch.images)?);
        Ok(())
    }
}

/// Collapses the ensemble axis into one probability map.
pub struct EnsembleReduceStep {
    reduction: Reduction,
}

impl EnsembleReduceStep {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }
}

impl BatchStep for EnsembleReduceStep {
    fn name(&self) -> &str {
        "ensemble_reduce"
    }

    fn run(&mut self, ctx: &mut BatchContext, _task: &mut TaskContext) -> Result<()> {
        let ensemble = ctx
            .ensemble
            .take()
            .context("No ensemble output to reduce")?;
        ctx.probabilities = Some(self.reduction.reduce(&ensemble)?);
        Ok(())
    }
}

/// Moves the class axis last: (batch, classes, spatial...) to (batch, spatial..., classes).
#[derive(Debug, Default)]
pub struct ChannelsLastStep;

impl BatchStep for ChannelsLastStep {
    fn name(&self) -> &str {
        "channels_last"
    }

    fn run(&mut self, ctx: &mut BatchContext, _task: &mut TaskContext) -> Result<()> {
        let probabilities = ctx
            .probabilities
            .take()
            .context("No probabilities to reorder")?;
        ctx.probabilities = Some(channels_last(probabilities)?);
        Ok(())
    }
}

fn channels_last(probabilities: ArrayD<f32>) -> Result<ArrayD<f32>> {
    let ndim = probabilities.ndim();
    if ndim <= CLASS_AXIS.index() {
        anyhow::bail!("Probabilities of shape {:?} have no class axis", probabilities.shape());
    }

    let mut order: Vec<usize> = (0..ndim).filter(|&a| a != CLASS_AXIS.index()).collect();
    order.push(CLASS_AXIS.index());
    Ok(probabilities
        .permuted_axes(order)
        .as_standard_layout()
        .into_owned())
}

/// Picks the most probable class per voxel.
#[derive(Debug, Default)]
pub struct ArgmaxStep;

impl EntityStep for ArgmaxStep {
    fn name(&self) -> &str {
        "argmax"
    }

    fn run(&mut self, ctx: &mut EntityContext, _task: &mut TaskContext) -> Result<()> {
        let probabilities = &ctx.entity.probabilities;
        if probabilities.ndim() < 2 {
            anyhow::bail!("Entity probabilities of shape {:?} have no class axis", probabilities.shape());
        }
        if ctx.entity.num_classes() > u8::MAX as usize + 1 {
            anyhow::bail!("{} classes do not fit a u8 prediction", ctx.entity.num_classes());
        }

        let class_axis = Axis(probabilities.ndim() - 1);
        let prediction: ArrayD<u8> = probabilities.map_axis(class_axis, |lane| argmax(lane.iter().copied()) as u8);
        ctx.prediction = Some(prediction);
        Ok(())
    }
}

/// Scores the prediction against the assembled labels.
pub struct EvaluateStep {
    evaluator: MetricsEvaluator,
}

impl EvaluateStep {
    pub fn new(evaluator: MetricsEvaluator) -> Self {
        Self { evaluator }
    }
}

impl EntityStep for EvaluateStep {
    fn name(&self) -> &str {
        "evaluate"
    }

    fn run(&mut self, ctx: &mut EntityContext, task: &mut TaskContext) -> Result<()> {
        let prediction = ctx
            .prediction
            .as_ref()
            .context("No prediction to evaluate (argmax step missing?)")?;
        let values = self
            .evaluator
            .evaluate(&prediction.view(), &ctx.entity.labels.view())?;

        tracing::debug!("Entity {} scored: {} metric(s)", ctx.entity.id, values.len());
        task.metrics.insert(ctx.entity.id.clone(), values.clone());
        ctx.metrics = values;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::CompletedEntity;
    use crate::data::{Batch, ChunkMeta, EntityId, Placement};
    use crate::eval::{Dice, MetricValue};
    use ndarray::IxDyn;

    fn batch() -> Batch {
        Batch::new(
            0,
            ArrayD::zeros(IxDyn(&[1, 1, 2, 2])),
            ArrayD::zeros(IxDyn(&[1, 2, 2])),
            vec![ChunkMeta::new("A", 0)],
        )
        .unwrap()
    }

    #[test]
    fn test_channels_last_moves_class_axis() {
        // (batch=1, classes=2, h=1, w=3)
        let probs = ArrayD::from_shape_vec(IxDyn(&[1, 2, 1, 3]), vec![0.1, 0.2, 0.3, 0.9, 0.8, 0.7]).unwrap();
        let mut ctx = BatchContext::new(batch());
        ctx.probabilities = Some(probs);

        let mut task = TaskContext::new("cpu", ".");
        ChannelsLastStep.run(&mut ctx, &mut task).unwrap();

        let out = ctx.probabilities.unwrap();
        assert_eq!(out.shape(), &[1, 1, 3, 2]);
        assert_eq!(out[[0, 0, 1, 0]], 0.2);
        assert_eq!(out[[0, 0, 1, 1]], 0.8);
        assert!(out.is_standard_layout());
    }

    #[test]
    fn test_reduce_without_ensemble_fails() {
        let mut ctx = BatchContext::new(batch());
        let mut task = TaskContext::new("cpu", ".");
        let err = EnsembleReduceStep::new(Reduction::Mean)
            .run(&mut ctx, &mut task)
            .unwrap_err();
        assert!(err.to_string().contains("No ensemble output"));
    }

    fn entity() -> CompletedEntity {
        // (chunks=1, pixels=3, classes=2)
        CompletedEntity {
            id: EntityId::from("A"),
            placements: vec![Placement(0)],
            probabilities: ArrayD::from_shape_vec(IxDyn(&[1, 3, 2]), vec![0.9, 0.1, 0.3, 0.7, 0.5, 0.5]).unwrap(),
            labels: ArrayD::from_shape_vec(IxDyn(&[1, 3]), vec![0, 1, 1]).unwrap(),
        }
    }

    #[test]
    fn test_argmax_then_evaluate() {
        let mut ctx = EntityContext::new(entity());
        let mut task = TaskContext::new("cpu", ".");

        ArgmaxStep.run(&mut ctx, &mut task).unwrap();
        let prediction = ctx.prediction.clone().unwrap();
        // Tie at the last pixel resolves to class 0
        assert_eq!(prediction.iter().copied().collect::<Vec<_>>(), vec![0, 1, 0]);

        let evaluator = MetricsEvaluator::new(vec![Box::new(Dice)]).unwrap();
        EvaluateStep::new(evaluator).run(&mut ctx, &mut task).unwrap();

        // tp=1, |pred|=1, |truth|=2
        let expected = MetricValue::Scalar(2.0 / 3.0);
        assert_eq!(ctx.metrics["dice"], expected);
        assert_eq!(task.metrics[&EntityId::from("A")]["dice"], expected);
    }

    #[test]
    fn test_evaluate_without_prediction_fails() {
        let evaluator = MetricsEvaluator::new(vec![Box::new(Dice)]).unwrap();
        let mut ctx = EntityContext::new(entity());
        let mut task = TaskContext::new("cpu", ".");
        assert!(EvaluateStep::new(evaluator).run(&mut ctx, &mut task).is_err());
    }
}
