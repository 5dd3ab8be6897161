use crate::eval::MetricValue;
use crate::hooks::{Reduced, TestLoopHook};
use crate::pipeline::{EntityContext, TaskContext};
use anyhow::Result;
use ndarray::Axis;

/// Produces probability statistics for downstream hooks.
///
/// - `mean_foreground_probability`: mean of the foreground class probability
/// - `predicted_foreground_fraction`: share of voxels predicted non-background
#[derive(Debug, Default)]
pub struct ProbabilityStatsHook;

/// Foreground is class 1 when there are several classes, else the only class.
pub(crate) fn foreground_class(num_classes: usize) -> usize {
    if num_classes > 1 {
        1
    } else {
        0
    }
}

impl TestLoopHook for ProbabilityStatsHook {
    fn name(&self) -> &str {
        "probability_stats"
    }

    fn on_entity_end(&mut self, entity: &EntityContext, _task: &TaskContext, _upstream: &Reduced) -> Result<Reduced> {
        let probabilities = &entity.entity.probabilities;
        let class_axis = Axis(probabilities.ndim().saturating_sub(1));
        let foreground = probabilities.index_axis(class_axis, foreground_class(entity.entity.num_classes()));

        let mut out = Reduced::new();
        let mean = foreground.mean().map(f64::from).unwrap_or(f64::NAN);
        out.insert("mean_foreground_probability".to_string(), MetricValue::Scalar(mean));

        if let Some(prediction) = &entity.prediction {
            let fraction = if prediction.is_empty() {
                f64::NAN
            } else {
                prediction.iter().filter(|&&c| c != 0).count() as f64 / prediction.len() as f64
            };
            out.insert("predicted_foreground_fraction".to_string(), MetricValue::Scalar(fraction));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::CompletedEntity;
    use crate::data::{EntityId, Placement};
    use ndarray::{ArrayD, IxDyn};

    #[test]
    fn test_stats() {
        let mut ctx = EntityContext::new(CompletedEntity {
            id: EntityId::from("A"),
            placements: vec![Placement(0)],
            probabilities: ArrayD::from_shape_vec(IxDyn(&[1, 2, 2]), vec![0.8, 0.2, 0.4, 0.6]).unwrap(),
            labels: ArrayD::zeros(IxDyn(&[1, 2])),
        });
        ctx.prediction = Some(ArrayD::from_shape_vec(IxDyn(&[1, 2]), vec![0, 1]).unwrap());

        let out = ProbabilityStatsHook
            .on_entity_end(&ctx, &TaskContext::new("cpu", "."), &Reduced::new())
            .unwrap();

        let mean = out["mean_foreground_probability"].as_scalar().unwrap();
        assert!((mean - 0.4).abs() < 1e-6);
        assert_eq!(out["predicted_foreground_fraction"], MetricValue::Scalar(0.5));
    }

    #[test]
    fn test_foreground_class() {
        assert_eq!(foreground_class(1), 0);
        assert_eq!(foreground_class(2), 1);
        assert_eq!(foreground_class(4), 1);
    }
}
