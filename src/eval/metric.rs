//! Entity-level metrics and their composition.

use crate::error::{ConfigurationError, ShapeMismatchError};
use ndarray::ArrayViewD;
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};

/// Value of one named metric.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Scalar(f64),
    Array(Vec<f64>),
}

impl MetricValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            MetricValue::Scalar(v) => Some(*v),
            MetricValue::Array(_) => None,
        }
    }

    /// Flatten into (column, value) pairs; arrays expand to `name_<i>`.
    pub fn columns(&self, name: &str) -> Vec<(String, f64)> {
        match self {
            MetricValue::Scalar(v) => vec![(name.to_string(), *v)],
            MetricValue::Array(values) => values
                .iter()
                .enumerate()
                .map(|(i, v)| (format!("{}_{}", name, i), *v))
                .collect(),
        }
    }
}

impl Serialize for MetricValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MetricValue::Scalar(v) => serializer.serialize_f64(*v),
            MetricValue::Array(values) => values.serialize(serializer),
        }
    }
}

impl std::fmt::Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricValue::Scalar(v) => write!(f, "{:.4}", v),
            MetricValue::Array(values) => {
                let parts: Vec<String> = values.iter().map(|v| format!("{:.4}", v)).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

/// Named metric values, ordered by name.
pub type MetricValues = BTreeMap<String, MetricValue>;

/// One metric over a discrete prediction and its ground truth.
///
/// Implementations are pure: identical inputs give identical outputs.
pub trait Metric: Send + Sync {
    /// Names this metric produces.
    fn names(&self) -> Vec<String>;

    /// Compute values; inputs are guaranteed to share a shape.
    fn compute(&self, prediction: &ArrayViewD<u8>, target: &ArrayViewD<u8>) -> Vec<(String, MetricValue)>;
}

/// Foreground overlap counts for binary metrics (label != 0 is foreground).
fn overlap(prediction: &ArrayViewD<u8>, target: &ArrayViewD<u8>, class: Option<u8>) -> (u64, u64, u64) {
    let is_fg = |v: u8| match class {
        Some(c) => v == c,
        None => v != 0,
    };
    let mut tp = 0;
    let mut pred = 0;
    let mut truth = 0;
    for (&p, &t) in prediction.iter().zip(target.iter()) {
        let (p, t) = (is_fg(p), is_fg(t));
        if p {
            pred += 1;
        }
        if t {
            truth += 1;
        }
        if p && t {
            tp += 1;
        }
    }
    (tp, pred, truth)
}

fn dice_from(tp: u64, pred: u64, truth: u64) -> f64 {
    // Both empty counts as perfect agreement
    if pred + truth == 0 {
        return 1.0;
    }
    2.0 * tp as f64 / (pred + truth) as f64
}

/// Dice coefficient of the binary foreground.
#[derive(Debug, Clone, Default)]
pub struct Dice;

impl Metric for Dice {
    fn names(&self) -> Vec<String> {
        vec!["dice".to_string()]
    }

    fn compute(&self, prediction: &ArrayViewD<u8>, target: &ArrayViewD<u8>) -> Vec<(String, MetricValue)> {
        let (tp, pred, truth) = overlap(prediction, target, None);
        vec![("dice".to_string(), MetricValue::Scalar(dice_from(tp, pred, truth)))]
    }
}

/// Jaccard index (IoU) of the binary foreground.
#[derive(Debug, Clone, Default)]
pub struct Jaccard;

impl Metric for Jaccard {
    fn names(&self) -> Vec<String> {
        vec!["jaccard".to_string()]
    }

    fn compute(&self, prediction: &ArrayViewD<u8>, target: &ArrayViewD<u8>) -> Vec<(String, MetricValue)> {
        let (tp, pred, truth) = overlap(prediction, target, None);
        let union = pred + truth - tp;
        let value = if union == 0 { 1.0 } else { tp as f64 / union as f64 };
        vec![("jaccard".to_string(), MetricValue::Scalar(value))]
    }
}

/// Dice per class label `0..num_classes`, as an array metric.
#[derive(Debug, Clone)]
pub struct PerClassDice {
    pub num_classes: u8,
}

impl Metric for PerClassDice {
    fn names(&self) -> Vec<String> {
        vec!["class_dice".to_string()]
    }

    fn compute(&self, prediction: &ArrayViewD<u8>, target: &ArrayViewD<u8>) -> Vec<(String, MetricValue)> {
        let values = (0..self.num_classes)
            .map(|c| {
                let (tp, pred, truth) = overlap(prediction, target, Some(c));
                dice_from(tp, pred, truth)
            })
            .collect();
        vec![("class_dice".to_string(), MetricValue::Array(values))]
    }
}

/// A composed set of metrics evaluated together.
pub struct MetricsEvaluator {
    metrics: Vec<Box<dyn Metric>>,
}

impl MetricsEvaluator {
    /// Compose metrics. Fails if two metrics produce the same name.
    pub fn new(metrics: Vec<Box<dyn Metric>>) -> Result<Self, ConfigurationError> {
        let mut seen = BTreeSet::new();
        for metric in &metrics {
            for name in metric.names() {
                if !seen.insert(name.clone()) {
                    return Err(ConfigurationError::DuplicateMetric { name });
                }
            }
        }
        Ok(Self { metrics })
    }

    /// All metric names, in composition order.
    pub fn names(&self) -> Vec<String> {
        self.metrics.iter().flat_map(|m| m.names()).collect()
    }

    pub fn evaluate(
        &self,
        prediction: &ArrayViewD<u8>,
        target: &ArrayViewD<u8>,
    ) -> Result<MetricValues, ShapeMismatchError> {
        if prediction.shape() != target.shape() {
            return Err(ShapeMismatchError {
                prediction: prediction.shape().to_vec(),
                target: target.shape().to_vec(),
            });
        }

        let mut results = MetricValues::new();
        for metric in &self.metrics {
            results.extend(metric.compute(prediction, target));
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn labels(values: &[u8]) -> ArrayD<u8> {
        ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.to_vec()).unwrap()
    }

    #[test]
    fn test_dice() {
        let pred = labels(&[1, 1, 0, 0]);
        let truth = labels(&[1, 0, 1, 0]);
        let out = Dice.compute(&pred.view(), &truth.view());
        assert_eq!(out[0].1, MetricValue::Scalar(0.5));
    }

    #[test]
    fn test_dice_both_empty_is_one() {
        let empty = labels(&[0, 0, 0]);
        let out = Dice.compute(&empty.view(), &empty.view());
        assert_eq!(out[0].1, MetricValue::Scalar(1.0));
    }

    #[test]
    fn test_jaccard() {
        let pred = labels(&[1, 1, 0, 0]);
        let truth = labels(&[1, 0, 1, 0]);
        let out = Jaccard.compute(&pred.view(), &truth.view());
        let value = out[0].1.as_scalar().unwrap();
        assert!((value - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_per_class_dice() {
        let pred = labels(&[0, 1, 2, 2]);
        let truth = labels(&[0, 1, 2, 1]);
        let out = PerClassDice { num_classes: 3 }.compute(&pred.view(), &truth.view());
        match &out[0].1 {
            MetricValue::Array(values) => {
                assert_eq!(values.len(), 3);
                assert_eq!(values[0], 1.0);
                assert!((values[1] - 2.0 / 3.0).abs() < 1e-12);
                assert!((values[2] - 2.0 / 3.0).abs() < 1e-12);
            }
            other => panic!("expected array metric, got {:?}", other),
        }
    }

    #[test]
    fn test_evaluator_preserves_all_names() {
        let eval = MetricsEvaluator::new(vec![
            Box::new(Dice),
            Box::new(Jaccard),
            Box::new(PerClassDice { num_classes: 2 }),
        ])
        .unwrap();
        assert_eq!(eval.names(), vec!["dice", "jaccard", "class_dice"]);

        let pred = labels(&[1, 0]);
        let out = eval.evaluate(&pred.view(), &pred.view()).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out["dice"], MetricValue::Scalar(1.0));
    }

    #[test]
    fn test_evaluator_rejects_name_collision() {
        let result = MetricsEvaluator::new(vec![Box::new(Dice), Box::new(Dice)]);
        assert!(matches!(result, Err(ConfigurationError::DuplicateMetric { name }) if name == "dice"));
    }

    #[test]
    fn test_evaluator_shape_mismatch() {
        let eval = MetricsEvaluator::new(vec![Box::new(Dice)]).unwrap();
        let pred = labels(&[1, 0, 1]);
        let truth = labels(&[1, 0]);
        let err = eval.evaluate(&pred.view(), &truth.view()).unwrap_err();
        assert_eq!(err.prediction, vec![3]);
        assert_eq!(err.target, vec![2]);
    }

    #[test]
    fn test_evaluate_is_deterministic() {
        let eval = MetricsEvaluator::new(vec![Box::new(Dice), Box::new(Jaccard)]).unwrap();
        let pred = labels(&[1, 1, 0, 1, 0]);
        let truth = labels(&[1, 0, 0, 1, 1]);
        let a = eval.evaluate(&pred.view(), &truth.view()).unwrap();
        let b = eval.evaluate(&pred.view(), &truth.view()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_metric_value_columns() {
        assert_eq!(MetricValue::Scalar(0.5).columns("dice"), vec![("dice".to_string(), 0.5)]);
        let cols = MetricValue::Array(vec![0.1, 0.2]).columns("class_dice");
        assert_eq!(cols[1].0, "class_dice_1");
    }
}
