//! Ensemble inference and ensemble-axis reduction.

use crate::error::{ConfigurationError, InferenceError};
use crate::model::ModelHandle;
use ndarray::{stack, ArrayD, Axis};
use serde::{Deserialize, Serialize};

/// Class axis of raw model outputs: (batch, classes, spatial...)
pub const CLASS_AXIS: Axis = Axis(1);

/// Runs a fixed, ordered list of models on one batch.
pub struct EnsembleInference {
    models: Vec<Box<dyn ModelHandle>>,
}

impl EnsembleInference {
    /// Primary model first, additional members in configured order.
    pub fn new(models: Vec<Box<dyn ModelHandle>>) -> Result<Self, ConfigurationError> {
        if models.is_empty() {
            return Err(ConfigurationError::EmptyEnsemble);
        }
        Ok(Self { models })
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn model_names(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.name()).collect()
    }

    /// Per-member class probabilities: (members, batch, classes, spatial...)
    ///
    /// All or nothing: the first failing member aborts the batch.
    pub fn predict(&self, input: &ArrayD<f32>) -> Result<ArrayD<f32>, InferenceError> {
        let mut members = Vec::with_capacity(self.models.len());

        for (index, model) in self.models.iter().enumerate() {
            let logits = model.predict(input).map_err(|source| InferenceError::Model {
                index,
                name: model.name().to_string(),
                source,
            })?;

            if logits.ndim() < 2 || logits.len_of(CLASS_AXIS) == 0 {
                return Err(InferenceError::InvalidOutput {
                    index,
                    name: model.name().to_string(),
                    shape: logits.shape().to_vec(),
                });
            }

            if let Some(first) = members.first() {
                let first: &ArrayD<f32> = first;
                if first.shape() != logits.shape() {
                    return Err(InferenceError::InconsistentOutputs {
                        index,
                        expected: first.shape().to_vec(),
                        actual: logits.shape().to_vec(),
                    });
                }
            }

            members.push(softmax(logits, CLASS_AXIS));
        }

        let views: Vec<_> = members.iter().map(|m| m.view()).collect();
        // Shapes are identical, checked above
        stack(Axis(0), &views).map_err(|_| InferenceError::InconsistentOutputs {
            index: 0,
            expected: members[0].shape().to_vec(),
            actual: Vec::new(),
        })
    }
}

/// Numerically stable softmax along `axis`, in place.
pub fn softmax(mut scores: ArrayD<f32>, axis: Axis) -> ArrayD<f32> {
    for mut lane in scores.lanes_mut(axis) {
        let max = lane.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        if sum > 0.0 {
            lane.mapv_inplace(|v| v / sum);
        }
    }
    scores
}

/// How the ensemble axis is collapsed into one probability map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    /// Mean of member probabilities
    #[default]
    Mean,
    /// Fraction of members voting for each class
    Vote,
    /// Weighted mean; one weight per member
    Weighted(Vec<f32>),
}

impl Reduction {
    /// Check the reduction against the ensemble size.
    pub fn validate(&self, members: usize) -> Result<(), ConfigurationError> {
        if let Reduction::Weighted(weights) = self {
            if weights.len() != members {
                return Err(ConfigurationError::invalid(format!(
                    "{} ensemble weights for {} models",
                    weights.len(),
                    members
                )));
            }
            if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
                return Err(ConfigurationError::invalid("Ensemble weights must be finite and >= 0"));
            }
            if weights.iter().sum::<f32>() <= 0.0 {
                return Err(ConfigurationError::invalid("Ensemble weights must not all be zero"));
            }
        }
        Ok(())
    }

    /// Collapse (members, batch, classes, spatial...) to (batch, classes, spatial...).
    pub fn reduce(&self, ensemble: &ArrayD<f32>) -> anyhow::Result<ArrayD<f32>> {
        let members = ensemble.len_of(Axis(0));
        if members == 0 || ensemble.ndim() < 3 || ensemble.len_of(Axis(CLASS_AXIS.index() + 1)) == 0 {
            anyhow::bail!("Cannot reduce ensemble of shape {:?}", ensemble.shape());
        }

        match self {
            Reduction::Mean => ensemble
                .mean_axis(Axis(0))
                .ok_or_else(|| anyhow::anyhow!("Empty ensemble axis")),
            Reduction::Weighted(weights) => {
                self.validate(members)?;
                let total: f32 = weights.iter().sum();
                let mut out = ArrayD::<f32>::zeros(ensemble.index_axis(Axis(0), 0).raw_dim());
                for (member, &w) in ensemble.axis_iter(Axis(0)).zip(weights) {
                    out.scaled_add(w / total, &member);
                }
                Ok(out)
            }
            Reduction::Vote => {
                // Member axis 0, class axis 2 in the stacked layout
                let class_axis = Axis(CLASS_AXIS.index() + 1);
                let mut votes = ArrayD::<f32>::zeros(ensemble.raw_dim());
                for (probs, mut vote) in ensemble
                    .lanes(class_axis)
                    .into_iter()
                    .zip(votes.lanes_mut(class_axis))
                {
                    vote[argmax(probs.iter().copied())] = 1.0;
                }
                votes
                    .mean_axis(Axis(0))
                    .ok_or_else(|| anyhow::anyhow!("Empty ensemble axis"))
            }
        }
    }
}

/// Index of the largest value; first index wins on ties.
pub fn argmax(values: impl Iterator<Item = f32>) -> usize {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (i, v) in values.enumerate() {
        if v > best_value {
            best = i;
            best_value = v;
        }
    }
    best
}
