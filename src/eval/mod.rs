//! Scoring of assembled entities.

mod metric;
mod summary;

pub use metric::{Dice, Jaccard, Metric, MetricValue, MetricValues, MetricsEvaluator, PerClassDice};
pub use summary::{summarize, ColumnSummary};
