//! Aggregate statistics over per-entity metric rows.

use crate::data::EntityId;
use crate::eval::MetricValues;
use serde::Serialize;
use std::collections::BTreeMap;

/// Summary of one metric column across entities.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnSummary {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

/// Summarize every (expanded) metric column. Non-finite values are skipped.
pub fn summarize(rows: &BTreeMap<EntityId, MetricValues>) -> BTreeMap<String, ColumnSummary> {
    let mut columns: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for values in rows.values() {
        for (name, value) in values {
            for (column, v) in value.columns(name) {
                if v.is_finite() {
                    columns.entry(column).or_default().push(v);
                }
            }
        }
    }

    columns
        .into_iter()
        .filter(|(_, values)| !values.is_empty())
        .map(|(column, values)| {
            let count = values.len();
            let mean = values.iter().sum::<f64>() / count as f64;
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            (
                column,
                ColumnSummary {
                    mean,
                    std: var.sqrt(),
                    min,
                    max,
                    count,
                },
            )
        })
        .collect()
}
