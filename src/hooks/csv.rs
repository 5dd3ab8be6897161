use crate::data::EntityId;
use crate::eval::summarize;
use crate::hooks::{Reduced, TestLoopHook};
use crate::pipeline::{EntityContext, TaskContext};
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Writes one metrics row per entity and a summary file at run end.
///
/// The rows file is truncated on the first entity and flushed after every
/// row, so a failed run still leaves the rows written so far. Array metrics
/// expand to `name_<i>` columns.
pub struct MetricsCsvHook {
    path: PathBuf,
    summary_path: PathBuf,
    columns: Option<Vec<String>>,
    writer: Option<BufWriter<File>>,
}

impl MetricsCsvHook {
    /// `path` is resolved against the run's test directory when relative.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let summary_path = summary_path_for(&path);
        Self {
            path,
            summary_path,
            columns: None,
            writer: None,
        }
    }

    fn resolve(&self, path: &Path, task: &TaskContext) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            task.test_dir.join(path)
        }
    }

    fn open(&mut self, columns: &[String], task: &TaskContext) -> Result<()> {
        let path = self.resolve(&self.path, task);
        let file = File::create(&path).with_context(|| format!("Cannot create {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        write_row(&mut writer, std::iter::once("id").chain(columns.iter().map(|c| c.as_str())))?;
        tracing::debug!("Writing entity metrics to {}", path.display());
        self.writer = Some(writer);
        Ok(())
    }
}

/// `metrics.csv` -> `metrics_summary.csv`
fn summary_path_for(path: &Path) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("metrics");
    path.with_file_name(format!("{}_summary.csv", stem))
}

fn csv_field(value: &str) -> String {
    if value.contains(|c: char| matches!(c, ',' | '"' | '\n' | '\r')) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn write_row<'a>(writer: &mut impl Write, fields: impl Iterator<Item = &'a str>) -> Result<()> {
    let line: Vec<String> = fields.map(csv_field).collect();
    writeln!(writer, "{}", line.join(","))?;
    Ok(())
}

impl TestLoopHook for MetricsCsvHook {
    fn name(&self) -> &str {
        "metrics_csv"
    }

    fn on_entity_end(&mut self, entity: &EntityContext, task: &TaskContext, _upstream: &Reduced) -> Result<Reduced> {
        let cells: Vec<(String, f64)> = entity
            .metrics
            .iter()
            .flat_map(|(name, value)| value.columns(name))
            .collect();
        let names: Vec<String> = cells.iter().map(|(c, _)| c.clone()).collect();

        if let Some(columns) = &self.columns {
            if *columns != names {
                anyhow::bail!(
                    "Entity {} has metric columns {:?}, expected {:?}",
                    entity.id(),
                    names,
                    columns
                );
            }
        } else {
            self.open(&names, task)?;
            self.columns = Some(names);
        }

        let writer = self.writer.as_mut().context("Metrics file is not open")?;
        let values: Vec<String> = cells.iter().map(|(_, v)| v.to_string()).collect();
        write_row(
            writer,
            std::iter::once(entity.id().as_str()).chain(values.iter().map(|v| v.as_str())),
        )?;
        writer.flush()?;
        Ok(Reduced::new())
    }

    fn on_run_end(&mut self, task: &TaskContext) -> Result<()> {
        if self.writer.is_none() {
            // No entity completed: still leave a (header-only) file behind
            self.open(&[], task)?;
        }
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }

        let summary_path = self.resolve(&self.summary_path, task);
        let mut writer = BufWriter::new(
            File::create(&summary_path).with_context(|| format!("Cannot create {}", summary_path.display()))?,
        );
        write_row(&mut writer, ["metric", "mean", "std", "min", "max", "count"].into_iter())?;
        for (column, stats) in summarize(&task.metrics) {
            let row = [
                column,
                stats.mean.to_string(),
                stats.std.to_string(),
                stats.min.to_string(),
                stats.max.to_string(),
                stats.count.to_string(),
            ];
            write_row(&mut writer, row.iter().map(|s| s.as_str()))?;
        }
        writer.flush()?;

        tracing::info!("Metrics written to {}", self.resolve(&self.path, task).display());
        Ok(())
    }
}

/// Reads back the entity ids of a metrics file, in row order.
pub fn read_entity_ids(path: &Path) -> Result<Vec<EntityId>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .skip(1)
        .filter_map(|line| line.split(',').next())
        .map(|id| EntityId::from(id.trim_matches('"')))
        .collect())
}
