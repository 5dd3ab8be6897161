//! Run progress monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Counters for one evaluation run.
///
/// Updated from the synchronous main path and from write-back tasks.
#[derive(Debug, Default)]
pub struct RunMetrics {
    /// Batches pulled from the source
    pub batches: AtomicU64,

    /// Chunks routed into the assembler
    pub chunks: AtomicU64,

    /// Entities completed and scored
    pub entities: AtomicU64,

    /// Background writes finished successfully
    pub writes_completed: AtomicU64,

    /// Background writes that failed
    pub write_failures: AtomicU64,

    /// Artifact bytes written
    pub bytes_written: AtomicU64,

    start_time: Option<Instant>,

    // Per-phase timing, microseconds
    /// Ensemble inference and reduction
    pub inference_us: AtomicU64,

    /// Entity steps (argmax, scoring)
    pub evaluation_us: AtomicU64,

    /// Hook chain dispatch
    pub hooks_us: AtomicU64,

    /// Background writes (summed across tasks)
    pub write_us: AtomicU64,
}

impl RunMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_chunks(&self, count: u64) {
        self.chunks.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_entity(&self) {
        self.entities.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_write(&self, bytes: u64) {
        self.writes_completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_inference_time(&self, duration: Duration) {
        self.inference_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_evaluation_time(&self, duration: Duration) {
        self.evaluation_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_hooks_time(&self, duration: Duration) {
        self.hooks_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_write_time(&self, duration: Duration) {
        self.write_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    pub fn chunks_per_second(&self) -> f64 {
        let chunks = self.chunks.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            chunks as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let secs = |c: &AtomicU64| c.load(Ordering::Relaxed) as f64 / 1_000_000.0;

        MetricsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            entities: self.entities.load(Ordering::Relaxed),
            writes_completed: self.writes_completed.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            chunks_per_second: self.chunks_per_second(),
            inference_secs: secs(&self.inference_us),
            evaluation_secs: secs(&self.evaluation_us),
            hooks_secs: secs(&self.hooks_us),
            write_secs: secs(&self.write_us),
        }
    }
}

/// Snapshot of run metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub batches: u64,
    pub chunks: u64,
    pub entities: u64,
    pub writes_completed: u64,
    pub write_failures: u64,
    pub bytes_written: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub chunks_per_second: f64,
    pub inference_secs: f64,
    pub evaluation_secs: f64,
    pub hooks_secs: f64,
    /// Summed across concurrent write tasks
    pub write_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        println!("\n=== Evaluation Summary ===");
        println!("Total time: {:.1}s", self.elapsed.as_secs_f64());
        println!("Batches: {}", self.batches);
        println!("Chunks: {} ({:.1}/s)", self.chunks, self.chunks_per_second);
        println!("Entities: {}", self.entities);
        println!(
            "Writes: {} completed, {} failed, {:.2} MB",
            self.writes_completed,
            self.write_failures,
            self.bytes_written as f64 / (1024.0 * 1024.0)
        );

        let main_path = self.inference_secs + self.evaluation_secs + self.hooks_secs;
        if main_path > 0.0 {
            println!("\n--- Main Path Time Breakdown ---");
            println!("Inference:   {:>7.1}s ({:>5.1}%)", self.inference_secs, self.inference_secs / main_path * 100.0);
            println!("Evaluation:  {:>7.1}s ({:>5.1}%)", self.evaluation_secs, self.evaluation_secs / main_path * 100.0);
            println!("Hooks:       {:>7.1}s ({:>5.1}%)", self.hooks_secs, self.hooks_secs / main_path * 100.0);
        }
        println!("Background write time: {:.1}s", self.write_secs);
        println!("==========================\n");
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let main_path = self.inference_secs + self.evaluation_secs + self.hooks_secs;
        let (infer_pct, eval_pct, hooks_pct) = if main_path > 0.0 {
            (
                self.inference_secs / main_path * 100.0,
                self.evaluation_secs / main_path * 100.0,
                self.hooks_secs / main_path * 100.0,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        write!(
            f,
            "Batches: {} | Chunks: {} @ {:.1}/s | Entities: {} | \
             Writes: {} ok, {} failed ({:.2} MB) | Elapsed: {:.1}s | \
             Time: infer {:.0}% | eval {:.0}% | hooks {:.0}%",
            self.batches,
            self.chunks,
            self.chunks_per_second,
            self.entities,
            self.writes_completed,
            self.write_failures,
            self.bytes_written as f64 / (1024.0 * 1024.0),
            self.elapsed.as_secs_f64(),
            infer_pct,
            eval_pct,
            hooks_pct,
        )
    }
}

/// Periodic progress reporter running on the write-back runtime.
pub struct MetricsReporter {
    metrics: Arc<RunMetrics>,
    interval_secs: u64,
    total_chunks: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<RunMetrics>, interval_secs: u64, total_chunks: u64) -> Self {
        Self {
            metrics,
            interval_secs: interval_secs.max(1),
            total_chunks,
        }
    }

    /// Report until a shutdown message arrives (or the sender is dropped).
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let progress = if self.total_chunks > 0 {
                        snapshot.chunks as f64 / self.total_chunks as f64 * 100.0
                    } else {
                        0.0
                    };
                    tracing::info!("[{:.1}%] {}", progress, snapshot);
                }
                _ = shutdown.recv() => {
                    tracing::info!("Final: {}", self.metrics.snapshot());
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = RunMetrics::new();

        metrics.add_batch();
        metrics.add_chunks(4);
        metrics.add_chunks(2);
        metrics.add_entity();
        metrics.add_write(1024);
        metrics.add_write(1024);
        metrics.add_write_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.batches, 1);
        assert_eq!(snapshot.chunks, 6);
        assert_eq!(snapshot.entities, 1);
        assert_eq!(snapshot.writes_completed, 2);
        assert_eq!(snapshot.write_failures, 1);
        assert_eq!(snapshot.bytes_written, 2048);
    }

    #[test]
    fn test_timing_metrics() {
        let metrics = RunMetrics::new();

        metrics.add_inference_time(Duration::from_millis(100));
        metrics.add_evaluation_time(Duration::from_millis(50));
        metrics.add_hooks_time(Duration::from_millis(25));
        metrics.add_write_time(Duration::from_millis(75));

        let snapshot = metrics.snapshot();
        assert!((snapshot.inference_secs - 0.1).abs() < 0.001);
        assert!((snapshot.evaluation_secs - 0.05).abs() < 0.001);
        assert!((snapshot.hooks_secs - 0.025).abs() < 0.001);
        assert!((snapshot.write_secs - 0.075).abs() < 0.001);
    }

    #[test]
    fn test_snapshot_display() {
        let metrics = RunMetrics::new();
        metrics.add_batch();
        metrics.add_chunks(12);
        metrics.add_write_failure();
        metrics.add_inference_time(Duration::from_secs(3));
        metrics.add_hooks_time(Duration::from_secs(1));

        let display = metrics.snapshot().to_string();
        assert!(display.contains("Chunks: 12"));
        assert!(display.contains("1 failed"));
        assert!(display.contains("infer 75%"));
        assert!(display.contains("hooks 25%"));
    }

    #[test]
    fn test_zero_elapsed_no_panic() {
        let metrics = RunMetrics {
            start_time: None,
            ..Default::default()
        };
        metrics.add_chunks(10);
        assert_eq!(metrics.chunks_per_second(), 0.0);
    }

    #[test]
    fn test_save_to_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("run_metrics.json");

        let metrics = RunMetrics::new();
        metrics.add_entity();
        metrics.snapshot().save_to_file(path.to_str().unwrap()).unwrap();

        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["entities"], 1);
    }

    #[tokio::test]
    async fn test_reporter_stops_on_shutdown() {
        let reporter = MetricsReporter::new(RunMetrics::new(), 60, 10);
        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(reporter.run(rx));
        tx.send(()).await.unwrap();
        task.await.unwrap();
    }
}
