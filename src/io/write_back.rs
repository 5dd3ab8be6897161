//! Background persistence with an explicit join barrier.
//!
//! Writes are submitted from the synchronous main path and run as tasks on a
//! Tokio runtime. Failures are recorded, never raised at the submitter, and
//! reported in aggregate by [`AsyncWriteBack::join_all`].

use crate::error::WriteFailure;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Outcome of a join over the background writes.
#[derive(Debug, Clone, Default)]
pub struct WriteBackReport {
    /// Writes that finished successfully
    pub completed: usize,

    /// Writes that failed or panicked
    pub failures: Vec<WriteFailure>,

    /// Writes cancelled before completion
    pub aborted: usize,
}

impl WriteBackReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.aborted == 0
    }
}

impl std::fmt::Display for WriteBackReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} completed, {} failed, {} aborted",
            self.completed,
            self.failures.len(),
            self.aborted
        )
    }
}

/// Decrements the outstanding counter when a task finishes or is dropped.
struct OutstandingGuard(Arc<AtomicUsize>);

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Submitted {
    label: String,
    handle: JoinHandle<anyhow::Result<()>>,
}

/// Fire-and-forget write tasks plus a join barrier.
///
/// `join_all` blocks the calling thread, so it must not be called from one of
/// the runtime's worker threads.
pub struct AsyncWriteBack {
    runtime: Handle,
    permits: Arc<Semaphore>,
    outstanding: Arc<AtomicUsize>,
    tasks: Mutex<Vec<Submitted>>,
    submitted: AtomicUsize,
}

impl AsyncWriteBack {
    /// `max_concurrency` bounds how many writes run at once.
    pub fn new(runtime: Handle, max_concurrency: usize) -> Self {
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            outstanding: Arc::new(AtomicUsize::new(0)),
            tasks: Mutex::new(Vec::new()),
            submitted: AtomicUsize::new(0),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<Submitted>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Schedule a write. Returns immediately; the write waits for a permit.
    pub fn submit<F>(&self, label: impl Into<String>, write: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let label = label.into();
        // Held until the handle is recorded, so a concurrent join sees the task
        let mut tasks = self.tasks();
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.submitted.fetch_add(1, Ordering::Relaxed);

        let guard = OutstandingGuard(self.outstanding.clone());
        let permits = self.permits.clone();
        let task_label = label.clone();

        let handle = self.runtime.spawn(async move {
            let _guard = guard;
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| anyhow::anyhow!("Write-back closed: {}", e))?;

            let result = write.await;
            if let Err(e) = &result {
                tracing::warn!("Background write '{}' failed: {:#}", task_label, e);
            }
            result
        });

        tracing::debug!("Submitted background write '{}'", label);
        tasks.push(Submitted { label, handle });
    }

    /// Writes submitted and not yet finished.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Total writes submitted over the lifetime of this instance.
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Block until every write submitted before this call has finished.
    pub fn join_all(&self) -> WriteBackReport {
        let pending = std::mem::take(&mut *self.tasks());
        if pending.is_empty() {
            return WriteBackReport::default();
        }

        tracing::info!("Waiting for {} background write(s)", pending.len());
        let report = self.runtime.block_on(collect(pending));
        tracing::info!("Background writes joined: {}", report);
        report
    }

    /// Cancel every pending write, then wait for the cancellations to land.
    pub fn abort_all(&self) -> WriteBackReport {
        let pending = std::mem::take(&mut *self.tasks());
        for task in &pending {
            task.handle.abort();
        }

        let report = self.runtime.block_on(collect(pending));
        tracing::warn!("Background writes aborted: {}", report);
        report
    }
}

async fn collect(pending: Vec<Submitted>) -> WriteBackReport {
    let mut report = WriteBackReport::default();

    for Submitted { label, handle } in pending {
        match handle.await {
            Ok(Ok(())) => report.completed += 1,
            Ok(Err(e)) => report.failures.push(WriteFailure {
                label,
                cause: format!("{:#}", e),
            }),
            Err(e) if e.is_cancelled() => report.aborted += 1,
            Err(e) => report.failures.push(WriteFailure {
                label,
                cause: format!("write task panicked: {}", e),
            }),
        }
    }

    report
}

impl Drop for AsyncWriteBack {
    fn drop(&mut self) {
        let pending = self.outstanding();
        if pending > 0 {
            tracing::warn!("Write-back dropped with {} write(s) still running", pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_runtime;
    use std::time::Duration;

    #[test]
    fn test_join_waits_for_every_write() {
        let runtime = build_runtime(Some(4)).unwrap();
        let write_back = AsyncWriteBack::new(runtime.handle().clone(), 8);
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..100 {
            let counter = counter.clone();
            write_back.submit(format!("task-{}", i), async move {
                tokio::time::sleep(Duration::from_millis((i % 5) as u64)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let report = write_back.join_all();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert_eq!(report.completed, 100);
        assert!(report.is_clean());
        assert_eq!(write_back.outstanding(), 0);
        assert_eq!(write_back.submitted(), 100);
    }

    #[test]
    fn test_failures_are_collected_not_raised() {
        let runtime = build_runtime(Some(2)).unwrap();
        let write_back = AsyncWriteBack::new(runtime.handle().clone(), 4);
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..10 {
            let counter = counter.clone();
            write_back.submit(format!("entity-{}", i), async move {
                if i == 3 || i == 7 {
                    anyhow::bail!("disk full");
                }
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let report = write_back.join_all();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        assert_eq!(report.completed, 8);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].label, "entity-3");
        assert!(report.failures[1].cause.contains("disk full"));
    }

    #[test]
    fn test_panicking_write_is_a_failure() {
        let runtime = build_runtime(Some(1)).unwrap();
        let write_back = AsyncWriteBack::new(runtime.handle().clone(), 1);

        write_back.submit("boom", async {
            if true {
                panic!("encoder crashed");
            }
            Ok(())
        });
        write_back.submit("fine", async { Ok(()) });

        let report = write_back.join_all();
        assert_eq!(report.completed, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].label, "boom");
    }

    #[test]
    fn test_concurrency_is_bounded() {
        let runtime = build_runtime(Some(4)).unwrap();
        let write_back = AsyncWriteBack::new(runtime.handle().clone(), 2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..12 {
            let running = running.clone();
            let peak = peak.clone();
            write_back.submit(format!("w{}", i), async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let report = write_back.join_all();
        assert_eq!(report.completed, 12);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_abort_all() {
        let runtime = build_runtime(Some(2)).unwrap();
        let write_back = AsyncWriteBack::new(runtime.handle().clone(), 4);

        for i in 0..4 {
            write_back.submit(format!("slow-{}", i), async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            });
        }

        let report = write_back.abort_all();
        assert_eq!(report.aborted, 4);
        assert_eq!(report.completed, 0);
        assert_eq!(write_back.outstanding(), 0);
    }

    #[test]
    fn test_join_while_another_thread_submits() {
        const WRITES: usize = 200;
        let runtime = build_runtime(Some(2)).unwrap();
        let write_back = Arc::new(AsyncWriteBack::new(runtime.handle().clone(), 4));
        let finished = Arc::new(AtomicUsize::new(0));
        let returned = Arc::new(AtomicUsize::new(0));

        let submitter = {
            let write_back = write_back.clone();
            let finished = finished.clone();
            let returned = returned.clone();
            std::thread::spawn(move || {
                for i in 0..WRITES {
                    let finished = finished.clone();
                    write_back.submit(format!("w{}", i), async move {
                        tokio::time::sleep(Duration::from_millis((i % 3) as u64)).await;
                        finished.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    });
                    returned.store(i + 1, Ordering::SeqCst);
                }
            })
        };

        let mut completed = 0;
        loop {
            let done_submitting = submitter.is_finished();
            let submitted_before = returned.load(Ordering::SeqCst);
            let report = write_back.join_all();
            completed += report.completed;
            // Everything submitted before the join has finished when it returns
            assert!(finished.load(Ordering::SeqCst) >= submitted_before);
            if done_submitting {
                break;
            }
        }
        submitter.join().unwrap();
        completed += write_back.join_all().completed;

        assert_eq!(completed, WRITES);
        assert_eq!(finished.load(Ordering::SeqCst), WRITES);
        assert_eq!(write_back.outstanding(), 0);
    }

    #[test]
    fn test_join_with_nothing_submitted() {
        let runtime = build_runtime(Some(1)).unwrap();
        let write_back = AsyncWriteBack::new(runtime.handle().clone(), 1);
        let report = write_back.join_all();
        assert_eq!(report.completed, 0);
        assert!(report.is_clean());
    }
}
