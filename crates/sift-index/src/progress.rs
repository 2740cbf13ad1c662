//! Run progress: counts, throughput and ETA.
//!
//! Snapshots are published on a `watch` channel so a caller can render
//! progress without polling the pipeline; every batch is also logged.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub files_total: usize,
    pub files_done: usize,
    pub entities_total: usize,
    pub entities_done: usize,
    pub batches_done: u64,
    pub files_per_sec: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<Duration>,
}

pub struct ProgressReporter {
    tx: Arc<watch::Sender<ProgressSnapshot>>,
    started: Instant,
    snapshot: ProgressSnapshot,
}

impl ProgressReporter {
    pub fn new(tx: Arc<watch::Sender<ProgressSnapshot>>) -> Self {
        Self {
            tx,
            started: Instant::now(),
            snapshot: ProgressSnapshot::default(),
        }
    }

    /// Reset counters for a run over `files_total` files.
    pub fn start(&mut self, files_total: usize) {
        self.started = Instant::now();
        self.snapshot = ProgressSnapshot {
            files_total,
            ..Default::default()
        };
        self.publish();
    }

    /// Entities discovered while preparing files.
    pub fn entities_found(&mut self, count: usize) {
        self.snapshot.entities_total += count;
    }

    /// A batch finished; `files` and `entities` are what it covered.
    pub fn batch_done(&mut self, files: usize, entities: usize) {
        self.snapshot.files_done += files;
        self.snapshot.entities_done += entities;
        self.snapshot.batches_done += 1;
        self.refresh_rates(self.started.elapsed());

        info!(
            "Batch {}: {}/{} files, {} entities, {:.1} files/s, eta {}",
            self.snapshot.batches_done,
            self.snapshot.files_done,
            self.snapshot.files_total,
            self.snapshot.entities_done,
            self.snapshot.files_per_sec,
            self.snapshot
                .eta
                .map(|d| format!("{}s", d.as_secs()))
                .unwrap_or_else(|| "-".to_string())
        );
        self.publish();
    }

    /// Files that left the run without a batch (deletions, renames, failures).
    pub fn files_settled(&mut self, files: usize) {
        self.snapshot.files_done += files;
        self.publish();
    }

    pub fn snapshot(&self) -> &ProgressSnapshot {
        &self.snapshot
    }

    fn refresh_rates(&mut self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 || self.snapshot.files_done == 0 {
            self.snapshot.files_per_sec = 0.0;
            self.snapshot.eta = None;
            return;
        }
        let rate = self.snapshot.files_done as f64 / secs;
        let remaining = self.snapshot.files_total.saturating_sub(self.snapshot.files_done);
        self.snapshot.files_per_sec = rate;
        self.snapshot.eta = Some(Duration::from_secs_f64(remaining as f64 / rate));
    }

    fn publish(&self) {
        // No receivers is fine.
        self.tx.send_replace(self.snapshot.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batches_update_snapshot() {
        let (tx, rx) = watch::channel(ProgressSnapshot::default());
        let mut reporter = ProgressReporter::new(Arc::new(tx));

        reporter.start(10);
        assert_eq!(rx.borrow().files_total, 10);

        reporter.entities_found(7);
        reporter.batch_done(4, 7);
        let snap = rx.borrow().clone();
        assert_eq!(snap.files_done, 4);
        assert_eq!(snap.entities_done, 7);
        assert_eq!(snap.entities_total, 7);
        assert_eq!(snap.batches_done, 1);

        reporter.files_settled(6);
        assert_eq!(rx.borrow().files_done, 10);
    }

    #[test]
    fn test_rates() {
        let (tx, _rx) = watch::channel(ProgressSnapshot::default());
        let mut reporter = ProgressReporter::new(Arc::new(tx));
        reporter.snapshot.files_total = 100;
        reporter.snapshot.files_done = 50;

        reporter.refresh_rates(Duration::from_secs(10));
        assert!((reporter.snapshot().files_per_sec - 5.0).abs() < 1e-9);
        assert_eq!(reporter.snapshot().eta, Some(Duration::from_secs(10)));

        reporter.snapshot.files_done = 0;
        reporter.refresh_rates(Duration::from_secs(10));
        assert_eq!(reporter.snapshot().eta, None);
    }
}
