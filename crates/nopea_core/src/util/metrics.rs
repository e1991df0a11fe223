use prometheus::{
    histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
};
use tokio::time::Instant;

use crate::util::errors::Error;

#[derive(Clone)]
pub struct Metrics {
    pub syncs: IntCounter,
    pub sync_failures: IntCounterVec,
    pub sync_duration: HistogramVec,
    pub drift_detected: IntCounterVec,
    pub heals: IntCounterVec,
    pub workers: IntGauge,
    pub webhooks: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let sync_duration = HistogramVec::new(
            histogram_opts!(
                "nopea_sync_duration_seconds",
                "The duration of a full sync cycle in seconds",
            )
            .buckets(vec![0.05, 0.25, 1., 5., 15., 60., 300.]),
            &["repo"],
        )
        .unwrap();
        let sync_failures = IntCounterVec::new(
            opts!("nopea_sync_failures_total", "sync cycle failures"),
            &["repo", "error"],
        )
        .unwrap();
        let syncs = IntCounter::new("nopea_sync_total", "completed sync cycles").unwrap();
        let drift_detected = IntCounterVec::new(
            opts!("nopea_drift_detected_total", "drifted resources detected"),
            &["repo", "kind"],
        )
        .unwrap();
        let heals = IntCounterVec::new(opts!("nopea_heals_total", "resources healed"), &["repo"]).unwrap();
        let workers = IntGauge::new("nopea_workers", "running repository workers").unwrap();
        let webhooks = IntCounterVec::new(
            opts!("nopea_webhooks_total", "webhook deliveries"),
            &["provider", "accepted"],
        )
        .unwrap();
        Metrics {
            syncs,
            sync_failures,
            sync_duration,
            drift_detected,
            heals,
            workers,
            webhooks,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.sync_duration.clone()))?;
        registry.register(Box::new(self.sync_failures.clone()))?;
        registry.register(Box::new(self.syncs.clone()))?;
        registry.register(Box::new(self.drift_detected.clone()))?;
        registry.register(Box::new(self.heals.clone()))?;
        registry.register(Box::new(self.workers.clone()))?;
        registry.register(Box::new(self.webhooks.clone()))?;
        Ok(self)
    }

    pub fn sync_failure(&self, repo: &str, e: &Error) {
        self.sync_failures.with_label_values(&[repo, e.metric_label()]).inc()
    }

    pub fn count_and_measure(&self, repo: &str) -> SyncMeasurer {
        self.syncs.inc();
        SyncMeasurer {
            start: Instant::now(),
            metric: self.sync_duration.clone(),
            repo: repo.to_string(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct SyncMeasurer {
    start: Instant,
    metric: HistogramVec,
    repo: String,
}

impl Drop for SyncMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.with_label_values(&[self.repo.as_str()]).observe(duration);
    }
}
