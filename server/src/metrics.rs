//! Backup outcome metrics, exposed in Prometheus text format.

use chrono::Utc;
use prometheus::{
    register_gauge_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Gauge, IntCounter, IntGauge, Registry, TextEncoder,
};
use std::future::Future;
use std::time::Instant;
use tablesnap_core::Result;

/// `last_backup_success` before any backup finished in this process.
pub const SUCCESS_UNKNOWN: i64 = 2;

#[derive(Clone)]
pub struct BackupMetrics {
    /// Unix seconds.
    pub last_backup_start: IntGauge,
    /// Unix seconds.
    pub last_backup_end: IntGauge,
    /// Seconds.
    pub last_backup_duration: Gauge,
    /// 0 failed, 1 succeeded, 2 unknown.
    pub last_backup_success: IntGauge,
    pub successful_backups: IntCounter,
    pub failed_backups: IntCounter,
}

impl BackupMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let metrics = Self {
            last_backup_start: register_int_gauge_with_registry!(
                "tablesnap_last_backup_start",
                "Last backup start timestamp",
                registry,
            )?,
            last_backup_end: register_int_gauge_with_registry!(
                "tablesnap_last_backup_end",
                "Last backup end timestamp",
                registry,
            )?,
            last_backup_duration: register_gauge_with_registry!(
                "tablesnap_last_backup_duration",
                "Backup duration in seconds",
                registry,
            )?,
            last_backup_success: register_int_gauge_with_registry!(
                "tablesnap_last_backup_success",
                "Last backup success boolean: 0=failed, 1=success, 2=unknown",
                registry,
            )?,
            successful_backups: register_int_counter_with_registry!(
                "tablesnap_successful_backups",
                "Number of successful backups",
                registry,
            )?,
            failed_backups: register_int_counter_with_registry!(
                "tablesnap_failed_backups",
                "Number of failed backups",
                registry,
            )?,
        };
        metrics.last_backup_success.set(SUCCESS_UNKNOWN);
        Ok(metrics)
    }

    /// Marks a backup as started. The returned run records a failure unless
    /// [`BackupRun::finish`] is called, so an unwinding handler still counts.
    pub fn begin(&self) -> BackupRun<'_> {
        self.last_backup_start.set(Utc::now().timestamp());
        BackupRun {
            metrics: self,
            started: Instant::now(),
            finished: false,
        }
    }

    /// Runs `backup` between [`begin`](Self::begin) and
    /// [`finish`](BackupRun::finish).
    pub async fn track<T, F>(&self, backup: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let run = self.begin();
        let result = backup.await;
        run.finish(result.is_ok());
        result
    }

    fn record(&self, started: Instant, success: bool) {
        self.last_backup_end.set(Utc::now().timestamp());
        self.last_backup_duration.set(started.elapsed().as_secs_f64());
        if success {
            self.last_backup_success.set(1);
            self.successful_backups.inc();
        } else {
            self.last_backup_success.set(0);
            self.failed_backups.inc();
        }
    }
}

pub struct BackupRun<'a> {
    metrics: &'a BackupMetrics,
    started: Instant,
    finished: bool,
}

impl BackupRun<'_> {
    pub fn finish(mut self, success: bool) {
        self.finished = true;
        self.metrics.record(self.started, success);
    }
}

impl Drop for BackupRun<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.metrics.record(self.started, false);
        }
    }
}

pub fn encode(registry: &Registry) -> prometheus::Result<String> {
    TextEncoder.encode_to_string(&registry.gather())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablesnap_core::Error;

    #[tokio::test]
    async fn test_success_gauge_scenario() {
        let registry = Registry::new();
        let metrics = BackupMetrics::new(&registry).unwrap();
        assert_eq!(metrics.last_backup_success.get(), SUCCESS_UNKNOWN);

        let failed: Result<()> = metrics
            .track(async { Err(Error::Other("disk full".to_string())) })
            .await;
        assert!(failed.is_err());
        assert_eq!(metrics.last_backup_success.get(), 0);
        assert_eq!(metrics.failed_backups.get(), 1);
        assert_eq!(metrics.successful_backups.get(), 0);

        let name = metrics.track(async { Ok("2024-03-01T10-00-00") }).await.unwrap();
        assert_eq!(name, "2024-03-01T10-00-00");
        assert_eq!(metrics.last_backup_success.get(), 1);
        assert_eq!(metrics.failed_backups.get(), 1);
        assert_eq!(metrics.successful_backups.get(), 1);

        assert!(metrics.last_backup_duration.get() >= 0.0);
        assert!(metrics.last_backup_end.get() >= metrics.last_backup_start.get());
    }

    #[test]
    fn test_abandoned_run_counts_as_failure() {
        let registry = Registry::new();
        let metrics = BackupMetrics::new(&registry).unwrap();
        drop(metrics.begin());
        assert_eq!(metrics.last_backup_success.get(), 0);
        assert_eq!(metrics.failed_backups.get(), 1);
    }

    #[test]
    fn test_exposition_lists_every_metric() {
        let registry = Registry::new();
        let _metrics = BackupMetrics::new(&registry).unwrap();
        let text = encode(&registry).unwrap();
        for name in [
            "tablesnap_last_backup_start",
            "tablesnap_last_backup_end",
            "tablesnap_last_backup_duration",
            "tablesnap_last_backup_success 2",
            "tablesnap_successful_backups",
            "tablesnap_failed_backups",
        ] {
            assert!(text.contains(name), "missing {}", name);
        }
    }
}
