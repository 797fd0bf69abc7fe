//! Load generator: starts the Worker pool and the Monitor, decides when
//! the run ends, and collects the results.

use super::counter::ThroughputCounter;
use super::monitor::{Monitor, MonitorReport, Reporter};
use super::worker::{latency_histogram, Worker, WorkerReport};
use crate::config::BenchSettings;
use crate::error::HarnessError;
use crate::service::EchoClient;
use bytes::Bytes;
use hdrhistogram::Histogram;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of a run that ended without a fatal error.
#[derive(Debug)]
pub struct RunSummary {
    pub workers: usize,
    /// Final counter value.
    pub total: u64,
    pub elapsed: Duration,
    pub monitor: MonitorReport,
    /// Merged round-trip latency of every Worker, in microseconds.
    pub latency: Histogram<u64>,
}

impl RunSummary {
    /// Average calls per second over the whole run.
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total as f64 / secs
        } else {
            0.0
        }
    }
}

/// Owns the counter and the shared client handle for one run.
pub struct LoadGenerator<C> {
    client: Arc<C>,
    settings: BenchSettings,
    counter: ThroughputCounter,
}

impl<C: EchoClient> LoadGenerator<C> {
    pub fn new(client: Arc<C>, settings: BenchSettings) -> Self {
        let counter = match settings.max_requests {
            Some(limit) => ThroughputCounter::with_limit(limit),
            None => ThroughputCounter::new(),
        };
        Self {
            client,
            settings,
            counter,
        }
    }

    /// Handle to the run's counter.
    #[cfg(test)]
    pub fn counter(&self) -> ThroughputCounter {
        self.counter.clone()
    }

    /// Run until `cancel` fires, the configured duration elapses, the
    /// request limit is reached, or any Worker fails.
    ///
    /// The first failure stops every other Worker and is returned once
    /// they have all exited.
    pub async fn run<R>(
        self,
        reporter: R,
        cancel: CancellationToken,
    ) -> Result<RunSummary, HarnessError>
    where
        R: Reporter + Send + 'static,
    {
        let LoadGenerator {
            client,
            settings,
            counter,
        } = self;
        let key = Bytes::from(settings.key.into_bytes());
        let started = Instant::now();

        // Baseline before the first Worker can increment
        let monitor = Monitor::new(counter.clone(), settings.interval);

        let mut workers = JoinSet::new();
        for id in 0..settings.workers {
            let worker = Worker::new(
                id,
                Arc::clone(&client),
                key.clone(),
                counter.clone(),
                cancel.clone(),
            );
            workers.spawn(worker.run());
        }

        let monitor_stop = CancellationToken::new();
        let mut monitor_task = tokio::spawn(monitor.run(reporter, monitor_stop.clone()));

        info!(
            workers = settings.workers,
            interval_ms = settings.interval.as_millis() as u64,
            duration_secs = settings.duration.map(|d| d.as_secs_f64()),
            max_requests = settings.max_requests,
            "Load generator started"
        );

        let duration = settings.duration;
        let deadline = async {
            match duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let mut reports = Vec::with_capacity(settings.workers);
        let mut failure: Option<HarnessError> = None;
        let mut monitor_result = None;

        loop {
            tokio::select! {
                biased;
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Some(e) = absorb(joined, &mut reports) {
                        failure = Some(e);
                        break;
                    }
                }
                _ = cancel.cancelled() => break,
                _ = &mut deadline => {
                    debug!("Run duration elapsed");
                    break;
                }
                result = &mut monitor_task => {
                    monitor_result = Some(result);
                    break;
                }
            }
        }

        // Stop everything; drain Workers before the final Monitor reading
        if failure.is_some() {
            counter.seal();
        }
        cancel.cancel();
        debug!(
            sealed = counter.is_sealed(),
            total = counter.read(),
            "Stopping workers"
        );
        while let Some(joined) = workers.join_next().await {
            if let Some(e) = absorb(joined, &mut reports) {
                counter.seal();
                if failure.is_none() {
                    failure = Some(e);
                } else {
                    debug!(error = %e, "Further worker failure");
                }
            }
        }

        monitor_stop.cancel();
        let monitor_result = match monitor_result {
            Some(result) => result,
            None => monitor_task.await,
        };
        let monitor = match monitor_result {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                failure.get_or_insert(HarnessError::Report(e));
                MonitorReport::default()
            }
            Err(e) => {
                failure.get_or_insert(HarnessError::Panicked {
                    task: "monitor".to_string(),
                    message: e.to_string(),
                });
                MonitorReport::default()
            }
        };

        let mut latency = latency_histogram();
        for report in &reports {
            debug!(worker = report.id, completed = report.completed, "Worker report");
            if let Err(e) = latency.add(&report.latency) {
                warn!(worker = report.id, error = ?e, "Failed to merge latency histogram");
            }
        }

        let summary = RunSummary {
            workers: settings.workers,
            total: counter.read(),
            elapsed: started.elapsed(),
            monitor,
            latency,
        };
        log_summary(&summary);

        match failure {
            Some(e) => {
                error!(error = %e, "Run aborted");
                Err(e)
            }
            None => Ok(summary),
        }
    }
}

/// Keep a Worker's report, or turn its exit into the run's failure.
fn absorb(
    joined: Result<Result<WorkerReport, HarnessError>, JoinError>,
    reports: &mut Vec<WorkerReport>,
) -> Option<HarnessError> {
    match joined {
        Ok(Ok(report)) => {
            reports.push(report);
            None
        }
        Ok(Err(e)) => Some(e),
        Err(e) => Some(HarnessError::Panicked {
            task: "worker".to_string(),
            message: e.to_string(),
        }),
    }
}

fn log_summary(summary: &RunSummary) {
    info!(
        workers = summary.workers,
        total = summary.total,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        rate = summary.rate().round() as u64,
        intervals = summary.monitor.intervals,
        reported = summary.monitor.reported,
        trailing = summary.monitor.trailing,
        "Run finished"
    );

    if !summary.latency.is_empty() {
        info!(
            mean_us = summary.latency.mean(),
            p50_us = summary.latency.value_at_quantile(0.5),
            p99_us = summary.latency.value_at_quantile(0.99),
            p999_us = summary.latency.value_at_quantile(0.999),
            max_us = summary.latency.max(),
            "Latency"
        );
    }
}
