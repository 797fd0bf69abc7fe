//! Periodic throughput sampling.
//!
//! Once per interval the Monitor reads the counter, emits the difference
//! from the previous reading and keeps the new reading as its baseline.
//! Every increment therefore lands in exactly one interval: the one whose
//! read first observes it.

use super::counter::ThroughputCounter;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Destination for per-interval deltas.
pub trait Reporter: Send {
    fn report(&mut self, delta: u64) -> impl Future<Output = io::Result<()>> + Send;
}

/// Writes one integer per line and flushes, for piping into other tools.
pub struct LineReporter<W> {
    out: W,
}

impl<W: AsyncWrite + Unpin + Send> LineReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl LineReporter<tokio::io::Stdout> {
    /// Stdout through tokio, so a stalled pipe parks only the Monitor.
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W: AsyncWrite + Unpin + Send> Reporter for LineReporter<W> {
    async fn report(&mut self, delta: u64) -> io::Result<()> {
        self.out.write_all(format!("{delta}\n").as_bytes()).await?;
        self.out.flush().await
    }
}

/// Totals of what the Monitor saw over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorReport {
    /// Full intervals reported.
    pub intervals: u64,
    /// Sum of every reported delta.
    pub reported: u64,
    /// Increments after the last full interval, read at shutdown.
    pub trailing: u64,
}

pub struct Monitor {
    counter: ThroughputCounter,
    interval: Duration,
    baseline: u64,
}

impl Monitor {
    /// Take the first baseline now. Construct before any Worker starts for
    /// the baseline to be zero.
    pub fn new(counter: ThroughputCounter, interval: Duration) -> Self {
        let baseline = counter.read();
        Self {
            counter,
            interval,
            baseline,
        }
    }

    /// Read, diff and rebase as one step. Only the Monitor writes the
    /// baseline, so no increment is counted twice or skipped.
    fn sample(&mut self) -> u64 {
        let current = self.counter.read();
        let delta = current - self.baseline;
        self.baseline = current;
        delta
    }

    /// Report once per interval until `stop` fires, then take a final
    /// reading for the partial interval.
    ///
    /// Missed ticks are caught up, so a stalled scheduler still yields one
    /// reading per elapsed interval. A write still pending when `stop` fires
    /// is abandoned and its delta is folded into the trailing reading.
    pub async fn run<R: Reporter>(
        mut self,
        mut reporter: R,
        stop: CancellationToken,
    ) -> io::Result<MonitorReport> {
        let mut report = MonitorReport::default();
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let delta = self.sample();
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => {
                            // Never printed; leave it to the trailing reading
                            self.baseline -= delta;
                            warn!(delta, "Output stalled at shutdown");
                            break;
                        }
                        written = reporter.report(delta) => written?,
                    }
                    report.intervals += 1;
                    report.reported += delta;
                    debug!(
                        interval = report.intervals,
                        delta,
                        total = self.baseline,
                        "Throughput sample"
                    );
                }
            }
        }

        report.trailing = self.sample();
        Ok(report)
    }
}
