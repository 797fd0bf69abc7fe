//! Worker loop: call, validate, count, repeat.

use super::counter::{Refused, ThroughputCounter};
use crate::error::HarnessError;
use crate::service::EchoClient;
use bytes::Bytes;
use hdrhistogram::Histogram;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// What a Worker hands back when it stops without error.
#[derive(Debug)]
pub struct WorkerReport {
    pub id: usize,
    /// Calls this Worker got counted.
    pub completed: u64,
    /// Round-trip latency in microseconds.
    pub latency: Histogram<u64>,
}

/// Empty latency histogram, microsecond values, 3 significant figures.
pub fn latency_histogram() -> Histogram<u64> {
    Histogram::<u64>::new(3).expect("3 sigfigs is always valid")
}

/// One concurrent caller.
pub struct Worker<C> {
    id: usize,
    client: Arc<C>,
    key: Bytes,
    counter: ThroughputCounter,
    cancel: CancellationToken,
}

impl<C: EchoClient> Worker<C> {
    pub fn new(
        id: usize,
        client: Arc<C>,
        key: Bytes,
        counter: ThroughputCounter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            client,
            key,
            counter,
            cancel,
        }
    }

    /// Issue calls back-to-back until cancelled, the counter refuses, or a
    /// call fails.
    ///
    /// A failed call or a response that differs from the key seals the
    /// counter before returning, so nothing is counted after the failure.
    /// The Worker that reaches the request limit cancels the run.
    pub async fn run(self) -> Result<WorkerReport, HarnessError> {
        let mut latency = latency_histogram();
        let mut completed = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let begin = Instant::now();
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.client.get(self.key.clone()) => result,
            };

            let value = match result {
                Ok(value) => value,
                Err(source) => {
                    self.counter.seal();
                    error!(worker = self.id, error = %source, "Call failed");
                    return Err(HarnessError::Call {
                        worker: self.id,
                        source,
                    });
                }
            };

            if value != self.key {
                self.counter.seal();
                error!(worker = self.id, "Response does not match request");
                return Err(HarnessError::Mismatch {
                    worker: self.id,
                    expected: String::from_utf8_lossy(&self.key).into_owned(),
                    actual: String::from_utf8_lossy(&value).into_owned(),
                });
            }

            let elapsed = begin.elapsed();

            match self.counter.increment() {
                Ok(total) => {
                    completed += 1;
                    latency.saturating_record(elapsed.as_micros() as u64);
                    if self.counter.limit() == Some(total) {
                        debug!(worker = self.id, total, "Request limit reached");
                        self.cancel.cancel();
                        break;
                    }
                }
                Err(Refused::Limit) => {
                    self.cancel.cancel();
                    break;
                }
                Err(Refused::Sealed) => break,
            }
        }

        debug!(worker = self.id, completed, "Worker stopped");
        Ok(WorkerReport {
            id: self.id,
            completed,
            latency,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::CallError;
    use crate::service::EchoService;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Echo client whose n-th call (1-based) can fail or answer wrongly.
    #[derive(Default)]
    pub(crate) struct ScriptedClient {
        pub calls: AtomicU64,
        pub fail_at: Option<u64>,
        pub corrupt_at: Option<u64>,
        pub expected_key: Option<Bytes>,
    }

    impl EchoClient for ScriptedClient {
        async fn get(&self, key: Bytes) -> Result<Bytes, CallError> {
            tokio::task::yield_now().await;
            if let Some(expected) = &self.expected_key {
                assert_eq!(&key, expected);
            }
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_at == Some(n) {
                return Err(CallError::Disconnected);
            }
            if self.corrupt_at == Some(n) {
                return Ok(Bytes::from_static(b"garbage"));
            }
            Ok(key)
        }
    }

    /// Client whose calls never complete.
    struct HangingClient;

    impl EchoClient for HangingClient {
        async fn get(&self, _key: Bytes) -> Result<Bytes, CallError> {
            std::future::pending().await
        }
    }

    fn worker<C: EchoClient>(
        client: Arc<C>,
        counter: &ThroughputCounter,
        cancel: &CancellationToken,
    ) -> Worker<C> {
        Worker::new(
            0,
            client,
            Bytes::from("probe"),
            counter.clone(),
            cancel.clone(),
        )
    }

    #[tokio::test]
    async fn test_single_worker_stops_at_limit() {
        let client = Arc::new(ScriptedClient {
            expected_key: Some(Bytes::from("probe")),
            ..Default::default()
        });
        let counter = ThroughputCounter::with_limit(100);
        let cancel = CancellationToken::new();

        let report = worker(Arc::clone(&client), &counter, &cancel)
            .run()
            .await
            .unwrap();

        assert_eq!(report.completed, 100);
        assert_eq!(report.latency.len(), 100);
        assert_eq!(counter.read(), 100);
        assert_eq!(client.calls.load(Ordering::SeqCst), 100);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_call_error_seals_counter() {
        let client = Arc::new(ScriptedClient {
            fail_at: Some(5),
            ..Default::default()
        });
        let counter = ThroughputCounter::new();
        let cancel = CancellationToken::new();

        let result = worker(client, &counter, &cancel).run().await;

        assert!(matches!(
            result,
            Err(HarnessError::Call {
                worker: 0,
                source: CallError::Disconnected
            })
        ));
        assert!(counter.is_sealed());
        assert_eq!(counter.read(), 4);
    }

    #[tokio::test]
    async fn test_mismatch_seals_counter() {
        let client = Arc::new(ScriptedClient {
            corrupt_at: Some(3),
            ..Default::default()
        });
        let counter = ThroughputCounter::new();
        let cancel = CancellationToken::new();

        match worker(client, &counter, &cancel).run().await {
            Err(HarnessError::Mismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, "probe");
                assert_eq!(actual, "garbage");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(counter.is_sealed());
        assert_eq!(counter.read(), 2);
    }

    #[tokio::test]
    async fn test_stops_when_counter_sealed_elsewhere() {
        let counter = ThroughputCounter::new();
        counter.seal();
        let cancel = CancellationToken::new();

        let report = worker(Arc::new(EchoService), &counter, &cancel)
            .run()
            .await
            .unwrap();

        assert_eq!(report.completed, 0);
        assert_eq!(counter.read(), 0);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_hung_call() {
        let counter = ThroughputCounter::new();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker(Arc::new(HangingClient), &counter, &cancel).run());

        tokio::task::yield_now().await;
        cancel.cancel();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.completed, 0);
        assert!(!counter.is_sealed());
    }
}
