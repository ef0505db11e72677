//! Asynchronous hand-off of measurements to the broker.
//!
//! [`Publisher::publish`] only waits for room in a bounded buffer. A delivery
//! task drains the buffer in order, retrying transient send errors a bounded
//! number of times. Whatever still fails goes to a separate error-draining
//! task that logs it and bumps the `dropped` counter; callers never see
//! delivery errors.
//!
//! When the buffer is full `publish` blocks the caller, so a slow broker
//! slows the pollers down rather than losing readings at this layer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::broker::Transport;
use crate::measurement::Measurement;
use crate::{Error, Result};

/// Publisher tuning.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Measurements buffered before `publish` blocks
    pub buffer: usize,
    /// Re-attempts after the first failed send
    pub retries: u32,
    /// Pause between attempts
    pub retry_backoff: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            buffer: 1024,
            retries: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// Delivery counters, readable while the pipeline runs.
#[derive(Debug, Default)]
pub struct PublisherStats {
    published: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
}

impl PublisherStats {
    /// Measurements accepted by `publish`.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Measurements the broker acknowledged.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Send attempts repeated after a transient error.
    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    /// Measurements given up on.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A measurement the delivery task gave up on.
#[derive(Debug)]
struct DeliveryFailure {
    key: String,
    attempts: u32,
    error: Error,
}

/// Cloneable publishing handle shared by the pollers.
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::Sender<Measurement>,
    stats: Arc<PublisherStats>,
}

/// Owns the publisher's background tasks.
pub struct PublisherTasks {
    delivery: JoinHandle<()>,
    drain: JoinHandle<()>,
    stats: Arc<PublisherStats>,
}

impl Publisher {
    /// Starts the delivery and error-draining tasks for `topic`.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        topic: &str,
        config: PublisherConfig,
    ) -> (Publisher, PublisherTasks) {
        let (tx, rx) = mpsc::channel(config.buffer.max(1));
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(PublisherStats::default());

        let delivery = tokio::spawn(deliver(
            transport,
            topic.to_string(),
            config,
            rx,
            errors_tx,
            stats.clone(),
        ));
        let drain = tokio::spawn(drain_errors(errors_rx, stats.clone()));

        let publisher = Publisher {
            tx,
            stats: stats.clone(),
        };
        let tasks = PublisherTasks {
            delivery,
            drain,
            stats,
        };
        (publisher, tasks)
    }

    /// Queues a measurement for delivery.
    ///
    /// Returns once the measurement is buffered; fails only if the delivery
    /// task is gone.
    pub async fn publish(&self, measurement: Measurement) -> Result<()> {
        self.tx
            .send(measurement)
            .await
            .map_err(|_| Error::Closed("publisher"))?;
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Returns the delivery counters.
    pub fn stats(&self) -> Arc<PublisherStats> {
        self.stats.clone()
    }
}

impl PublisherTasks {
    /// Returns the delivery counters.
    pub fn stats(&self) -> Arc<PublisherStats> {
        self.stats.clone()
    }

    /// Waits until everything buffered has been delivered or dropped.
    ///
    /// Every [`Publisher`] clone must be dropped first, otherwise this waits forever.
    pub async fn flush(self) {
        if let Err(e) = self.delivery.await {
            error!("Delivery task failed: {}", e);
        }
        if let Err(e) = self.drain.await {
            error!("Error-draining task failed: {}", e);
        }
        info!(
            "Publisher flushed: {} published, {} delivered, {} retried, {} dropped",
            self.stats.published(),
            self.stats.delivered(),
            self.stats.retried(),
            self.stats.dropped()
        );
    }
}

async fn deliver(
    transport: Arc<dyn Transport>,
    topic: String,
    config: PublisherConfig,
    mut rx: mpsc::Receiver<Measurement>,
    errors: mpsc::UnboundedSender<DeliveryFailure>,
    stats: Arc<PublisherStats>,
) {
    while let Some(measurement) = rx.recv().await {
        let key = measurement.partition_key();
        let payload = match measurement.encode() {
            Ok(payload) => payload,
            Err(error) => {
                let _ = errors.send(DeliveryFailure {
                    key,
                    attempts: 0,
                    error,
                });
                continue;
            }
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            match transport.send(&topic, &key, &payload).await {
                Ok(()) => {
                    stats.delivered.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Sent {}{:?} = {:.2} to {}",
                        measurement.name, measurement.labels, measurement.value, topic
                    );
                    break;
                }
                Err(e) if attempts <= config.retries => {
                    stats.retried.fetch_add(1, Ordering::Relaxed);
                    debug!("Retrying {} after attempt {}: {}", key, attempts, e);
                    tokio::time::sleep(config.retry_backoff).await;
                }
                Err(error) => {
                    let _ = errors.send(DeliveryFailure {
                        key,
                        attempts,
                        error,
                    });
                    break;
                }
            }
        }
    }
}

async fn drain_errors(
    mut rx: mpsc::UnboundedReceiver<DeliveryFailure>,
    stats: Arc<PublisherStats>,
) {
    while let Some(failure) = rx.recv().await {
        stats.dropped.fetch_add(1, Ordering::Relaxed);
        error!(
            "Failed to produce message {} after {} attempts: {}",
            failure.key, failure.attempts, failure.error
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Fails the first `failures` sends, then accepts everything.
    struct FlakyTransport {
        failures: u32,
        calls: AtomicU32,
        accepted: std::sync::Mutex<Vec<(String, String)>>,
    }

    impl FlakyTransport {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                accepted: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn send(&self, topic: &str, key: &str, _payload: &[u8]) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(Error::Broker("leader not available".to_string()));
            }
            self.accepted
                .lock()
                .unwrap()
                .push((topic.to_string(), key.to_string()));
            Ok(())
        }
    }

    /// Takes the first send and never completes it.
    struct StalledTransport {
        entered: tokio::sync::Notify,
    }

    #[async_trait]
    impl Transport for StalledTransport {
        async fn send(&self, _topic: &str, _key: &str, _payload: &[u8]) -> Result<()> {
            self.entered.notify_one();
            std::future::pending::<Result<()>>().await
        }
    }

    fn fast_config() -> PublisherConfig {
        PublisherConfig {
            buffer: 8,
            retries: 3,
            retry_backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_publish_routes_by_series_key() {
        let broker = MemoryBroker::new(4);
        let (publisher, tasks) =
            Publisher::spawn(Arc::new(broker.clone()), "sensors", fast_config());

        for value in [1.0, 2.0, 3.0] {
            publisher
                .publish(Measurement::new("zone_temp", "Zone", value, "thermal_zone0"))
                .await
                .unwrap();
        }
        let stats = publisher.stats();
        drop(publisher);
        tasks.flush().await;

        let partition = broker.partition_for("zone_temp_thermal_zone0");
        assert_eq!(broker.partition_len("sensors", partition), 3);
        assert_eq!(stats.published(), 3);
        assert_eq!(stats.delivered(), 3);
        assert_eq!(stats.dropped(), 0);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let transport = Arc::new(FlakyTransport::new(2));
        let (publisher, tasks) = Publisher::spawn(transport.clone(), "sensors", fast_config());

        publisher
            .publish(Measurement::new("cpu_freq", "CPU", 1.0, "cpu0"))
            .await
            .unwrap();
        drop(publisher);
        let stats = tasks.stats();
        tasks.flush().await;

        assert_eq!(stats.delivered(), 1);
        assert_eq!(stats.retried(), 2);
        assert_eq!(stats.dropped(), 0);
        assert_eq!(
            transport.accepted.lock().unwrap().as_slice(),
            &[("sensors".to_string(), "cpu_freq_cpu0".to_string())]
        );
    }

    #[tokio::test]
    async fn test_persistent_errors_are_counted_not_returned() {
        let transport = Arc::new(FlakyTransport::new(u32::MAX));
        let (publisher, tasks) = Publisher::spawn(transport.clone(), "sensors", fast_config());

        for origin in ["cpu0", "cpu1"] {
            assert!(publisher
                .publish(Measurement::new("cpu_freq", "CPU", 1.0, origin))
                .await
                .is_ok());
        }
        drop(publisher);
        let stats = tasks.stats();
        tasks.flush().await;

        assert_eq!(stats.published(), 2);
        assert_eq!(stats.delivered(), 0);
        assert_eq!(stats.dropped(), 2);
        // One initial attempt plus three retries per measurement.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_closed_broker_drops_after_retries() {
        let broker = MemoryBroker::new(1);
        broker.close();
        let (publisher, tasks) = Publisher::spawn(Arc::new(broker), "sensors", fast_config());

        publisher
            .publish(Measurement::new("mem", "Memory", 1.0, "MemFree"))
            .await
            .unwrap();
        drop(publisher);
        let stats = tasks.stats();
        tasks.flush().await;

        assert_eq!(stats.dropped(), 1);
    }

    #[tokio::test]
    async fn test_full_buffer_blocks_publish() {
        let transport = Arc::new(StalledTransport {
            entered: tokio::sync::Notify::new(),
        });
        let config = PublisherConfig {
            buffer: 1,
            ..fast_config()
        };
        let (publisher, tasks) = Publisher::spawn(transport.clone(), "sensors", config);
        let reading = |origin: &str| Measurement::new("cpu_freq", "CPU", 1.0, origin);

        publisher.publish(reading("cpu0")).await.unwrap();
        // The delivery task now holds the first measurement inside `send`.
        tokio::time::timeout(Duration::from_secs(5), transport.entered.notified())
            .await
            .expect("delivery task never sent");

        publisher.publish(reading("cpu1")).await.unwrap();
        let third = tokio::time::timeout(
            Duration::from_millis(100),
            publisher.publish(reading("cpu2")),
        )
        .await;
        assert!(third.is_err(), "publish into a full buffer returned");

        let stats = tasks.stats();
        assert_eq!(stats.published(), 2);
        assert_eq!(stats.delivered(), 0);
        assert_eq!(stats.dropped(), 0);
    }
}
