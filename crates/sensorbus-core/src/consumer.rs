//! Consumer-group side of the pipeline.
//!
//! Each claimed partition gets its own sequential processing loop, so
//! messages of one partition are applied in delivery order while different
//! partitions proceed independently. Malformed messages are marked consumed
//! and dropped; there is no dead-letter path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Claim, ConsumerGroup, Delivery, Session};
use crate::measurement::Measurement;
use crate::registry::MetricRegistry;
use crate::Result;

/// Consumer tuning.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Topic to consume
    pub topic: String,
    /// Pause before rejoining after a group or session error
    pub backoff: Duration,
}

impl ConsumerConfig {
    /// Creates a config with the default five second backoff.
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            backoff: Duration::from_secs(5),
        }
    }
}

/// Processing counters, readable while the consumer runs.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    applied: AtomicU64,
    malformed: AtomicU64,
    rejected: AtomicU64,
    sessions: AtomicU64,
}

impl ConsumerStats {
    /// Measurements written to the registry.
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Messages that could not be decoded.
    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Decoded measurements the registry refused.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Group sessions started.
    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }
}

/// Feeds the registry from a consumer group.
pub struct Consumer {
    group: Box<dyn ConsumerGroup>,
    registry: Arc<MetricRegistry>,
    config: ConsumerConfig,
    stats: Arc<ConsumerStats>,
}

impl Consumer {
    /// Creates a consumer writing into `registry`.
    pub fn new(
        group: Box<dyn ConsumerGroup>,
        registry: Arc<MetricRegistry>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            group,
            registry,
            config,
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    /// Returns the processing counters.
    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    /// Joins the group and processes sessions until cancelled.
    ///
    /// Errors never end the loop: after a failed join or session the consumer
    /// waits `backoff` and joins again.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Starting consumer for topic: {}", self.config.topic);

        while !cancel.is_cancelled() {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                joined = self.group.join(&self.config.topic) => joined,
            };

            let outcome = match joined {
                Ok(session) => {
                    self.stats.sessions.fetch_add(1, Ordering::Relaxed);
                    self.run_session(session, &cancel).await
                }
                Err(e) => Err(e),
            };

            if let Err(e) = outcome {
                warn!(
                    "Error from consumer: {}. Retrying in {:?}",
                    e, self.config.backoff
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.backoff) => {}
                }
            }
        }

        info!(
            "Consumer stopped: {} applied, {} malformed, {} rejected",
            self.stats.applied(),
            self.stats.malformed(),
            self.stats.rejected()
        );
    }

    /// Spawns a loop per claim and waits for all of them once the session ends.
    async fn run_session(&self, mut session: Session, cancel: &CancellationToken) -> Result<()> {
        let mut claims = JoinSet::new();

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                next = session.next_claim() => match next {
                    Some(Ok(claim)) => {
                        claims.spawn(process_claim(
                            claim,
                            self.registry.clone(),
                            self.stats.clone(),
                            cancel.clone(),
                        ));
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                },
            }
        };

        // Dropping the session lets the broker close the claims' channels.
        drop(session);
        while let Some(joined) = claims.join_next().await {
            if let Err(e) = joined {
                error!("Claim processing task failed: {}", e);
            }
        }
        outcome
    }
}

/// Processes one partition strictly in delivery order.
async fn process_claim(
    mut claim: Claim,
    registry: Arc<MetricRegistry>,
    stats: Arc<ConsumerStats>,
    cancel: CancellationToken,
) {
    debug!("Processing partition {}", claim.partition());
    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            delivery = claim.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };
        apply(&delivery, &registry, &stats);
        claim.mark(&delivery);
    }
    debug!("Released partition {}", claim.partition());
}

fn apply(delivery: &Delivery, registry: &MetricRegistry, stats: &ConsumerStats) {
    let measurement = match Measurement::decode(&delivery.payload) {
        Ok(measurement) => measurement,
        Err(e) => {
            stats.malformed.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Failed to decode message at {}/{}: {}",
                delivery.partition, delivery.offset, e
            );
            return;
        }
    };

    match registry.record(&measurement) {
        Ok(()) => {
            stats.applied.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Updated metric {}{:?} = {:.2}",
                measurement.name, measurement.labels, measurement.value
            );
        }
        Err(e) => {
            stats.rejected.fetch_add(1, Ordering::Relaxed);
            warn!("Rejected measurement {}: {}", measurement.name, e);
        }
    }
}
