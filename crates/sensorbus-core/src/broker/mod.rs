//! Broker seam.
//!
//! The pipeline treats the broker as an ordered, partitioned mailbox with
//! at-least-once delivery. [`Transport`] is the producing side, and
//! [`ConsumerGroup`] hands out sessions whose [`Claim`]s each own one
//! partition until the session ends.

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

use async_trait::async_trait;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::{Error, Result};

pub use memory::{MemoryBroker, MemoryConsumerGroup};

/// Messages buffered between the broker and one claim's processing loop.
pub const CLAIM_BUFFER: usize = 64;

/// Where a group starts reading a partition it has no committed offset for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialOffset {
    /// Replay everything retained.
    Oldest,
    /// Only messages produced after joining.
    #[default]
    Newest,
}

impl FromStr for InitialOffset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "oldest" | "earliest" => Ok(InitialOffset::Oldest),
            "newest" | "latest" => Ok(InitialOffset::Newest),
            _ => Err(Error::Config(format!("unknown initial offset: {}", s))),
        }
    }
}

/// Producing side of the broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one keyed record and waits until the broker accepts it.
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()>;
}

/// One message read from a claimed partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// Records that a delivery has been consumed.
pub trait OffsetMarker: Send + Sync {
    /// Marks the delivery consumed; the group resumes after it on the next session.
    fn mark(&self, delivery: &Delivery);
}

/// Exclusive ownership of one partition for the duration of a session.
pub struct Claim {
    partition: i32,
    messages: mpsc::Receiver<Delivery>,
    marker: Arc<dyn OffsetMarker>,
}

impl Claim {
    /// Creates a claim fed by `messages`.
    pub fn new(
        partition: i32,
        messages: mpsc::Receiver<Delivery>,
        marker: Arc<dyn OffsetMarker>,
    ) -> Self {
        Self {
            partition,
            messages,
            marker,
        }
    }

    /// Returns the claimed partition.
    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Waits for the next message; `None` once the claim is revoked.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.messages.recv().await
    }

    /// Marks a delivery of this claim consumed.
    pub fn mark(&self, delivery: &Delivery) {
        self.marker.mark(delivery);
    }
}

/// One membership period of a consumer group.
///
/// Yields claims as partitions are assigned. An `Err` item means the session
/// failed; `None` means it ended normally (rebalance or shutdown).
pub struct Session {
    claims: mpsc::Receiver<Result<Claim>>,
}

impl Session {
    /// Creates a session fed by `claims`.
    pub fn new(claims: mpsc::Receiver<Result<Claim>>) -> Self {
        Self { claims }
    }

    /// Waits for the next claim or the end of the session.
    pub async fn next_claim(&mut self) -> Option<Result<Claim>> {
        self.claims.recv().await
    }
}

/// Consuming side of the broker.
#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Joins the group for `topic` and starts a new session.
    async fn join(&self, topic: &str) -> Result<Session>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_offset_from_str() {
        assert_eq!("oldest".parse::<InitialOffset>().unwrap(), InitialOffset::Oldest);
        assert_eq!("Latest".parse::<InitialOffset>().unwrap(), InitialOffset::Newest);
        assert!("middle".parse::<InitialOffset>().is_err());
    }
}
