//! In-process partitioned log.
//!
//! Implements the same contract a Kafka cluster gives the pipeline: records
//! with the same key land in the same partition and keep their order, each
//! partition is claimed by exactly one group member per generation, and
//! anything not marked before a session ends is delivered again.
//!
//! Records are released once every active group has committed past them.
//! A per-partition retention limit bounds the log when nothing consumes it.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{
    Claim, ConsumerGroup, Delivery, InitialOffset, OffsetMarker, Session, Transport, CLAIM_BUFFER,
};
use crate::{Error, Result};

/// Records kept per partition before the oldest are discarded unread.
pub const DEFAULT_RETENTION: usize = 65_536;

struct Record {
    key: String,
    payload: Vec<u8>,
}

/// Retained tail of one partition; `base` is the offset of the first record.
#[derive(Default)]
struct Partition {
    base: i64,
    records: VecDeque<Record>,
}

impl Partition {
    /// Offset the next appended record gets.
    fn end(&self) -> i64 {
        self.base + self.records.len() as i64
    }

    fn get(&self, offset: i64) -> Option<&Record> {
        if offset < self.base {
            return None;
        }
        self.records.get((offset - self.base) as usize)
    }

    /// Releases every record below `offset`.
    fn trim_to(&mut self, offset: i64) {
        while self.base < offset && self.records.pop_front().is_some() {
            self.base += 1;
        }
    }
}

#[derive(Default)]
struct Group {
    generation: u64,
    members: Vec<u64>,
    /// Next offset to read per (topic, partition), set on first claim.
    committed: HashMap<(String, i32), i64>,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Vec<Partition>>,
    groups: HashMap<String, Group>,
    closed: bool,
}

impl State {
    /// Lowest committed offset of a partition over groups that still have members.
    fn low_watermark(&self, topic: &str, partition: i32) -> Option<i64> {
        let key = (topic.to_string(), partition);
        self.groups
            .values()
            .filter(|group| !group.members.is_empty())
            .filter_map(|group| group.committed.get(&key))
            .min()
            .copied()
    }

    fn release(&mut self, topic: &str, partition: i32) {
        let Some(low) = self.low_watermark(topic, partition) else {
            return;
        };
        if let Some(log) = self
            .topics
            .get_mut(topic)
            .and_then(|partitions| partitions.get_mut(partition as usize))
        {
            log.trim_to(low);
        }
    }
}

struct Inner {
    partitions: usize,
    retention: usize,
    state: Mutex<State>,
    /// Bumped on every append, rebalance and close.
    changes: watch::Sender<u64>,
    next_member: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave the log half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    fn topic<'a>(&self, state: &'a mut State, topic: &str) -> &'a mut Vec<Partition> {
        let partitions = self.partitions;
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| (0..partitions).map(|_| Partition::default()).collect())
    }
}

/// Shared handle to an in-process broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Creates a broker whose topics have `partitions` partitions each.
    pub fn new(partitions: usize) -> Self {
        Self::with_retention(partitions, DEFAULT_RETENTION)
    }

    /// Creates a broker keeping at most `retention` records per partition.
    pub fn with_retention(partitions: usize, retention: usize) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                retention: retention.max(1),
                state: Mutex::new(State::default()),
                changes,
                next_member: AtomicU64::new(1),
            }),
        }
    }

    /// Returns the partition a key is routed to.
    pub fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.inner.partitions as u64) as i32
    }

    /// Adds a member to `group`, triggering a rebalance of its existing members.
    pub fn consumer_group(
        &self,
        group: &str,
        initial_offset: InitialOffset,
    ) -> MemoryConsumerGroup {
        let member = self.inner.next_member.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.inner.lock();
            let entry = state.groups.entry(group.to_string()).or_default();
            entry.members.push(member);
            entry.generation += 1;
        }
        self.inner.notify();
        info!("Member {} joined group {}", member, group);

        MemoryConsumerGroup {
            broker: self.clone(),
            group: group.to_string(),
            member,
            initial_offset,
        }
    }

    /// Number of records retained in a partition.
    pub fn partition_len(&self, topic: &str, partition: i32) -> usize {
        let state = self.inner.lock();
        state
            .topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .map_or(0, |log| log.records.len())
    }

    /// Next offset the group will read from a partition, once it has claimed it.
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        let state = self.inner.lock();
        state
            .groups
            .get(group)
            .and_then(|g| g.committed.get(&(topic.to_string(), partition)))
            .copied()
    }

    /// Closes the broker: sends fail and every session ends with an error.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.inner.notify();
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        let partition = self.partition_for(key);
        {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(Error::Closed("memory broker"));
            }
            let retention = self.inner.retention;
            let log = &mut self.inner.topic(&mut state, topic)[partition as usize];
            log.records.push_back(Record {
                key: key.to_string(),
                payload: payload.to_vec(),
            });
            if log.records.len() > retention {
                let excess = log.base + (log.records.len() - retention) as i64;
                log.trim_to(excess);
            }
        }
        self.inner.notify();
        Ok(())
    }
}

/// One member of a consumer group on a [`MemoryBroker`].
///
/// Dropping the member removes it from the group and rebalances the rest.
pub struct MemoryConsumerGroup {
    broker: MemoryBroker,
    group: String,
    member: u64,
    initial_offset: InitialOffset,
}

impl MemoryConsumerGroup {
    fn assignment(&self, state: &State) -> Option<(u64, Vec<i32>)> {
        let group = state.groups.get(&self.group)?;
        let index = group.members.iter().position(|m| *m == self.member)?;
        let members = group.members.len();
        let partitions = (0..self.broker.inner.partitions)
            .filter(|p| p % members == index)
            .map(|p| p as i32)
            .collect();
        Some((group.generation, partitions))
    }

    /// Resolves where this session starts reading each claimed partition.
    ///
    /// Runs under the state lock so nothing appended after `join` returns
    /// can fall before the starting offset.
    fn start_offsets(&self, state: &mut State, topic: &str, partitions: &[i32]) -> Vec<(i32, i64)> {
        let log: Vec<(i64, i64)> = self
            .broker
            .inner
            .topic(state, topic)
            .iter()
            .map(|partition| (partition.base, partition.end()))
            .collect();

        let Some(group) = state.groups.get_mut(&self.group) else {
            return Vec::new();
        };
        partitions
            .iter()
            .map(|&partition| {
                let (base, end) = log[partition as usize];
                let initial = match self.initial_offset {
                    InitialOffset::Oldest => base,
                    InitialOffset::Newest => end,
                };
                let committed = group
                    .committed
                    .entry((topic.to_string(), partition))
                    .or_insert(initial);
                *committed = (*committed).max(base);
                (partition, *committed)
            })
            .collect()
    }
}

impl Drop for MemoryConsumerGroup {
    fn drop(&mut self) {
        {
            let mut state = self.broker.inner.lock();
            if let Some(group) = state.groups.get_mut(&self.group) {
                group.members.retain(|m| *m != self.member);
                group.generation += 1;
            }
        }
        self.broker.inner.notify();
    }
}

#[async_trait]
impl ConsumerGroup for MemoryConsumerGroup {
    async fn join(&self, topic: &str) -> Result<Session> {
        let inner = &self.broker.inner;
        let (generation, starts) = {
            let mut state = inner.lock();
            if state.closed {
                return Err(Error::Closed("memory broker"));
            }
            let (generation, partitions) = self.assignment(&state).ok_or_else(|| {
                Error::Broker(format!("member {} left group {}", self.member, self.group))
            })?;
            (generation, self.start_offsets(&mut state, topic, &partitions))
        };
        debug!(
            "Member {} of {} claims {:?} (generation {})",
            self.member, self.group, starts, generation
        );

        let (claims_tx, claims_rx) = mpsc::channel(starts.len() + 1);
        let marker: Arc<dyn OffsetMarker> = Arc::new(MemoryMarker {
            inner: inner.clone(),
            group: self.group.clone(),
        });

        for (partition, start) in starts {
            let (tx, rx) = mpsc::channel(CLAIM_BUFFER);
            let feed = Feed {
                inner: inner.clone(),
                group: self.group.clone(),
                topic: topic.to_string(),
                partition,
                generation,
                start,
            };
            tokio::spawn(feed.run(tx));
            // Capacity covers every claim, so this cannot block.
            let _ = claims_tx.try_send(Ok(Claim::new(partition, rx, marker.clone())));
        }

        tokio::spawn(watch_session(
            inner.clone(),
            self.group.clone(),
            generation,
            claims_tx,
        ));

        Ok(Session::new(claims_rx))
    }
}

/// Holds the session open until the group rebalances or the broker closes.
async fn watch_session(
    inner: Arc<Inner>,
    group: String,
    generation: u64,
    claims: mpsc::Sender<Result<Claim>>,
) {
    let mut changes = inner.changes.subscribe();
    loop {
        changes.borrow_and_update();
        let (closed, current) = {
            let state = inner.lock();
            let current = state.groups.get(&group).map(|g| g.generation);
            (state.closed, current)
        };
        if closed {
            let _ = claims.send(Err(Error::Closed("memory broker"))).await;
            return;
        }
        if current != Some(generation) {
            return;
        }

        tokio::select! {
            _ = claims.closed() => return,
            changed = changes.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

/// Copies one partition into a claim's channel from a fixed starting offset.
struct Feed {
    inner: Arc<Inner>,
    group: String,
    topic: String,
    partition: i32,
    generation: u64,
    start: i64,
}

impl Feed {
    async fn run(self, tx: mpsc::Sender<Delivery>) {
        let mut changes = self.inner.changes.subscribe();
        let mut cursor = self.start;

        loop {
            changes.borrow_and_update();
            let next = {
                let state = self.inner.lock();
                let Some(group) = state.groups.get(&self.group) else {
                    return;
                };
                if state.closed || group.generation != self.generation {
                    return;
                }
                let Some(log) = state
                    .topics
                    .get(&self.topic)
                    .and_then(|partitions| partitions.get(self.partition as usize))
                else {
                    return;
                };
                if cursor < log.base {
                    warn!(
                        "Records {}..{} of {}/{} expired before group {} read them",
                        cursor, log.base, self.topic, self.partition, self.group
                    );
                    cursor = log.base;
                }
                log.get(cursor).map(|record| Delivery {
                    topic: self.topic.clone(),
                    partition: self.partition,
                    offset: cursor,
                    key: Some(record.key.clone()),
                    payload: record.payload.clone(),
                })
            };

            match next {
                Some(delivery) => {
                    if tx.send(delivery).await.is_err() {
                        return;
                    }
                    cursor += 1;
                }
                None => {
                    tokio::select! {
                        _ = tx.closed() => return,
                        changed = changes.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

struct MemoryMarker {
    inner: Arc<Inner>,
    group: String,
}

impl OffsetMarker for MemoryMarker {
    fn mark(&self, delivery: &Delivery) {
        let mut state = self.inner.lock();
        let Some(group) = state.groups.get_mut(&self.group) else {
            return;
        };
        let next = delivery.offset + 1;
        let committed = group
            .committed
            .entry((delivery.topic.clone(), delivery.partition))
            .or_insert(next);
        *committed = (*committed).max(next);
        state.release(&delivery.topic, delivery.partition);
    }
}
