//! Kafka backend built on `rdkafka`.
//!
//! The client library owns connection management, partition assignment and
//! offset commits. Offsets are stored only when the pipeline marks a message,
//! and committed in the background.
//!
//! The client hands out one stream for all partitions. It is split into one
//! forwarding task per partition so a slow claim only holds back its own
//! partition: once its backlog grows the partition is paused at the client
//! and resumed when the claim catches up.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::BorrowedMessage;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Message, TopicPartitionList};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    Claim, ConsumerGroup, Delivery, InitialOffset, OffsetMarker, Session, Transport, CLAIM_BUFFER,
};
use crate::{Error, Result};

/// How long a send may wait in the client queue before it counts as failed.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Queued deliveries at which a partition is paused.
const PAUSE_AT: usize = CLAIM_BUFFER * 4;

/// Queued deliveries at which a paused partition is resumed.
const RESUME_AT: usize = CLAIM_BUFFER;

/// How often the dispatcher looks for revoked partitions.
const ASSIGNMENT_CHECK: Duration = Duration::from_secs(1);

/// Kafka producer.
pub struct KafkaTransport {
    producer: FutureProducer,
}

impl KafkaTransport {
    /// Creates a producer for the given bootstrap brokers.
    ///
    /// Client-side retries are disabled; the publisher retries failed sends.
    pub fn connect(brokers: &[String]) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("acks", "1")
            .set("message.send.max.retries", "0")
            .create()?;
        info!("Kafka producer created for {}", brokers.join(","));
        Ok(Self { producer })
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        let record = FutureRecord::to(topic).key(key).payload(payload);
        self.producer
            .send(record, Timeout::After(SEND_TIMEOUT))
            .await
            .map(|_| ())
            .map_err(|(e, _)| Error::Kafka(e))
    }
}

/// Kafka consumer group member.
pub struct KafkaConsumerGroup {
    brokers: String,
    group: String,
    initial_offset: InitialOffset,
}

impl KafkaConsumerGroup {
    /// Describes a group member; the client is created on every join.
    pub fn new(brokers: &[String], group: &str, initial_offset: InitialOffset) -> Self {
        Self {
            brokers: brokers.join(","),
            group: group.to_string(),
            initial_offset,
        }
    }
}

#[async_trait]
impl ConsumerGroup for KafkaConsumerGroup {
    async fn join(&self, topic: &str) -> Result<Session> {
        let reset = match self.initial_offset {
            InitialOffset::Oldest => "earliest",
            InitialOffset::Newest => "latest",
        };
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group)
            .set("partition.assignment.strategy", "roundrobin")
            .set("auto.offset.reset", reset)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .create()?;
        consumer.subscribe(&[topic])?;
        info!("Joined consumer group {} for topic {}", self.group, topic);

        let (claims_tx, claims_rx) = mpsc::channel(16);
        tokio::spawn(dispatch(Arc::new(consumer), claims_tx));
        Ok(Session::new(claims_rx))
    }
}

fn to_delivery(message: &BorrowedMessage<'_>) -> Delivery {
    Delivery {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message
            .key()
            .map(|key| String::from_utf8_lossy(key).into_owned()),
        payload: message.payload().unwrap_or_default().to_vec(),
    }
}

/// Stops and restarts fetching for a set of partitions.
trait FlowControl: Send + Sync {
    fn pause_partitions(&self, list: &TopicPartitionList) -> KafkaResult<()>;
    fn resume_partitions(&self, list: &TopicPartitionList) -> KafkaResult<()>;
}

impl FlowControl for StreamConsumer {
    fn pause_partitions(&self, list: &TopicPartitionList) -> KafkaResult<()> {
        Consumer::pause(self, list)
    }

    fn resume_partitions(&self, list: &TopicPartitionList) -> KafkaResult<()> {
        Consumer::resume(self, list)
    }
}

/// Flow control for one partition, shared by the dispatcher and its forwarder.
struct PartitionFlow {
    control: Arc<dyn FlowControl>,
    topic: String,
    partition: i32,
    backlog: AtomicUsize,
    paused: AtomicBool,
}

impl PartitionFlow {
    fn new(control: Arc<dyn FlowControl>, topic: &str, partition: i32) -> Self {
        Self {
            control,
            topic: topic.to_string(),
            partition,
            backlog: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
        }
    }

    fn list(&self) -> TopicPartitionList {
        let mut list = TopicPartitionList::new();
        list.add_partition(&self.topic, self.partition);
        list
    }

    /// Counts a queued delivery, pausing the partition once the backlog is high.
    fn queued(&self) {
        let backlog = self.backlog.fetch_add(1, Ordering::SeqCst) + 1;
        if backlog >= PAUSE_AT && !self.paused.swap(true, Ordering::SeqCst) {
            match self.control.pause_partitions(&self.list()) {
                Ok(()) => debug!("Paused partition {} at {} queued", self.partition, backlog),
                Err(e) => warn!("Failed to pause partition {}: {}", self.partition, e),
            }
        }
    }

    /// Counts a forwarded delivery, resuming the partition once it has caught up.
    fn forwarded(&self) {
        let backlog = self.backlog.fetch_sub(1, Ordering::SeqCst) - 1;
        if backlog <= RESUME_AT {
            self.resume();
        }
    }

    fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            match self.control.resume_partitions(&self.list()) {
                Ok(()) => debug!("Resumed partition {}", self.partition),
                Err(e) => warn!("Failed to resume partition {}: {}", self.partition, e),
            }
        }
    }
}

/// Dispatcher-side handle of a partition's forwarding task.
struct Forwarder {
    queue: mpsc::UnboundedSender<Delivery>,
    flow: Arc<PartitionFlow>,
    revoked: CancellationToken,
}

impl Forwarder {
    fn spawn(flow: PartitionFlow, claim: mpsc::Sender<Delivery>) -> Self {
        let (queue, pending) = mpsc::unbounded_channel();
        let flow = Arc::new(flow);
        let revoked = CancellationToken::new();
        tokio::spawn(forward(pending, claim, flow.clone(), revoked.clone()));
        Self {
            queue,
            flow,
            revoked,
        }
    }

    /// Queues a delivery; false once the forwarding task is gone.
    fn push(&self, delivery: Delivery) -> bool {
        self.flow.queued();
        self.queue.send(delivery).is_ok()
    }
}

/// Moves one partition's deliveries into its claim until revoked or released.
async fn forward(
    mut pending: mpsc::UnboundedReceiver<Delivery>,
    claim: mpsc::Sender<Delivery>,
    flow: Arc<PartitionFlow>,
    revoked: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = revoked.cancelled() => break,
            delivery = pending.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };
        let sent = tokio::select! {
            biased;
            _ = revoked.cancelled() => break,
            sent = claim.send(delivery) => sent,
        };
        if sent.is_err() {
            break;
        }
        flow.forwarded();
    }
    // Dropping `claim` ends the claim; a paused partition must not stay paused.
    flow.resume();
    debug!("Released partition {}", flow.partition);
}

/// Routes the consumer's single stream into one claim per partition.
async fn dispatch(consumer: Arc<StreamConsumer>, claims: mpsc::Sender<Result<Claim>>) {
    let marker: Arc<dyn OffsetMarker> = Arc::new(KafkaMarker {
        consumer: consumer.clone(),
    });
    let mut partitions: HashMap<i32, Forwarder> = HashMap::new();
    let mut assignment_check = tokio::time::interval(ASSIGNMENT_CHECK);

    loop {
        let received = tokio::select! {
            _ = claims.closed() => break,
            _ = assignment_check.tick() => {
                release_revoked(&consumer, &mut partitions);
                continue;
            }
            received = consumer.recv() => received.map(|message| to_delivery(&message)),
        };

        let delivery = match received {
            Ok(delivery) => delivery,
            Err(e) => {
                let _ = claims.send(Err(Error::Kafka(e))).await;
                break;
            }
        };

        let partition = delivery.partition;
        let forwarder = match partitions.entry(partition) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let (tx, rx) = mpsc::channel(CLAIM_BUFFER);
                debug!("Claimed partition {}", partition);
                if claims
                    .send(Ok(Claim::new(partition, rx, marker.clone())))
                    .await
                    .is_err()
                {
                    break;
                }
                let flow = PartitionFlow::new(consumer.clone(), &delivery.topic, partition);
                entry.insert(Forwarder::spawn(flow, tx))
            }
        };

        if !forwarder.push(delivery) {
            // The processing loop is gone; the next message reopens the claim.
            partitions.remove(&partition);
        }
    }

    for forwarder in partitions.values() {
        forwarder.revoked.cancel();
    }
}

/// Ends the claims of partitions the group no longer assigns to this member.
fn release_revoked(consumer: &StreamConsumer, partitions: &mut HashMap<i32, Forwarder>) {
    let assigned: HashSet<i32> = match consumer.assignment() {
        Ok(list) => list.elements().iter().map(|elem| elem.partition()).collect(),
        Err(e) => {
            warn!("Failed to read partition assignment: {}", e);
            return;
        }
    };
    partitions.retain(|partition, forwarder| {
        let keep = assigned.contains(partition);
        if !keep {
            debug!("Partition {} revoked", partition);
            forwarder.revoked.cancel();
        }
        keep
    });
}

struct KafkaMarker {
    consumer: Arc<StreamConsumer>,
}

impl OffsetMarker for KafkaMarker {
    fn mark(&self, delivery: &Delivery) {
        if let Err(e) =
            self.consumer
                .store_offset(&delivery.topic, delivery.partition, delivery.offset + 1)
        {
            warn!(
                "Failed to store offset {} for {}/{}: {}",
                delivery.offset, delivery.topic, delivery.partition, e
            );
        }
    }
}
