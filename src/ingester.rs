use std::{collections::HashMap, time::Duration};

use anyhow::Context;
use rdkafka::{
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::KafkaResult,
    ClientConfig, Offset, TopicPartitionList,
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    pipeline::{Pipeline, PipelineError, RawMessage},
    record::Record,
    settings,
    sink::{SinkError, Store},
};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Next offset to commit per topic partition
#[derive(Default, Debug)]
pub struct OffsetTracker {
    offsets: HashMap<(String, i32), i64>,
}

impl OffsetTracker {
    /// Marks message at `offset` as done. Commits point to the _next_ message, as per
    /// https://docs.rs/rdkafka/latest/rdkafka/consumer/trait.Consumer.html#tymethod.commit
    pub fn track(&mut self, topic: &str, partition: i32, offset: i64) {
        let next = offset + 1;
        self.offsets
            .entry((topic.to_owned(), partition))
            .and_modify(|o| *o = (*o).max(next))
            .or_insert(next);
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn to_list(&self) -> KafkaResult<TopicPartitionList> {
        let map = self
            .offsets
            .iter()
            .map(|(k, o)| (k.clone(), Offset::Offset(*o)))
            .collect::<HashMap<_, _>>();
        TopicPartitionList::from_topic_map(&map)
    }
}

/// Message that must be consumed again once the current batch is stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redelivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// What became of a consumed message
#[derive(Debug)]
pub enum Admission {
    Added,
    Skipped(String),
    Redeliver(PipelineError),
}

/// Records collected for one insert, with the offsets to commit once they are stored
#[derive(Default, Debug)]
pub struct Batch {
    records: Vec<Record>,
    offsets: OffsetTracker,
    redelivery: Option<Redelivery>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn offsets(&self) -> &OffsetTracker {
        &self.offsets
    }

    pub fn redelivery(&self) -> Option<&Redelivery> {
        self.redelivery.as_ref()
    }

    /// Accounts for the outcome of processing `msg`.
    /// Records the store cannot encode are skipped like undecodable messages. A failure
    /// not caused by the message ends the batch: its offset stays untracked and the
    /// message becomes the redelivery target.
    pub fn admit(
        &mut self,
        msg: &RawMessage,
        res: Result<Record, PipelineError>,
        store: &Store,
    ) -> Admission {
        let admission = match res {
            Ok(record) => match store.validate(&record) {
                Ok(()) => {
                    self.records.push(record);
                    Admission::Added
                }
                Err(e) => Admission::Skipped(e.to_string()),
            },
            Err(e) if e.is_skippable() => Admission::Skipped(e.to_string()),
            Err(e) => {
                self.redelivery = Some(Redelivery {
                    topic: msg.topic.clone(),
                    partition: msg.partition,
                    offset: msg.offset,
                });
                return Admission::Redeliver(e);
            }
        };
        self.offsets.track(&msg.topic, msg.partition, msg.offset);
        admission
    }
}

/// Outcome of storing a batch
#[derive(Debug)]
pub enum Flush {
    Stored,
    Cancelled,
    Failed(SinkError),
}

/// Inserts records, retrying with backoff while the store is unavailable.
/// Any other store error is returned as is.
pub async fn flush(
    store: &Store,
    records: &[Record],
    backoff: Duration,
    cancel: &CancellationToken,
) -> Flush {
    loop {
        match store.insert(records, cancel).await {
            Ok(()) => return Flush::Stored,
            Err(SinkError::Cancelled) => return Flush::Cancelled,
            Err(e) if e.is_transient() => {
                warn!(
                    store = store.name(),
                    pending = records.len(),
                    "inserting batch, will retry: {e}"
                );
                if !pause(backoff, cancel).await {
                    return Flush::Cancelled;
                }
            }
            Err(e) => return Flush::Failed(e),
        }
    }
}

/// Sleeps for backoff interval, false if cancelled meanwhile
async fn pause(backoff: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(backoff) => true,
    }
}

/// Consumes single topic, decodes messages and stores them in batches.
/// Offsets are committed only after the batch is stored.
pub struct Ingester {
    name: String,
    batch_size: usize,
    batch_timeout: Duration,
    backoff: Duration,
    consumer: StreamConsumer,
    pipeline: Pipeline,
    store: Store,
    cancel: CancellationToken,
}

impl Ingester {
    pub fn new(
        name: &str,
        cfg: &settings::Ingester,
        pipeline: Pipeline,
        store: Store,
        cancel: CancellationToken,
    ) -> Result<Ingester, anyhow::Error> {
        let group = cfg.consumer_group.as_deref().unwrap_or(name);
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", group)
            .set("bootstrap.servers", &cfg.kafka_broker)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .context("creating kafka consumer")?;
        consumer
            .subscribe(&[cfg.topic.as_str()])
            .with_context(|| format!("subscribing to {}", cfg.topic))?;

        Ok(Ingester {
            name: name.to_owned(),
            batch_size: cfg.batch_size.unwrap_or(1000),
            batch_timeout: Duration::from_secs(cfg.batch_timeout_seconds.unwrap_or(10)),
            backoff: Duration::from_millis(cfg.insert_backoff_ms.unwrap_or(1000)),
            consumer,
            pipeline,
            store,
            cancel,
        })
    }

    /// Runs until cancelled. Fails when the store refuses a batch for good,
    /// leaving its offsets uncommitted.
    pub async fn start(&mut self) -> Result<(), anyhow::Error> {
        info!(ingester = %self.name, store = self.store.name(), "starting ingester");
        while !self.cancel.is_cancelled() {
            let batch = self.get_batch().await;
            if !batch.offsets().is_empty() {
                match flush(&self.store, batch.records(), self.backoff, &self.cancel).await {
                    Flush::Stored => {
                        debug!(ingester = %self.name, rows = batch.len(), "batch stored");
                        self.commit(batch.offsets());
                    }
                    Flush::Cancelled => {
                        info!(
                            ingester = %self.name,
                            dropped = batch.len(),
                            "ingester stopped, uncommitted messages will be redelivered"
                        );
                        return Ok(());
                    }
                    Flush::Failed(e) => {
                        return Err(anyhow::Error::new(e).context(format!(
                            "ingester {} cannot store batch of {} records",
                            self.name,
                            batch.len()
                        )));
                    }
                }
            }
            if let Some(msg) = batch.redelivery() {
                self.rewind(msg).await;
            }
        }
        info!(ingester = %self.name, "ingester stopped");
        Ok(())
    }

    fn commit(&self, offsets: &OffsetTracker) {
        match offsets.to_list() {
            Ok(tpl) => self
                .consumer
                .commit(&tpl, CommitMode::Sync)
                .unwrap_or_else(|e| error!(ingester = %self.name, "failed to commit offsets: {e}")),
            Err(e) => error!(ingester = %self.name, "building offsets list: {e}"),
        }
    }

    /// Seeks partition back to a message that failed for reasons unrelated to its content
    async fn rewind(&self, msg: &Redelivery) {
        if let Err(e) = self.consumer.seek(
            &msg.topic,
            msg.partition,
            Offset::Offset(msg.offset),
            SEEK_TIMEOUT,
        ) {
            error!(ingester = %self.name, "seeking back to offset {}: {e}", msg.offset);
        }
        pause(self.backoff, &self.cancel).await;
    }

    /// Collects decoded records until batch is full or timeout passes.
    /// Stops early on a failure that is not caused by the message itself.
    async fn get_batch(&mut self) -> Batch {
        let mut batch = Batch::default();
        let deadline = tokio::time::Instant::now() + self.batch_timeout;
        while batch.len() < self.batch_size {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = tokio::time::timeout_at(deadline, self.consumer.recv()) => match res {
                    Err(_) => break,
                    Ok(Err(e)) => {
                        warn!(ingester = %self.name, "error receiving message: {e}");
                        break;
                    }
                    Ok(Ok(msg)) => RawMessage::from_kafka(&msg),
                },
            };
            let res = self.pipeline.process(&msg, &self.cancel).await;
            match batch.admit(&msg, res, &self.store) {
                Admission::Added => {}
                Admission::Skipped(reason) => warn!(
                    ingester = %self.name,
                    topic = %msg.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    "skipping message: {reason}"
                ),
                Admission::Redeliver(e) => {
                    error!(
                        ingester = %self.name,
                        offset = msg.offset,
                        "failed to decode message, will retry: {e}"
                    );
                    break;
                }
            }
        }
        batch
    }
}
