use std::time::Duration;

use rdkafka::consumer::{Consumer, ConsumerGroupMetadata, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use tracing::{debug, error, info};

use crate::config::Config;

/// A record read off one of the audit topics, decoupled from rdkafka's
/// borrowed message so it can outlive the poll that produced it.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
}

/// The consuming half of the coordinator: polls the audit topics one
/// record at a time under read-committed isolation, with offset commits
/// left entirely to the transactional producer.
pub struct AuditConsumer {
    consumer: StreamConsumer,
}

impl AuditConsumer {
    pub fn new(config: &Config) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("group.id", &config.consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("isolation.level", "read_committed")
            .set("auto.offset.reset", "earliest")
            .set(
                "session.timeout.ms",
                config.kafka_session_timeout_ms.to_string(),
            )
            .set(
                "max.poll.interval.ms",
                config.kafka_max_poll_interval_ms.to_string(),
            );

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka consumer configuration: {:?}", client_config);
        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[
            config.methods_topic.as_str(),
            config.requests_topic.as_str(),
        ])?;

        Ok(Self { consumer })
    }

    /// Receive the next record. At most one record is in flight per call,
    /// which keeps the exactly-once unit at one record per transaction.
    pub async fn recv(&self) -> Result<RawRecord, KafkaError> {
        let message = self.consumer.recv().await?;

        Ok(RawRecord {
            topic: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
            key: message
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            payload: message.payload().map(|p| p.to_vec()).unwrap_or_default(),
            timestamp: message.timestamp().to_millis(),
        })
    }

    pub fn group_metadata(&self) -> Option<ConsumerGroupMetadata> {
        self.consumer.group_metadata()
    }
}

/// The producing half of the coordinator: a producer bound to a stable
/// transactional id, used to bracket dead-letter sends and the offset
/// commit in one transaction.
pub struct TransactionalProducer {
    inner: FutureProducer,
    timeout: Duration,
}

impl TransactionalProducer {
    pub fn from_config(config: &Config, timeout: Duration) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "5")
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set("transactional.id", config.transactional_id());

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka producer configuration: {:?}", client_config);
        let producer: FutureProducer = client_config.create()?;

        // "Ping" the Kafka brokers by requesting metadata
        match producer
            .client()
            .fetch_metadata(None, Duration::from_secs(15))
        {
            Ok(metadata) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
            }
            Err(error) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(error);
            }
        }

        // Fences any previous generation holding the same transactional id
        producer.init_transactions(timeout)?;

        Ok(TransactionalProducer {
            inner: producer,
            timeout,
        })
    }

    pub fn begin(self) -> Result<KafkaTransaction, KafkaError> {
        self.inner.begin_transaction()?;
        Ok(KafkaTransaction { producer: self })
    }
}

/// An open producer transaction. Consuming `commit` or `abort` returns the
/// producer, so the type system rules out sends outside a transaction.
pub struct KafkaTransaction {
    producer: TransactionalProducer,
}

impl KafkaTransaction {
    pub async fn send(&self, topic: &str, key: &str, payload: &str) -> Result<(), KafkaError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);
        self.producer
            .inner
            .send(record, self.producer.timeout)
            .await
            .map(|_| ())
            .map_err(|(error, _message)| error)
    }

    /// Commit `offset + 1` for the record's partition inside this
    /// transaction, making offset advancement atomic with any dead-letter
    /// publication for consumers running under read-committed isolation.
    pub fn commit_offset(
        &self,
        group_metadata: &ConsumerGroupMetadata,
        record: &RawRecord,
    ) -> Result<(), KafkaError> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &record.topic,
            record.partition,
            Offset::Offset(record.offset + 1),
        )?;
        self.producer.inner.send_offsets_to_transaction(
            &offsets,
            group_metadata,
            self.producer.timeout,
        )
    }

    pub fn commit(self) -> Result<TransactionalProducer, KafkaError> {
        self.producer
            .inner
            .commit_transaction(self.producer.timeout)?;
        Ok(self.producer)
    }

    pub fn abort(self) -> Result<TransactionalProducer, KafkaError> {
        self.producer
            .inner
            .abort_transaction(self.producer.timeout)?;
        Ok(self.producer)
    }
}
