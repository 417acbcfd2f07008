use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use rdkafka::consumer::ConsumerGroupMetadata;
use rdkafka::error::KafkaError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use audit_common::event::{parse_event, TypedEvent};
use audit_common::health::HealthHandle;
use audit_common::retry::RetryPolicy;

use crate::config::Config;
use crate::error::{FailureKind, StoreError, WorkerError};
use crate::kafka::{AuditConsumer, KafkaTransaction, RawRecord, TransactionalProducer};
use crate::sinks::{LogStore, Provenance, WriteOutcome};

/// Why a record could not be ingested.
#[derive(Debug)]
pub enum IngestFailure {
    /// Terminal for the record: publish it to the dead-letter topic and
    /// commit its offset, it is considered handled.
    DeadLetter { reason: String },
    /// Terminal for the worker.
    Fatal(StoreError),
}

/// The classify → deserialize → guard → write portion of the pipeline,
/// kept free of any broker concern so it can be driven directly in tests.
pub struct Ingestor {
    store: Box<dyn LogStore>,
    retry_policy: RetryPolicy,
}

impl Ingestor {
    pub fn new(store: Box<dyn LogStore>, retry_policy: RetryPolicy) -> Self {
        Self {
            store,
            retry_policy,
        }
    }

    /// Ingest one record: parse it, then attempt the idempotent write,
    /// backing off on transient store failures until the retry budget is
    /// spent.
    pub async fn ingest(&self, record: &RawRecord) -> Result<WriteOutcome, IngestFailure> {
        debug!(
            topic = record.topic,
            partition = record.partition,
            offset = record.offset,
            "processing message"
        );

        let event = match parse_event(&record.payload) {
            Ok(event) => event,
            Err(error) => {
                warn!(
                    topic = record.topic,
                    offset = record.offset,
                    "failed to classify or deserialize message: {error}"
                );
                return Err(IngestFailure::DeadLetter {
                    reason: error.to_string(),
                });
            }
        };

        let provenance = Provenance {
            topic: &record.topic,
            partition: record.partition,
            offset: record.offset,
        };

        let mut failed_attempts: u32 = 0;
        loop {
            let result = match &event {
                TypedEvent::Method(method) => {
                    self.store.write_method_audit(method, provenance).await
                }
                TypedEvent::Http(http) => self.store.write_http_audit(http, provenance).await,
            };

            match result {
                Ok(outcome) => {
                    let kind = event.kind().to_string();
                    match outcome {
                        WriteOutcome::Written => {
                            counter!("audit_messages_ingested_total", "kind" => kind)
                                .increment(1);
                        }
                        WriteOutcome::AlreadyPresent => {
                            counter!("audit_messages_duplicate_total", "kind" => kind)
                                .increment(1);
                        }
                    }
                    return Ok(outcome);
                }
                Err(store_error) => match store_error.failure_kind() {
                    FailureKind::Fatal => return Err(IngestFailure::Fatal(store_error)),
                    FailureKind::Record => {
                        warn!(
                            message_id = event.message_id(),
                            "persist failed, routing to dead-letter topic: {store_error}"
                        );
                        return Err(IngestFailure::DeadLetter {
                            reason: store_error.to_string(),
                        });
                    }
                    FailureKind::Transient => {
                        failed_attempts += 1;
                        if !self.retry_policy.should_retry(failed_attempts) {
                            warn!(
                                message_id = event.message_id(),
                                attempts = failed_attempts,
                                "retries exhausted, routing to dead-letter topic: {store_error}"
                            );
                            return Err(IngestFailure::DeadLetter {
                                reason: store_error.to_string(),
                            });
                        }
                        counter!("audit_write_retries_total").increment(1);
                        warn!(
                            message_id = event.message_id(),
                            attempt = failed_attempts,
                            "transient store failure, backing off: {store_error}"
                        );
                        tokio::time::sleep(self.retry_policy.backoff()).await;
                    }
                },
            }
        }
    }
}

/// The dead-letter payload carries the original message verbatim so it can
/// be replayed manually.
pub fn dead_letter_payload(record: &RawRecord, reason: &str) -> String {
    format!(
        "Parsing or validation error: {}, {}",
        String::from_utf8_lossy(&record.payload),
        reason
    )
}

/// The top-level pipeline: polls one record at a time, runs it through the
/// `Ingestor`, then settles it inside a producer transaction bracketing
/// any dead-letter publication together with the offset commit.
pub struct PipelineWorker {
    consumer: AuditConsumer,
    // Taken for the duration of each transaction and put back on commit or
    // abort.
    producer: Option<TransactionalProducer>,
    ingestor: Ingestor,
    retry_policy: RetryPolicy,
    dlq_topic: String,
    poll_timeout: Duration,
    liveness: HealthHandle,
}

impl PipelineWorker {
    pub fn new(
        consumer: AuditConsumer,
        producer: TransactionalProducer,
        store: Box<dyn LogStore>,
        config: &Config,
        liveness: HealthHandle,
    ) -> Self {
        let retry_policy = RetryPolicy::new(config.retry_attempts, config.retry_backoff.0);

        Self {
            consumer,
            producer: Some(producer),
            ingestor: Ingestor::new(store, retry_policy),
            retry_policy,
            dlq_topic: config.dlq_topic.clone(),
            poll_timeout: config.poll_timeout.0,
            liveness,
        }
    }

    /// Run this worker until `shutdown` resolves. The in-flight record is
    /// always settled before the loop exits; dropping the producer closes
    /// it, which fences this transactional id's generation.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<(), WorkerError> {
        tokio::pin!(shutdown);

        loop {
            self.liveness.report_healthy();

            tokio::select! {
                _ = &mut shutdown => {
                    info!("stopped polling, shutting down");
                    break;
                }
                polled = tokio::time::timeout(self.poll_timeout, self.consumer.recv()) => {
                    match polled {
                        // Idle tick, loop around to report liveness
                        Err(_elapsed) => continue,
                        Ok(Err(error)) => {
                            warn!("kafka poll failed: {error}");
                            continue;
                        }
                        Ok(Ok(record)) => self.process(record).await?,
                    }
                }
            }
        }

        Ok(())
    }

    async fn process(&mut self, record: RawRecord) -> Result<(), WorkerError> {
        let started = Instant::now();

        let dlq_payload = match self.ingestor.ingest(&record).await {
            Ok(_) => None,
            Err(IngestFailure::Fatal(store_error)) => {
                error!("unrecoverable store failure: {store_error}");
                return Err(store_error.into());
            }
            Err(IngestFailure::DeadLetter { reason }) => {
                Some(dead_letter_payload(&record, &reason))
            }
        };

        self.settle(&record, dlq_payload).await?;

        histogram!("audit_record_processing_seconds").record(started.elapsed().as_secs_f64());
        Ok(())
    }

    /// Open a producer transaction bracketing the optional dead-letter
    /// publication and the offset commit, so that consumers under
    /// read-committed isolation observe both or neither. Attempts that
    /// abort cleanly are retried on the same budget the store writes use.
    async fn settle(
        &mut self,
        record: &RawRecord,
        dlq_payload: Option<String>,
    ) -> Result<(), WorkerError> {
        let group_metadata = self
            .consumer
            .group_metadata()
            .ok_or(WorkerError::NoGroupMetadata)?;

        let mut settle = ProducerSettle {
            producer: &mut self.producer,
            dlq_topic: &self.dlq_topic,
            group_metadata: &group_metadata,
        };
        settle_with_retries(&mut settle, &self.retry_policy, record, dlq_payload.as_deref())
            .await?;

        if dlq_payload.is_some() {
            counter!("audit_dlq_messages_total").increment(1);
            warn!(
                topic = record.topic,
                offset = record.offset,
                "routed message to dead-letter topic"
            );
        }
        Ok(())
    }

    async fn settle_in_txn(
        txn: &KafkaTransaction,
        dlq_topic: &str,
        record: &RawRecord,
        group_metadata: &ConsumerGroupMetadata,
        dlq_payload: Option<&str>,
    ) -> Result<(), KafkaError> {
        if let Some(payload) = dlq_payload {
            txn.send(dlq_topic, &Uuid::new_v4().to_string(), payload)
                .await?;
        }
        txn.commit_offset(group_metadata, record)
    }
}

/// How a settlement attempt ended when it did not commit.
enum SettleError {
    /// The transaction aborted cleanly; the producer can try again.
    Aborted(KafkaError),
    /// The producer is no longer usable.
    Broken(KafkaError),
}

/// One settlement attempt, everything between `begin` and `commit`.
#[async_trait]
trait SettleAttempt {
    async fn attempt(
        &mut self,
        record: &RawRecord,
        dlq_payload: Option<&str>,
    ) -> Result<(), SettleError>;
}

struct ProducerSettle<'a> {
    producer: &'a mut Option<TransactionalProducer>,
    dlq_topic: &'a str,
    group_metadata: &'a ConsumerGroupMetadata,
}

#[async_trait]
impl SettleAttempt for ProducerSettle<'_> {
    async fn attempt(
        &mut self,
        record: &RawRecord,
        dlq_payload: Option<&str>,
    ) -> Result<(), SettleError> {
        let producer = self
            .producer
            .take()
            .expect("producer is returned after every transaction");
        let txn = producer.begin().map_err(SettleError::Broken)?;

        let result = PipelineWorker::settle_in_txn(
            &txn,
            self.dlq_topic,
            record,
            self.group_metadata,
            dlq_payload,
        )
        .await;

        match result {
            Ok(()) => {
                *self.producer = Some(txn.commit().map_err(SettleError::Broken)?);
                Ok(())
            }
            Err(error) => {
                warn!(
                    topic = record.topic,
                    offset = record.offset,
                    "aborting transaction: {error}"
                );
                *self.producer = Some(txn.abort().map_err(SettleError::Broken)?);
                Err(SettleError::Aborted(error))
            }
        }
    }
}

/// Drive settlement attempts: one that aborted cleanly is retried after
/// the fixed backoff until the budget runs out, anything that left the
/// producer unusable propagates immediately.
async fn settle_with_retries(
    settle: &mut dyn SettleAttempt,
    retry_policy: &RetryPolicy,
    record: &RawRecord,
    dlq_payload: Option<&str>,
) -> Result<(), KafkaError> {
    let mut failed_attempts: u32 = 0;
    loop {
        match settle.attempt(record, dlq_payload).await {
            Ok(()) => return Ok(()),
            Err(SettleError::Broken(error)) => return Err(error),
            Err(SettleError::Aborted(error)) => {
                failed_attempts += 1;
                if !retry_policy.should_retry(failed_attempts) {
                    warn!(
                        topic = record.topic,
                        offset = record.offset,
                        attempts = failed_attempts,
                        "settlement retries exhausted: {error}"
                    );
                    return Err(error);
                }
                counter!("audit_settle_retries_total").increment(1);
                warn!(
                    topic = record.topic,
                    offset = record.offset,
                    attempt = failed_attempts,
                    "transaction aborted, backing off: {error}"
                );
                tokio::time::sleep(retry_policy.backoff()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::json;

    use audit_common::event::{HttpAuditEvent, MethodAuditEvent};

    #[derive(Debug, Clone)]
    struct StoredRecord {
        message_id: String,
        event: TypedEvent,
        topic: String,
        offset: i64,
    }

    /// In-memory double for `LogStore`, unique on message_id, optionally
    /// failing its first N write attempts with a transient error.
    struct MemoryStore {
        records: Arc<Mutex<Vec<StoredRecord>>>,
        transient_failures: AtomicU32,
    }

    impl MemoryStore {
        fn new(records: Arc<Mutex<Vec<StoredRecord>>>) -> Self {
            Self {
                records,
                transient_failures: AtomicU32::new(0),
            }
        }

        fn failing_first(records: Arc<Mutex<Vec<StoredRecord>>>, failures: u32) -> Self {
            Self {
                records,
                transient_failures: AtomicU32::new(failures),
            }
        }

        fn write(
            &self,
            message_id: &str,
            event: TypedEvent,
            provenance: Provenance<'_>,
        ) -> Result<WriteOutcome, StoreError> {
            if self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }

            let mut records = self.records.lock().unwrap();
            if records.iter().any(|r| r.message_id == message_id) {
                return Ok(WriteOutcome::AlreadyPresent);
            }
            records.push(StoredRecord {
                message_id: message_id.to_owned(),
                event,
                topic: provenance.topic.to_owned(),
                offset: provenance.offset,
            });
            Ok(WriteOutcome::Written)
        }
    }

    #[async_trait]
    impl LogStore for MemoryStore {
        async fn write_method_audit(
            &self,
            event: &MethodAuditEvent,
            provenance: Provenance<'_>,
        ) -> Result<WriteOutcome, StoreError> {
            self.write(
                &event.message_id,
                TypedEvent::Method(event.clone()),
                provenance,
            )
        }

        async fn write_http_audit(
            &self,
            event: &HttpAuditEvent,
            provenance: Provenance<'_>,
        ) -> Result<WriteOutcome, StoreError> {
            self.write(
                &event.message_id,
                TypedEvent::Http(event.clone()),
                provenance,
            )
        }
    }

    fn record_with(payload: &[u8], offset: i64) -> RawRecord {
        RawRecord {
            topic: "audit.methods".to_owned(),
            partition: 0,
            offset,
            key: None,
            payload: payload.to_vec(),
            timestamp: Some(1_700_000_000_000),
        }
    }

    fn method_payload() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "messageId": "m1",
            "id": "11111111-1111-1111-1111-111111111111",
            "type": "START",
            "methodName": "UserService.create",
            "logLevel": "INFO",
            "timestamp": "2024-01-01T00:00:00"
        }))
        .unwrap()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn ingests_a_method_audit() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let ingestor = Ingestor::new(Box::new(MemoryStore::new(records.clone())), fast_retry());

        let outcome = ingestor
            .ingest(&record_with(&method_payload(), 0))
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::Written);
        let records = records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message_id, "m1");
        assert_eq!(records[0].topic, "audit.methods");
        assert_eq!(records[0].offset, 0);
        let TypedEvent::Method(event) = &records[0].event else {
            panic!("expected a method audit");
        };
        assert_eq!(event.event_type, "START");
        assert_eq!(event.method_name, "UserService.create");
    }

    #[tokio::test]
    async fn http_audit_fields_round_trip() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let ingestor = Ingestor::new(Box::new(MemoryStore::new(records.clone())), fast_retry());

        let payload = serde_json::to_vec(&json!({
            "messageId": "h1",
            "timestamp": "2024-01-01T00:00:00",
            "direction": "Incoming",
            "method": "POST",
            "statusCode": 201,
            "url": "/api/users",
            "requestBody": "{\"n\":1}",
            "responseBody": "{\"id\":1}"
        }))
        .unwrap();

        ingestor.ingest(&record_with(&payload, 0)).await.unwrap();

        let records = records.lock().unwrap();
        let TypedEvent::Http(event) = &records[0].event else {
            panic!("expected an http audit");
        };
        assert_eq!(event.method, "POST");
        assert_eq!(event.status_code, 201);
        assert_eq!(event.direction, "Incoming");
        assert_eq!(event.url, "/api/users");
        assert_eq!(event.request_body.as_deref(), Some("{\"n\":1}"));
        assert_eq!(event.response_body.as_deref(), Some("{\"id\":1}"));
    }

    #[tokio::test]
    async fn repeated_delivery_persists_exactly_once() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let ingestor = Ingestor::new(Box::new(MemoryStore::new(records.clone())), fast_retry());

        for offset in 0..5 {
            let outcome = ingestor
                .ingest(&record_with(&method_payload(), offset))
                .await
                .unwrap();
            if offset == 0 {
                assert_eq!(outcome, WriteOutcome::Written);
            } else {
                assert_eq!(outcome, WriteOutcome::AlreadyPresent);
            }
        }

        assert_eq!(records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_json_goes_to_dead_letter() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let ingestor = Ingestor::new(Box::new(MemoryStore::new(records.clone())), fast_retry());

        let record = record_with(b"{ invalid: json }", 0);
        let failure = ingestor.ingest(&record).await.unwrap_err();

        let IngestFailure::DeadLetter { reason } = failure else {
            panic!("expected a dead-letter failure");
        };
        let payload = dead_letter_payload(&record, &reason);
        assert!(payload.starts_with("Parsing or validation error: { invalid: json }, "));
        assert!(records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn schema_violation_goes_to_dead_letter() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let ingestor = Ingestor::new(Box::new(MemoryStore::new(records.clone())), fast_retry());

        // messageId missing: classifies fine, fails strict deserialization
        let payload = serde_json::to_vec(&json!({
            "id": "11111111-1111-1111-1111-111111111111",
            "type": "START",
            "methodName": "UserService.create",
            "logLevel": "INFO"
        }))
        .unwrap();

        let failure = ingestor.ingest(&record_with(&payload, 0)).await.unwrap_err();
        assert!(matches!(failure, IngestFailure::DeadLetter { .. }));
        assert!(records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_outage_recovers_within_retry_budget() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let store = MemoryStore::failing_first(records.clone(), 2);
        let ingestor = Ingestor::new(Box::new(store), fast_retry());

        let outcome = ingestor
            .ingest(&record_with(&method_payload(), 0))
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::Written);
        assert_eq!(records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_route_to_dead_letter() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let store = MemoryStore::failing_first(records.clone(), u32::MAX);
        let ingestor = Ingestor::new(Box::new(store), fast_retry());

        let failure = ingestor
            .ingest(&record_with(&method_payload(), 0))
            .await
            .unwrap_err();

        assert!(matches!(failure, IngestFailure::DeadLetter { .. }));
        assert!(records.lock().unwrap().is_empty());
    }

    #[test]
    fn dead_letter_payload_carries_the_original_message() {
        let record = record_with(b"not even json", 7);
        let payload = dead_letter_payload(&record, "invalid JSON: oops");
        assert_eq!(
            payload,
            "Parsing or validation error: not even json, invalid JSON: oops"
        );
    }

    /// Settlement double that aborts its first N attempts.
    struct FlakySettle {
        aborts: u32,
        attempts: u32,
        seen_payloads: Vec<Option<String>>,
    }

    impl FlakySettle {
        fn aborting_first(aborts: u32) -> Self {
            Self {
                aborts,
                attempts: 0,
                seen_payloads: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl SettleAttempt for FlakySettle {
        async fn attempt(
            &mut self,
            _record: &RawRecord,
            dlq_payload: Option<&str>,
        ) -> Result<(), SettleError> {
            self.attempts += 1;
            self.seen_payloads.push(dlq_payload.map(str::to_owned));
            if self.attempts <= self.aborts {
                Err(SettleError::Aborted(KafkaError::MessageProduction(
                    rdkafka::types::RDKafkaErrorCode::QueueFull,
                )))
            } else {
                Ok(())
            }
        }
    }

    struct BrokenSettle {
        attempts: u32,
    }

    #[async_trait]
    impl SettleAttempt for BrokenSettle {
        async fn attempt(
            &mut self,
            _record: &RawRecord,
            _dlq_payload: Option<&str>,
        ) -> Result<(), SettleError> {
            self.attempts += 1;
            Err(SettleError::Broken(KafkaError::MessageProduction(
                rdkafka::types::RDKafkaErrorCode::QueueFull,
            )))
        }
    }

    #[tokio::test]
    async fn aborted_settlement_is_retried_within_budget() {
        let mut settle = FlakySettle::aborting_first(2);
        let record = record_with(&method_payload(), 0);

        settle_with_retries(&mut settle, &fast_retry(), &record, Some("dead letter"))
            .await
            .unwrap();

        assert_eq!(settle.attempts, 3);
        // Every attempt republishes the same dead-letter payload
        assert!(settle
            .seen_payloads
            .iter()
            .all(|p| p.as_deref() == Some("dead letter")));
    }

    #[tokio::test]
    async fn settlement_retries_are_bounded() {
        let mut settle = FlakySettle::aborting_first(u32::MAX);
        let record = record_with(&method_payload(), 0);

        let error = settle_with_retries(&mut settle, &fast_retry(), &record, None)
            .await
            .unwrap_err();

        assert!(matches!(error, KafkaError::MessageProduction(_)));
        // The initial attempt plus the three retries the policy allows
        assert_eq!(settle.attempts, 4);
    }

    #[tokio::test]
    async fn unusable_producer_fails_without_retrying() {
        let mut settle = BrokenSettle { attempts: 0 };
        let record = record_with(&method_payload(), 0);

        let error = settle_with_retries(&mut settle, &fast_retry(), &record, None)
            .await
            .unwrap_err();

        assert!(matches!(error, KafkaError::MessageProduction(_)));
        assert_eq!(settle.attempts, 1);
    }
}
