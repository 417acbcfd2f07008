use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use audit_common::event::{render_args, HttpAuditEvent, MethodAuditEvent};
use audit_common::timestamp::parse_event_timestamp;

use crate::error::StoreError;
use crate::sinks::{LogStore, Provenance, WriteOutcome};

const AUDIT_LOGS_TABLE: &str = "audit_logs";
const HTTP_LOGS_TABLE: &str = "http_logs";

/// The relational variant: rows in `audit_logs` / `http_logs` with
/// provenance columns, unique on `message_id` and on
/// `(kafka_topic, kafka_partition, kafka_offset)`.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn message_exists(&self, table: &str, message_id: &str) -> Result<bool, StoreError> {
        let query = format!("SELECT EXISTS (SELECT 1 FROM {table} WHERE message_id = $1)");
        let exists: bool = sqlx::query_scalar(&query)
            .bind(message_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn offset_exists(
        &self,
        table: &str,
        provenance: Provenance<'_>,
    ) -> Result<bool, StoreError> {
        let query = format!(
            "SELECT EXISTS (SELECT 1 FROM {table} \
             WHERE kafka_topic = $1 AND kafka_partition = $2 AND kafka_offset = $3)"
        );
        let exists: bool = sqlx::query_scalar(&query)
            .bind(provenance.topic)
            .bind(provenance.partition)
            .bind(provenance.offset)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    /// Log the duplicate with enough context to tell a broker redelivery
    /// (same offset already persisted) from a producer-side duplicate.
    async fn log_duplicate(
        &self,
        table: &str,
        message_id: &str,
        provenance: Provenance<'_>,
    ) -> Result<(), StoreError> {
        if self.offset_exists(table, provenance).await? {
            warn!(
                message_id,
                topic = provenance.topic,
                partition = provenance.partition,
                offset = provenance.offset,
                "Kafka message already processed (broker redelivery)"
            );
        } else {
            warn!(message_id, "Kafka message already processed");
        }
        Ok(())
    }
}

#[async_trait]
impl LogStore for PostgresStore {
    async fn write_method_audit(
        &self,
        event: &MethodAuditEvent,
        provenance: Provenance<'_>,
    ) -> Result<WriteOutcome, StoreError> {
        debug!(
            event_id = event.event_id,
            event_type = event.event_type,
            "processing audit log"
        );

        if self
            .message_exists(AUDIT_LOGS_TABLE, &event.message_id)
            .await?
        {
            self.log_duplicate(AUDIT_LOGS_TABLE, &event.message_id, provenance)
                .await?;
            return Ok(WriteOutcome::AlreadyPresent);
        }

        let timestamp = parse_event_timestamp(event.timestamp.as_deref());
        let args = event.args.as_deref().map(render_args);

        let result = sqlx::query(
            "INSERT INTO audit_logs \
             (message_id, audit_id, type, method_name, args, result, error, log_level, \
              timestamp, kafka_topic, kafka_partition, kafka_offset) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(&event.message_id)
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(&event.method_name)
        .bind(args)
        .bind(&event.result)
        .bind(&event.error)
        .bind(&event.log_level)
        .bind(timestamp)
        .bind(provenance.topic)
        .bind(provenance.partition)
        .bind(provenance.offset)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                info!(event_id = event.event_id, "audit log saved successfully");
                Ok(WriteOutcome::Written)
            }
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                debug!(
                    offset = provenance.offset,
                    "duplicate key on insert (race), treating as already processed"
                );
                Ok(WriteOutcome::AlreadyPresent)
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn write_http_audit(
        &self,
        event: &HttpAuditEvent,
        provenance: Provenance<'_>,
    ) -> Result<WriteOutcome, StoreError> {
        debug!(
            method = event.method,
            url = event.url,
            status = event.status_code,
            "processing HTTP log"
        );

        if self
            .message_exists(HTTP_LOGS_TABLE, &event.message_id)
            .await?
        {
            self.log_duplicate(HTTP_LOGS_TABLE, &event.message_id, provenance)
                .await?;
            return Ok(WriteOutcome::AlreadyPresent);
        }

        let timestamp = parse_event_timestamp(event.timestamp.as_deref());

        let result = sqlx::query(
            "INSERT INTO http_logs \
             (message_id, timestamp, direction, method, status_code, url, request_body, \
              response_body, kafka_topic, kafka_partition, kafka_offset) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(&event.message_id)
        .bind(timestamp)
        .bind(&event.direction)
        .bind(&event.method)
        .bind(event.status_code)
        .bind(&event.url)
        .bind(&event.request_body)
        .bind(&event.response_body)
        .bind(provenance.topic)
        .bind(provenance.partition)
        .bind(provenance.offset)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                info!(method = event.method, url = event.url, "HTTP log saved successfully");
                Ok(WriteOutcome::Written)
            }
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                debug!(
                    offset = provenance.offset,
                    "duplicate key on insert (race), treating as already processed"
                );
                Ok(WriteOutcome::AlreadyPresent)
            }
            Err(error) => Err(error.into()),
        }
    }
}
