use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use audit_common::event::{render_args, HttpAuditEvent, MethodAuditEvent};
use audit_common::timestamp::{parse_event_timestamp, to_epoch_millis};

use crate::error::StoreError;
use crate::sinks::{LogStore, Provenance, WriteOutcome};

const METHODS_INDEX: &str = "audit-methods";
const REQUESTS_INDEX: &str = "audit-requests";

/// The document variant: one index per record kind, documents `_create`d
/// under an explicit id so a second create of the same message conflicts
/// instead of writing twice. `message_id` is a keyword field queried for
/// the idempotence pre-check.
pub struct ElasticStore {
    client: reqwest::Client,
    base_url: String,
}

impl ElasticStore {
    pub fn new(base_url: &str) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    /// Create the backing indices with an explicit mapping. Dynamic
    /// mapping would type `message_id` as analyzed text, and the term
    /// query in the idempotence pre-check would never match a whole id.
    pub async fn ensure_indices(&self) -> Result<(), StoreError> {
        let mapping = json!({
            "mappings": {
                "properties": {
                    "message_id": {"type": "keyword"},
                    "timestamp": {"type": "date"}
                }
            }
        });

        for index in [METHODS_INDEX, REQUESTS_INDEX] {
            let url = format!("{}/{}", self.base_url, index);
            let response = self.client.put(&url).json(&mapping).send().await?;

            if response.status() == StatusCode::BAD_REQUEST {
                let body = response.text().await.unwrap_or_default();
                if body.contains("resource_already_exists_exception") {
                    debug!(index, "index already exists");
                    continue;
                }
                return Err(StoreError::Rejected { status: 400, body });
            }
            if !response.status().is_success() {
                return Err(rejected(response).await);
            }
            info!(index, "created index");
        }

        Ok(())
    }

    async fn message_exists(&self, index: &str, message_id: &str) -> Result<bool, StoreError> {
        let url = format!("{}/{}/_count", self.base_url, index);
        let query = json!({"query": {"term": {"message_id": message_id}}});

        let response = self.client.post(&url).json(&query).send().await?;
        // A missing index just means nothing has been written yet
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }

        let body: Value = response.json().await?;
        Ok(body.get("count").and_then(Value::as_u64).unwrap_or(0) > 0)
    }

    async fn create(
        &self,
        index: &str,
        doc_id: &str,
        document: &Value,
    ) -> Result<WriteOutcome, StoreError> {
        let url = format!("{}/{}/_create/{}", self.base_url, index, doc_id);
        let response = self.client.put(&url).json(document).send().await?;

        if response.status() == StatusCode::CONFLICT {
            debug!(
                index,
                doc_id, "version conflict on create (race), treating as already processed"
            );
            return Ok(WriteOutcome::AlreadyPresent);
        }
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }

        Ok(WriteOutcome::Written)
    }
}

async fn rejected(response: reqwest::Response) -> StoreError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    StoreError::Rejected { status, body }
}

#[async_trait]
impl LogStore for ElasticStore {
    async fn write_method_audit(
        &self,
        event: &MethodAuditEvent,
        _provenance: Provenance<'_>,
    ) -> Result<WriteOutcome, StoreError> {
        debug!(
            event_id = event.event_id,
            event_type = event.event_type,
            "processing audit log"
        );

        // The method index is keyed by the correlation id, so it has to be
        // a real UUID. Anything else is a schema violation, not a write
        // failure.
        let doc_id = Uuid::parse_str(&event.event_id)
            .map_err(|_| StoreError::InvalidEventId(event.event_id.clone()))?;

        if self.message_exists(METHODS_INDEX, &event.message_id).await? {
            warn!(message_id = event.message_id, "Kafka message already processed");
            return Ok(WriteOutcome::AlreadyPresent);
        }

        let timestamp = parse_event_timestamp(event.timestamp.as_deref());
        let document = json!({
            "message_id": event.message_id,
            "audit_id": event.event_id,
            "type": event.event_type,
            "method_name": event.method_name,
            "args": event.args.as_deref().map(render_args),
            "result": event.result,
            "error": event.error,
            "log_level": event.log_level,
            "timestamp": to_epoch_millis(timestamp),
        });

        let outcome = self
            .create(METHODS_INDEX, &doc_id.to_string(), &document)
            .await?;
        if outcome == WriteOutcome::Written {
            info!(event_id = event.event_id, "audit log saved successfully");
        }
        Ok(outcome)
    }

    async fn write_http_audit(
        &self,
        event: &HttpAuditEvent,
        _provenance: Provenance<'_>,
    ) -> Result<WriteOutcome, StoreError> {
        debug!(
            method = event.method,
            url = event.url,
            status = event.status_code,
            "processing HTTP log"
        );

        if self
            .message_exists(REQUESTS_INDEX, &event.message_id)
            .await?
        {
            warn!(message_id = event.message_id, "Kafka message already processed");
            return Ok(WriteOutcome::AlreadyPresent);
        }

        let timestamp = parse_event_timestamp(event.timestamp.as_deref());
        let document = json!({
            "message_id": event.message_id,
            "timestamp": to_epoch_millis(timestamp),
            "direction": event.direction,
            "method": event.method,
            "status_code": event.status_code,
            "url": event.url,
            "request_body": event.request_body,
            "response_body": event.response_body,
        });

        let outcome = self
            .create(REQUESTS_INDEX, &event.message_id, &document)
            .await?;
        if outcome == WriteOutcome::Written {
            info!(method = event.method, url = event.url, "HTTP log saved successfully");
        }
        Ok(outcome)
    }
}
