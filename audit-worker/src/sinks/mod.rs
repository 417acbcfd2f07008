use async_trait::async_trait;

use audit_common::event::{HttpAuditEvent, MethodAuditEvent};

use crate::error::StoreError;

pub mod elastic;
pub mod postgres;

/// Where the persisted record came from, kept alongside it for forensic
/// replay and for telling broker redeliveries apart from producer
/// duplicates.
#[derive(Debug, Clone, Copy)]
pub struct Provenance<'a> {
    pub topic: &'a str,
    pub partition: i32,
    pub offset: i64,
}

/// Outcome of an idempotent write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// A record with this messageId already exists; the write was a no-op.
    AlreadyPresent,
}

/// The contract both persistence variants implement. Writers must be
/// idempotent per messageId: a pre-check short-circuits cheaply, and a
/// unique-key conflict on the actual insert is folded into
/// `AlreadyPresent` rather than surfaced as an error, since it only
/// happens when a concurrent or retried worker won the race.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn write_method_audit(
        &self,
        event: &MethodAuditEvent,
        provenance: Provenance<'_>,
    ) -> Result<WriteOutcome, StoreError>;

    async fn write_http_audit(
        &self,
        event: &HttpAuditEvent,
        provenance: Provenance<'_>,
    ) -> Result<WriteOutcome, StoreError>;
}
