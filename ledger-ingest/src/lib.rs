//! Event ingestion at the kernel boundary: schema validation, payload-hash
//! verification, and idempotent storage of immutable [`Event`] rows.
//! Grounded on `finance_kernel/services/ingestor_service.py`, with its
//! unique-violation/rollback/retry race folded into a single critical
//! section under one `tokio::sync::Mutex`, the same collapse
//! `codex-bank-ingest`'s in-memory dedupe and `codex-audit-log`'s
//! `InMemoryAuditLog` both make (R1, R2, R3, R8).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use ledger_audit::Auditor;
use ledger_types::{ActorId, Clock, Event, EventId};
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("event_type must be a non-empty namespaced string (e.g. \"sale.recorded\")")]
    MissingEventType,
    #[error("event_type {0} must contain a \".\" namespace separator")]
    UnnamespacedEventType(String),
    #[error("payload must be a JSON object")]
    PayloadNotAnObject,
    #[error("producer must be non-empty")]
    MissingProducer,
    #[error("failed to hash payload: {0}")]
    Hashing(#[from] ledger_hashing::HashingError),
    #[error("audit recording failed: {0}")]
    Audit(#[from] ledger_audit::AuditError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStatus {
    Accepted,
    Duplicate,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct IngestResult {
    pub status: IngestStatus,
    pub event_id: EventId,
    pub event: Option<Event>,
    pub message: Option<String>,
}

impl IngestResult {
    pub fn is_success(&self) -> bool {
        matches!(self.status, IngestStatus::Accepted | IngestStatus::Duplicate)
    }
}

/// Pure boundary validation: no I/O, no clock, just shape checks on the
/// inputs that would otherwise crash interpretation further downstream.
fn validate_event(event_type: &str, payload: &serde_json::Value) -> Result<(), IngestError> {
    if event_type.trim().is_empty() {
        return Err(IngestError::MissingEventType);
    }
    if !event_type.contains('.') {
        return Err(IngestError::UnnamespacedEventType(event_type.to_string()));
    }
    if !payload.is_object() {
        return Err(IngestError::PayloadNotAnObject);
    }
    Ok(())
}

pub struct EventIngestor {
    clock: Arc<dyn Clock>,
    auditor: Option<Arc<dyn Auditor>>,
    events: Mutex<HashMap<EventId, Event>>,
}

impl EventIngestor {
    pub fn new(clock: Arc<dyn Clock>, auditor: Option<Arc<dyn Auditor>>) -> Self {
        Self {
            clock,
            auditor,
            events: Mutex::new(HashMap::new()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn ingest(
        &self,
        event_id: EventId,
        event_type: &str,
        occurred_at: DateTime<Utc>,
        effective_date: NaiveDate,
        actor_id: ActorId,
        producer: &str,
        payload: serde_json::Value,
        schema_version: u32,
    ) -> Result<IngestResult, IngestError> {
        if producer.trim().is_empty() {
            return Err(IngestError::MissingProducer);
        }
        if let Err(validation_error) = validate_event(event_type, &payload) {
            if let Some(auditor) = self.auditor.as_deref() {
                ledger_audit::record_event_rejected(auditor, event_id, &validation_error.to_string(), actor_id)
                    .await?;
            }
            tracing::warn!(event_id = %event_id, error = %validation_error, "event_rejected_validation");
            return Ok(IngestResult {
                status: IngestStatus::Rejected,
                event_id,
                event: None,
                message: Some(validation_error.to_string()),
            });
        }

        let payload_hash = ledger_hashing::hash_payload(&payload)?;
        let mut events = self.events.lock().await;

        if let Some(existing) = events.get(&event_id) {
            if existing.payload_hash != payload_hash {
                if let Some(auditor) = self.auditor.as_deref() {
                    ledger_audit::record_payload_mismatch(auditor, event_id, actor_id).await?;
                }
                tracing::warn!(event_id = %event_id, "event_rejected_hash_mismatch");
                return Ok(IngestResult {
                    status: IngestStatus::Rejected,
                    event_id,
                    event: None,
                    message: Some("payload hash mismatch - events are immutable".to_string()),
                });
            }
            tracing::info!(event_id = %event_id, "event_duplicate");
            return Ok(IngestResult {
                status: IngestStatus::Duplicate,
                event_id,
                event: Some(existing.clone()),
                message: Some("event already ingested".to_string()),
            });
        }

        let event = Event {
            event_id,
            event_type: event_type.to_string(),
            occurred_at,
            effective_date,
            actor_id,
            producer: producer.to_string(),
            payload,
            payload_hash,
            schema_version,
            ingested_at: self.clock.now(),
        };
        events.insert(event_id, event.clone());
        drop(events);

        if let Some(auditor) = self.auditor.as_deref() {
            ledger_audit::record_event_ingested(auditor, event_id, event_type, actor_id).await?;
        }
        tracing::info!(event_id = %event_id, event_type, "event_ingested");
        Ok(IngestResult {
            status: IngestStatus::Accepted,
            event_id,
            event: Some(event),
            message: Some("event ingested successfully".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_audit::InMemoryAuditor;
    use ledger_sequence::InMemorySequenceAllocator;
    use ledger_types::SystemClock;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use uuid::Uuid;

    fn sample_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 10).unwrap()
    }

    #[tokio::test]
    async fn accepts_a_well_formed_event() {
        let ingestor = EventIngestor::new(Arc::new(SystemClock), None);
        let result = ingestor
            .ingest(
                Uuid::new_v4(),
                "sale.recorded",
                Utc::now(),
                sample_date(),
                Uuid::new_v4(),
                "pos-terminal",
                serde_json::json!({"amount": "10.00"}),
                1,
            )
            .await
            .unwrap();
        assert_eq!(result.status, IngestStatus::Accepted);
    }

    #[tokio::test]
    async fn resubmitting_the_same_event_id_and_payload_is_a_duplicate() {
        let ingestor = EventIngestor::new(Arc::new(SystemClock), None);
        let event_id = Uuid::new_v4();
        let actor = Uuid::new_v4();
        let payload = serde_json::json!({"amount": "10.00"});
        ingestor
            .ingest(event_id, "sale.recorded", Utc::now(), sample_date(), actor, "pos", payload.clone(), 1)
            .await
            .unwrap();
        let second = ingestor
            .ingest(event_id, "sale.recorded", Utc::now(), sample_date(), actor, "pos", payload, 1)
            .await
            .unwrap();
        assert_eq!(second.status, IngestStatus::Duplicate);
    }

    #[tokio::test]
    async fn resubmitting_with_a_different_payload_is_rejected() {
        let ingestor = EventIngestor::new(Arc::new(SystemClock), None);
        let event_id = Uuid::new_v4();
        let actor = Uuid::new_v4();
        ingestor
            .ingest(
                event_id,
                "sale.recorded",
                Utc::now(),
                sample_date(),
                actor,
                "pos",
                serde_json::json!({"amount": "10.00"}),
                1,
            )
            .await
            .unwrap();
        let second = ingestor
            .ingest(
                event_id,
                "sale.recorded",
                Utc::now(),
                sample_date(),
                actor,
                "pos",
                serde_json::json!({"amount": "99.00"}),
                1,
            )
            .await
            .unwrap();
        assert_eq!(second.status, IngestStatus::Rejected);
    }

    #[tokio::test]
    async fn payload_hash_mismatch_on_resubmission_is_audited_as_payload_mismatch() {
        let auditor: Arc<dyn ledger_audit::Auditor> = Arc::new(InMemoryAuditor::new(Arc::new(SystemClock), Arc::new(InMemorySequenceAllocator::new())));
        let ingestor = EventIngestor::new(Arc::new(SystemClock), Some(auditor.clone()));
        let event_id = Uuid::new_v4();
        let actor = Uuid::new_v4();
        ingestor
            .ingest(event_id, "sale.recorded", Utc::now(), sample_date(), actor, "pos", serde_json::json!({"amount": "10.00"}), 1)
            .await
            .unwrap();
        ingestor
            .ingest(event_id, "sale.recorded", Utc::now(), sample_date(), actor, "pos", serde_json::json!({"amount": "99.00"}), 1)
            .await
            .unwrap();
        let rows = auditor.records().await.unwrap();
        assert_eq!(rows.last().unwrap().action, ledger_types::AuditAction::PayloadMismatch);
    }

    #[tokio::test]
    async fn unnamespaced_event_type_is_rejected_and_audited() {
        let auditor: Arc<dyn ledger_audit::Auditor> = Arc::new(InMemoryAuditor::new(Arc::new(SystemClock), Arc::new(InMemorySequenceAllocator::new())));
        let ingestor = EventIngestor::new(Arc::new(SystemClock), Some(auditor.clone()));
        let result = ingestor
            .ingest(
                Uuid::new_v4(),
                "saleRecorded",
                Utc::now(),
                sample_date(),
                Uuid::new_v4(),
                "pos",
                serde_json::json!({}),
                1,
            )
            .await
            .unwrap();
        assert_eq!(result.status, IngestStatus::Rejected);
        assert_eq!(auditor.records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_object_payload_is_rejected() {
        let ingestor = EventIngestor::new(Arc::new(SystemClock), None);
        let result = ingestor
            .ingest(
                Uuid::new_v4(),
                "sale.recorded",
                Utc::now(),
                sample_date(),
                Uuid::new_v4(),
                "pos",
                serde_json::json!([1, 2, 3]),
                1,
            )
            .await
            .unwrap();
        assert_eq!(result.status, IngestStatus::Rejected);
    }
}
