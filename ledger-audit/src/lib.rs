//! Tamper-evident, append-only audit log: every row chains its hash to its
//! predecessor's, exactly as `codex-audit-log::InMemoryAuditLog` does,
//! generalized from a free-form `action: String` to the closed
//! [`AuditAction`] enum and from one generic `append` to named recorders.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledger_sequence::{SequenceAllocator, STREAM_AUDIT_EVENT};
use ledger_types::{ActorId, AuditAction, AuditEvent, AuditId, Clock};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit payload is not JSON-serializable: {0}")]
    Payload(#[from] ledger_hashing::HashingError),
    #[error("sequence allocation failed: {0}")]
    Sequence(#[from] ledger_sequence::SequenceError),
    #[error("audit chain broken at {audit_id}: expected prev_hash {expected:?}, row has {actual:?}")]
    AuditChainBroken {
        audit_id: AuditId,
        expected: Option<String>,
        actual: Option<String>,
    },
    #[error("audit chain broken at {audit_id}: recomputed hash does not match stored hash")]
    HashMismatch { audit_id: AuditId },
}

#[async_trait]
pub trait Auditor: Send + Sync {
    async fn record(
        &self,
        entity_type: &str,
        entity_id: &str,
        action: AuditAction,
        actor_id: Option<ActorId>,
        payload: serde_json::Value,
    ) -> Result<AuditEvent, AuditError>;

    /// Returns every row in `seq` order and verifies the hash chain as it
    /// reads them. A mismatch anywhere fails the whole read.
    async fn records(&self) -> Result<Vec<AuditEvent>, AuditError>;

    async fn validate_chain(&self) -> Result<(), AuditError> {
        self.records().await.map(|_| ())
    }
}

pub struct InMemoryAuditor {
    clock: Arc<dyn Clock>,
    sequence: Arc<dyn SequenceAllocator>,
    rows: RwLock<Vec<AuditEvent>>,
}

impl InMemoryAuditor {
    pub fn new(clock: Arc<dyn Clock>, sequence: Arc<dyn SequenceAllocator>) -> Self {
        Self {
            clock,
            sequence,
            rows: RwLock::new(Vec::new()),
        }
    }

    fn verify(rows: &[AuditEvent]) -> Result<(), AuditError> {
        let mut prev: Option<&str> = None;
        for row in rows {
            if row.prev_hash.as_deref() != prev {
                return Err(AuditError::AuditChainBroken {
                    audit_id: row.audit_id,
                    expected: prev.map(str::to_string),
                    actual: row.prev_hash.clone(),
                });
            }
            let recomputed = ledger_hashing::hash_audit_event(
                &row.entity_type,
                &row.entity_id,
                row.action,
                &row.payload_hash,
                prev,
            );
            if recomputed != row.hash {
                return Err(AuditError::HashMismatch { audit_id: row.audit_id });
            }
            prev = Some(&row.hash);
        }
        Ok(())
    }
}

#[async_trait]
impl Auditor for InMemoryAuditor {
    async fn record(
        &self,
        entity_type: &str,
        entity_id: &str,
        action: AuditAction,
        actor_id: Option<ActorId>,
        payload: serde_json::Value,
    ) -> Result<AuditEvent, AuditError> {
        let payload_hash = ledger_hashing::hash_payload(&payload)?;
        let mut rows = self.rows.write().await;
        let prev_hash = rows.last().map(|r| r.hash.clone());
        let seq = self.sequence.next(STREAM_AUDIT_EVENT).await?;
        let hash = ledger_hashing::hash_audit_event(
            entity_type,
            entity_id,
            action,
            &payload_hash,
            prev_hash.as_deref(),
        );
        let row = AuditEvent {
            audit_id: Uuid::new_v4(),
            seq,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            action,
            actor_id,
            occurred_at: self.clock.now(),
            payload,
            payload_hash,
            prev_hash,
            hash,
        };
        tracing::info!(entity_type, entity_id, action = ?action, "audit_recorded");
        rows.push(row.clone());
        Ok(row)
    }

    async fn records(&self) -> Result<Vec<AuditEvent>, AuditError> {
        let rows = self.rows.read().await;
        Self::verify(&rows)?;
        Ok(rows.clone())
    }
}

/// Thin recorder wrappers matching the named-method shape the component
/// specifies, so callers never build raw payload `serde_json::Value`s
/// inline.
pub async fn record_event_ingested(
    auditor: &dyn Auditor,
    event_id: Uuid,
    event_type: &str,
    actor_id: ActorId,
) -> Result<AuditEvent, AuditError> {
    auditor
        .record(
            "Event",
            &event_id.to_string(),
            AuditAction::EventIngested,
            Some(actor_id),
            serde_json::json!({ "event_type": event_type }),
        )
        .await
}

pub async fn record_event_rejected(
    auditor: &dyn Auditor,
    event_id: Uuid,
    reason: &str,
    actor_id: ActorId,
) -> Result<AuditEvent, AuditError> {
    auditor
        .record(
            "Event",
            &event_id.to_string(),
            AuditAction::EventRejected,
            Some(actor_id),
            serde_json::json!({ "reason": reason }),
        )
        .await
}

/// Distinct from [`record_event_rejected`]: this is specifically a
/// resubmission whose payload hash no longer matches the immutable event
/// it claims to be (S3), not an ordinary schema-validation failure.
pub async fn record_payload_mismatch(
    auditor: &dyn Auditor,
    event_id: Uuid,
    actor_id: ActorId,
) -> Result<AuditEvent, AuditError> {
    auditor
        .record(
            "Event",
            &event_id.to_string(),
            AuditAction::PayloadMismatch,
            Some(actor_id),
            serde_json::json!({ "reason": "payload hash mismatch on resubmission" }),
        )
        .await
}

pub async fn record_period_violation(
    auditor: &dyn Auditor,
    period_code: &str,
    effective_date: chrono::NaiveDate,
    actor_id: ActorId,
) -> Result<AuditEvent, AuditError> {
    auditor
        .record(
            "FiscalPeriod",
            period_code,
            AuditAction::PeriodViolation,
            Some(actor_id),
            serde_json::json!({ "effective_date": effective_date }),
        )
        .await
}

/// A posting that failed interpretation or persistence for reasons other
/// than "already posted" or "period closed" -- a bad strategy match, an
/// invalid account, a rounding gap too wide to absorb.
pub async fn record_validation_failure(
    auditor: &dyn Auditor,
    event_id: Uuid,
    reason: &str,
    actor_id: ActorId,
) -> Result<AuditEvent, AuditError> {
    auditor
        .record(
            "Event",
            &event_id.to_string(),
            AuditAction::ValidationFailure,
            Some(actor_id),
            serde_json::json!({ "reason": reason }),
        )
        .await
}

pub async fn record_posting(
    auditor: &dyn Auditor,
    entry_id: Uuid,
    seq: u64,
    actor_id: ActorId,
) -> Result<AuditEvent, AuditError> {
    auditor
        .record(
            "JournalEntry",
            &entry_id.to_string(),
            AuditAction::JournalPosted,
            Some(actor_id),
            serde_json::json!({ "seq": seq }),
        )
        .await
}

pub async fn record_reversal(
    auditor: &dyn Auditor,
    reversal_entry_id: Uuid,
    reversed_entry_id: Uuid,
    actor_id: ActorId,
) -> Result<AuditEvent, AuditError> {
    auditor
        .record(
            "JournalEntry",
            &reversal_entry_id.to_string(),
            AuditAction::JournalReversed,
            Some(actor_id),
            serde_json::json!({ "reversed_entry_id": reversed_entry_id }),
        )
        .await
}

pub async fn record_period_closed(
    auditor: &dyn Auditor,
    period_code: &str,
    actor_id: ActorId,
) -> Result<AuditEvent, AuditError> {
    auditor
        .record(
            "FiscalPeriod",
            period_code,
            AuditAction::PeriodClosed,
            Some(actor_id),
            serde_json::json!({}),
        )
        .await
}

pub async fn record_close_certified(
    auditor: &dyn Auditor,
    certificate_id: Uuid,
    period_code: &str,
    actor_id: ActorId,
) -> Result<AuditEvent, AuditError> {
    auditor
        .record(
            "CloseCertificate",
            &certificate_id.to_string(),
            AuditAction::CloseCertified,
            Some(actor_id),
            serde_json::json!({ "period_code": period_code }),
        )
        .await
}

pub async fn record_close_begun(
    auditor: &dyn Auditor,
    period_code: &str,
    correlation_id: Uuid,
    actor_id: ActorId,
) -> Result<AuditEvent, AuditError> {
    auditor
        .record(
            "FiscalPeriod",
            period_code,
            AuditAction::CloseBegun,
            Some(actor_id),
            serde_json::json!({ "correlation_id": correlation_id }),
        )
        .await
}

pub async fn record_subledger_closed(
    auditor: &dyn Auditor,
    period_code: &str,
    subledger_type: &str,
    actor_id: ActorId,
) -> Result<AuditEvent, AuditError> {
    auditor
        .record(
            "FiscalPeriod",
            period_code,
            AuditAction::SubledgerClosed,
            Some(actor_id),
            serde_json::json!({ "subledger_type": subledger_type }),
        )
        .await
}

pub async fn record_close_cancelled(
    auditor: &dyn Auditor,
    period_code: &str,
    reason: &str,
    actor_id: ActorId,
) -> Result<AuditEvent, AuditError> {
    auditor
        .record(
            "FiscalPeriod",
            period_code,
            AuditAction::CloseCancelled,
            Some(actor_id),
            serde_json::json!({ "reason": reason }),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_sequence::InMemorySequenceAllocator;
    use ledger_types::SystemClock;
    use pretty_assertions::assert_eq;

    fn auditor() -> InMemoryAuditor {
        InMemoryAuditor::new(Arc::new(SystemClock), Arc::new(InMemorySequenceAllocator::new()))
    }

    #[tokio::test]
    async fn first_row_has_no_prev_hash() {
        let auditor = auditor();
        let row = auditor
            .record("Event", "e1", AuditAction::EventIngested, None, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(row.prev_hash, None);
        assert_eq!(row.seq, 1);
    }

    #[tokio::test]
    async fn chain_links_successive_rows() {
        let auditor = auditor();
        let first = auditor
            .record("Event", "e1", AuditAction::EventIngested, None, serde_json::json!({}))
            .await
            .unwrap();
        let second = auditor
            .record("Event", "e2", AuditAction::EventIngested, None, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(second.prev_hash, Some(first.hash));
    }

    #[tokio::test]
    async fn validate_chain_succeeds_on_untampered_log() {
        let auditor = auditor();
        for i in 0..5 {
            auditor
                .record("Event", &i.to_string(), AuditAction::EventIngested, None, serde_json::json!({}))
                .await
                .unwrap();
        }
        assert!(auditor.validate_chain().await.is_ok());
    }

    #[tokio::test]
    async fn tampering_with_a_row_breaks_the_chain() {
        let auditor = auditor();
        auditor
            .record("Event", "e1", AuditAction::EventIngested, None, serde_json::json!({}))
            .await
            .unwrap();
        auditor
            .record("Event", "e2", AuditAction::EventIngested, None, serde_json::json!({}))
            .await
            .unwrap();
        {
            let mut rows = auditor.rows.write().await;
            rows[1].prev_hash = Some("tampered".into());
        }
        let err = auditor.validate_chain().await.unwrap_err();
        assert!(matches!(err, AuditError::AuditChainBroken { .. }));
    }

    #[tokio::test]
    async fn named_recorders_populate_expected_entity_type_and_action() {
        let auditor = auditor();
        let actor = Uuid::new_v4();
        let row = record_event_ingested(&auditor, Uuid::new_v4(), "sale.recorded", actor)
            .await
            .unwrap();
        assert_eq!(row.entity_type, "Event");
        assert_eq!(row.action, AuditAction::EventIngested);
    }
}
