//! Composes ingestion, period gating, event interpretation, and journal
//! persistence into the single public `post_event` pipeline. Grounded on
//! `codex-accounting-api::facade::LedgerFacade` for the "thin orchestrator
//! wrapping `Arc<dyn Service>` fields, one method per use case" shape, and
//! `codex-policy::PolicyRuleSet::evaluate` for dispatching a pure decision
//! function over a snapshot fetched just before it's needed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use ledger_audit::Auditor;
use ledger_ingest::{EventIngestor, IngestStatus};
use ledger_journal::{JournalOutcome, JournalWriter, ProposedJournalEntry};
use ledger_period::PeriodController;
use ledger_refdata::ReferenceDataCache;
use ledger_types::{ActorId, Event, EventId, InterpretationOutcome, InterpretationStatus, JournalEntryId};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum PostingError {
    #[error(transparent)]
    Ingest(#[from] ledger_ingest::IngestError),
    #[error(transparent)]
    Period(#[from] ledger_period::PeriodError),
    #[error(transparent)]
    Journal(#[from] ledger_journal::JournalError),
    #[error(transparent)]
    Audit(#[from] ledger_audit::AuditError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostingStatus {
    Posted,
    AlreadyPosted,
    /// A resubmission is never reported this way today -- it re-interprets
    /// and re-attempts persistence, converging deterministically on
    /// `AlreadyPosted` via `JournalWriter`'s idempotency-key lookup.
    /// Reserved for a future short-circuit path that skips re-interpretation
    /// entirely.
    DuplicateNoop,
    ValidationFailed,
    PeriodClosed,
    IngestionFailed,
}

#[derive(Debug, Clone)]
pub struct PostingResult {
    pub status: PostingStatus,
    pub event_id: EventId,
    pub entry_id: Option<JournalEntryId>,
    pub message: Option<String>,
}

/// A pure function from an ingested event (plus a read-only reference-data
/// snapshot) to a proposed entry. No I/O; strategies never see the
/// journal, the period controller, or the clock.
pub trait PostingStrategy: Send + Sync {
    fn interpret(&self, event: &Event, refdata: &ReferenceDataCache) -> Result<ProposedJournalEntry, Vec<String>>;
}

/// Namespace matching `event_type.starts_with(prefix)` counts as a close
/// posting for period-gating purposes (R per §4.9 step 3).
const CLOSE_EVENT_NAMESPACE: &str = "close.";

#[derive(Default)]
pub struct StrategyRegistry {
    strategies: HashMap<(String, u32), Arc<dyn PostingStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event_type: impl Into<String>, strategy_version: u32, strategy: Arc<dyn PostingStrategy>) {
        self.strategies.insert((event_type.into(), strategy_version), strategy);
    }

    /// R23: a strategy must be registered for the exact `(event_type,
    /// strategy_version)` pair. There is no implicit fallback to the
    /// latest version -- an unregistered version is a hard validation
    /// failure, not a silent upgrade.
    fn resolve(&self, event_type: &str, strategy_version: u32) -> Option<Arc<dyn PostingStrategy>> {
        self.strategies.get(&(event_type.to_string(), strategy_version)).cloned()
    }
}

pub struct PostingOrchestrator {
    event_ingestor: Arc<EventIngestor>,
    refdata_store: Arc<dyn ledger_refdata::ReferenceDataStore>,
    period_controller: Arc<PeriodController>,
    journal_writer: Arc<JournalWriter>,
    auditor: Arc<dyn Auditor>,
    strategies: StrategyRegistry,
    outcomes: Mutex<Vec<InterpretationOutcome>>,
}

impl PostingOrchestrator {
    pub fn new(
        event_ingestor: Arc<EventIngestor>,
        refdata_store: Arc<dyn ledger_refdata::ReferenceDataStore>,
        period_controller: Arc<PeriodController>,
        journal_writer: Arc<JournalWriter>,
        auditor: Arc<dyn Auditor>,
        strategies: StrategyRegistry,
    ) -> Self {
        Self {
            event_ingestor,
            refdata_store,
            period_controller,
            journal_writer,
            auditor,
            strategies,
            outcomes: Mutex::new(Vec::new()),
        }
    }

    pub async fn interpretation_outcomes(&self) -> Vec<InterpretationOutcome> {
        self.outcomes.lock().await.clone()
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn post_event(
        &self,
        event_id: EventId,
        event_type: &str,
        strategy_version: u32,
        occurred_at: DateTime<Utc>,
        effective_date: NaiveDate,
        actor_id: ActorId,
        producer: &str,
        payload: serde_json::Value,
        schema_version: u32,
    ) -> Result<PostingResult, PostingError> {
        let ingest_result = self
            .event_ingestor
            .ingest(event_id, event_type, occurred_at, effective_date, actor_id, producer, payload, schema_version)
            .await?;

        if ingest_result.status == IngestStatus::Rejected {
            let outcome = self
                .record_outcome(event_id, InterpretationStatus::Rejected, None, Some("ingest_rejected".to_string()), ingest_result.message.clone())
                .await;
            return Ok(PostingResult {
                status: PostingStatus::IngestionFailed,
                event_id,
                entry_id: None,
                message: outcome.error_message,
            });
        }
        let Some(event) = ingest_result.event else {
            let outcome = self
                .record_outcome(
                    event_id,
                    InterpretationStatus::ValidationFailed,
                    None,
                    Some("ingest_accepted_without_event".to_string()),
                    Some("ingestor reported Accepted but returned no event".to_string()),
                )
                .await;
            return Ok(PostingResult {
                status: PostingStatus::ValidationFailed,
                event_id,
                entry_id: None,
                message: outcome.error_message,
            });
        };

        let refdata = self.refdata_store.snapshot().await;

        let is_close_posting = event_type.starts_with(CLOSE_EVENT_NAMESPACE);
        if let Err(period_err) = self.period_controller.validate_effective_date(effective_date, is_close_posting).await {
            let period_code = match &period_err {
                ledger_period::PeriodError::NoPeriodForDate(date) => date.to_string(),
                ledger_period::PeriodError::PeriodNotOpenForPosting { period, .. } => period.clone(),
                ledger_period::PeriodError::ClosingPostingNotAllowed(code) => code.clone(),
                other => other.to_string(),
            };
            ledger_audit::record_period_violation(self.auditor.as_ref(), &period_code, effective_date, actor_id).await?;
            let outcome = self
                .record_outcome(event_id, InterpretationStatus::PeriodClosed, None, Some("period_closed".to_string()), Some(period_err.to_string()))
                .await;
            return Ok(PostingResult {
                status: PostingStatus::PeriodClosed,
                event_id,
                entry_id: None,
                message: outcome.error_message,
            });
        }

        let strategy = match self.strategies.resolve(event_type, strategy_version) {
            Some(strategy) => strategy,
            None => {
                let message = format!("no posting strategy registered for {event_type} v{strategy_version}");
                ledger_audit::record_validation_failure(self.auditor.as_ref(), event_id, &message, actor_id).await?;
                let outcome = self
                    .record_outcome(event_id, InterpretationStatus::ValidationFailed, None, Some("no_strategy".to_string()), Some(message))
                    .await;
                return Ok(PostingResult {
                    status: PostingStatus::ValidationFailed,
                    event_id,
                    entry_id: None,
                    message: outcome.error_message,
                });
            }
        };

        let mut proposal = match strategy.interpret(&event, &refdata) {
            Ok(proposal) => proposal,
            Err(errors) => {
                let message = errors.join("; ");
                ledger_audit::record_validation_failure(self.auditor.as_ref(), event_id, &message, actor_id).await?;
                let outcome = self
                    .record_outcome(event_id, InterpretationStatus::ValidationFailed, None, Some("interpretation_failed".to_string()), Some(message))
                    .await;
                return Ok(PostingResult {
                    status: PostingStatus::ValidationFailed,
                    event_id,
                    entry_id: None,
                    message: outcome.error_message,
                });
            }
        };

        proposal.idempotency_key = format!("{producer}:{event_type}:{event_id}");
        proposal.source_event_id = event_id;
        proposal.source_event_type = event_type.to_string();
        proposal.occurred_at = occurred_at;
        proposal.effective_date = effective_date;
        proposal.actor_id = actor_id;
        proposal
            .entry_metadata
            .insert("refdata_version_hash".to_string(), serde_json::json!(refdata.version_hash()));

        let outcome = self.journal_writer.persist(proposal, &refdata).await;
        match outcome {
            Ok(JournalOutcome::Persisted(entry)) => {
                ledger_audit::record_posting(
                    self.auditor.as_ref(),
                    entry.entry_id,
                    entry.seq.unwrap_or_default(),
                    actor_id,
                )
                .await?;
                self.record_outcome(event_id, InterpretationStatus::Posted, Some(entry.entry_id), None, None).await;
                tracing::info!(event_id = %event_id, entry_id = %entry.entry_id, "event_posted");
                Ok(PostingResult {
                    status: PostingStatus::Posted,
                    event_id,
                    entry_id: Some(entry.entry_id),
                    message: None,
                })
            }
            Ok(JournalOutcome::AlreadyExists(entry)) => {
                self.record_outcome(event_id, InterpretationStatus::AlreadyPosted, Some(entry.entry_id), None, None).await;
                Ok(PostingResult {
                    status: PostingStatus::AlreadyPosted,
                    event_id,
                    entry_id: Some(entry.entry_id),
                    message: None,
                })
            }
            Err(journal_err) => {
                let message = journal_err.to_string();
                ledger_audit::record_validation_failure(self.auditor.as_ref(), event_id, &message, actor_id).await?;
                let outcome = self
                    .record_outcome(event_id, InterpretationStatus::ValidationFailed, None, Some("journal_write_failed".to_string()), Some(message))
                    .await;
                Ok(PostingResult {
                    status: PostingStatus::ValidationFailed,
                    event_id,
                    entry_id: None,
                    message: outcome.error_message,
                })
            }
        }
    }

    async fn record_outcome(
        &self,
        event_id: EventId,
        status: InterpretationStatus,
        entry_id: Option<JournalEntryId>,
        error_code: Option<String>,
        error_message: Option<String>,
    ) -> InterpretationOutcome {
        let outcome = InterpretationOutcome {
            outcome_id: Uuid::new_v4(),
            event_id,
            status,
            entry_id,
            error_code,
            error_message,
            recorded_at: Utc::now(),
        };
        self.outcomes.lock().await.push(outcome.clone());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ledger_audit::InMemoryAuditor;
    use ledger_journal::ProposedLine as PLine;
    use ledger_refdata::{InMemoryReferenceDataStore, ReferenceDataStore};
    use ledger_sequence::InMemorySequenceAllocator;
    use ledger_types::{Account, AccountType, PostingSide, SystemClock};
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    struct SaleStrategy {
        cash_account: uuid::Uuid,
        revenue_account: uuid::Uuid,
    }

    impl PostingStrategy for SaleStrategy {
        fn interpret(&self, event: &Event, _refdata: &ReferenceDataCache) -> Result<ProposedJournalEntry, Vec<String>> {
            Ok(ProposedJournalEntry {
                source_event_id: event.event_id,
                source_event_type: event.event_type.clone(),
                occurred_at: event.occurred_at,
                effective_date: event.effective_date,
                actor_id: event.actor_id,
                idempotency_key: String::new(),
                posting_rule_version: 1,
                description: Some("sale".to_string()),
                entry_metadata: BTreeMap::new(),
                reversal_of_id: None,
                lines: vec![
                    PLine {
                        account_id: self.cash_account,
                        side: PostingSide::Debit,
                        amount: dec!(100),
                        currency: "USD".into(),
                        dimensions: BTreeMap::new(),
                        memo: None,
                        exchange_rate_id: None,
                    },
                    PLine {
                        account_id: self.revenue_account,
                        side: PostingSide::Credit,
                        amount: dec!(100),
                        currency: "USD".into(),
                        dimensions: BTreeMap::new(),
                        memo: None,
                        exchange_rate_id: None,
                    },
                ],
                rounding_accounts: BTreeMap::new(),
            })
        }
    }

    fn account(id: Uuid) -> Account {
        Account {
            account_id: id,
            code: id.to_string(),
            name: "test account".into(),
            account_type: AccountType::Asset,
            is_active: true,
            subledger_type: None,
        }
    }

    async fn setup() -> (PostingOrchestrator, NaiveDate, Arc<dyn Auditor>) {
        let ingestor = Arc::new(EventIngestor::new(Arc::new(SystemClock), None));
        let refdata_store = Arc::new(InMemoryReferenceDataStore::new());
        let cash_account = Uuid::new_v4();
        let revenue_account = Uuid::new_v4();
        refdata_store.upsert_account(account(cash_account)).await.unwrap();
        refdata_store.upsert_account(account(revenue_account)).await.unwrap();
        let refdata_store: Arc<dyn ledger_refdata::ReferenceDataStore> = refdata_store;
        let period_controller = Arc::new(PeriodController::new());
        let effective_date = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        period_controller
            .create_period("2024-01", "January", NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(), true)
            .await
            .unwrap();
        let journal_writer = Arc::new(JournalWriter::new(Arc::new(SystemClock), Arc::new(InMemorySequenceAllocator::new())));
        let auditor: Arc<dyn Auditor> = Arc::new(InMemoryAuditor::new(Arc::new(SystemClock), Arc::new(InMemorySequenceAllocator::new())));

        let mut strategies = StrategyRegistry::new();
        strategies.register("sale.recorded", 1, Arc::new(SaleStrategy { cash_account, revenue_account }));

        let orchestrator =
            PostingOrchestrator::new(ingestor, refdata_store, period_controller, journal_writer, auditor.clone(), strategies);
        (orchestrator, effective_date, auditor)
    }

    #[tokio::test]
    async fn a_recognized_event_is_interpreted_and_posted() {
        let (orchestrator, effective_date, _auditor) = setup().await;
        let result = orchestrator
            .post_event(
                Uuid::new_v4(),
                "sale.recorded",
                1,
                Utc::now(),
                effective_date,
                Uuid::new_v4(),
                "pos-terminal",
                serde_json::json!({"amount": "100.00"}),
                1,
            )
            .await
            .unwrap();
        assert_eq!(result.status, PostingStatus::Posted);
        assert!(result.entry_id.is_some());
        assert_eq!(orchestrator.interpretation_outcomes().await.len(), 1);
    }

    #[tokio::test]
    async fn resubmitting_the_same_event_id_is_already_posted_with_the_same_entry() {
        let (orchestrator, effective_date, _auditor) = setup().await;
        let event_id = Uuid::new_v4();
        let actor = Uuid::new_v4();
        let payload = serde_json::json!({"amount": "100.00"});
        let first = orchestrator
            .post_event(event_id, "sale.recorded", 1, Utc::now(), effective_date, actor, "pos", payload.clone(), 1)
            .await
            .unwrap();
        assert_eq!(first.status, PostingStatus::Posted);
        for _ in 0..9 {
            let repeat = orchestrator
                .post_event(event_id, "sale.recorded", 1, Utc::now(), effective_date, actor, "pos", payload.clone(), 1)
                .await
                .unwrap();
            assert_eq!(repeat.status, PostingStatus::AlreadyPosted);
            assert_eq!(repeat.entry_id, first.entry_id);
        }
    }

    #[tokio::test]
    async fn an_unregistered_strategy_version_fails_validation() {
        let (orchestrator, effective_date, _auditor) = setup().await;
        let result = orchestrator
            .post_event(
                Uuid::new_v4(),
                "sale.recorded",
                99,
                Utc::now(),
                effective_date,
                Uuid::new_v4(),
                "pos",
                serde_json::json!({"amount": "100.00"}),
                1,
            )
            .await
            .unwrap();
        assert_eq!(result.status, PostingStatus::ValidationFailed);
    }

    #[tokio::test]
    async fn posting_outside_the_known_period_range_is_period_closed_and_audited() {
        let (orchestrator, _, auditor) = setup().await;
        let out_of_range = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let result = orchestrator
            .post_event(
                Uuid::new_v4(),
                "sale.recorded",
                1,
                Utc::now(),
                out_of_range,
                Uuid::new_v4(),
                "pos",
                serde_json::json!({"amount": "100.00"}),
                1,
            )
            .await
            .unwrap();
        assert_eq!(result.status, PostingStatus::PeriodClosed);
        let rows = auditor.records().await.unwrap();
        assert!(rows.iter().any(|r| r.action == ledger_types::AuditAction::PeriodViolation));
    }
}
