//! Reverses a posted journal entry by writing an equal-and-opposite entry
//! and linking the two, never mutating the original. Grounded directly on
//! `finance_kernel/services/reversal_service.py`'s `ReversalService`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use ledger_audit::Auditor;
use ledger_journal::{JournalError, JournalOutcome, JournalWriter, ProposedJournalEntry, ProposedLine};
use ledger_links::{LinkGraph, LinkGraphError};
use ledger_period::{PeriodController, PeriodError};
use ledger_refdata::ReferenceDataStore;
use ledger_types::{ActorId, ArtifactRef, EntryStatus, EventId, JournalEntryId, LinkId, LinkType};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ReversalError {
    #[error("original entry {0} not found")]
    OriginalNotFound(JournalEntryId),
    #[error("original entry {0} already has a reversal")]
    EntryAlreadyReversed(JournalEntryId),
    /// Mirrors `finance_kernel/services/reversal_service.py`'s
    /// `EntryNotPostedError`: a draft entry can't be reversed, only a
    /// posted one. `JournalWriter::persist` only ever stores an entry after
    /// setting it `Posted`, so this guard is currently unreachable through
    /// this workspace's in-memory writer; kept for parity with a backend
    /// that can expose a draft row.
    #[error("entry {0} is not posted")]
    EntryNotPosted(JournalEntryId),
    #[error("entry {0} belongs to a different ledger than the one requesting its reversal")]
    CrossLedgerReversal(JournalEntryId),
    #[error(transparent)]
    Period(#[from] PeriodError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    LinkGraph(#[from] LinkGraphError),
    #[error(transparent)]
    Audit(#[from] ledger_audit::AuditError),
}

#[derive(Debug, Clone)]
pub struct ReversalResult {
    pub original_entry_id: JournalEntryId,
    pub reversal_entry_id: JournalEntryId,
    pub reversal_seq: Option<u64>,
    pub effective_date: NaiveDate,
    pub link_id: LinkId,
}

pub struct ReversalService {
    journal_writer: Arc<JournalWriter>,
    period_controller: Arc<PeriodController>,
    link_graph: Arc<LinkGraph>,
    auditor: Arc<dyn Auditor>,
    refdata_store: Arc<dyn ReferenceDataStore>,
}

impl ReversalService {
    pub fn new(
        journal_writer: Arc<JournalWriter>,
        period_controller: Arc<PeriodController>,
        link_graph: Arc<LinkGraph>,
        auditor: Arc<dyn Auditor>,
        refdata_store: Arc<dyn ReferenceDataStore>,
    ) -> Self {
        Self {
            journal_writer,
            period_controller,
            link_graph,
            auditor,
            refdata_store,
        }
    }

    /// Books the reversal on the original entry's own effective date.
    pub async fn reverse_in_same_period(
        &self,
        original_entry_id: JournalEntryId,
        reason: &str,
        actor: ActorId,
        new_event_id: Option<EventId>,
        expected_ledger_id: Option<&str>,
    ) -> Result<ReversalResult, ReversalError> {
        let original = self
            .journal_writer
            .entry_by_id(original_entry_id)
            .await
            .ok_or(ReversalError::OriginalNotFound(original_entry_id))?;
        self.reverse(original, reason, actor, new_event_id, None, expected_ledger_id).await
    }

    /// Books the reversal on a caller-supplied (typically "today") date,
    /// for when the original period has already closed.
    pub async fn reverse_in_current_period(
        &self,
        original_entry_id: JournalEntryId,
        reason: &str,
        actor: ActorId,
        effective_date: NaiveDate,
        new_event_id: Option<EventId>,
        expected_ledger_id: Option<&str>,
    ) -> Result<ReversalResult, ReversalError> {
        let original = self
            .journal_writer
            .entry_by_id(original_entry_id)
            .await
            .ok_or(ReversalError::OriginalNotFound(original_entry_id))?;
        self.reverse(original, reason, actor, new_event_id, Some(effective_date), expected_ledger_id).await
    }

    async fn reverse(
        &self,
        original: ledger_types::JournalEntry,
        reason: &str,
        actor: ActorId,
        new_event_id: Option<EventId>,
        effective_date_override: Option<NaiveDate>,
        expected_ledger_id: Option<&str>,
    ) -> Result<ReversalResult, ReversalError> {
        if original.status != EntryStatus::Posted {
            return Err(ReversalError::EntryNotPosted(original.entry_id));
        }
        if self.journal_writer.find_reversal_of(original.entry_id).await.is_some() {
            return Err(ReversalError::EntryAlreadyReversed(original.entry_id));
        }
        if let Some(expected) = expected_ledger_id {
            let actual = original.entry_metadata.get("ledger_id").and_then(|v| v.as_str());
            if actual != Some(expected) {
                return Err(ReversalError::CrossLedgerReversal(original.entry_id));
            }
        }

        let effective_date = effective_date_override.unwrap_or(original.effective_date);
        self.period_controller.validate_effective_date(effective_date, false).await?;

        let reversal_event_id = new_event_id.unwrap_or_else(Uuid::new_v4);

        let lines: Vec<ProposedLine> = original
            .lines
            .iter()
            .map(|line| ProposedLine {
                account_id: line.account_id,
                side: line.side.flip(),
                amount: line.amount,
                currency: line.currency.clone(),
                dimensions: line.dimensions.clone(),
                memo: line.line_memo.clone(),
                exchange_rate_id: line.exchange_rate_id,
            })
            .collect();

        let mut entry_metadata = BTreeMap::new();
        entry_metadata.insert("original_entry_id".to_string(), serde_json::json!(original.entry_id));
        entry_metadata.insert("original_seq".to_string(), serde_json::json!(original.seq));
        entry_metadata.insert("reason".to_string(), serde_json::json!(reason));
        if let Some(ledger_id) = original.entry_metadata.get("ledger_id") {
            entry_metadata.insert("ledger_id".to_string(), ledger_id.clone());
        }

        let refdata = self.refdata_store.snapshot().await;
        entry_metadata.insert("refdata_version_hash".to_string(), serde_json::json!(refdata.version_hash()));

        let proposal = ProposedJournalEntry {
            source_event_id: reversal_event_id,
            source_event_type: "system.reversal".to_string(),
            occurred_at: original.occurred_at,
            effective_date,
            actor_id: actor,
            idempotency_key: format!("reversal:{}", original.entry_id),
            posting_rule_version: original.posting_rule_version,
            description: Some(format!("Reversal of {}: {reason}", original.entry_id)),
            entry_metadata,
            reversal_of_id: Some(original.entry_id),
            lines,
            rounding_accounts: BTreeMap::new(),
        };

        let reversal_entry = match self.journal_writer.persist(proposal, &refdata).await? {
            JournalOutcome::Persisted(entry) => entry,
            JournalOutcome::AlreadyExists(entry) => entry,
        };

        let link = self
            .link_graph
            .establish(
                LinkType::ReversedBy,
                ArtifactRef::JournalEntry(original.entry_id),
                ArtifactRef::JournalEntry(reversal_entry.entry_id),
                reversal_event_id,
                BTreeMap::new(),
            )
            .await?;

        ledger_audit::record_reversal(self.auditor.as_ref(), reversal_entry.entry_id, original.entry_id, actor).await?;

        Ok(ReversalResult {
            original_entry_id: original.entry_id,
            reversal_entry_id: reversal_entry.entry_id,
            reversal_seq: reversal_entry.seq,
            effective_date,
            link_id: link.link_id,
        })
    }
}
