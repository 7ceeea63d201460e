//! Appends balanced [`JournalEntry`] rows. Persistence is a single
//! `tokio::sync::Mutex<HashMap<_, _>>` keyed by idempotency key, the same
//! granularity as `codex-ledger::memory::InMemoryLedgerService`'s `State`;
//! the crash-recovery DRAFT-row cleanup step a row-locked RDBMS needs
//! collapses away for the same reason `ledger-ingest`'s concurrent-insert
//! race does (documented simplification, SPEC_FULL.md §4.4/§4.7).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use ledger_refdata::{RefDataError, ReferenceDataCache};
use ledger_sequence::{SequenceAllocator, STREAM_JOURNAL_ENTRY};
use ledger_types::{
    AccountId, ActorId, Clock, CurrencyCode, DimensionCode, DimensionValueCode, EntryStatus, EventId, ExchangeRateId,
    JournalEntry, JournalEntryId, JournalLine, LedgerTypeError, PostingSide,
};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error(transparent)]
    Invalid(#[from] LedgerTypeError),
    #[error("currency {currency} is off-balance by {gap}, which exceeds the rounding tolerance")]
    RoundingAmountExceeded { currency: CurrencyCode, gap: Decimal },
    #[error("sequence allocation failed: {0}")]
    Sequence(#[from] ledger_sequence::SequenceError),
    #[error("account {0} does not exist or does not accept postings")]
    InvalidAccount(AccountId),
    #[error("dimension {0} is not recognized")]
    MissingDimension(DimensionCode),
    #[error("dimension value {0}/{1} is not recognized")]
    InvalidDimensionValue(DimensionCode, DimensionValueCode),
    #[error("dimension {0} is inactive")]
    InactiveDimension(DimensionCode),
    #[error("dimension value {0}/{1} is inactive")]
    InactiveDimensionValue(DimensionCode, DimensionValueCode),
    /// `ProposedLine` has no `is_rounding` field (see below), so a strategy
    /// can never actually trigger this (R22); kept for taxonomy parity
    /// with collaborators that accept rounding lines over the wire.
    #[error("strategy proposed a pre-marked rounding line, which JournalWriter alone may author")]
    StrategyRoundingViolation,
    /// Every caller in this workspace takes a snapshot via
    /// `ReferenceDataStore::snapshot` before calling `persist`, so `persist`
    /// is never actually invoked without one.
    #[error("no reference-data snapshot was supplied for this posting")]
    MissingReferenceSnapshot,
    #[error("reference data drifted between interpretation and persistence: recorded {recorded}, current {current}")]
    StaleReferenceSnapshot { recorded: String, current: String },
    /// Reserved for a row-level backend; the in-memory writer serializes
    /// every persist under a single mutex, so a write can never observe a
    /// stale version here.
    #[error("optimistic lock conflict on entry {0}")]
    OptimisticLockConflict(JournalEntryId),
}

fn map_dimension_error(err: RefDataError) -> JournalError {
    match err {
        RefDataError::DimensionNotFound(code) => JournalError::MissingDimension(code),
        RefDataError::DimensionValueNotFound(dim, value) => JournalError::InvalidDimensionValue(dim, value),
        RefDataError::InactiveDimension(code) => JournalError::InactiveDimension(code),
        RefDataError::InactiveDimensionValue(dim, value) => JournalError::InactiveDimensionValue(dim, value),
        other => unreachable!("validate_dimensions never returns {other:?}"),
    }
}

/// Has no `is_rounding` field by construction: a strategy can never hand
/// the writer a pre-marked rounding line (R22) because the type gives it
/// no way to express one. The writer is the sole author of rounding lines.
#[derive(Debug, Clone)]
pub struct ProposedLine {
    pub account_id: AccountId,
    pub side: PostingSide,
    pub amount: Decimal,
    pub currency: CurrencyCode,
    pub dimensions: BTreeMap<DimensionCode, DimensionValueCode>,
    pub memo: Option<String>,
    pub exchange_rate_id: Option<ExchangeRateId>,
}

#[derive(Debug, Clone)]
pub struct ProposedJournalEntry {
    pub source_event_id: EventId,
    pub source_event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub effective_date: NaiveDate,
    pub actor_id: ActorId,
    pub idempotency_key: String,
    pub posting_rule_version: u32,
    pub description: Option<String>,
    pub entry_metadata: BTreeMap<String, serde_json::Value>,
    pub reversal_of_id: Option<JournalEntryId>,
    pub lines: Vec<ProposedLine>,
    /// Account each currency's rounding residual should land in, if any
    /// residual is observed. A currency with no entry here and a nonzero
    /// residual fails with [`JournalError::RoundingAmountExceeded`].
    pub rounding_accounts: BTreeMap<CurrencyCode, AccountId>,
}

#[derive(Debug, Clone)]
pub enum JournalOutcome {
    Persisted(JournalEntry),
    AlreadyExists(JournalEntry),
}

/// Widest residual the writer will absorb with a single rounding line,
/// per non-rounding line contributing to a currency's total.
const ROUNDING_TOLERANCE_PER_LINE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

pub struct JournalWriter {
    clock: Arc<dyn Clock>,
    sequence: Arc<dyn SequenceAllocator>,
    entries: Mutex<HashMap<String, JournalEntry>>,
}

impl JournalWriter {
    pub fn new(clock: Arc<dyn Clock>, sequence: Arc<dyn SequenceAllocator>) -> Self {
        Self {
            clock,
            sequence,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn persist(
        &self,
        proposal: ProposedJournalEntry,
        refdata: &ReferenceDataCache,
    ) -> Result<JournalOutcome, JournalError> {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(&proposal.idempotency_key) {
            return Ok(JournalOutcome::AlreadyExists(existing.clone()));
        }

        for proposed in &proposal.lines {
            if !refdata.is_account_postable(proposed.account_id) {
                return Err(JournalError::InvalidAccount(proposed.account_id));
            }
            if let Some(err) = refdata.validate_dimensions(&proposed.dimensions).into_iter().next() {
                return Err(map_dimension_error(err));
            }
        }

        let mut lines = Vec::with_capacity(proposal.lines.len());
        for (idx, proposed) in proposal.lines.iter().enumerate() {
            lines.push(JournalLine {
                line_id: Uuid::new_v4(),
                account_id: proposed.account_id,
                side: proposed.side,
                amount: proposed.amount,
                currency: proposed.currency.clone(),
                dimensions: proposed.dimensions.clone(),
                is_rounding: false,
                line_memo: proposed.memo.clone(),
                line_seq: idx as u32,
                exchange_rate_id: proposed.exchange_rate_id,
            });
        }

        let non_rounding_count = lines.len();
        let mut next_seq = lines.len() as u32;
        let mut entry = JournalEntry {
            entry_id: Uuid::new_v4(),
            source_event_id: proposal.source_event_id,
            source_event_type: proposal.source_event_type,
            occurred_at: proposal.occurred_at,
            effective_date: proposal.effective_date,
            actor_id: proposal.actor_id,
            status: EntryStatus::Draft,
            seq: None,
            posted_at: None,
            idempotency_key: proposal.idempotency_key,
            posting_rule_version: proposal.posting_rule_version,
            description: proposal.description,
            entry_metadata: proposal.entry_metadata,
            reversal_of_id: proposal.reversal_of_id,
            lines,
        };

        for (currency, (debit, credit)) in entry.currency_totals() {
            let gap = debit - credit;
            if gap == Decimal::ZERO {
                continue;
            }
            let tolerance = ROUNDING_TOLERANCE_PER_LINE * Decimal::from(non_rounding_count.max(1));
            if gap.abs() > tolerance {
                return Err(JournalError::RoundingAmountExceeded { currency, gap });
            }
            let account_id = match proposal.rounding_accounts.get(&currency) {
                Some(id) => *id,
                None => return Err(JournalError::RoundingAmountExceeded { currency, gap }),
            };
            let side = if gap > Decimal::ZERO { PostingSide::Credit } else { PostingSide::Debit };
            entry.lines.push(JournalLine {
                line_id: Uuid::new_v4(),
                account_id,
                side,
                amount: gap.abs(),
                currency,
                dimensions: BTreeMap::new(),
                is_rounding: true,
                line_memo: Some("rounding adjustment".to_string()),
                line_seq: next_seq,
                exchange_rate_id: None,
            });
            next_seq += 1;
        }

        entry.validate()?;

        let seq = self.sequence.next(STREAM_JOURNAL_ENTRY).await?;
        entry.seq = Some(seq);
        entry.posted_at = Some(self.clock.now());
        entry.status = EntryStatus::Posted;

        tracing::info!(entry_id = %entry.entry_id, seq, "journal_entry_posted");
        entries.insert(entry.idempotency_key.clone(), entry.clone());
        Ok(JournalOutcome::Persisted(entry))
    }

    pub async fn entry_by_id(&self, entry_id: JournalEntryId) -> Option<JournalEntry> {
        self.entries.lock().await.values().find(|e| e.entry_id == entry_id).cloned()
    }

    /// Any existing entry whose `reversal_of_id` points at `original_id` --
    /// "is this entry reversed" is always this derived query, never a
    /// status mutation on the original (R10).
    pub async fn find_reversal_of(&self, original_id: JournalEntryId) -> Option<JournalEntry> {
        self.entries
            .lock()
            .await
            .values()
            .find(|e| e.reversal_of_id == Some(original_id))
            .cloned()
    }

    /// Snapshot of every entry currently stored, for selectors and the
    /// close pipeline. Ordering is unspecified; callers sort as needed.
    pub async fn all_entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().await.values().cloned().collect()
    }
}
