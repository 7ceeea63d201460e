//! Core domain types shared by every posting-kernel crate: entities from the
//! data model, the closed tagged-variant enums, and the injectable [`Clock`].
//!
//! Nothing in this crate performs I/O. Components that need persistence or
//! cross-entity validation live in their own crates and depend on this one.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type EventId = Uuid;
pub type ActorId = Uuid;
pub type AccountId = Uuid;
pub type PeriodId = Uuid;
pub type JournalEntryId = Uuid;
pub type JournalLineId = Uuid;
pub type AuditId = Uuid;
pub type LinkId = Uuid;
pub type DimensionCode = String;
pub type DimensionValueCode = String;
pub type CurrencyCode = String;
pub type ExchangeRateId = Uuid;

#[derive(Debug, thiserror::Error)]
pub enum LedgerTypeError {
    #[error("unbalanced entry: currency {currency} debit={debit} credit={credit}")]
    Unbalanced {
        currency: CurrencyCode,
        debit: Decimal,
        credit: Decimal,
    },
    #[error("entry has no lines")]
    EmptyEntry,
    #[error("more than one rounding line present for currency {0}")]
    MultipleRoundingLines(CurrencyCode),
    #[error("invalid currency code: {0}")]
    InvalidCurrency(String),
    #[error("fiscal period range invalid: start {start} is after end {end}")]
    InvalidPeriodRange { start: NaiveDate, end: NaiveDate },
}

/// Injectable wall clock. The default wraps [`Utc::now`]; tests inject a
/// deterministic sequence instead of depending on real time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Deterministic clock for tests: returns a fixed instant, or advances by
/// one tick per call if constructed with [`FixedClock::ticking`].
#[derive(Debug, Clone)]
pub struct FixedClock {
    instants: std::sync::Arc<std::sync::Mutex<Vec<DateTime<Utc>>>>,
    cursor: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

impl FixedClock {
    pub fn at(instant: DateTime<Utc>) -> Self {
        Self::ticking(vec![instant])
    }

    pub fn ticking(instants: Vec<DateTime<Utc>>) -> Self {
        assert!(!instants.is_empty(), "FixedClock requires at least one instant");
        Self {
            instants: std::sync::Arc::new(std::sync::Mutex::new(instants)),
            cursor: std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        let instants = self.instants.lock().unwrap_or_else(|e| e.into_inner());
        let idx = self
            .cursor
            .fetch_update(
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
                |n| Some(if n + 1 < instants.len() { n + 1 } else { n }),
            )
            .unwrap_or(0);
        instants[idx.min(instants.len() - 1)]
    }
}

/// Validates an ISO-4217-shaped currency code: three uppercase ASCII letters.
pub fn validate_currency_code(code: &str) -> Result<(), LedgerTypeError> {
    let ok = code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase());
    if ok {
        Ok(())
    } else {
        Err(LedgerTypeError::InvalidCurrency(code.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountType {
    Asset,
    Liability,
    Equity,
    Revenue,
    Expense,
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AccountType::Asset => "ASSET",
            AccountType::Liability => "LIABILITY",
            AccountType::Equity => "EQUITY",
            AccountType::Revenue => "REVENUE",
            AccountType::Expense => "EXPENSE",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: AccountId,
    pub code: String,
    pub name: String,
    pub account_type: AccountType,
    pub is_active: bool,
    pub subledger_type: Option<String>,
}

impl Account {
    pub fn allows_posting(&self) -> bool {
        self.is_active
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dimension {
    pub dimension_code: DimensionCode,
    pub name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionValue {
    pub dimension_code: DimensionCode,
    pub value_code: DimensionValueCode,
    pub name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub rate_id: ExchangeRateId,
    pub from_currency: CurrencyCode,
    pub to_currency: CurrencyCode,
    pub rate: Decimal,
    pub valid_on: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostingSide {
    Debit,
    Credit,
}

impl PostingSide {
    pub fn flip(self) -> PostingSide {
        match self {
            PostingSide::Debit => PostingSide::Credit,
            PostingSide::Credit => PostingSide::Debit,
        }
    }
}

/// Status of a [`JournalEntry`]. `Reversed` was removed: whether an entry
/// has been reversed is a derived property (does any entry exist whose
/// `reversal_of_id` points at it), never a status mutation on the original
/// (R10). See SPEC_FULL.md Design Notes, Open Question 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Draft,
    Posted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalLine {
    pub line_id: JournalLineId,
    pub account_id: AccountId,
    pub side: PostingSide,
    pub amount: Decimal,
    pub currency: CurrencyCode,
    pub dimensions: BTreeMap<DimensionCode, DimensionValueCode>,
    pub is_rounding: bool,
    pub line_memo: Option<String>,
    pub line_seq: u32,
    pub exchange_rate_id: Option<ExchangeRateId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub entry_id: JournalEntryId,
    pub source_event_id: EventId,
    pub source_event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub effective_date: NaiveDate,
    pub actor_id: ActorId,
    pub status: EntryStatus,
    pub seq: Option<u64>,
    pub posted_at: Option<DateTime<Utc>>,
    pub idempotency_key: String,
    pub posting_rule_version: u32,
    pub description: Option<String>,
    pub entry_metadata: BTreeMap<String, serde_json::Value>,
    pub reversal_of_id: Option<JournalEntryId>,
    pub lines: Vec<JournalLine>,
}

impl JournalEntry {
    /// Per-currency debit/credit totals, in the stable iteration order
    /// produced by a `BTreeMap` (lexicographic by currency code).
    pub fn currency_totals(&self) -> BTreeMap<CurrencyCode, (Decimal, Decimal)> {
        let mut totals: BTreeMap<CurrencyCode, (Decimal, Decimal)> = BTreeMap::new();
        for line in &self.lines {
            let entry = totals.entry(line.currency.clone()).or_default();
            match line.side {
                PostingSide::Debit => entry.0 += line.amount,
                PostingSide::Credit => entry.1 += line.amount,
            }
        }
        totals
    }

    /// I1: per currency, debits equal credits exactly.
    pub fn is_balanced(&self) -> bool {
        self.currency_totals()
            .values()
            .all(|(debit, credit)| debit == credit)
    }

    pub fn validate(&self) -> Result<(), LedgerTypeError> {
        if self.lines.is_empty() {
            return Err(LedgerTypeError::EmptyEntry);
        }
        let mut rounding_currencies: BTreeMap<CurrencyCode, u32> = BTreeMap::new();
        for line in &self.lines {
            if line.is_rounding {
                *rounding_currencies.entry(line.currency.clone()).or_insert(0) += 1;
            }
        }
        if let Some((currency, _)) = rounding_currencies.iter().find(|(_, count)| **count > 1) {
            return Err(LedgerTypeError::MultipleRoundingLines(currency.clone()));
        }
        let mismatch = self
            .currency_totals()
            .into_iter()
            .find(|(_, (debit, credit))| debit != credit);
        if let Some((currency, (debit, credit))) = mismatch {
            return Err(LedgerTypeError::Unbalanced {
                currency,
                debit,
                credit,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub effective_date: NaiveDate,
    pub actor_id: ActorId,
    pub producer: String,
    pub payload: serde_json::Value,
    pub payload_hash: String,
    pub schema_version: u32,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeriodStatus {
    Open,
    Closing,
    Closed,
    Locked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiscalPeriod {
    pub period_id: PeriodId,
    pub period_code: String,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: PeriodStatus,
    pub allows_adjustments: bool,
    pub closing_run_id: Option<Uuid>,
    pub closed_at: Option<DateTime<Utc>>,
    pub closed_by: Option<ActorId>,
}

impl FiscalPeriod {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start_date && date <= self.end_date
    }

    pub fn overlaps(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.start_date <= end && start <= self.end_date
    }
}

/// Closed set of audit actions. Adding a member requires touching every
/// recorder in `ledger-audit` that pattern-matches on this enum (by design:
/// §6 calls the action set closed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    EventIngested,
    EventRejected,
    JournalDraftCreated,
    JournalPosted,
    JournalReversed,
    PeriodOpened,
    PeriodClosed,
    PeriodViolation,
    ProtocolViolation,
    PayloadMismatch,
    ValidationFailure,
    CloseBegun,
    SubledgerClosed,
    CloseCertified,
    CloseCancelled,
    AccountCreated,
    AccountDeactivated,
    ApprovalGranted,
    ApprovalRejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub audit_id: AuditId,
    pub seq: u64,
    pub entity_type: String,
    pub entity_id: String,
    pub action: AuditAction,
    pub actor_id: Option<ActorId>,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub payload_hash: String,
    pub prev_hash: Option<String>,
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkType {
    ReversedBy,
    Settles,
    Corrects,
}

impl LinkType {
    /// Maximum outgoing edges of this type a single parent may hold.
    pub fn max_children(self) -> usize {
        match self {
            LinkType::ReversedBy => 1,
            LinkType::Settles => usize::MAX,
            LinkType::Corrects => usize::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "artifact_type", content = "artifact_id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactRef {
    Event(EventId),
    JournalEntry(JournalEntryId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EconomicLink {
    pub link_id: LinkId,
    pub link_type: LinkType,
    pub parent_ref: ArtifactRef,
    pub child_ref: ArtifactRef,
    pub creating_event_id: EventId,
    pub created_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterpretationStatus {
    Posted,
    AlreadyPosted,
    Rejected,
    ValidationFailed,
    PeriodClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpretationOutcome {
    pub outcome_id: Uuid,
    pub event_id: EventId,
    pub status: InterpretationStatus,
    pub entry_id: Option<JournalEntryId>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Authority level required to execute a close phase. Ordered:
/// `Auditor < Preparer < Approver`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseRole {
    Auditor,
    Preparer,
    Approver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseRunStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodCloseRun {
    pub run_id: Uuid,
    pub period_code: String,
    pub correlation_id: Uuid,
    pub status: CloseRunStatus,
    pub current_phase: u8,
    pub started_at: DateTime<Utc>,
    pub started_by: ActorId,
    pub is_year_end: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClosePhaseStatus {
    Ok,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosePhaseResult {
    pub phase: u8,
    pub phase_name: String,
    pub status: ClosePhaseStatus,
    pub message: Option<String>,
    pub details: BTreeMap<String, serde_json::Value>,
}

/// One row of a trial balance, as produced by `ledger-selectors` and
/// consumed by `ledger-hashing::hash_trial_balance` / `ledger-close`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialBalanceRow {
    pub account_id: AccountId,
    pub account_code: String,
    pub currency: CurrencyCode,
    pub debit_total: Decimal,
    pub credit_total: Decimal,
}

impl TrialBalanceRow {
    pub fn balance(&self) -> Decimal {
        self.debit_total - self.credit_total
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseCertificate {
    pub certificate_id: Uuid,
    pub period_code: String,
    pub closed_at: DateTime<Utc>,
    pub closed_by: ActorId,
    pub correlation_id: Uuid,
    pub ledger_hash: String,
    pub trial_balance_debits: Decimal,
    pub trial_balance_credits: Decimal,
    pub subledgers_closed: Vec<String>,
    pub phases_completed: u8,
    pub phases_skipped: u8,
    pub audit_event_id: Option<AuditId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    fn line(side: PostingSide, amount: Decimal, currency: &str, seq: u32) -> JournalLine {
        JournalLine {
            line_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            side,
            amount,
            currency: currency.to_string(),
            dimensions: BTreeMap::new(),
            is_rounding: false,
            line_memo: None,
            line_seq: seq,
            exchange_rate_id: None,
        }
    }

    fn balanced_entry() -> JournalEntry {
        JournalEntry {
            entry_id: Uuid::new_v4(),
            source_event_id: Uuid::new_v4(),
            source_event_type: "sale".into(),
            occurred_at: Utc::now(),
            effective_date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            actor_id: Uuid::new_v4(),
            status: EntryStatus::Draft,
            seq: None,
            posted_at: None,
            idempotency_key: "demo:sale:1".into(),
            posting_rule_version: 1,
            description: None,
            entry_metadata: BTreeMap::new(),
            reversal_of_id: None,
            lines: vec![
                line(PostingSide::Debit, dec!(100.00), "USD", 0),
                line(PostingSide::Credit, dec!(100.00), "USD", 1),
            ],
        }
    }

    #[test]
    fn balanced_entry_validates() {
        let entry = balanced_entry();
        assert!(entry.is_balanced());
        assert!(entry.validate().is_ok());
    }

    #[test]
    fn unbalanced_entry_is_rejected() {
        let mut entry = balanced_entry();
        entry.lines[1].amount = dec!(99.00);
        assert!(!entry.is_balanced());
        let err = entry.validate().unwrap_err();
        assert!(matches!(err, LedgerTypeError::Unbalanced { .. }));
    }

    #[test]
    fn multiple_rounding_lines_rejected() {
        let mut entry = balanced_entry();
        entry.lines[0].is_rounding = true;
        entry.lines.push(line(PostingSide::Debit, dec!(0.01), "USD", 2));
        entry.lines.last_mut().unwrap().is_rounding = true;
        entry.lines[1].amount = dec!(100.01);
        let err = entry.validate().unwrap_err();
        assert!(matches!(err, LedgerTypeError::MultipleRoundingLines(_)));
    }

    #[test]
    fn empty_entry_rejected() {
        let mut entry = balanced_entry();
        entry.lines.clear();
        assert!(matches!(entry.validate(), Err(LedgerTypeError::EmptyEntry)));
    }

    #[test]
    fn currency_code_validation() {
        assert!(validate_currency_code("USD").is_ok());
        assert!(validate_currency_code("usd").is_err());
        assert!(validate_currency_code("US").is_err());
    }

    #[test]
    fn posting_side_flip_is_involution() {
        assert_eq!(PostingSide::Debit.flip(), PostingSide::Credit);
        assert_eq!(PostingSide::Credit.flip(), PostingSide::Debit);
    }

    #[test]
    fn close_role_ordering() {
        assert!(CloseRole::Auditor < CloseRole::Preparer);
        assert!(CloseRole::Preparer < CloseRole::Approver);
    }

    #[test]
    fn fixed_clock_advances_then_holds() {
        let t0 = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let t1 = DateTime::parse_from_rfc3339("2024-01-02T00:00:00Z").unwrap().with_timezone(&Utc);
        let clock = FixedClock::ticking(vec![t0, t1]);
        assert_eq!(clock.now(), t0);
        assert_eq!(clock.now(), t1);
        assert_eq!(clock.now(), t1);
    }
}
