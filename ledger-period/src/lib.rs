//! Fiscal period state machine: `OPEN -> CLOSING -> CLOSED -> LOCKED`, plus
//! `OPEN -> OPEN` for `allows_adjustments` toggles. No other transition
//! exists; `LOCKED` is terminal. Mirrors `codex-ledger`'s `PeriodState`
//! gating (`allows_posting`) generalized into a full state machine with a
//! row lock per period, the same `tokio::sync::Mutex<HashMap<_, _>>`
//! granularity `codex-ledger::memory::State` uses.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use ledger_types::{ActorId, FiscalPeriod, PeriodId, PeriodStatus};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PeriodError {
    #[error("no fiscal period covers {0}")]
    NoPeriodForDate(NaiveDate),
    #[error("period {0} not found")]
    NotFound(String),
    #[error("period {period} is {status:?}, date {date} cannot be posted")]
    PeriodNotOpenForPosting {
        period: String,
        status: PeriodStatus,
        date: NaiveDate,
    },
    #[error("period {0} is closing; only close postings may target it")]
    ClosingPostingNotAllowed(String),
    #[error("period {0} does not allow adjustments")]
    AdjustmentsNotAllowed(String),
    #[error("proposed period {code} ({start}..={end}) overlaps existing period {overlaps_with}")]
    OverlappingRange {
        code: String,
        start: NaiveDate,
        end: NaiveDate,
        overlaps_with: String,
    },
    #[error("start date {start} is after end date {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
    #[error("period {code} cannot transition from {from:?} to {to:?}")]
    InvalidTransition {
        code: String,
        from: PeriodStatus,
        to: PeriodStatus,
    },
}

#[derive(Debug, Default)]
pub struct PeriodController {
    periods: Mutex<BTreeMap<String, FiscalPeriod>>,
}

impl PeriodController {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_period(
        &self,
        code: &str,
        name: &str,
        start: NaiveDate,
        end: NaiveDate,
        allows_adjustments: bool,
    ) -> Result<FiscalPeriod, PeriodError> {
        if start > end {
            return Err(PeriodError::InvalidRange { start, end });
        }
        let mut periods = self.periods.lock().await;
        if let Some(existing) = periods.values().find(|p| p.overlaps(start, end)) {
            return Err(PeriodError::OverlappingRange {
                code: code.to_string(),
                start,
                end,
                overlaps_with: existing.period_code.clone(),
            });
        }
        let period = FiscalPeriod {
            period_id: Uuid::new_v4(),
            period_code: code.to_string(),
            name: name.to_string(),
            start_date: start,
            end_date: end,
            status: PeriodStatus::Open,
            allows_adjustments,
            closing_run_id: None,
            closed_at: None,
            closed_by: None,
        };
        periods.insert(code.to_string(), period.clone());
        tracing::info!(period_code = code, "period_created");
        Ok(period)
    }

    pub async fn period_for(&self, code: &str) -> Option<FiscalPeriod> {
        self.periods.lock().await.get(code).cloned()
    }

    async fn period_containing(&self, date: NaiveDate) -> Result<FiscalPeriod, PeriodError> {
        self.periods
            .lock()
            .await
            .values()
            .find(|p| p.contains(date))
            .cloned()
            .ok_or(PeriodError::NoPeriodForDate(date))
    }

    /// R25: a period in CLOSING only accepts postings from the close
    /// pipeline itself (`is_close_posting = true`); a period that is
    /// CLOSED or LOCKED accepts nothing.
    pub async fn validate_effective_date(
        &self,
        date: NaiveDate,
        is_close_posting: bool,
    ) -> Result<FiscalPeriod, PeriodError> {
        let period = self.period_containing(date).await?;
        match period.status {
            PeriodStatus::Open => Ok(period),
            PeriodStatus::Closing if is_close_posting => Ok(period),
            PeriodStatus::Closing => Err(PeriodError::ClosingPostingNotAllowed(period.period_code)),
            PeriodStatus::Closed | PeriodStatus::Locked => Err(PeriodError::PeriodNotOpenForPosting {
                period: period.period_code,
                status: period.status,
                date,
            }),
        }
    }

    /// R13: adjustments additionally require `allows_adjustments`.
    pub async fn validate_adjustment_allowed(
        &self,
        date: NaiveDate,
        is_adjustment: bool,
        is_close_posting: bool,
    ) -> Result<FiscalPeriod, PeriodError> {
        let period = self.validate_effective_date(date, is_close_posting).await?;
        if is_adjustment && !period.allows_adjustments {
            return Err(PeriodError::AdjustmentsNotAllowed(period.period_code));
        }
        Ok(period)
    }

    pub async fn begin_closing(&self, code: &str, run_id: Uuid, _actor: ActorId) -> Result<FiscalPeriod, PeriodError> {
        let mut periods = self.periods.lock().await;
        let period = periods.get_mut(code).ok_or_else(|| PeriodError::NotFound(code.to_string()))?;
        if period.status != PeriodStatus::Open {
            return Err(PeriodError::InvalidTransition {
                code: code.to_string(),
                from: period.status,
                to: PeriodStatus::Closing,
            });
        }
        period.status = PeriodStatus::Closing;
        period.closing_run_id = Some(run_id);
        Ok(period.clone())
    }

    pub async fn cancel_closing(&self, code: &str) -> Result<FiscalPeriod, PeriodError> {
        let mut periods = self.periods.lock().await;
        let period = periods.get_mut(code).ok_or_else(|| PeriodError::NotFound(code.to_string()))?;
        if period.status != PeriodStatus::Closing {
            return Err(PeriodError::InvalidTransition {
                code: code.to_string(),
                from: period.status,
                to: PeriodStatus::Open,
            });
        }
        period.status = PeriodStatus::Open;
        period.closing_run_id = None;
        Ok(period.clone())
    }

    /// Accepts `CLOSING -> CLOSED` and, by convention, `OPEN -> CLOSED`
    /// directly. Concurrent callers serialize on the controller's lock;
    /// only the first observes `Closing`/`Open` and the rest get
    /// `InvalidTransition` once the state has already flipped.
    pub async fn close_period(
        &self,
        code: &str,
        actor: ActorId,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<FiscalPeriod, PeriodError> {
        let mut periods = self.periods.lock().await;
        let period = periods.get_mut(code).ok_or_else(|| PeriodError::NotFound(code.to_string()))?;
        if !matches!(period.status, PeriodStatus::Open | PeriodStatus::Closing) {
            return Err(PeriodError::InvalidTransition {
                code: code.to_string(),
                from: period.status,
                to: PeriodStatus::Closed,
            });
        }
        period.status = PeriodStatus::Closed;
        period.closing_run_id = None;
        period.closed_at = Some(now);
        period.closed_by = Some(actor);
        Ok(period.clone())
    }

    pub async fn lock_period(&self, code: &str, _actor: ActorId) -> Result<FiscalPeriod, PeriodError> {
        let mut periods = self.periods.lock().await;
        let period = periods.get_mut(code).ok_or_else(|| PeriodError::NotFound(code.to_string()))?;
        if period.status != PeriodStatus::Closed {
            return Err(PeriodError::InvalidTransition {
                code: code.to_string(),
                from: period.status,
                to: PeriodStatus::Locked,
            });
        }
        period.status = PeriodStatus::Locked;
        Ok(period.clone())
    }

    /// Only valid while OPEN; structurally impossible once CLOSING or
    /// beyond, since those transitions never route back through here.
    pub async fn set_allows_adjustments(&self, code: &str, allows_adjustments: bool) -> Result<FiscalPeriod, PeriodError> {
        let mut periods = self.periods.lock().await;
        let period = periods.get_mut(code).ok_or_else(|| PeriodError::NotFound(code.to_string()))?;
        if period.status != PeriodStatus::Open {
            return Err(PeriodError::InvalidTransition {
                code: code.to_string(),
                from: period.status,
                to: PeriodStatus::Open,
            });
        }
        period.allows_adjustments = allows_adjustments;
        Ok(period.clone())
    }
}
