//! Sequences the six-phase period close, gated by authority at each
//! boundary, and issues a signed [`CloseCertificate`] on success. Grounded
//! directly on `finance_services/period_close_orchestrator.py`
//! (`PHASE_AUTHORITY`, `run_phase`'s dispatch table, the `_phase_N_*`
//! handlers, `_build_certificate`, `close_period_full`'s
//! stop-on-first-failure loop), with the authority-gated multi-stage
//! sequencing cross-checked against `codex-approvals::ApprovalTask`'s
//! `current_stage_index` pattern.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use ledger_audit::Auditor;
use ledger_journal::JournalWriter;
use ledger_period::PeriodController;
use ledger_refdata::ReferenceDataStore;
use ledger_types::{
    ActorId, CloseCertificate, CloseRole, CloseRunStatus, ClosePhaseResult, ClosePhaseStatus, PeriodCloseRun,
};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CloseError {
    #[error("actor {actor_id} has role {actual:?}, phase {phase} requires at least {required:?}")]
    AuthorityDenied {
        actor_id: ActorId,
        required: CloseRole,
        actual: CloseRole,
        phase: u8,
    },
    #[error(transparent)]
    Period(#[from] ledger_period::PeriodError),
    #[error(transparent)]
    Audit(#[from] ledger_audit::AuditError),
    #[error(transparent)]
    Selector(#[from] ledger_selectors::SelectorError),
    #[error("no close run is in progress for period {0}")]
    NoRunInProgress(String),
}

/// Minimum [`CloseRole`] each phase requires. Phase 0 (health check) isn't
/// dispatched through `run_phase` -- it's read-only and callable directly
/// -- so it isn't listed here.
fn phase_authority(phase: u8) -> CloseRole {
    match phase {
        1 | 2 | 3 | 4 => CloseRole::Preparer,
        5 | 6 => CloseRole::Approver,
        _ => CloseRole::Approver,
    }
}

#[async_trait]
pub trait CloseRoleResolver: Send + Sync {
    async fn resolve(&self, actor_id: ActorId) -> CloseRole;
}

/// Unrestricted default: every actor may execute every phase.
pub struct DefaultCloseRoleResolver;

#[async_trait]
impl CloseRoleResolver for DefaultCloseRoleResolver {
    async fn resolve(&self, _actor_id: ActorId) -> CloseRole {
        CloseRole::Approver
    }
}

/// Closes one subledger type as of `period_end_date`, returning whether it
/// reconciled and closed cleanly. `Ok(false)` is a soft failure the phase
/// reports but the caller must still decide whether it blocks the close.
#[async_trait]
pub trait SubledgerCloser: Send + Sync {
    async fn close_subledger(&self, subledger_type: &str, period_end_date: NaiveDate, actor: ActorId) -> Result<bool, String>;
}

#[async_trait]
pub trait AdjustmentPoster: Send + Sync {
    async fn post_adjustments(&self, period_code: &str, actor: ActorId) -> Result<u32, String>;
}

#[async_trait]
pub trait ClosingEntryPoster: Send + Sync {
    async fn post_closing_entries(&self, period_code: &str, period_end_date: NaiveDate, actor: ActorId) -> Result<u32, String>;
}

/// Subledger types closed in phase 1, in reporting order.
pub const SUBLEDGER_CLOSE_ORDER: &[&str] = &["accounts_payable", "accounts_receivable", "inventory", "bank"];

#[derive(Debug, Clone)]
pub struct CloseRunOutcome {
    pub period_code: String,
    pub status: CloseRunStatus,
    pub correlation_id: Uuid,
    pub phases_completed: u8,
    pub phases_total: u8,
    pub phase_results: Vec<ClosePhaseResult>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub certificate: Option<CloseCertificate>,
    pub message: String,
}

pub struct CloseOrchestrator {
    period_controller: Arc<PeriodController>,
    journal_writer: Arc<JournalWriter>,
    refdata_store: Arc<dyn ReferenceDataStore>,
    auditor: Arc<dyn Auditor>,
    role_resolver: Arc<dyn CloseRoleResolver>,
    subledger_closer: Option<Arc<dyn SubledgerCloser>>,
    adjustment_poster: Option<Arc<dyn AdjustmentPoster>>,
    closing_entry_poster: Option<Arc<dyn ClosingEntryPoster>>,
    runs: Mutex<BTreeMap<String, PeriodCloseRun>>,
}

impl CloseOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        period_controller: Arc<PeriodController>,
        journal_writer: Arc<JournalWriter>,
        refdata_store: Arc<dyn ReferenceDataStore>,
        auditor: Arc<dyn Auditor>,
        role_resolver: Arc<dyn CloseRoleResolver>,
        subledger_closer: Option<Arc<dyn SubledgerCloser>>,
        adjustment_poster: Option<Arc<dyn AdjustmentPoster>>,
        closing_entry_poster: Option<Arc<dyn ClosingEntryPoster>>,
    ) -> Self {
        Self {
            period_controller,
            journal_writer,
            refdata_store,
            auditor,
            role_resolver,
            subledger_closer,
            adjustment_poster,
            closing_entry_poster,
            runs: Mutex::new(BTreeMap::new()),
        }
    }

    async fn check_authority(&self, actor_id: ActorId, phase: u8) -> Result<(), CloseError> {
        let required = phase_authority(phase);
        let actual = self.role_resolver.resolve(actor_id).await;
        if actual < required {
            return Err(CloseError::AuthorityDenied {
                actor_id,
                required,
                actual,
                phase,
            });
        }
        Ok(())
    }

    /// R25: acquires the exclusive close lock by transitioning the period
    /// `OPEN -> CLOSING`. From this point on, only close postings may
    /// target the period.
    pub async fn begin_close(&self, period_code: &str, actor_id: ActorId, is_year_end: bool) -> Result<PeriodCloseRun, CloseError> {
        self.check_authority(actor_id, 1).await?;

        let run_id = Uuid::new_v4();
        let correlation_id = Uuid::new_v4();
        self.period_controller.begin_closing(period_code, run_id, actor_id).await?;
        ledger_audit::record_close_begun(self.auditor.as_ref(), period_code, correlation_id, actor_id).await?;

        let run = PeriodCloseRun {
            run_id,
            period_code: period_code.to_string(),
            correlation_id,
            status: CloseRunStatus::InProgress,
            current_phase: 0,
            started_at: Utc::now(),
            started_by: actor_id,
            is_year_end,
        };
        self.runs.lock().await.insert(period_code.to_string(), run.clone());
        tracing::info!(period_code, run_id = %run_id, "close_begun");
        Ok(run)
    }

    pub async fn run_phase(&self, run: &PeriodCloseRun, phase: u8, actor_id: ActorId) -> Result<ClosePhaseResult, CloseError> {
        self.check_authority(actor_id, phase).await?;
        let result = match phase {
            1 => self.phase_1_close_subledgers(run, actor_id).await?,
            2 => self.phase_2_verify_trial_balance(run).await?,
            3 => self.phase_3_adjustments(run, actor_id).await,
            4 => self.phase_4_closing_entries(run, actor_id).await,
            5 => self.phase_5_close_gl(run, actor_id).await?,
            6 => self.phase_6_lock_period(run, actor_id).await?,
            other => ClosePhaseResult {
                phase: other,
                phase_name: "unknown".to_string(),
                status: ClosePhaseStatus::Failed,
                message: Some(format!("unknown phase: {other}")),
                details: BTreeMap::new(),
            },
        };
        tracing::info!(
            correlation_id = %run.correlation_id,
            phase,
            phase_name = %result.phase_name,
            status = ?result.status,
            "close_phase_completed"
        );
        Ok(result)
    }

    async fn phase_1_close_subledgers(&self, run: &PeriodCloseRun, actor_id: ActorId) -> Result<ClosePhaseResult, CloseError> {
        let Some(closer) = &self.subledger_closer else {
            return Ok(ClosePhaseResult {
                phase: 1,
                phase_name: "close_subledgers".to_string(),
                status: ClosePhaseStatus::Skipped,
                message: Some("no subledger closer configured".to_string()),
                details: BTreeMap::new(),
            });
        };

        let period = self
            .period_controller
            .period_for(&run.period_code)
            .await
            .ok_or_else(|| ledger_period::PeriodError::NotFound(run.period_code.clone()))?;

        let mut details = BTreeMap::new();
        let mut all_closed = true;
        for subledger_type in SUBLEDGER_CLOSE_ORDER {
            match closer.close_subledger(subledger_type, period.end_date, actor_id).await {
                Ok(true) => {
                    ledger_audit::record_subledger_closed(self.auditor.as_ref(), &run.period_code, subledger_type, actor_id).await?;
                    details.insert((*subledger_type).to_string(), serde_json::json!({"closed": true}));
                }
                Ok(false) => {
                    all_closed = false;
                    details.insert((*subledger_type).to_string(), serde_json::json!({"closed": false}));
                }
                Err(error) => {
                    all_closed = false;
                    details.insert((*subledger_type).to_string(), serde_json::json!({"closed": false, "error": error}));
                }
            }
        }

        Ok(ClosePhaseResult {
            phase: 1,
            phase_name: "close_subledgers".to_string(),
            status: if all_closed { ClosePhaseStatus::Ok } else { ClosePhaseStatus::Failed },
            message: Some(if all_closed { "all subledgers closed".to_string() } else { "one or more subledgers failed to close".to_string() }),
            details,
        })
    }

    async fn phase_2_verify_trial_balance(&self, run: &PeriodCloseRun) -> Result<ClosePhaseResult, CloseError> {
        let period = self
            .period_controller
            .period_for(&run.period_code)
            .await
            .ok_or_else(|| ledger_period::PeriodError::NotFound(run.period_code.clone()))?;

        let entries = self.journal_writer.all_entries().await;
        let refdata = self.refdata_store.snapshot().await;
        let rows = ledger_selectors::ledger::trial_balance(&entries, &refdata, Some(period.end_date));
        let total_debits: Decimal = rows.iter().map(|r| r.debit_total).sum();
        let total_credits: Decimal = rows.iter().map(|r| r.credit_total).sum();
        let balanced = total_debits == total_credits;

        let mut details = BTreeMap::new();
        details.insert("total_debits".to_string(), serde_json::json!(total_debits.to_string()));
        details.insert("total_credits".to_string(), serde_json::json!(total_credits.to_string()));

        Ok(ClosePhaseResult {
            phase: 2,
            phase_name: "verify_trial_balance".to_string(),
            status: if balanced { ClosePhaseStatus::Ok } else { ClosePhaseStatus::Failed },
            message: Some(if balanced { "trial balance balanced".to_string() } else { "trial balance NOT balanced".to_string() }),
            details,
        })
    }

    async fn phase_3_adjustments(&self, run: &PeriodCloseRun, actor_id: ActorId) -> ClosePhaseResult {
        let Some(poster) = &self.adjustment_poster else {
            return ClosePhaseResult {
                phase: 3,
                phase_name: "post_adjustments".to_string(),
                status: ClosePhaseStatus::Skipped,
                message: Some("no adjustment callback configured".to_string()),
                details: BTreeMap::new(),
            };
        };

        match poster.post_adjustments(&run.period_code, actor_id).await {
            Ok(count) => {
                let mut details = BTreeMap::new();
                details.insert("adjustment_count".to_string(), serde_json::json!(count));
                ClosePhaseResult {
                    phase: 3,
                    phase_name: "post_adjustments".to_string(),
                    status: ClosePhaseStatus::Ok,
                    message: Some(format!("{count} adjustments posted")),
                    details,
                }
            }
            Err(error) => ClosePhaseResult {
                phase: 3,
                phase_name: "post_adjustments".to_string(),
                status: ClosePhaseStatus::Failed,
                message: Some(error),
                details: BTreeMap::new(),
            },
        }
    }

    async fn phase_4_closing_entries(&self, run: &PeriodCloseRun, actor_id: ActorId) -> ClosePhaseResult {
        if !run.is_year_end {
            return ClosePhaseResult {
                phase: 4,
                phase_name: "post_closing_entries".to_string(),
                status: ClosePhaseStatus::Skipped,
                message: Some("not year-end".to_string()),
                details: BTreeMap::new(),
            };
        }

        let Some(poster) = &self.closing_entry_poster else {
            return ClosePhaseResult {
                phase: 4,
                phase_name: "post_closing_entries".to_string(),
                status: ClosePhaseStatus::Skipped,
                message: Some("no closing-entry poster configured".to_string()),
                details: BTreeMap::new(),
            };
        };

        let Some(period) = self.period_controller.period_for(&run.period_code).await else {
            return ClosePhaseResult {
                phase: 4,
                phase_name: "post_closing_entries".to_string(),
                status: ClosePhaseStatus::Failed,
                message: Some(format!("period {} not found", run.period_code)),
                details: BTreeMap::new(),
            };
        };

        match poster.post_closing_entries(&run.period_code, period.end_date, actor_id).await {
            Ok(count) => {
                let mut details = BTreeMap::new();
                details.insert("entry_count".to_string(), serde_json::json!(count));
                ClosePhaseResult {
                    phase: 4,
                    phase_name: "post_closing_entries".to_string(),
                    status: ClosePhaseStatus::Ok,
                    message: Some(format!("closing entries posted ({count})")),
                    details,
                }
            }
            Err(error) => ClosePhaseResult {
                phase: 4,
                phase_name: "post_closing_entries".to_string(),
                status: ClosePhaseStatus::Failed,
                message: Some(error),
                details: BTreeMap::new(),
            },
        }
    }

    async fn phase_5_close_gl(&self, run: &PeriodCloseRun, actor_id: ActorId) -> Result<ClosePhaseResult, CloseError> {
        self.period_controller.close_period(&run.period_code, actor_id, Utc::now()).await?;
        ledger_audit::record_period_closed(self.auditor.as_ref(), &run.period_code, actor_id).await?;
        Ok(ClosePhaseResult {
            phase: 5,
            phase_name: "close_gl_period".to_string(),
            status: ClosePhaseStatus::Ok,
            message: Some(format!("period {} -> CLOSED", run.period_code)),
            details: BTreeMap::new(),
        })
    }

    async fn phase_6_lock_period(&self, run: &PeriodCloseRun, actor_id: ActorId) -> Result<ClosePhaseResult, CloseError> {
        if !run.is_year_end {
            return Ok(ClosePhaseResult {
                phase: 6,
                phase_name: "lock_period".to_string(),
                status: ClosePhaseStatus::Skipped,
                message: Some("not year-end".to_string()),
                details: BTreeMap::new(),
            });
        }
        self.period_controller.lock_period(&run.period_code, actor_id).await?;
        Ok(ClosePhaseResult {
            phase: 6,
            phase_name: "lock_period".to_string(),
            status: ClosePhaseStatus::Ok,
            message: Some(format!("period {} -> LOCKED", run.period_code)),
            details: BTreeMap::new(),
        })
    }

    async fn build_certificate(&self, run: &PeriodCloseRun, phase_results: &[ClosePhaseResult], actor_id: ActorId) -> Result<CloseCertificate, CloseError> {
        let period = self.period_controller.period_for(&run.period_code).await;
        let as_of = period.as_ref().map(|p| p.end_date);

        let entries = self.journal_writer.all_entries().await;
        let ledger_hash = ledger_selectors::ledger::canonical_hash(&entries, as_of)?;

        let refdata = self.refdata_store.snapshot().await;
        let rows = ledger_selectors::ledger::trial_balance(&entries, &refdata, as_of);
        let trial_balance_debits: Decimal = rows.iter().map(|r| r.debit_total).sum();
        let trial_balance_credits: Decimal = rows.iter().map(|r| r.credit_total).sum();

        let subledgers_closed: Vec<String> = phase_results
            .iter()
            .find(|r| r.phase == 1)
            .map(|r| {
                r.details
                    .iter()
                    .filter(|(_, v)| v.get("closed").and_then(serde_json::Value::as_bool).unwrap_or(false))
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default();

        let phases_completed = phase_results.iter().filter(|r| r.status == ClosePhaseStatus::Ok).count() as u8;
        let phases_skipped = phase_results.iter().filter(|r| r.status == ClosePhaseStatus::Skipped).count() as u8;

        let certificate_id = Uuid::new_v4();
        let audit_event = ledger_audit::record_close_certified(self.auditor.as_ref(), certificate_id, &run.period_code, actor_id).await?;

        Ok(CloseCertificate {
            certificate_id,
            period_code: run.period_code.clone(),
            closed_at: Utc::now(),
            closed_by: actor_id,
            correlation_id: run.correlation_id,
            ledger_hash,
            trial_balance_debits,
            trial_balance_credits,
            subledgers_closed,
            phases_completed,
            phases_skipped,
            audit_event_id: Some(audit_event.audit_id),
        })
    }

    /// Runs phases 1..6 in order. Stops at the first phase whose status is
    /// `Failed` and returns a `Failed` outcome with no certificate; a
    /// `Skipped` phase is not a failure and the run continues.
    pub async fn close_period_full(&self, period_code: &str, actor_id: ActorId, is_year_end: bool) -> Result<CloseRunOutcome, CloseError> {
        let run = self.begin_close(period_code, actor_id, is_year_end).await?;
        let mut phase_results = Vec::new();

        for phase in 1..=6u8 {
            let result = self.run_phase(&run, phase, actor_id).await?;
            let failed = result.status == ClosePhaseStatus::Failed;
            phase_results.push(result);
            if failed {
                self.runs.lock().await.remove(period_code);
                return Ok(CloseRunOutcome {
                    period_code: period_code.to_string(),
                    status: CloseRunStatus::Failed,
                    correlation_id: run.correlation_id,
                    phases_completed: phase - 1,
                    phases_total: 6,
                    message: format!("failed at phase {phase}"),
                    phase_results,
                    started_at: run.started_at,
                    completed_at: Utc::now(),
                    certificate: None,
                });
            }
        }

        let certificate = self.build_certificate(&run, &phase_results, actor_id).await?;
        let phases_completed = phase_results.iter().filter(|r| r.status == ClosePhaseStatus::Ok).count() as u8;
        self.runs.lock().await.remove(period_code);

        Ok(CloseRunOutcome {
            period_code: period_code.to_string(),
            status: CloseRunStatus::Completed,
            correlation_id: run.correlation_id,
            phases_completed,
            phases_total: 6,
            message: format!("period {period_code} closed successfully"),
            phase_results,
            started_at: run.started_at,
            completed_at: Utc::now(),
            certificate: Some(certificate),
        })
    }

    /// Releases the R25 close lock, reverting `CLOSING -> OPEN`. Requires
    /// Approver authority, the same threshold as phase 5.
    pub async fn cancel_close(&self, period_code: &str, actor_id: ActorId, reason: &str) -> Result<(), CloseError> {
        self.check_authority(actor_id, 5).await?;
        self.period_controller.cancel_closing(period_code).await?;
        ledger_audit::record_close_cancelled(self.auditor.as_ref(), period_code, reason, actor_id).await?;
        self.runs.lock().await.remove(period_code);
        Ok(())
    }

    /// Read-only status of the run tracked for `period_code`, if any. The
    /// run is removed from tracking once it completes, fails, or is
    /// cancelled.
    pub async fn run_status(&self, period_code: &str) -> Result<PeriodCloseRun, CloseError> {
        self.runs
            .lock()
            .await
            .get(period_code)
            .cloned()
            .ok_or_else(|| CloseError::NoRunInProgress(period_code.to_string()))
    }
}
