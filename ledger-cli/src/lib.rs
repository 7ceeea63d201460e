//! Thin demonstration binary wiring the kernel crates into one in-memory
//! pipeline, in the shape of the teacher's own `cli` crate: one `anyhow`
//! top-level `run`, a demo-context builder, and a `--format text|json`
//! switch on the read commands.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use ledger_audit::{Auditor, InMemoryAuditor};
use ledger_close::{CloseOrchestrator, DefaultCloseRoleResolver};
use ledger_ingest::EventIngestor;
use ledger_journal::{JournalWriter, ProposedJournalEntry, ProposedLine};
use ledger_links::LinkGraph;
use ledger_period::PeriodController;
use ledger_posting::{PostingOrchestrator, PostingStrategy, StrategyRegistry};
use ledger_refdata::{InMemoryReferenceDataStore, ReferenceDataCache, ReferenceDataStore};
use ledger_reversal::ReversalService;
use ledger_sequence::InMemorySequenceAllocator;
use ledger_types::{Account, AccountId, AccountType, ActorId, PostingSide, SystemClock};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "ledger", about = "Demonstration CLI over the posting kernel")]
pub struct LedgerCli {
    #[command(subcommand)]
    command: LedgerCommand,
}

#[derive(Debug, Subcommand)]
enum LedgerCommand {
    /// Seed a demo chart of accounts and period, post one sale, show the result.
    Demo {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Post a sale event for the given amount against the demo chart of accounts.
    PostSale {
        #[arg(long)]
        amount: Decimal,
        #[arg(long, default_value = "USD")]
        currency: String,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Run the full six-phase close over the demo period.
    Close {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl OutputFormat {
    fn is_json(self) -> bool {
        matches!(self, OutputFormat::Json)
    }
}

pub async fn run(cli: LedgerCli) -> Result<()> {
    match cli.command {
        LedgerCommand::Demo { format } => run_demo(format).await,
        LedgerCommand::PostSale { amount, currency, format } => run_post_sale(amount, &currency, format).await,
        LedgerCommand::Close { format } => run_close(format).await,
    }
}

const PERIOD_CODE: &str = "2024-01";
const DEMO_ACTOR: ActorId = Uuid::nil();

struct DemoChart {
    cash: AccountId,
    sales_revenue: AccountId,
}

struct DemoContext {
    chart: DemoChart,
    period_controller: Arc<PeriodController>,
    journal_writer: Arc<JournalWriter>,
    refdata_store: Arc<dyn ReferenceDataStore>,
    auditor: Arc<dyn Auditor>,
    posting_orchestrator: PostingOrchestrator,
    reversal_service: ReversalService,
    close_orchestrator: CloseOrchestrator,
}

struct SaleStrategy {
    cash: AccountId,
    sales_revenue: AccountId,
}

impl PostingStrategy for SaleStrategy {
    fn interpret(&self, event: &ledger_types::Event, _refdata: &ReferenceDataCache) -> Result<ProposedJournalEntry, Vec<String>> {
        let amount = event
            .payload
            .get("amount")
            .and_then(serde_json::Value::as_str)
            .and_then(|raw| raw.parse::<Decimal>().ok())
            .ok_or_else(|| vec!["payload.amount must be a decimal string".to_string()])?;
        let currency = event
            .payload
            .get("currency")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| vec!["payload.currency must be a string".to_string()])?
            .to_string();

        Ok(ProposedJournalEntry {
            source_event_id: event.event_id,
            source_event_type: event.event_type.clone(),
            occurred_at: event.occurred_at,
            effective_date: event.effective_date,
            actor_id: event.actor_id,
            idempotency_key: String::new(),
            posting_rule_version: 1,
            description: Some("sale recorded".to_string()),
            entry_metadata: BTreeMap::new(),
            reversal_of_id: None,
            lines: vec![
                ProposedLine {
                    account_id: self.cash,
                    side: PostingSide::Debit,
                    amount,
                    currency: currency.clone(),
                    dimensions: BTreeMap::new(),
                    memo: None,
                    exchange_rate_id: None,
                },
                ProposedLine {
                    account_id: self.sales_revenue,
                    side: PostingSide::Credit,
                    amount,
                    currency,
                    dimensions: BTreeMap::new(),
                    memo: None,
                    exchange_rate_id: None,
                },
            ],
            rounding_accounts: BTreeMap::new(),
        })
    }
}

async fn build_demo_context() -> Result<DemoContext> {
    let clock = Arc::new(SystemClock);
    let sequence = Arc::new(InMemorySequenceAllocator::new());
    let auditor: Arc<dyn Auditor> = Arc::new(InMemoryAuditor::new(clock.clone(), sequence.clone()));
    let refdata_store: Arc<dyn ReferenceDataStore> = Arc::new(InMemoryReferenceDataStore::new());

    let cash = Uuid::new_v4();
    let sales_revenue = Uuid::new_v4();
    refdata_store
        .upsert_account(Account {
            account_id: cash,
            code: "1000".to_string(),
            name: "Cash".to_string(),
            account_type: AccountType::Asset,
            is_active: true,
            subledger_type: None,
        })
        .await?;
    refdata_store
        .upsert_account(Account {
            account_id: sales_revenue,
            code: "4000".to_string(),
            name: "Sales Revenue".to_string(),
            account_type: AccountType::Revenue,
            is_active: true,
            subledger_type: None,
        })
        .await?;

    let period_controller = Arc::new(PeriodController::new());
    period_controller
        .create_period(
            PERIOD_CODE,
            "January 2024",
            NaiveDate::from_ymd_opt(2024, 1, 1).context("invalid period start")?,
            NaiveDate::from_ymd_opt(2024, 1, 31).context("invalid period end")?,
            true,
        )
        .await?;

    let journal_writer = Arc::new(JournalWriter::new(clock.clone(), sequence.clone()));
    let event_ingestor = Arc::new(EventIngestor::new(clock.clone(), Some(auditor.clone())));
    let link_graph = Arc::new(LinkGraph::new());

    let mut strategies = StrategyRegistry::new();
    strategies.register("sale.recorded", 1, Arc::new(SaleStrategy { cash, sales_revenue }));

    let posting_orchestrator = PostingOrchestrator::new(
        event_ingestor,
        refdata_store.clone(),
        period_controller.clone(),
        journal_writer.clone(),
        auditor.clone(),
        strategies,
    );
    let reversal_service = ReversalService::new(
        journal_writer.clone(),
        period_controller.clone(),
        link_graph.clone(),
        auditor.clone(),
        refdata_store.clone(),
    );
    let close_orchestrator = CloseOrchestrator::new(
        period_controller.clone(),
        journal_writer.clone(),
        refdata_store.clone(),
        auditor.clone(),
        Arc::new(DefaultCloseRoleResolver),
        None,
        None,
        None,
    );

    Ok(DemoContext {
        chart: DemoChart { cash, sales_revenue },
        period_controller,
        journal_writer,
        refdata_store,
        auditor,
        posting_orchestrator,
        reversal_service,
        close_orchestrator,
    })
}

async fn post_sample_sale(context: &DemoContext, amount: Decimal, currency: &str) -> Result<ledger_posting::PostingResult> {
    let result = context
        .posting_orchestrator
        .post_event(
            Uuid::new_v4(),
            "sale.recorded",
            1,
            Utc::now(),
            NaiveDate::from_ymd_opt(2024, 1, 15).context("invalid effective date")?,
            DEMO_ACTOR,
            "ledger-cli",
            serde_json::json!({ "amount": amount.to_string(), "currency": currency }),
            1,
        )
        .await
        .map_err(|err| anyhow!(err))?;
    Ok(result)
}

async fn run_demo(format: OutputFormat) -> Result<()> {
    let context = build_demo_context().await?;
    println!("Chart: Cash={} Sales Revenue={}", context.chart.cash, context.chart.sales_revenue);
    let result = post_sample_sale(&context, Decimal::new(12500, 2), "USD").await?;
    let entry_id = result.entry_id.ok_or_else(|| anyhow!("demo sale did not post: {:?}", result.message))?;

    let reversal = context
        .reversal_service
        .reverse_in_same_period(entry_id, "demo reversal", DEMO_ACTOR, None, None)
        .await
        .map_err(|err| anyhow!(err))?;

    let entries = context.journal_writer.all_entries().await;
    let refdata = context.refdata_store.snapshot().await;
    let trial_balance = ledger_selectors::ledger::trial_balance(&entries, &refdata, None);

    if format.is_json() {
        let payload = DemoOutput {
            posting_status: format!("{:?}", result.status),
            entry_id: Some(entry_id.to_string()),
            reversal_entry_id: Some(reversal.reversal_entry_id.to_string()),
            trial_balance: trial_balance
                .iter()
                .map(|row| TrialBalanceRowOutput {
                    account_code: row.account_code.clone(),
                    currency: row.currency.clone(),
                    debit_total: row.debit_total.to_string(),
                    credit_total: row.credit_total.to_string(),
                })
                .collect(),
        };
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!("Posted sale: {:?} (entry {entry_id})", result.status);
    println!("Reversed by entry {}", reversal.reversal_entry_id);
    println!("Trial balance as of period end (net of reversal):");
    for row in &trial_balance {
        println!("  {} {} • debit {} • credit {}", row.account_code, row.currency, row.debit_total, row.credit_total);
    }
    Ok(())
}

async fn run_post_sale(amount: Decimal, currency: &str, format: OutputFormat) -> Result<()> {
    let context = build_demo_context().await?;
    let result = post_sample_sale(&context, amount, currency).await?;

    if format.is_json() {
        println!(
            "{}",
            serde_json::to_string_pretty(&PostSaleOutput {
                status: format!("{:?}", result.status),
                entry_id: result.entry_id.map(|id| id.to_string()),
                message: result.message.clone(),
            })?
        );
        return Ok(());
    }

    println!("Status: {:?}", result.status);
    if let Some(entry_id) = result.entry_id {
        println!("Entry: {entry_id}");
    }
    if let Some(message) = result.message {
        println!("Message: {message}");
    }
    Ok(())
}

async fn run_close(format: OutputFormat) -> Result<()> {
    let context = build_demo_context().await?;
    post_sample_sale(&context, Decimal::new(5000, 2), "USD").await?;

    let outcome = context
        .close_orchestrator
        .close_period_full(PERIOD_CODE, DEMO_ACTOR, false)
        .await
        .map_err(|err| anyhow!(err))?;

    if format.is_json() {
        let payload = CloseOutput {
            status: format!("{:?}", outcome.status),
            phases_completed: outcome.phases_completed,
            phases_total: outcome.phases_total,
            certificate_hash: outcome.certificate.as_ref().map(|c| c.ledger_hash.clone()),
        };
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!("Close status: {:?} ({}/{} phases completed)", outcome.status, outcome.phases_completed, outcome.phases_total);
    for phase in &outcome.phase_results {
        println!("  phase {} ({}): {:?} — {}", phase.phase, phase.phase_name, phase.status, phase.message.clone().unwrap_or_default());
    }
    if let Some(certificate) = outcome.certificate {
        println!("Certificate {} • ledger hash {}", certificate.certificate_id, certificate.ledger_hash);
    }

    context.auditor.validate_chain().await.map_err(|err| anyhow!(err))?;
    println!("Audit chain verified.");
    if let Some(period) = context.period_controller.period_for(PERIOD_CODE).await {
        println!("Period {} is now {:?}.", period.period_code, period.status);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct DemoOutput {
    posting_status: String,
    entry_id: Option<String>,
    reversal_entry_id: Option<String>,
    trial_balance: Vec<TrialBalanceRowOutput>,
}

#[derive(Debug, Serialize)]
struct TrialBalanceRowOutput {
    account_code: String,
    currency: String,
    debit_total: String,
    credit_total: String,
}

#[derive(Debug, Serialize)]
struct PostSaleOutput {
    status: String,
    entry_id: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct CloseOutput {
    status: String,
    phases_completed: u8,
    phases_total: u8,
    certificate_hash: Option<String>,
}
