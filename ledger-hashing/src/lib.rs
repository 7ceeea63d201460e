//! Canonical JSON encoding and the SHA-256 hash functions used throughout
//! the kernel: payload hashing, the audit hash chain, journal-entry
//! determinism hashing, trial-balance hashing, and trace-bundle hashing.
//!
//! Canonical JSON here means: object keys sorted lexicographically (free,
//! since `serde_json::Map` without the `preserve_order` feature is backed
//! by a `BTreeMap`) and no insignificant whitespace (`serde_json::to_string`
//! is already compact). Decimal amounts must be normalized by the caller
//! before being placed in a hashed payload — see [`normalized_amount`].

use std::collections::BTreeMap;

use ledger_types::{AuditAction, CurrencyCode, JournalEntry, JournalEntryId, TrialBalanceRow};
use rust_decimal::Decimal;
use serde::Serialize;
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum HashingError {
    #[error("value is not JSON-serializable: {0}")]
    Serialization(String),
}

const GENESIS_SENTINEL: &str = "GENESIS";

/// Renders a decimal with no trailing fractional zeros, matching the
/// source's `Decimal.normalize()` convention so hashes stay stable
/// regardless of the scale an amount happened to be constructed with.
pub fn normalized_amount(amount: Decimal) -> String {
    amount.normalize().to_string()
}

fn hex_sha256(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Serializes `value` to compact JSON with lexicographically sorted keys.
pub fn canonicalize<T: Serialize>(value: &T) -> Result<String, HashingError> {
    let json = serde_json::to_value(value).map_err(|e| HashingError::Serialization(e.to_string()))?;
    serde_json::to_string(&json).map_err(|e| HashingError::Serialization(e.to_string()))
}

/// `hash_payload(p)`: SHA-256 of the canonical JSON encoding of `p`.
pub fn hash_payload<T: Serialize>(payload: &T) -> Result<String, HashingError> {
    let canonical = canonicalize(payload)?;
    Ok(hex_sha256(canonical.as_bytes()))
}

/// `hash_audit_event`: chains a new audit row onto its predecessor's hash.
/// `prev_hash = None` only for the genesis row.
pub fn hash_audit_event(
    entity_type: &str,
    entity_id: &str,
    action: AuditAction,
    payload_hash: &str,
    prev_hash: Option<&str>,
) -> String {
    let action_str = canonicalize(&action).unwrap_or_default();
    let components = [
        entity_type,
        entity_id,
        action_str.trim_matches('"'),
        payload_hash,
        prev_hash.unwrap_or(GENESIS_SENTINEL),
    ];
    hex_sha256(components.join("|").as_bytes())
}

#[derive(Serialize)]
struct HashableLine {
    account_id: ledger_types::AccountId,
    side: ledger_types::PostingSide,
    amount: String,
    currency: CurrencyCode,
    is_rounding: bool,
    line_seq: u32,
}

#[derive(Serialize)]
struct HashableEntry {
    entry_id: JournalEntryId,
    lines: Vec<HashableLine>,
}

/// `hash_journal_entry`: sorts lines by `line_seq`, then canonical-hashes
/// `{entry_id, lines}`. Used for replay determinism checks and as the
/// building block for `hash_ledger_snapshot`.
pub fn hash_journal_entry(entry: &JournalEntry) -> Result<String, HashingError> {
    let mut lines: Vec<&ledger_types::JournalLine> = entry.lines.iter().collect();
    lines.sort_by_key(|line| line.line_seq);
    let hashable = HashableEntry {
        entry_id: entry.entry_id,
        lines: lines
            .into_iter()
            .map(|line| HashableLine {
                account_id: line.account_id,
                side: line.side,
                amount: normalized_amount(line.amount),
                currency: line.currency.clone(),
                is_rounding: line.is_rounding,
                line_seq: line.line_seq,
            })
            .collect(),
    };
    hash_payload(&hashable)
}

#[derive(Serialize)]
struct HashableTrialBalanceRow {
    account_id: ledger_types::AccountId,
    currency: CurrencyCode,
    debit_total: String,
    credit_total: String,
}

/// `hash_trial_balance`: sorts rows by `(account_id, currency)`, then
/// canonical-hashes the sorted list wrapped in `{trial_balance: [...]}`.
pub fn hash_trial_balance(rows: &[TrialBalanceRow]) -> Result<String, HashingError> {
    let mut sorted: Vec<&TrialBalanceRow> = rows.iter().collect();
    sorted.sort_by(|a, b| (a.account_id, &a.currency).cmp(&(b.account_id, &b.currency)));
    let hashable: Vec<HashableTrialBalanceRow> = sorted
        .into_iter()
        .map(|row| HashableTrialBalanceRow {
            account_id: row.account_id,
            currency: row.currency.clone(),
            debit_total: normalized_amount(row.debit_total),
            credit_total: normalized_amount(row.credit_total),
        })
        .collect();
    let mut wrapper = BTreeMap::new();
    wrapper.insert("trial_balance", hashable);
    hash_payload(&wrapper)
}

/// Canonical hash over a whole ledger snapshot: `hash_journal_entry` over
/// each entry (already expected sorted by `(seq, line order)` by the
/// caller), then `hash_payload` over the concatenated list — the
/// implementation behind `Selectors::ledger::canonical_hash`.
pub fn hash_ledger_snapshot(entries: &[JournalEntry]) -> Result<String, HashingError> {
    let entry_hashes = entries
        .iter()
        .map(hash_journal_entry)
        .collect::<Result<Vec<String>, HashingError>>()?;
    hash_payload(&entry_hashes)
}

/// `hash_trace_bundle`: excludes volatile fields (`generated_at`,
/// `trace_id`, and any self-referential `integrity.bundle_hash`) before
/// canonical-hashing the remainder.
pub fn hash_trace_bundle(bundle: &serde_json::Value) -> Result<String, HashingError> {
    let mut cleaned = bundle
        .as_object()
        .cloned()
        .ok_or_else(|| HashingError::Serialization("trace bundle must be a JSON object".into()))?;
    cleaned.remove("generated_at");
    cleaned.remove("trace_id");
    if let Some(serde_json::Value::Object(integrity)) = cleaned.get_mut("integrity") {
        integrity.remove("bundle_hash");
    }
    hash_payload(&cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use ledger_types::{EntryStatus, JournalLine, PostingSide};
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn sample_entry() -> JournalEntry {
        JournalEntry {
            entry_id: Uuid::nil(),
            source_event_id: Uuid::nil(),
            source_event_type: "sale".into(),
            occurred_at: Utc::now(),
            effective_date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            actor_id: Uuid::nil(),
            status: EntryStatus::Posted,
            seq: Some(1),
            posted_at: Some(Utc::now()),
            idempotency_key: "demo:sale:1".into(),
            posting_rule_version: 1,
            description: None,
            entry_metadata: BTreeMap::new(),
            reversal_of_id: None,
            lines: vec![
                JournalLine {
                    line_id: Uuid::nil(),
                    account_id: Uuid::nil(),
                    side: PostingSide::Credit,
                    amount: dec!(100.00),
                    currency: "USD".into(),
                    dimensions: BTreeMap::new(),
                    is_rounding: false,
                    line_memo: None,
                    line_seq: 1,
                    exchange_rate_id: None,
                },
                JournalLine {
                    line_id: Uuid::nil(),
                    account_id: Uuid::nil(),
                    side: PostingSide::Debit,
                    amount: dec!(100.0),
                    currency: "USD".into(),
                    dimensions: BTreeMap::new(),
                    is_rounding: false,
                    line_memo: None,
                    line_seq: 0,
                    exchange_rate_id: None,
                },
            ],
        }
    }

    #[test]
    fn hash_payload_is_deterministic_regardless_of_key_insertion_order() {
        let mut a = BTreeMap::new();
        a.insert("b", 2);
        a.insert("a", 1);
        let mut b = BTreeMap::new();
        b.insert("a", 1);
        b.insert("b", 2);
        assert_eq!(hash_payload(&a).unwrap(), hash_payload(&b).unwrap());
    }

    #[test]
    fn hash_audit_event_changes_with_different_prev_hash() {
        let h1 = hash_audit_event("JournalEntry", "1", AuditAction::JournalPosted, "ph", None);
        let h2 = hash_audit_event("JournalEntry", "1", AuditAction::JournalPosted, "ph", Some("abc"));
        assert_ne!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn hash_journal_entry_is_independent_of_input_line_order() {
        let entry = sample_entry();
        let mut reordered = entry.clone();
        reordered.lines.reverse();
        assert_eq!(hash_journal_entry(&entry).unwrap(), hash_journal_entry(&reordered).unwrap());
    }

    #[test]
    fn hash_journal_entry_is_insensitive_to_decimal_scale() {
        // 100.0 vs 100.00 normalize to the same string, so hashes must match
        // across a replay that reconstructs amounts with a different scale.
        let entry = sample_entry();
        let mut rescaled = entry.clone();
        rescaled.lines[1].amount = dec!(100.00);
        assert_eq!(hash_journal_entry(&entry).unwrap(), hash_journal_entry(&rescaled).unwrap());
    }

    #[test]
    fn hash_trial_balance_sorts_rows_before_hashing() {
        let row_a = TrialBalanceRow {
            account_id: Uuid::from_u128(1),
            account_code: "1000".into(),
            currency: "USD".into(),
            debit_total: dec!(100),
            credit_total: dec!(0),
        };
        let row_b = TrialBalanceRow {
            account_id: Uuid::from_u128(2),
            account_code: "4000".into(),
            currency: "USD".into(),
            debit_total: dec!(0),
            credit_total: dec!(100),
        };
        let forward = hash_trial_balance(&[row_a.clone(), row_b.clone()]).unwrap();
        let backward = hash_trial_balance(&[row_b, row_a]).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn hash_trace_bundle_excludes_volatile_fields() {
        let bundle_a = serde_json::json!({
            "generated_at": "2024-01-01T00:00:00Z",
            "trace_id": "11111111-1111-1111-1111-111111111111",
            "integrity": {"bundle_hash": "deadbeef", "other": 1},
            "facts": [1, 2, 3],
        });
        let bundle_b = serde_json::json!({
            "generated_at": "2099-12-31T00:00:00Z",
            "trace_id": "22222222-2222-2222-2222-222222222222",
            "integrity": {"bundle_hash": "cafef00d", "other": 1},
            "facts": [1, 2, 3],
        });
        assert_eq!(hash_trace_bundle(&bundle_a).unwrap(), hash_trace_bundle(&bundle_b).unwrap());
    }
}
