//! Point-in-time reference data: chart of accounts, dimensions, and
//! exchange rates. Mutating operations go through [`ReferenceDataStore`];
//! a posting pipeline takes an immutable [`ReferenceDataCache`] snapshot at
//! the start of its run so every step in that run sees a consistent view,
//! the same cache-in-front-of-durable-store shape as
//! `codex-policy::DurablePolicyStore<P>`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use ledger_types::{
    Account, AccountId, CurrencyCode, Dimension, DimensionCode, DimensionValue, DimensionValueCode,
    ExchangeRate, ExchangeRateId,
};
use rust_decimal::Decimal;
use tokio::sync::RwLock;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RefDataError {
    #[error("duplicate account code: {0}")]
    DuplicateAccountCode(String),
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),
    #[error("dimension not found: {0}")]
    DimensionNotFound(DimensionCode),
    #[error("dimension value not found: {0}/{1}")]
    DimensionValueNotFound(DimensionCode, DimensionValueCode),
    #[error("dimension {0} is inactive")]
    InactiveDimension(DimensionCode),
    #[error("dimension value {0}/{1} is inactive")]
    InactiveDimensionValue(DimensionCode, DimensionValueCode),
    #[error("exchange rate {from}->{to} on {date} is inconsistent with its inverse")]
    ArbitrageRate {
        from: CurrencyCode,
        to: CurrencyCode,
        date: NaiveDate,
    },
}

#[async_trait]
pub trait ReferenceDataStore: Send + Sync {
    async fn upsert_account(&self, account: Account) -> Result<(), RefDataError>;
    async fn upsert_dimension(&self, dimension: Dimension) -> Result<(), RefDataError>;
    async fn upsert_dimension_value(&self, value: DimensionValue) -> Result<(), RefDataError>;
    async fn upsert_exchange_rate(&self, rate: ExchangeRate) -> Result<(), RefDataError>;
    /// Takes an immutable, content-hashed snapshot of the current state.
    async fn snapshot(&self) -> ReferenceDataCache;
}

#[derive(Debug, Default)]
struct State {
    accounts_by_id: BTreeMap<AccountId, Account>,
    accounts_by_code: BTreeMap<String, AccountId>,
    dimensions: BTreeMap<DimensionCode, Dimension>,
    dimension_values: BTreeMap<(DimensionCode, DimensionValueCode), DimensionValue>,
    exchange_rates: BTreeMap<(CurrencyCode, CurrencyCode, NaiveDate), ExchangeRate>,
}

#[derive(Debug, Default)]
pub struct InMemoryReferenceDataStore {
    state: RwLock<State>,
}

impl InMemoryReferenceDataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReferenceDataStore for InMemoryReferenceDataStore {
    async fn upsert_account(&self, account: Account) -> Result<(), RefDataError> {
        let mut state = self.state.write().await;
        if let Some(existing_id) = state.accounts_by_code.get(&account.code) {
            if *existing_id != account.account_id {
                return Err(RefDataError::DuplicateAccountCode(account.code));
            }
        }
        state.accounts_by_code.insert(account.code.clone(), account.account_id);
        state.accounts_by_id.insert(account.account_id, account);
        Ok(())
    }

    async fn upsert_dimension(&self, dimension: Dimension) -> Result<(), RefDataError> {
        let mut state = self.state.write().await;
        state.dimensions.insert(dimension.dimension_code.clone(), dimension);
        Ok(())
    }

    async fn upsert_dimension_value(&self, value: DimensionValue) -> Result<(), RefDataError> {
        let mut state = self.state.write().await;
        if !state.dimensions.contains_key(&value.dimension_code) {
            return Err(RefDataError::DimensionNotFound(value.dimension_code));
        }
        state
            .dimension_values
            .insert((value.dimension_code.clone(), value.value_code.clone()), value);
        Ok(())
    }

    async fn upsert_exchange_rate(&self, rate: ExchangeRate) -> Result<(), RefDataError> {
        let mut state = self.state.write().await;
        let inverse_key = (rate.to_currency.clone(), rate.from_currency.clone(), rate.valid_on);
        if let Some(inverse) = state.exchange_rates.get(&inverse_key) {
            if rate.rate * inverse.rate != Decimal::ONE {
                return Err(RefDataError::ArbitrageRate {
                    from: rate.from_currency,
                    to: rate.to_currency,
                    date: rate.valid_on,
                });
            }
        }
        let key = (rate.from_currency.clone(), rate.to_currency.clone(), rate.valid_on);
        state.exchange_rates.insert(key, rate);
        Ok(())
    }

    async fn snapshot(&self) -> ReferenceDataCache {
        let state = self.state.read().await;
        ReferenceDataCache::from_state(&state)
    }
}

/// Immutable point-in-time view handed to a single posting pipeline run.
/// Exposes a `version_hash` so a posted entry can record what reference
/// data it saw (R21), letting a replayer detect drift (R23).
#[derive(Debug, Clone)]
pub struct ReferenceDataCache {
    accounts_by_id: BTreeMap<AccountId, Account>,
    accounts_by_code: BTreeMap<String, AccountId>,
    dimensions: BTreeMap<DimensionCode, Dimension>,
    dimension_values: BTreeMap<(DimensionCode, DimensionValueCode), DimensionValue>,
    exchange_rates: BTreeMap<(CurrencyCode, CurrencyCode, NaiveDate), ExchangeRate>,
    version_hash: String,
}

impl ReferenceDataCache {
    fn from_state(state: &State) -> Self {
        let mut cache = ReferenceDataCache {
            accounts_by_id: state.accounts_by_id.clone(),
            accounts_by_code: state.accounts_by_code.clone(),
            dimensions: state.dimensions.clone(),
            dimension_values: state.dimension_values.clone(),
            exchange_rates: state.exchange_rates.clone(),
            version_hash: String::new(),
        };
        cache.version_hash = cache.compute_version_hash();
        cache
    }

    fn compute_version_hash(&self) -> String {
        let account_codes: Vec<&String> = self.accounts_by_code.keys().collect();
        let dimension_codes: Vec<&DimensionCode> = self.dimensions.keys().collect();
        let rate_keys: Vec<&(CurrencyCode, CurrencyCode, NaiveDate)> = self.exchange_rates.keys().collect();
        ledger_hashing::hash_payload(&(account_codes, dimension_codes, rate_keys)).unwrap_or_default()
    }

    pub fn version_hash(&self) -> &str {
        &self.version_hash
    }

    pub fn is_account_postable(&self, id: AccountId) -> bool {
        self.accounts_by_id.get(&id).is_some_and(Account::allows_posting)
    }

    pub fn account_by_id(&self, id: AccountId) -> Option<&Account> {
        self.accounts_by_id.get(&id)
    }

    pub fn account_by_code(&self, code: &str) -> Option<&Account> {
        self.accounts_by_code.get(code).and_then(|id| self.accounts_by_id.get(id))
    }

    /// Every account tagged with `subledger_type`, for aggregation
    /// selectors that roll a subledger up into its GL control account.
    pub fn accounts_with_subledger_type(&self, subledger_type: &str) -> Vec<&Account> {
        self.accounts_by_id
            .values()
            .filter(|a| a.subledger_type.as_deref() == Some(subledger_type))
            .collect()
    }

    pub fn is_dimension_active(&self, code: &str) -> bool {
        self.dimensions.get(code).is_some_and(|d| d.is_active)
    }

    pub fn is_dimension_value_active(&self, dim: &str, value: &str) -> bool {
        self.dimension_values
            .get(&(dim.to_string(), value.to_string()))
            .is_some_and(|v| v.is_active)
    }

    /// Validates a full dimension map for a proposed line, returning every
    /// violation found rather than failing fast on the first.
    pub fn validate_dimensions(
        &self,
        dimensions: &BTreeMap<DimensionCode, DimensionValueCode>,
    ) -> Vec<RefDataError> {
        let mut errors = Vec::new();
        for (dim, value) in dimensions {
            match self.dimensions.get(dim) {
                None => errors.push(RefDataError::DimensionNotFound(dim.clone())),
                Some(d) if !d.is_active => errors.push(RefDataError::InactiveDimension(dim.clone())),
                Some(_) => match self.dimension_values.get(&(dim.clone(), value.clone())) {
                    None => errors.push(RefDataError::DimensionValueNotFound(dim.clone(), value.clone())),
                    Some(v) if !v.is_active => {
                        errors.push(RefDataError::InactiveDimensionValue(dim.clone(), value.clone()))
                    }
                    Some(_) => {}
                },
            }
        }
        errors
    }

    pub fn resolve_rate(&self, from: &str, to: &str, on_date: NaiveDate) -> Option<(ExchangeRateId, Decimal)> {
        self.exchange_rates
            .get(&(from.to_string(), to.to_string(), on_date))
            .map(|rate| (rate.rate_id, rate.rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_types::AccountType;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn account(code: &str) -> Account {
        Account {
            account_id: Uuid::new_v4(),
            code: code.to_string(),
            name: code.to_string(),
            account_type: AccountType::Asset,
            is_active: true,
            subledger_type: None,
        }
    }

    #[tokio::test]
    async fn snapshot_reflects_upserted_accounts_and_exposes_a_version_hash() {
        let store = InMemoryReferenceDataStore::new();
        store.upsert_account(account("1000")).await.unwrap();
        let cache = store.snapshot().await;
        assert!(cache.account_by_code("1000").is_some());
        assert!(!cache.version_hash().is_empty());
    }

    #[tokio::test]
    async fn version_hash_changes_when_reference_data_changes() {
        let store = InMemoryReferenceDataStore::new();
        let before = store.snapshot().await;
        store.upsert_account(account("1000")).await.unwrap();
        let after = store.snapshot().await;
        assert_ne!(before.version_hash(), after.version_hash());
    }

    #[tokio::test]
    async fn duplicate_account_code_with_different_id_is_rejected() {
        let store = InMemoryReferenceDataStore::new();
        store.upsert_account(account("1000")).await.unwrap();
        let err = store.upsert_account(account("1000")).await.unwrap_err();
        assert!(matches!(err, RefDataError::DuplicateAccountCode(_)));
    }

    #[tokio::test]
    async fn dimension_value_requires_existing_dimension() {
        let store = InMemoryReferenceDataStore::new();
        let err = store
            .upsert_dimension_value(DimensionValue {
                dimension_code: "project".into(),
                value_code: "alpha".into(),
                name: "Alpha".into(),
                is_active: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RefDataError::DimensionNotFound(_)));
    }

    #[tokio::test]
    async fn validate_dimensions_reports_inactive_value() {
        let store = InMemoryReferenceDataStore::new();
        store
            .upsert_dimension(Dimension {
                dimension_code: "project".into(),
                name: "Project".into(),
                is_active: true,
            })
            .await
            .unwrap();
        store
            .upsert_dimension_value(DimensionValue {
                dimension_code: "project".into(),
                value_code: "alpha".into(),
                name: "Alpha".into(),
                is_active: false,
            })
            .await
            .unwrap();
        let cache = store.snapshot().await;
        let mut dims = BTreeMap::new();
        dims.insert("project".to_string(), "alpha".to_string());
        let errors = cache.validate_dimensions(&dims);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], RefDataError::InactiveDimensionValue(_, _)));
    }

    #[tokio::test]
    async fn arbitrage_rate_is_rejected() {
        let store = InMemoryReferenceDataStore::new();
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        store
            .upsert_exchange_rate(ExchangeRate {
                rate_id: Uuid::new_v4(),
                from_currency: "USD".into(),
                to_currency: "EUR".into(),
                rate: dec!(0.9),
                valid_on: date,
            })
            .await
            .unwrap();
        let err = store
            .upsert_exchange_rate(ExchangeRate {
                rate_id: Uuid::new_v4(),
                from_currency: "EUR".into(),
                to_currency: "USD".into(),
                rate: dec!(1.2),
                valid_on: date,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RefDataError::ArbitrageRate { .. }));
    }

    #[tokio::test]
    async fn consistent_inverse_rate_is_accepted() {
        let store = InMemoryReferenceDataStore::new();
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        store
            .upsert_exchange_rate(ExchangeRate {
                rate_id: Uuid::new_v4(),
                from_currency: "USD".into(),
                to_currency: "EUR".into(),
                rate: dec!(0.5),
                valid_on: date,
            })
            .await
            .unwrap();
        store
            .upsert_exchange_rate(ExchangeRate {
                rate_id: Uuid::new_v4(),
                from_currency: "EUR".into(),
                to_currency: "USD".into(),
                rate: dec!(2),
                valid_on: date,
            })
            .await
            .unwrap();
        let cache = store.snapshot().await;
        assert_eq!(cache.resolve_rate("USD", "EUR", date).map(|(_, r)| r), Some(dec!(0.5)));
    }
}
