// Token ledger and daily proactive budget.
//
// Every model call appends one row. Proactive usage is summed per UTC day
// and drives the scheduler's adaptive sleep; reactive usage is unbounded but
// warned about per call.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use adjutant_providers::TokenUsage;
use adjutant_store::{Store, StoreResult};
use adjutant_types::{LedgerEntry, LedgerScope};

/// Per-million-token rates for one model.
#[derive(Debug, Clone, Copy)]
pub struct ModelRates {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    rates: HashMap<String, ModelRates>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, model: &str, input_per_million: f64, output_per_million: f64) -> Self {
        self.rates.insert(
            model.to_string(),
            ModelRates {
                input_per_million,
                output_per_million,
            },
        );
        self
    }

    /// Cost of a call, rounded to 1e-6 so daily sums stay stable. Unknown
    /// models cost zero.
    pub fn cost(&self, model: &str, usage: TokenUsage) -> f64 {
        let Some(rates) = self.rates.get(model) else {
            return 0.0;
        };
        let raw = usage.tokens_in as f64 / 1_000_000.0 * rates.input_per_million
            + usage.tokens_out as f64 / 1_000_000.0 * rates.output_per_million;
        (raw * 1_000_000.0).round() / 1_000_000.0
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BudgetStatus {
    pub used: i64,
    pub remaining: i64,
    pub usage_ratio: f64,
}

#[derive(Clone)]
pub struct TokenLedger {
    store: Arc<Store>,
    pricing: Arc<PricingTable>,
    daily_limit: i64,
    reactive_warn_threshold: i64,
}

impl TokenLedger {
    pub fn new(
        store: Arc<Store>,
        pricing: PricingTable,
        daily_limit: i64,
        reactive_warn_threshold: i64,
    ) -> Self {
        Self {
            store,
            pricing: Arc::new(pricing),
            daily_limit,
            reactive_warn_threshold,
        }
    }

    /// Append one usage row. Reactive calls over the warning threshold are
    /// logged but never blocked.
    pub async fn record(
        &self,
        scope: LedgerScope,
        provider: &str,
        model: &str,
        usage: TokenUsage,
        meta: Option<Value>,
    ) -> StoreResult<LedgerEntry> {
        let entry = LedgerEntry {
            id: uuid::Uuid::new_v4().to_string(),
            scope,
            provider: provider.to_string(),
            model: model.to_string(),
            tokens_in: usage.tokens_in,
            tokens_out: usage.tokens_out,
            tokens_total: usage.total(),
            cost: self.pricing.cost(model, usage),
            created_at: Utc::now(),
            meta,
        };
        self.store.record_ledger(&entry).await?;

        if scope == LedgerScope::Reactive && entry.tokens_total > self.reactive_warn_threshold {
            warn!(
                tokens = entry.tokens_total,
                threshold = self.reactive_warn_threshold,
                model,
                "reactive call exceeded token warning threshold"
            );
        }
        Ok(entry)
    }

    /// Budget state for a `YYYY-MM-DD` UTC day.
    pub async fn budget_status(&self, day: &str) -> StoreResult<BudgetStatus> {
        let used = self.store.proactive_tokens_for_day(day).await?;
        let remaining = (self.daily_limit - used).max(0);
        let usage_ratio = if self.daily_limit <= 0 {
            1.0
        } else {
            used as f64 / self.daily_limit as f64
        };
        Ok(BudgetStatus {
            used,
            remaining,
            usage_ratio,
        })
    }

    pub fn daily_limit(&self) -> i64 {
        self.daily_limit
    }
}

/// Today's ledger day key.
pub fn today_utc() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pricing() -> PricingTable {
        PricingTable::new().with_rate("gpt-4o-mini", 0.15, 0.60)
    }

    #[test]
    fn cost_rounds_to_micro_units() {
        let usage = TokenUsage {
            tokens_in: 1234,
            tokens_out: 567,
        };
        let cost = pricing().cost("gpt-4o-mini", usage);
        assert_eq!(cost, (cost * 1_000_000.0).round() / 1_000_000.0);
        assert!(cost > 0.0);
    }

    #[test]
    fn unknown_model_costs_zero() {
        let usage = TokenUsage {
            tokens_in: 1_000_000,
            tokens_out: 1_000_000,
        };
        assert_eq!(pricing().cost("mystery", usage), 0.0);
    }

    #[tokio::test]
    async fn budget_status_tracks_proactive_sum() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let ledger = TokenLedger::new(store, pricing(), 7_000_000, 100_000);

        ledger
            .record(
                LedgerScope::Proactive,
                "openrouter",
                "gpt-4o-mini",
                TokenUsage {
                    tokens_in: 2_000_000,
                    tokens_out: 1_500_000,
                },
                None,
            )
            .await
            .unwrap();
        ledger
            .record(
                LedgerScope::Reactive,
                "openrouter",
                "gpt-4o-mini",
                TokenUsage {
                    tokens_in: 500_000,
                    tokens_out: 500_000,
                },
                None,
            )
            .await
            .unwrap();

        let status = ledger.budget_status(&today_utc()).await.unwrap();
        assert_eq!(status.used, 3_500_000);
        assert_eq!(status.remaining, 3_500_000);
        assert!((status.usage_ratio - 0.5).abs() < 1e-9);
    }
}
