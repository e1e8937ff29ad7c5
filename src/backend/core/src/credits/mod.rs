//! Credit gate: the only path between LLM usage and a user's balance.
//!
//! Pre-flight refuses to spend money for a user who is already at or below
//! zero. Post-flight converts token usage into credits and records it through
//! the store's single transactional charge.

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{CoreError, ErrorCode, Result};
use crate::pipeline::Stage;
use crate::store::{Store, UsageLedgerEntry};

/// Token usage from one completed stage call.
#[derive(Debug, Clone)]
pub struct StageUsage {
    pub user_id: Uuid,
    pub project_id: Option<Uuid>,
    pub paper_id: Option<Uuid>,
    pub stage: Stage,
    pub model_name: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Atomic credit accounting around LLM calls.
pub struct CreditGate {
    store: Arc<dyn Store>,
    /// Used when no multiplier row is stored.
    default_multiplier: f64,
}

impl CreditGate {
    pub fn new(store: Arc<dyn Store>, default_multiplier: f64) -> Self {
        Self { store, default_multiplier }
    }

    /// Refuse work before any external call is made.
    pub async fn preflight(&self, user_id: Uuid) -> Result<()> {
        let balance = self.store.balance(user_id).await?;
        if balance <= 0.0 {
            return Err(CoreError::new(
                ErrorCode::InsufficientCredits,
                "Insufficient credits",
            ));
        }
        Ok(())
    }

    /// Charge for completed usage: ledger entry + balance decrement in one
    /// transactional store call. Zero-cost usage (no pricing row) is still
    /// ledgered for the audit trail.
    pub async fn charge(&self, usage: StageUsage) -> Result<()> {
        let cost_usd = self.cost_usd(&usage).await?;
        let multiplier = self
            .store
            .credit_multiplier()
            .await?
            .unwrap_or(self.default_multiplier);
        let credits = cost_usd * multiplier;

        let entry = UsageLedgerEntry {
            id: Uuid::new_v4(),
            user_id: usage.user_id,
            project_id: usage.project_id,
            paper_id: usage.paper_id,
            stage: usage.stage,
            model_name: usage.model_name.clone(),
            input_tokens: usage.input_tokens as i64,
            output_tokens: usage.output_tokens as i64,
            cost_usd,
            created_at: Utc::now(),
        };
        self.store.charge(&entry, credits).await?;

        tracing::info!(
            user_id = %usage.user_id,
            stage = usage.stage.as_str(),
            model = %usage.model_name,
            cost_usd = format!("{:.6}", cost_usd),
            credits = format!("{:.4}", credits),
            "Usage charged"
        );
        metrics::counter!("litrev_credits_charged_total").increment((credits * 100.0) as u64);
        Ok(())
    }

    /// Per-side rounding in cents, matching the pricing table's unit.
    async fn cost_usd(&self, usage: &StageUsage) -> Result<f64> {
        let Some(pricing) = self.store.model_pricing(&usage.model_name).await? else {
            tracing::warn!(model = %usage.model_name, "No pricing for model; charging zero");
            return Ok(0.0);
        };
        let input_cents =
            ((usage.input_tokens as f64 / 1_000_000.0) * pricing.input_cents_per_million).round();
        let output_cents =
            ((usage.output_tokens as f64 / 1_000_000.0) * pricing.output_cents_per_million).round();
        Ok((input_cents + output_cents) / 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, ModelPricing};

    fn usage(user_id: Uuid, model: &str) -> StageUsage {
        StageUsage {
            user_id,
            project_id: None,
            paper_id: None,
            stage: Stage::Intent,
            model_name: model.to_string(),
            input_tokens: 500_000,
            output_tokens: 250_000,
        }
    }

    #[tokio::test]
    async fn test_preflight_blocks_at_zero() {
        let store = Arc::new(MemoryStore::new());
        let user_id = store.add_user("a@example.com", 0.0);
        let gate = CreditGate::new(store.clone(), 100.0);
        let err = gate.preflight(user_id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InsufficientCredits);

        store.set_balance(user_id, 0.01);
        assert!(gate.preflight(user_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_charge_rounds_per_side_and_applies_multiplier() {
        let store = Arc::new(MemoryStore::new());
        let user_id = store.add_user("a@example.com", 100.0);
        store.set_pricing(ModelPricing {
            model_name: "test-model".into(),
            provider: "openai".into(),
            input_cents_per_million: 30.0,
            output_cents_per_million: 60.0,
        });
        store.set_multiplier(100.0);

        let gate = CreditGate::new(store.clone(), 100.0);
        // 0.5M input, 15 cents; 0.25M output, 15 cents; total $0.30 = 30 credits
        gate.charge(usage(user_id, "test-model")).await.unwrap();

        assert!((store.balance(user_id).await.unwrap() - 70.0).abs() < 1e-9);
        let ledger = store.ledger_snapshot();
        assert_eq!(ledger.len(), 1);
        assert!((ledger[0].cost_usd - 0.30).abs() < 1e-9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_charges_keep_ledger_and_balance_in_step() {
        let store = Arc::new(MemoryStore::new());
        let user_id = store.add_user("a@example.com", 1_000.0);
        store.set_pricing(ModelPricing {
            model_name: "test-model".into(),
            provider: "openai".into(),
            input_cents_per_million: 30.0,
            output_cents_per_million: 60.0,
        });
        store.set_multiplier(100.0);
        let gate = Arc::new(CreditGate::new(store.clone(), 100.0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.charge(usage(user_id, "test-model")).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // 16 charges at $0.30 / 30 credits each: ledger and balance must
        // account for exactly the same usage.
        let ledger = store.ledger_snapshot();
        assert_eq!(ledger.len(), 16);
        let total_cost: f64 = ledger.iter().map(|e| e.cost_usd).sum();
        assert!((total_cost - 4.80).abs() < 1e-9);
        assert!((store.balance(user_id).await.unwrap() - 520.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_missing_pricing_charges_zero_but_ledgers() {
        let store = Arc::new(MemoryStore::new());
        let user_id = store.add_user("a@example.com", 50.0);
        let gate = CreditGate::new(store.clone(), 100.0);

        gate.charge(usage(user_id, "unknown-model")).await.unwrap();
        assert_eq!(store.balance(user_id).await.unwrap(), 50.0);
        assert_eq!(store.ledger_snapshot().len(), 1);
    }
}
