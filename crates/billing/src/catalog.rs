//! Plan catalog
//!
//! Immutable plan table built once at process start and shared by
//! reference. No component mutates it after construction.

use draftmill_shared::PlanId;
use serde::Serialize;

use crate::config::BillingConfig;

/// Quota value substituted for "unlimited" plans so downstream comparisons
/// stay plain integer arithmetic.
pub const UNLIMITED_QUOTA: i64 = 999_999;

/// A single plan: price, monthly generation quota, and the external
/// billing-provider price reference used at checkout.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub id: PlanId,
    pub monthly_price_cents: i64,
    /// None means unlimited
    pub monthly_quota: Option<u64>,
    /// External price reference; None for plans that cannot be purchased
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_ref: Option<String>,
}

impl Plan {
    /// Free plan: 100 generations/month, never purchasable
    fn free() -> Self {
        Self {
            id: PlanId::Free,
            monthly_price_cents: 0,
            monthly_quota: Some(100),
            price_ref: None,
        }
    }

    /// Starter plan: 500 generations/month
    fn starter(price_ref: Option<String>) -> Self {
        Self {
            id: PlanId::Starter,
            monthly_price_cents: 1_900,
            monthly_quota: Some(500),
            price_ref,
        }
    }

    /// Pro plan: 2,000 generations/month
    fn pro(price_ref: Option<String>) -> Self {
        Self {
            id: PlanId::Pro,
            monthly_price_cents: 4_900,
            monthly_quota: Some(2_000),
            price_ref,
        }
    }

    /// Enterprise plan: unlimited generations
    fn enterprise(price_ref: Option<String>) -> Self {
        Self {
            id: PlanId::Enterprise,
            monthly_price_cents: 19_900,
            monthly_quota: None,
            price_ref,
        }
    }
}

/// Immutable plan id -> plan table
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: Vec<Plan>,
}

impl PlanCatalog {
    pub fn new(config: &BillingConfig) -> Self {
        Self {
            plans: vec![
                Plan::free(),
                Plan::starter(config.price_starter.clone()),
                Plan::pro(config.price_pro.clone()),
                Plan::enterprise(config.price_enterprise.clone()),
            ],
        }
    }

    pub fn lookup(&self, plan_id: PlanId) -> Option<&Plan> {
        self.plans.iter().find(|p| p.id == plan_id)
    }

    /// Numeric quota for a plan, with the unlimited sentinel flattened to
    /// a large finite integer.
    ///
    /// An id missing from the catalog gets the Free entry's quota; the
    /// catalog is total over `PlanId` so this only matters if a variant is
    /// ever added without a table entry.
    pub fn quota_of(&self, plan_id: PlanId) -> i64 {
        match self.lookup(plan_id).and_then(|p| p.monthly_quota) {
            Some(q) => q as i64,
            None if self.lookup(plan_id).is_some() => UNLIMITED_QUOTA,
            None => {
                tracing::warn!(plan_id = %plan_id, "Plan missing from catalog, using free quota");
                self.lookup(PlanId::Free)
                    .and_then(|p| p.monthly_quota)
                    .map_or(UNLIMITED_QUOTA, |q| q as i64)
            }
        }
    }

    /// Reverse lookup used when an event only carries a price reference
    pub fn plan_for_price_ref(&self, price_ref: &str) -> Option<PlanId> {
        self.plans
            .iter()
            .find(|p| p.price_ref.as_deref() == Some(price_ref))
            .map(|p| p.id)
    }

    /// All plans, for the public catalog listing
    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BillingConfig {
        BillingConfig {
            secret_key: "sk_test_dummy".to_string(),
            webhook_secret: "whsec_test".to_string(),
            price_starter: Some("price_starter_123".to_string()),
            price_pro: Some("price_pro_456".to_string()),
            price_enterprise: None,
        }
    }

    #[test]
    fn free_plan_has_no_price_ref() {
        let catalog = PlanCatalog::new(&test_config());
        let free = catalog.lookup(PlanId::Free).unwrap();
        assert!(free.price_ref.is_none());
        assert_eq!(free.monthly_price_cents, 0);
    }

    #[test]
    fn quota_of_maps_unlimited_to_sentinel() {
        let catalog = PlanCatalog::new(&test_config());
        assert_eq!(catalog.quota_of(PlanId::Enterprise), UNLIMITED_QUOTA);
    }

    #[test]
    fn quota_of_finite_plans() {
        let catalog = PlanCatalog::new(&test_config());
        assert_eq!(catalog.quota_of(PlanId::Free), 100);
        assert_eq!(catalog.quota_of(PlanId::Starter), 500);
        assert_eq!(catalog.quota_of(PlanId::Pro), 2_000);
    }

    #[test]
    fn price_ref_reverse_lookup() {
        let catalog = PlanCatalog::new(&test_config());
        assert_eq!(
            catalog.plan_for_price_ref("price_pro_456"),
            Some(PlanId::Pro)
        );
        assert_eq!(catalog.plan_for_price_ref("price_unknown"), None);
    }
}
