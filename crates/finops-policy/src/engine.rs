//! Policy engine — per-recommendation limits and namespace budgets.

use finops_core::cost::to_cents;
use finops_core::quantity::{ResourceKind, parse_quantity};
use finops_core::{CostModel, Policy, Recommendation, RecommendationStatus, ValidationResult};
use finops_state::{StateResult, StateStore};
use tracing::{debug, info, warn};

/// Validates recommendations against the policies in the store.
#[derive(Clone)]
pub struct PolicyEngine {
    store: StateStore,
    cost: CostModel,
}

impl PolicyEngine {
    pub fn new(store: StateStore, cost: CostModel) -> Self {
        Self { store, cost }
    }

    /// Check `rec` against every applicable enabled policy.
    ///
    /// Store read failures propagate; everything else produces a
    /// [`ValidationResult`].
    pub fn validate(&self, rec: &Recommendation) -> StateResult<ValidationResult> {
        let mut policies: Vec<Policy> = self
            .store
            .applicable_policies(&rec.namespace)?
            .into_iter()
            .filter(|p| p.enabled)
            .collect();

        if policies.is_empty() {
            info!(
                recommendation = %rec.id,
                namespace = %rec.namespace,
                "no applicable policies, approving"
            );
            return Ok(ValidationResult::valid());
        }

        // Global policies first, then namespace-scoped, each by name.
        policies.sort_by(|a, b| {
            (a.namespace.is_some(), &a.name).cmp(&(b.namespace.is_some(), &b.name))
        });

        for policy in &policies {
            if let Some(reason) = self.check_policy(rec, policy)? {
                warn!(
                    recommendation = %rec.id,
                    namespace = %rec.namespace,
                    policy = %policy.name,
                    %reason,
                    "policy violated"
                );
                return Ok(ValidationResult::invalid(reason, &policy.name));
            }
        }

        debug!(recommendation = %rec.id, policies = policies.len(), "all policies passed");
        Ok(ValidationResult::valid())
    }

    /// Returns the violation reason, if any.
    fn check_policy(&self, rec: &Recommendation, policy: &Policy) -> StateResult<Option<String>> {
        let suggested = &rec.suggested_resources;

        for (key, limit) in [("cpu", &policy.max_cpu), ("memory", &policy.max_memory)] {
            if let (Some(limit), Some(value)) = (limit, suggested.get(key))
                && exceeds(key, value, limit)
            {
                return Ok(Some(format!("suggested {key} {value} exceeds limit {limit}")));
            }
        }

        if let Some(min) = policy.min_monthly_savings
            && to_cents(rec.estimated_monthly_savings) < to_cents(min)
        {
            return Ok(Some(format!(
                "estimated monthly savings {:.2} below minimum {:.2}",
                rec.estimated_monthly_savings, min
            )));
        }

        if let Some(max) = policy.max_monthly_cost {
            let total = self.namespace_total_with(rec)?;
            if to_cents(total) > to_cents(max) {
                return Ok(Some(format!(
                    "namespace {} monthly cost {:.2} would exceed budget {:.2}",
                    rec.namespace, total, max
                )));
            }
        }

        Ok(None)
    }

    /// Cost of every other approved recommendation in the namespace plus
    /// the cost of `rec` itself.
    fn namespace_total_with(&self, rec: &Recommendation) -> StateResult<f64> {
        let approved = self
            .store
            .find_by_namespace_and_status(&rec.namespace, &[RecommendationStatus::Approved])?;

        let current: f64 = approved
            .iter()
            .filter(|r| r.id != rec.id)
            .map(|r| self.cost_or_zero(r))
            .sum();
        let total = current + self.cost_or_zero(rec);
        debug!(
            recommendation = %rec.id,
            namespace = %rec.namespace,
            approved = approved.len(),
            current,
            total,
            "namespace budget computed"
        );
        Ok(total)
    }

    fn cost_or_zero(&self, rec: &Recommendation) -> f64 {
        match self.cost.monthly_cost(&rec.suggested_resources) {
            Ok(cost) => cost,
            Err(e) => {
                warn!(
                    recommendation = %rec.id,
                    error = %e,
                    "cannot price suggested resources, counting as zero"
                );
                0.0
            }
        }
    }
}

/// Lenient comparison: a value that cannot be parsed never exceeds.
fn exceeds(key: &str, value: &str, limit: &str) -> bool {
    let Some(kind) = ResourceKind::from_key(key) else {
        return false;
    };
    match (parse_quantity(value, kind), parse_quantity(limit, kind)) {
        (Ok(v), Ok(l)) => v > l,
        (v, l) => {
            warn!(
                resource = key,
                value,
                limit,
                value_ok = v.is_ok(),
                limit_ok = l.is_ok(),
                "unparseable quantity, treating as within limit"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finops_core::event::RecommendationCreated;
    use finops_core::{ResourceSet, WorkloadRef};

    fn resources(pairs: &[(&str, &str)]) -> ResourceSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn recommendation(id: &str, namespace: &str, suggested: &[(&str, &str)]) -> Recommendation {
        Recommendation::from_created(&RecommendationCreated {
            id: id.to_string(),
            workload_ref: WorkloadRef::deployment("api"),
            namespace: namespace.to_string(),
            current_resources: resources(&[("cpu", "1"), ("memory", "1Gi")]),
            suggested_resources: resources(suggested),
            replicas: None,
            confidence_score: 0.9,
            estimated_monthly_savings: 10.0,
            currency: "USD".to_string(),
            created_at: 1000,
        })
    }

    fn approved(store: &StateStore, id: &str, namespace: &str, cpu: &str) {
        let mut rec = recommendation(id, namespace, &[("cpu", cpu)]);
        rec.approve().unwrap();
        store.put_recommendation(&rec).unwrap();
    }

    fn engine_with(policies: &[Policy]) -> (PolicyEngine, StateStore) {
        let store = StateStore::open_in_memory().unwrap();
        for p in policies {
            store.put_policy(p).unwrap();
        }
        (PolicyEngine::new(store.clone(), CostModel::default()), store)
    }

    fn cpu_limit(name: &str, max: &str) -> Policy {
        Policy {
            max_cpu: Some(max.to_string()),
            ..Policy::named(name)
        }
    }

    #[test]
    fn no_policies_is_valid() {
        let (engine, _) = engine_with(&[]);
        let rec = recommendation("r", "dev", &[("cpu", "64"), ("memory", "512Gi")]);
        assert_eq!(engine.validate(&rec).unwrap(), ValidationResult::valid());
    }

    #[test]
    fn policies_for_other_namespaces_do_not_apply() {
        let (engine, _) = engine_with(&[Policy {
            namespace: Some("prod".to_string()),
            ..cpu_limit("prod-cpu", "100m")
        }]);
        let rec = recommendation("r", "dev", &[("cpu", "4")]);
        assert!(engine.validate(&rec).unwrap().valid);
    }

    #[test]
    fn cpu_above_limit_is_rejected_with_policy_name() {
        let (engine, _) = engine_with(&[cpu_limit("cpu-cap", "200m")]);
        let rec = recommendation("r", "dev", &[("cpu", "500m")]);
        let result = engine.validate(&rec).unwrap();
        assert!(!result.valid);
        assert_eq!(result.policy_name.as_deref(), Some("cpu-cap"));
        assert_eq!(
            result.reason.as_deref(),
            Some("suggested cpu 500m exceeds limit 200m")
        );
    }

    #[test]
    fn cpu_at_or_below_limit_passes() {
        let (engine, _) = engine_with(&[cpu_limit("cpu-cap", "1")]);
        assert!(
            engine
                .validate(&recommendation("a", "dev", &[("cpu", "1000m")]))
                .unwrap()
                .valid
        );
        assert!(
            engine
                .validate(&recommendation("b", "dev", &[("cpu", "999m")]))
                .unwrap()
                .valid
        );
    }

    #[test]
    fn memory_above_limit_is_rejected() {
        let (engine, _) = engine_with(&[Policy {
            max_memory: Some("1Gi".to_string()),
            ..Policy::named("mem-cap")
        }]);
        let result = engine
            .validate(&recommendation("r", "dev", &[("memory", "2Gi")]))
            .unwrap();
        assert!(!result.valid);
        assert_eq!(result.policy_name.as_deref(), Some("mem-cap"));
        assert!(
            engine
                .validate(&recommendation("s", "dev", &[("memory", "1024Mi")]))
                .unwrap()
                .valid
        );
    }

    #[test]
    fn malformed_quantity_does_not_violate() {
        let (engine, _) = engine_with(&[cpu_limit("cpu-cap", "200m")]);
        let rec = recommendation("r", "dev", &[("cpu", "lots")]);
        assert!(engine.validate(&rec).unwrap().valid);

        let (engine, _) = engine_with(&[cpu_limit("broken", "???")]);
        let rec = recommendation("r", "dev", &[("cpu", "8")]);
        assert!(engine.validate(&rec).unwrap().valid);
    }

    #[test]
    fn min_savings_threshold() {
        let (engine, _) = engine_with(&[Policy {
            min_monthly_savings: Some(5.0),
            ..Policy::named("savings")
        }]);

        let mut below = recommendation("a", "dev", &[("cpu", "100m")]);
        below.estimated_monthly_savings = 4.99;
        let result = engine.validate(&below).unwrap();
        assert!(!result.valid);
        assert_eq!(result.policy_name.as_deref(), Some("savings"));

        let mut exact = recommendation("b", "dev", &[("cpu", "100m")]);
        exact.estimated_monthly_savings = 5.0;
        assert!(engine.validate(&exact).unwrap().valid);
    }

    #[test]
    fn disabled_policies_are_ignored() {
        let (engine, _) = engine_with(&[Policy {
            enabled: false,
            ..cpu_limit("off", "1m")
        }]);
        assert!(
            engine
                .validate(&recommendation("r", "dev", &[("cpu", "4")]))
                .unwrap()
                .valid
        );
    }

    #[test]
    fn global_policies_are_checked_first() {
        let (engine, _) = engine_with(&[
            Policy {
                namespace: Some("prod".to_string()),
                ..cpu_limit("a-scoped", "100m")
            },
            cpu_limit("z-global", "100m"),
        ]);
        let result = engine
            .validate(&recommendation("r", "prod", &[("cpu", "500m")]))
            .unwrap();
        assert_eq!(result.policy_name.as_deref(), Some("z-global"));
    }

    // ── Namespace budget ───────────────────────────────────────────

    /// $100 per core so that `"600m"` costs exactly $60.
    fn budget_engine(max: f64) -> (PolicyEngine, StateStore) {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_policy(&Policy {
                namespace: Some("team".to_string()),
                max_monthly_cost: Some(max),
                ..Policy::named("budget")
            })
            .unwrap();
        let model = CostModel {
            cpu_core_month: 100.0,
            memory_gib_month: 0.0,
        };
        (PolicyEngine::new(store.clone(), model), store)
    }

    #[test]
    fn budget_rejects_when_total_exceeds() {
        let (engine, store) = budget_engine(100.0);
        approved(&store, "a", "team", "600m");
        approved(&store, "b", "team", "500m");

        // 60 + 50 + 20 > 100
        let result = engine
            .validate(&recommendation("c", "team", &[("cpu", "200m")]))
            .unwrap();
        assert!(!result.valid);
        assert_eq!(result.policy_name.as_deref(), Some("budget"));

        // 60 + 50 already over budget, so even $10 is rejected.
        assert!(
            !engine
                .validate(&recommendation("d", "team", &[("cpu", "100m")]))
                .unwrap()
                .valid
        );
    }

    #[test]
    fn budget_boundary_is_inclusive() {
        let (engine, store) = budget_engine(100.0);
        approved(&store, "a", "team", "600m");
        approved(&store, "b", "team", "300m");

        // 60 + 30 + 10 == 100
        assert!(
            engine
                .validate(&recommendation("c", "team", &[("cpu", "100m")]))
                .unwrap()
                .valid
        );
        // 60 + 30 + 10.01 > 100
        assert!(
            !engine
                .validate(&recommendation("d", "team", &[("cpu", "100.1m")]))
                .unwrap()
                .valid
        );
    }

    #[test]
    fn budget_ignores_other_namespaces_and_statuses() {
        let (engine, store) = budget_engine(100.0);
        approved(&store, "other-ns", "dev", "900m");
        let pending = recommendation("pending", "team", &[("cpu", "900m")]);
        store.put_recommendation(&pending).unwrap();

        assert!(
            engine
                .validate(&recommendation("c", "team", &[("cpu", "500m")]))
                .unwrap()
                .valid
        );
    }

    #[test]
    fn budget_excludes_own_record() {
        let (engine, store) = budget_engine(100.0);
        approved(&store, "c", "team", "800m");

        // Re-validating the already approved record must not count it twice.
        let rec = recommendation("c", "team", &[("cpu", "800m")]);
        assert!(engine.validate(&rec).unwrap().valid);
    }

    #[test]
    fn unpriceable_approved_record_counts_as_zero() {
        let (engine, store) = budget_engine(100.0);
        let mut broken = recommendation("a", "team", &[("cpu", "garbage")]);
        broken.approve().unwrap();
        store.put_recommendation(&broken).unwrap();

        assert!(
            engine
                .validate(&recommendation("c", "team", &[("cpu", "1")]))
                .unwrap()
                .valid
        );
    }
}
