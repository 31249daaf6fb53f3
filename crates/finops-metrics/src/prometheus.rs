//! Prometheus text exposition format.

use crate::collector::{Decision, NamespaceMetrics};

/// Render namespace counters into Prometheus text format.
///
/// Produces COUNTER metrics with `namespace` labels; decisions also carry
/// a `status` label.
pub fn render_prometheus(metrics: &[NamespaceMetrics]) -> String {
    let mut out = String::new();

    out.push_str("# HELP finops_recommendations_total Recommendations decided by the policy engine.\n");
    out.push_str("# TYPE finops_recommendations_total counter\n");
    for m in metrics {
        for (decision, count) in [
            (Decision::Approved, m.approved),
            (Decision::Rejected, m.rejected),
        ] {
            out.push_str(&format!(
                "finops_recommendations_total{{status=\"{}\",namespace=\"{}\"}} {}\n",
                decision.as_str(),
                m.namespace,
                count
            ));
        }
    }

    out.push_str("# HELP finops_recommendations_created_total Recommendations published by the recommender.\n");
    out.push_str("# TYPE finops_recommendations_created_total counter\n");
    for m in metrics {
        out.push_str(&format!(
            "finops_recommendations_created_total{{namespace=\"{}\"}} {}\n",
            m.namespace, m.created
        ));
    }

    out.push_str("# HELP finops_recommendation_savings_total Estimated monthly savings of created recommendations.\n");
    out.push_str("# TYPE finops_recommendation_savings_total counter\n");
    for m in metrics {
        out.push_str(&format!(
            "finops_recommendation_savings_total{{namespace=\"{}\"}} {:.2}\n",
            m.namespace, m.savings_total
        ));
    }

    out
}
