//! Metrics collector — per-namespace pipeline counters.
//!
//! Counters are atomics behind a namespace map; the map lock is only
//! taken for writing the first time a namespace is seen.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tracing::debug;

/// Outcome label on the decision counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approved => "approved",
            Decision::Rejected => "rejected",
        }
    }
}

#[derive(Default)]
struct NamespaceCounters {
    approved: AtomicU64,
    rejected: AtomicU64,
    created: AtomicU64,
    /// Estimated monthly savings of created recommendations, in cents.
    savings_cents: AtomicU64,
}

/// Point-in-time counter values for one namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceMetrics {
    pub namespace: String,
    pub approved: u64,
    pub rejected: u64,
    pub created: u64,
    pub savings_total: f64,
}

/// Shared by every stage that reports counts.
#[derive(Default)]
pub struct MetricsCollector {
    namespaces: RwLock<HashMap<String, Arc<NamespaceCounters>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    async fn counters(&self, namespace: &str) -> Arc<NamespaceCounters> {
        if let Some(counters) = self.namespaces.read().await.get(namespace) {
            return counters.clone();
        }
        let mut namespaces = self.namespaces.write().await;
        namespaces
            .entry(namespace.to_string())
            .or_insert_with(|| {
                debug!(%namespace, "tracking metrics for namespace");
                Arc::new(NamespaceCounters::default())
            })
            .clone()
    }

    /// Count a policy decision.
    pub async fn record_decision(&self, namespace: &str, decision: Decision) {
        let counters = self.counters(namespace).await;
        let counter = match decision {
            Decision::Approved => &counters.approved,
            Decision::Rejected => &counters.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a published recommendation and its estimated savings.
    /// Negative savings add nothing; counters never decrease.
    pub async fn record_created(&self, namespace: &str, estimated_monthly_savings: f64) {
        let counters = self.counters(namespace).await;
        counters.created.fetch_add(1, Ordering::Relaxed);
        let cents = (estimated_monthly_savings.max(0.0) * 100.0).round() as u64;
        counters.savings_cents.fetch_add(cents, Ordering::Relaxed);
    }

    /// Current decision count for a namespace.
    pub async fn decisions(&self, namespace: &str, decision: Decision) -> u64 {
        let namespaces = self.namespaces.read().await;
        namespaces
            .get(namespace)
            .map(|c| match decision {
                Decision::Approved => c.approved.load(Ordering::Relaxed),
                Decision::Rejected => c.rejected.load(Ordering::Relaxed),
            })
            .unwrap_or(0)
    }

    /// Every namespace seen so far, sorted by name.
    pub async fn snapshot(&self) -> Vec<NamespaceMetrics> {
        let namespaces = self.namespaces.read().await;
        let mut out: Vec<NamespaceMetrics> = namespaces
            .iter()
            .map(|(namespace, c)| NamespaceMetrics {
                namespace: namespace.clone(),
                approved: c.approved.load(Ordering::Relaxed),
                rejected: c.rejected.load(Ordering::Relaxed),
                created: c.created.load(Ordering::Relaxed),
                savings_total: c.savings_cents.load(Ordering::Relaxed) as f64 / 100.0,
            })
            .collect();
        out.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        out
    }
}
