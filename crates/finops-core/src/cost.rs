//! Monthly cost model.
//!
//! Converts a resource set into an estimated monthly cost using fixed
//! per-unit prices. Only `cpu` and `memory` are priced; a missing key
//! costs nothing.

use serde::{Deserialize, Serialize};

use crate::quantity::{ParseError, parse_cpu, parse_memory};
use crate::types::ResourceSet;

const MILLICORES_PER_CORE: f64 = 1000.0;
const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Fixed unit prices for compute resources.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    /// Price of one CPU core for a month.
    pub cpu_core_month: f64,
    /// Price of one GiB of memory for a month.
    pub memory_gib_month: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            cpu_core_month: 30.0,
            memory_gib_month: 5.0,
        }
    }
}

impl CostModel {
    /// Estimated monthly cost of running `resources`.
    pub fn monthly_cost(&self, resources: &ResourceSet) -> Result<f64, ParseError> {
        let cores = match resources.get("cpu") {
            Some(q) => parse_cpu(q)? / MILLICORES_PER_CORE,
            None => 0.0,
        };
        let gib = match resources.get("memory") {
            Some(q) => parse_memory(q)? / BYTES_PER_GIB,
            None => 0.0,
        };
        Ok(cores * self.cpu_core_month + gib * self.memory_gib_month)
    }

    /// Savings from moving `current` to `suggested`. Never negative: a
    /// suggestion that costs more reports zero savings.
    pub fn monthly_savings(
        &self,
        current: &ResourceSet,
        suggested: &ResourceSet,
    ) -> Result<f64, ParseError> {
        let delta = self.monthly_cost(current)? - self.monthly_cost(suggested)?;
        Ok(delta.max(0.0))
    }
}

/// Round a currency amount to whole cents.
///
/// Threshold comparisons go through this so that a total landing exactly
/// on a limit is not pushed over it by floating-point error.
pub fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}
