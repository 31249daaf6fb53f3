//! Kubernetes quantity parsing.
//!
//! Converts strings such as `"500m"`, `"2"`, `"256Mi"` into a canonical
//! numeric value: millicores for CPU, bytes for memory. Matching is
//! case-insensitive and surrounding whitespace is ignored.

use thiserror::Error;

/// Which resource a quantity describes. Determines the canonical unit and
/// the meaning of an unsuffixed number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Canonical unit: millicores. `"1"` → 1000.
    Cpu,
    /// Canonical unit: bytes. `"1"` → 1.
    Memory,
}

impl ResourceKind {
    /// Resource kind for a resource-set key, if it is one we track.
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "cpu" => Some(Self::Cpu),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

/// Errors produced while parsing a quantity string.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("empty quantity")]
    Empty,

    #[error("invalid quantity {0:?}")]
    Invalid(String),

    #[error("quantity {0:?} uses a byte suffix on a cpu value")]
    UnitMismatch(String),
}

const KI: f64 = 1024.0;
const MI: f64 = KI * 1024.0;
const GI: f64 = MI * 1024.0;
const TI: f64 = GI * 1024.0;

/// Parse a quantity into its canonical unit for `kind`.
pub fn parse_quantity(input: &str, kind: ResourceKind) -> Result<f64, ParseError> {
    let clean = input.trim().to_ascii_lowercase();
    if clean.is_empty() {
        return Err(ParseError::Empty);
    }

    // Longest suffixes first so "mi" is not mistaken for "m".
    let binary_suffixes = [("ki", KI), ("mi", MI), ("gi", GI), ("ti", TI)];
    for (suffix, multiplier) in binary_suffixes {
        if let Some(n) = clean.strip_suffix(suffix) {
            if kind == ResourceKind::Cpu {
                return Err(ParseError::UnitMismatch(input.to_string()));
            }
            return Ok(number(n, input)? * multiplier);
        }
    }

    if let Some(n) = clean.strip_suffix('m') {
        let milli = number(n, input)?;
        return Ok(match kind {
            ResourceKind::Cpu => milli,
            ResourceKind::Memory => milli / 1000.0,
        });
    }

    let whole = number(&clean, input)?;
    Ok(match kind {
        ResourceKind::Cpu => whole * 1000.0,
        ResourceKind::Memory => whole,
    })
}

/// Parse a CPU quantity into millicores.
pub fn parse_cpu(input: &str) -> Result<f64, ParseError> {
    parse_quantity(input, ResourceKind::Cpu)
}

/// Parse a memory quantity into bytes.
pub fn parse_memory(input: &str) -> Result<f64, ParseError> {
    parse_quantity(input, ResourceKind::Memory)
}

fn number(n: &str, raw: &str) -> Result<f64, ParseError> {
    let n = n.trim();
    let value: f64 = n
        .parse()
        .map_err(|_| ParseError::Invalid(raw.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ParseError::Invalid(raw.to_string()));
    }
    Ok(value)
}
