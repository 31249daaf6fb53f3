//! redb table definitions for the recommendation store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Recommendations keyed by recommendation id.
pub const RECOMMENDATIONS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("recommendations");

/// Policies keyed by `{namespace or *}/{name}`.
pub const POLICIES: TableDefinition<&str, &[u8]> = TableDefinition::new("policies");
