//! finops-state — embedded recommendation store.
//!
//! Backed by [redb](https://docs.rs/redb), holds the lifecycle record of every
//! recommendation and the policies used to validate them.
//!
//! # Architecture
//!
//! Values are JSON-serialized into redb's `&[u8]` value columns.
//! Recommendations are keyed by id, policies by `{namespace or *}/{name}`.
//! Status changes happen inside a single write transaction so a rejected
//! transition never touches the stored record.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::StateStore;
