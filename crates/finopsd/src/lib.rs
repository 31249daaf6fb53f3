//! finopsd — wiring for the rightsizing pipeline.
//!
//! [`pipeline::Stages`] holds every stage's collaborators;
//! [`pipeline::Pipeline::start`] subscribes each stage to its topics on the
//! in-process transport, spawns the periodic loops and serves
//! [`metrics::router`] when a listen address is configured.

pub mod metrics;
pub mod pipeline;
