//! fleetgrid-state: embedded state store for the fleetgrid rollout engine.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for deployments and their per-device assignments.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Device rows use the composite key `{deployment_id}/{batch:010}/{device_id}`
//! so a prefix range scan returns a deployment's devices in batch order.
//!
//! Every status change goes through a closure-based read-modify-write
//! inside one write transaction (`update_deployment`, `update_device`,
//! `update_device_and_deployment`). redb serializes write transactions,
//! which makes each of these a single-row conditional update.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
