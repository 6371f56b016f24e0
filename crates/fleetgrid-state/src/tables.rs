//! redb table definitions for the fleetgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Deployments keyed by `{deployment_id}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Device assignments keyed by `{deployment_id}/{batch:010}/{device_id}`.
///
/// The zero-padded batch segment makes lexicographic order equal to
/// admission order within a deployment.
pub const DEVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("deployment_devices");
