//! StateStore: redb-backed persistence for deployments and device rows.
//!
//! Provides typed CRUD operations plus the conditional, single-transaction
//! updates the rollout engine builds its state transitions on. All values
//! are JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(DEVICES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert or replace a deployment.
    pub fn put_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        let value = serde_json::to_vec(deployment).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            table
                .insert(deployment.table_key(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment = %deployment.id, "deployment stored");
        Ok(())
    }

    /// Get a deployment by ID.
    pub fn get_deployment(&self, id: &str) -> StateResult<Option<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let deployment: Deployment =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(deployment))
            }
            None => Ok(None),
        }
    }

    /// List all deployments.
    pub fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let deployment: Deployment =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(deployment);
        }
        Ok(results)
    }

    /// Delete a deployment and all of its device rows.
    /// Returns true if the deployment existed.
    pub fn delete_deployment(&self, id: &str) -> StateResult<bool> {
        let prefix = DeviceKey::deployment_prefix(id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        let removed;
        {
            let mut devices = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            let keys: Vec<String> = {
                let mut keys = Vec::new();
                for entry in devices.range(prefix.as_str()..).map_err(map_err!(Read))? {
                    let (key, _) = entry.map_err(map_err!(Read))?;
                    let key = key.value();
                    if !key.starts_with(&prefix) {
                        break;
                    }
                    keys.push(key.to_string());
                }
                keys
            };
            for key in &keys {
                devices.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            removed = keys.len();

            let mut deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            existed = deployments.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment = %id, existed, devices = removed, "deployment deleted");
        Ok(existed)
    }

    /// Read-modify-write a deployment in one write transaction.
    ///
    /// `f` returns whether to commit its changes. Returns the committed
    /// deployment, or `None` when `f` declined.
    pub fn update_deployment<F>(&self, id: &str, f: F) -> StateResult<Option<Deployment>>
    where
        F: FnOnce(&mut Deployment) -> bool,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let current: Option<Deployment> = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            let mut deployment =
                current.ok_or_else(|| StateError::DeploymentNotFound(id.to_string()))?;
            if !f(&mut deployment) {
                None
            } else {
                deployment.updated_at = epoch_secs();
                let value = serde_json::to_vec(&deployment).map_err(map_err!(Serialize))?;
                table
                    .insert(id, value.as_slice())
                    .map_err(map_err!(Write))?;
                Some(deployment)
            }
        };
        match updated {
            Some(deployment) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(Some(deployment))
            }
            None => {
                txn.abort().map_err(map_err!(Transaction))?;
                Ok(None)
            }
        }
    }

    // ── Devices ────────────────────────────────────────────────────

    /// Insert or replace a device row.
    pub fn put_device(&self, device: &DeploymentDevice) -> StateResult<()> {
        self.put_devices(std::slice::from_ref(device))
    }

    /// Insert or replace many device rows in one transaction.
    pub fn put_devices(&self, devices: &[DeploymentDevice]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            for device in devices {
                let key = device.table_key();
                let value = serde_json::to_vec(device).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(count = devices.len(), "device rows stored");
        Ok(())
    }

    /// Get a device row by its composite key.
    pub fn get_device(&self, key: &DeviceKey) -> StateResult<Option<DeploymentDevice>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
        match table
            .get(key.table_key().as_str())
            .map_err(map_err!(Read))?
        {
            Some(guard) => {
                let device: DeploymentDevice =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(device))
            }
            None => Ok(None),
        }
    }

    /// Find a device row by deployment and device ID, without knowing its batch.
    pub fn find_device(
        &self,
        deployment_id: &str,
        device_id: &str,
    ) -> StateResult<Option<DeploymentDevice>> {
        let mut found = None;
        self.scan_devices(deployment_id, |device| {
            if device.device_id == device_id {
                found = Some(device);
                false
            } else {
                true
            }
        })?;
        Ok(found)
    }

    /// List all device rows of a deployment in batch order.
    pub fn list_devices(&self, deployment_id: &str) -> StateResult<Vec<DeploymentDevice>> {
        let mut results = Vec::new();
        self.scan_devices(deployment_id, |device| {
            results.push(device);
            true
        })?;
        Ok(results)
    }

    /// Up to `limit` device rows of a deployment whose status is one of
    /// `statuses`, in batch order.
    pub fn devices_with_status(
        &self,
        deployment_id: &str,
        statuses: &[DeviceStatus],
        limit: usize,
    ) -> StateResult<Vec<DeploymentDevice>> {
        let mut results = Vec::new();
        if limit == 0 {
            return Ok(results);
        }
        self.scan_devices(deployment_id, |device| {
            if statuses.contains(&device.status) {
                results.push(device);
            }
            results.len() < limit
        })?;
        Ok(results)
    }

    /// Up to `limit` pending device rows of a deployment, in batch order.
    pub fn pending_devices(
        &self,
        deployment_id: &str,
        limit: usize,
    ) -> StateResult<Vec<DeploymentDevice>> {
        self.devices_with_status(deployment_id, &[DeviceStatus::Pending], limit)
    }

    /// The lowest batch that still has open (pending or running) devices,
    /// with up to `limit` of its rows that are ready to be dispatched.
    ///
    /// The scan stops at the end of that batch or once `limit` ready rows
    /// were collected, so memory stays bounded for large fleets.
    pub fn admission_page(&self, deployment_id: &str, limit: usize) -> StateResult<AdmissionPage> {
        let mut page = AdmissionPage::default();
        self.scan_devices(deployment_id, |device| {
            if device.status.is_terminal() {
                return true;
            }
            match page.batch {
                None => page.batch = Some(device.batch_number),
                Some(batch) if batch != device.batch_number => return false,
                Some(_) => {}
            }
            if device.status == DeviceStatus::Pending && !device.dispatched {
                page.ready.push(device);
            } else {
                page.in_flight += 1;
            }
            page.ready.len() < limit
        })?;
        Ok(page)
    }

    /// Device counts per status for a deployment.
    pub fn deployment_progress(&self, deployment_id: &str) -> StateResult<DeploymentProgress> {
        let mut progress = DeploymentProgress::default();
        self.scan_devices(deployment_id, |device| {
            progress.record(device.status);
            true
        })?;
        Ok(progress)
    }

    /// Read-modify-write a device row in one write transaction.
    ///
    /// `f` returns whether to commit its changes. Returns the committed
    /// row, or `None` when `f` declined.
    pub fn update_device<F>(&self, key: &DeviceKey, f: F) -> StateResult<Option<DeploymentDevice>>
    where
        F: FnOnce(&mut DeploymentDevice) -> bool,
    {
        let table_key = key.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            let mut device = read_row::<DeploymentDevice>(&table, &table_key)?
                .ok_or_else(|| StateError::DeviceNotFound(key.to_string()))?;
            if !f(&mut device) {
                None
            } else {
                device.updated_at = epoch_secs();
                write_row(&mut table, &table_key, &device)?;
                Some(device)
            }
        };
        match updated {
            Some(device) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(Some(device))
            }
            None => {
                txn.abort().map_err(map_err!(Transaction))?;
                Ok(None)
            }
        }
    }

    /// Read-modify-write a device row together with its deployment.
    ///
    /// Both rows change in the same write transaction, so per-deployment
    /// counters stay consistent with device transitions.
    pub fn update_device_and_deployment<F>(
        &self,
        key: &DeviceKey,
        f: F,
    ) -> StateResult<Option<(DeploymentDevice, Deployment)>>
    where
        F: FnOnce(&mut DeploymentDevice, &mut Deployment) -> bool,
    {
        let table_key = key.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated = {
            let mut devices = txn.open_table(DEVICES).map_err(map_err!(Table))?;
            let mut deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let mut device = read_row::<DeploymentDevice>(&devices, &table_key)?
                .ok_or_else(|| StateError::DeviceNotFound(key.to_string()))?;
            let mut deployment = read_row::<Deployment>(&deployments, &key.deployment_id)?
                .ok_or_else(|| StateError::DeploymentNotFound(key.deployment_id.clone()))?;
            if !f(&mut device, &mut deployment) {
                None
            } else {
                let now = epoch_secs();
                device.updated_at = now;
                deployment.updated_at = now;
                write_row(&mut devices, &table_key, &device)?;
                write_row(&mut deployments, &key.deployment_id, &deployment)?;
                Some((device, deployment))
            }
        };
        match updated {
            Some(rows) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(Some(rows))
            }
            None => {
                txn.abort().map_err(map_err!(Transaction))?;
                Ok(None)
            }
        }
    }

    /// Visit a deployment's device rows in key (batch) order until `visit`
    /// returns false.
    fn scan_devices<F>(&self, deployment_id: &str, mut visit: F) -> StateResult<()>
    where
        F: FnMut(DeploymentDevice) -> bool,
    {
        let prefix = DeviceKey::deployment_prefix(deployment_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEVICES).map_err(map_err!(Table))?;
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            let device: DeploymentDevice =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if !visit(device) {
                break;
            }
        }
        Ok(())
    }
}

fn read_row<T: serde::de::DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(
            serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
        )),
        None => Ok(None),
    }
}

fn write_row<T: serde::Serialize>(
    table: &mut redb::Table<'_, &'static str, &'static [u8]>,
    key: &str,
    row: &T,
) -> StateResult<()> {
    let value = serde_json::to_vec(row).map_err(map_err!(Serialize))?;
    table
        .insert(key, value.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}
