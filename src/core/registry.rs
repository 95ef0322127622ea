//! Instance registry - Tracked records and the process handles behind them

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use super::error::{OrchestratorError, Result};
use super::instance::{InstanceId, InstanceRecord};
use super::process::ProcessHandle;

/// One tracked instance. Teardown takes the handle out once `removed` is set.
pub struct Entry {
    pub record: InstanceRecord,
    pub handle: Option<Box<dyn ProcessHandle>>,
    /// Set once teardown has taken the entry out of the table
    pub removed: bool,
}

pub type SharedEntry = Arc<Mutex<Entry>>;

/// Lock one entry, mapping poisoning to an orchestrator error
pub fn lock_entry(entry: &SharedEntry) -> Result<MutexGuard<'_, Entry>> {
    entry
        .lock()
        .map_err(|_| OrchestratorError::LockPoisoned("Instance record"))
}

/// The table lock is held only to look up, insert or remove. Operations on
/// a record hold that record's own lock instead.
#[derive(Default)]
pub struct Registry {
    table: RwLock<HashMap<InstanceId, SharedEntry>>,
    /// Ids claimed by launches still in flight
    reserved: Mutex<HashSet<InstanceId>>,
}

impl Registry {
    /// Claim `id` for a launch; fails if it is tracked or being launched
    pub fn reserve(&self, id: &InstanceId) -> Result<Reservation<'_>> {
        let table = self
            .table
            .read()
            .map_err(|_| OrchestratorError::LockPoisoned("Instances"))?;
        let mut reserved = self
            .reserved
            .lock()
            .map_err(|_| OrchestratorError::LockPoisoned("Reservations"))?;

        if table.contains_key(id) || !reserved.insert(id.clone()) {
            return Err(OrchestratorError::DuplicateId(id.to_string()));
        }
        Ok(Reservation {
            registry: self,
            id: id.clone(),
        })
    }

    pub fn lookup(&self, id: &InstanceId) -> Result<Option<SharedEntry>> {
        Ok(self
            .table
            .read()
            .map_err(|_| OrchestratorError::LockPoisoned("Instances"))?
            .get(id)
            .cloned())
    }

    /// Take an entry out of the table
    pub fn remove(&self, id: &InstanceId) -> Result<Option<SharedEntry>> {
        Ok(self
            .table
            .write()
            .map_err(|_| OrchestratorError::LockPoisoned("Instances"))?
            .remove(id))
    }

    /// Every tracked entry, for iteration without the table lock
    pub fn entries(&self) -> Result<Vec<SharedEntry>> {
        Ok(self
            .table
            .read()
            .map_err(|_| OrchestratorError::LockPoisoned("Instances"))?
            .values()
            .cloned()
            .collect())
    }

    pub fn ids(&self) -> Result<Vec<InstanceId>> {
        Ok(self
            .table
            .read()
            .map_err(|_| OrchestratorError::LockPoisoned("Instances"))?
            .keys()
            .cloned()
            .collect())
    }

    pub fn len(&self) -> usize {
        self.table.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshots ordered by start time, then id
    pub fn snapshots(&self) -> Result<Vec<InstanceRecord>> {
        let mut records = Vec::new();
        for entry in self.entries()? {
            let entry = lock_entry(&entry)?;
            if !entry.removed {
                records.push(entry.record.clone());
            }
        }
        records.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(records)
    }
}

/// A claimed id. Dropping it without inserting frees the id again.
pub struct Reservation<'a> {
    registry: &'a Registry,
    id: InstanceId,
}

impl Reservation<'_> {
    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    /// Track `entry` under the reserved id
    pub fn insert(self, entry: Entry) -> Result<InstanceRecord> {
        let record = entry.record.clone();
        self.registry
            .table
            .write()
            .map_err(|_| OrchestratorError::LockPoisoned("Instances"))?
            .insert(self.id.clone(), Arc::new(Mutex::new(entry)));
        Ok(record)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Ok(mut reserved) = self.registry.reserved.lock() {
            reserved.remove(&self.id);
        }
    }
}
