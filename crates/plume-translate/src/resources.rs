//! Per-connection table of producer-assigned surface ids.
//!
//! Every entry carries a manual reference count, initialized to 1 at
//! creation. Lock records increment it, unlock records decrement it, and a
//! destroy record drops the creation reference. Real destruction (the
//! executor call) happens exactly once, when the count reaches zero and no
//! lock is outstanding; a destroy record can therefore never race ahead of
//! a consumer still using the surface.

use std::collections::HashMap;

use plume_protocol::{LockMode, OwnerId, SurfaceDesc};

#[derive(Debug, Clone)]
pub struct ResourceEntry {
    pub desc: SurfaceDesc,
    pub lock: Option<LockMode>,
    ref_count: u32,
    pending_destroy: bool,
}

/// What a table operation asks the caller to do next.
#[derive(Debug, PartialEq, Eq)]
pub enum TableOp {
    /// Nothing further.
    None,
    /// The entry was removed; call the executor's destroy exactly once.
    Destroy,
}

#[derive(Debug, Default)]
pub struct ResourceTable {
    entries: HashMap<OwnerId, ResourceEntry>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("surface {0} already exists")]
    AlreadyExists(OwnerId),
    #[error("surface {0} does not exist")]
    Missing(OwnerId),
    #[error("surface {0} is already locked")]
    AlreadyLocked(OwnerId),
    #[error("surface {0} is not locked")]
    NotLocked(OwnerId),
    #[error("surface {0} was already destroyed")]
    AlreadyDestroyed(OwnerId),
}

impl ResourceTable {
    pub fn new() -> ResourceTable {
        ResourceTable::default()
    }

    pub fn create(&mut self, owner: OwnerId, desc: SurfaceDesc) -> Result<(), ResourceError> {
        if self.entries.contains_key(&owner) {
            return Err(ResourceError::AlreadyExists(owner));
        }
        self.entries.insert(
            owner,
            ResourceEntry {
                desc,
                lock: None,
                ref_count: 1,
                pending_destroy: false,
            },
        );
        Ok(())
    }

    pub fn lock(&mut self, owner: OwnerId, mode: LockMode) -> Result<(), ResourceError> {
        let entry = self
            .entries
            .get_mut(&owner)
            .ok_or(ResourceError::Missing(owner))?;
        if entry.lock.is_some() {
            return Err(ResourceError::AlreadyLocked(owner));
        }
        entry.lock = Some(mode);
        entry.ref_count += 1;
        Ok(())
    }

    pub fn unlock(&mut self, owner: OwnerId) -> Result<TableOp, ResourceError> {
        let entry = self
            .entries
            .get_mut(&owner)
            .ok_or(ResourceError::Missing(owner))?;
        if entry.lock.is_none() {
            return Err(ResourceError::NotLocked(owner));
        }
        entry.lock = None;
        entry.ref_count -= 1;
        Ok(self.reap(owner))
    }

    /// Drop the creation reference. Destruction may be deferred until an
    /// outstanding lock is released.
    pub fn destroy(&mut self, owner: OwnerId) -> Result<TableOp, ResourceError> {
        let entry = self
            .entries
            .get_mut(&owner)
            .ok_or(ResourceError::Missing(owner))?;
        if entry.pending_destroy {
            return Err(ResourceError::AlreadyDestroyed(owner));
        }
        entry.pending_destroy = true;
        entry.ref_count -= 1;
        Ok(self.reap(owner))
    }

    fn reap(&mut self, owner: OwnerId) -> TableOp {
        let destroyable = self
            .entries
            .get(&owner)
            .map(|e| e.pending_destroy && e.ref_count == 0 && e.lock.is_none())
            .unwrap_or(false);
        if destroyable {
            self.entries.remove(&owner);
            TableOp::Destroy
        } else {
            TableOp::None
        }
    }

    pub fn get(&self, owner: OwnerId) -> Option<&ResourceEntry> {
        self.entries.get(&owner)
    }

    pub fn contains(&self, owner: OwnerId) -> bool {
        self.entries.contains_key(&owner)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn owners(&self) -> Vec<OwnerId> {
        self.entries.keys().copied().collect()
    }

    /// Teardown pass: unlock and remove every entry, yielding the ids the
    /// caller must destroy on the executor.
    pub fn drain_all(&mut self) -> Vec<OwnerId> {
        let owners: Vec<_> = self.entries.keys().copied().collect();
        self.entries.clear();
        owners
    }

    /// Remove an entry outright (lost-surface path); the caller reports it.
    pub fn remove(&mut self, owner: OwnerId) -> Option<ResourceEntry> {
        self.entries.remove(&owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plume_protocol::{SurfaceFormat, SurfaceUsage};

    fn desc() -> SurfaceDesc {
        SurfaceDesc {
            width: 8,
            height: 8,
            format: SurfaceFormat::Rgba8,
            usage: SurfaceUsage::DISPLAY,
        }
    }

    #[test]
    fn destroy_fires_exactly_once() {
        let mut table = ResourceTable::new();
        table.create(7, desc()).unwrap();
        assert_eq!(table.destroy(7).unwrap(), TableOp::Destroy);
        assert_eq!(table.destroy(7), Err(ResourceError::Missing(7)));
    }

    #[test]
    fn destroy_defers_past_outstanding_lock() {
        let mut table = ResourceTable::new();
        table.create(1, desc()).unwrap();
        table.lock(1, LockMode::ReadWrite).unwrap();
        // Destroy while locked: the entry lingers.
        assert_eq!(table.destroy(1).unwrap(), TableOp::None);
        assert!(table.contains(1));
        // Unlock satisfies the blocking transaction.
        assert_eq!(table.unlock(1).unwrap(), TableOp::Destroy);
        assert!(!table.contains(1));
    }

    #[test]
    fn duplicate_create_is_an_error() {
        let mut table = ResourceTable::new();
        table.create(3, desc()).unwrap();
        assert_eq!(table.create(3, desc()), Err(ResourceError::AlreadyExists(3)));
    }

    #[test]
    fn double_destroy_while_locked_is_an_error() {
        let mut table = ResourceTable::new();
        table.create(2, desc()).unwrap();
        table.lock(2, LockMode::ReadOnly).unwrap();
        assert_eq!(table.destroy(2).unwrap(), TableOp::None);
        assert_eq!(table.destroy(2), Err(ResourceError::AlreadyDestroyed(2)));
    }

    #[test]
    fn unlock_without_lock_is_an_error() {
        let mut table = ResourceTable::new();
        table.create(4, desc()).unwrap();
        assert_eq!(table.unlock(4), Err(ResourceError::NotLocked(4)));
    }

    #[test]
    fn drain_all_empties_the_table() {
        let mut table = ResourceTable::new();
        table.create(1, desc()).unwrap();
        table.create(2, desc()).unwrap();
        table.lock(2, LockMode::ReadWrite).unwrap();
        let mut owners = table.drain_all();
        owners.sort_unstable();
        assert_eq!(owners, vec![1, 2]);
        assert!(table.is_empty());
    }
}
