//! Named admission-control pools.
//!
//! A [`ResourcePool`] holds a set of named counters, each bounded by a limit.
//! Flow stages request a *set* of names at once; the set is acquired
//! all-or-nothing under a single mutex so two tasks can never each hold half
//! of what the other needs.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::SchedulerError;

/// Usage of a single named pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolUsage {
    /// Pool name.
    pub name: String,
    /// Slots currently held.
    pub current: u32,
    /// Maximum concurrent holders.
    pub limit: u32,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    limit: u32,
    current: u32,
}

/// Table of named counting semaphores.
#[derive(Debug, Default)]
pub struct ResourcePool {
    slots: Mutex<BTreeMap<String, Slot>>,
}

impl ResourcePool {
    /// Create an empty pool table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool table from a `name -> limit` mapping.
    pub fn from_limits<I, S>(limits: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let pool = Self::new();
        for (name, limit) in limits {
            pool.register(name, limit);
        }
        pool
    }

    /// Register a pool and return the name it was stored under.
    ///
    /// An existing name is never overwritten: the new pool gets the first free
    /// alias of the form `name_`, `name__`, ...
    pub fn register(&self, name: impl Into<String>, limit: u32) -> String {
        let mut name = name.into();
        let mut slots = self.slots.lock();
        while slots.contains_key(&name) {
            name.push('_');
        }
        slots.insert(name.clone(), Slot { limit, current: 0 });
        debug!(pool = %name, limit, "registered pool");
        name
    }

    /// Register `name` with `limit`, or update the limit if it already exists.
    ///
    /// Used for pools owned by a single flow (per-stage concurrency), which are
    /// re-declared on every scheduler tick.
    pub fn ensure(&self, name: &str, limit: u32) {
        let mut slots = self.slots.lock();
        slots
            .entry(name.to_string())
            .and_modify(|slot| slot.limit = limit)
            .or_insert(Slot { limit, current: 0 });
    }

    /// Check whether every named pool currently has a free slot, without acquiring.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::UnknownPool`] if a name is not registered.
    pub fn allow(&self, names: &[String]) -> Result<bool, SchedulerError> {
        let slots = self.slots.lock();
        Self::check(&slots, names)
    }

    /// Acquire one slot in every named pool, or none at all.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::UnknownPool`] if a name is not registered.
    pub fn try_acquire(&self, names: &[String]) -> Result<bool, SchedulerError> {
        let mut slots = self.slots.lock();
        if !Self::check(&slots, names)? {
            return Ok(false);
        }
        for name in names {
            if let Some(slot) = slots.get_mut(name) {
                slot.current += 1;
            }
        }
        Ok(true)
    }

    /// Acquire the set and wrap it in a guard that releases on drop.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::UnknownPool`] if a name is not registered.
    pub fn try_lease(self: &Arc<Self>, names: &[String]) -> Result<Option<PoolLease>, SchedulerError> {
        if self.try_acquire(names)? {
            Ok(Some(PoolLease {
                pool: Arc::clone(self),
                names: names.to_vec(),
            }))
        } else {
            Ok(None)
        }
    }

    /// Release one slot in every named pool.
    ///
    /// Releasing a pool that is already at zero is logged and ignored.
    pub fn release(&self, names: &[String]) {
        let mut slots = self.slots.lock();
        for name in names {
            match slots.get_mut(name) {
                Some(slot) if slot.current > 0 => slot.current -= 1,
                Some(_) => warn!(pool = %name, "attempt to release pool below zero"),
                None => warn!(pool = %name, "attempt to release unknown pool"),
            }
        }
    }

    /// Current usage of a single pool.
    #[must_use]
    pub fn usage(&self, name: &str) -> Option<PoolUsage> {
        self.slots.lock().get(name).map(|slot| PoolUsage {
            name: name.to_string(),
            current: slot.current,
            limit: slot.limit,
        })
    }

    /// Usage of every pool, ordered by name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PoolUsage> {
        self.slots
            .lock()
            .iter()
            .map(|(name, slot)| PoolUsage {
                name: name.clone(),
                current: slot.current,
                limit: slot.limit,
            })
            .collect()
    }

    /// One-line summary for periodic logging.
    #[must_use]
    pub fn info_text(&self) -> String {
        self.snapshot()
            .iter()
            .map(|u| format!("{}={}/{}", u.name, u.current, u.limit))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn check(slots: &BTreeMap<String, Slot>, names: &[String]) -> Result<bool, SchedulerError> {
        let mut allowed = true;
        for name in names {
            let slot = slots
                .get(name)
                .ok_or_else(|| SchedulerError::UnknownPool(name.clone()))?;
            // Count duplicates in the request so `["a", "a"]` needs two slots.
            let wanted = u32::try_from(names.iter().filter(|n| *n == name).count()).unwrap_or(u32::MAX);
            if slot.current.saturating_add(wanted) > slot.limit {
                allowed = false;
            }
        }
        Ok(allowed)
    }
}

/// A held set of pool slots. Dropping the lease releases the slots.
#[derive(Debug)]
pub struct PoolLease {
    pool: Arc<ResourcePool>,
    names: Vec<String>,
}

impl PoolLease {
    /// Names held by this lease.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.pool.release(&self.names);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_register_appends_alias() {
        let pool = ResourcePool::new();
        assert_eq!(pool.register("flows", 2), "flows");
        assert_eq!(pool.register("flows", 5), "flows_");
        assert_eq!(pool.register("flows", 7), "flows__");
        assert_eq!(pool.usage("flows").unwrap().limit, 2);
        assert_eq!(pool.usage("flows_").unwrap().limit, 5);
    }

    #[test]
    fn test_all_or_nothing() {
        let pool = ResourcePool::from_limits([("a", 2), ("b", 1)]);
        assert!(pool.try_acquire(&names(&["a", "b"])).unwrap());
        // b is full, a must stay untouched
        assert!(!pool.try_acquire(&names(&["a", "b"])).unwrap());
        assert_eq!(pool.usage("a").unwrap().current, 1);
        assert_eq!(pool.usage("b").unwrap().current, 1);

        pool.release(&names(&["a", "b"]));
        assert_eq!(pool.usage("a").unwrap().current, 0);
        assert_eq!(pool.usage("b").unwrap().current, 0);
    }

    #[test]
    fn test_over_release_is_ignored() {
        let pool = ResourcePool::from_limits([("a", 1)]);
        pool.release(&names(&["a"]));
        assert_eq!(pool.usage("a").unwrap().current, 0);
        assert!(pool.try_acquire(&names(&["a"])).unwrap());
        assert_eq!(pool.usage("a").unwrap().current, 1);
    }

    #[test]
    fn test_unknown_pool_is_error() {
        let pool = ResourcePool::new();
        let err = pool.try_acquire(&names(&["missing"])).unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownPool(name) if name == "missing"));
    }

    #[test]
    fn test_empty_set_always_acquires() {
        let pool = ResourcePool::new();
        assert!(pool.try_acquire(&[]).unwrap());
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let pool = Arc::new(ResourcePool::from_limits([("a", 1)]));
        let lease = pool.try_lease(&names(&["a"])).unwrap().unwrap();
        assert_eq!(lease.names(), &names(&["a"])[..]);
        assert!(pool.try_lease(&names(&["a"])).unwrap().is_none());
        drop(lease);
        assert_eq!(pool.usage("a").unwrap().current, 0);
    }

    #[test]
    fn test_ensure_updates_limit() {
        let pool = ResourcePool::new();
        pool.ensure("__f_export_concurrency__", 1);
        pool.ensure("__f_export_concurrency__", 3);
        assert_eq!(pool.snapshot().len(), 1);
        assert_eq!(pool.usage("__f_export_concurrency__").unwrap().limit, 3);
    }

    #[test]
    fn test_duplicate_names_need_two_slots() {
        let pool = ResourcePool::from_limits([("a", 1)]);
        assert!(!pool.try_acquire(&names(&["a", "a"])).unwrap());
        assert_eq!(pool.usage("a").unwrap().current, 0);
    }
}
