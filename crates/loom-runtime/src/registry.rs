//! Operation registry: per-slot chains of callbacks.
//!
//! Operations live in a generational arena and are identified by
//! [`OpHandle`]. Two operations with the same callback are still different
//! operations; unlinking always goes by handle.
//!
//! Chains are immutable `Arc<[_]>` snapshots replaced wholesale on every
//! change. `dispatch` clones the snapshot before invoking anything, so a
//! callback that trades the caller's hold (an atomic region) never walks a
//! chain that is being rewritten.

use std::cell::UnsafeCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::EngineError;
use crate::quiescence::{Coordinator, EvacuationGuard};

pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// One callback bound to one slot.
#[derive(Clone)]
pub struct Operation {
    pub slot: u32,
    pub callback: Callback,
}

impl Operation {
    pub fn new(slot: u32, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            slot,
            callback: Arc::new(callback),
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation").field("slot", &self.slot).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpHandle {
    index: u32,
    generation: u32,
}

#[derive(Clone)]
struct ChainEntry {
    handle: OpHandle,
    callback: Callback,
}

struct ArenaEntry {
    generation: u32,
    /// Slot the operation is linked at, `None` once unlinked
    slot: Option<u32>,
}

#[derive(Default)]
struct Tables {
    arena: Vec<ArenaEntry>,
    free: Vec<u32>,
    chains: HashMap<u32, Arc<[ChainEntry]>>,
}

impl Tables {
    fn alloc(&mut self, slot: u32) -> OpHandle {
        if let Some(index) = self.free.pop() {
            let entry = &mut self.arena[index as usize];
            entry.slot = Some(slot);
            return OpHandle {
                index,
                generation: entry.generation,
            };
        }
        self.arena.push(ArenaEntry {
            generation: 0,
            slot: Some(slot),
        });
        OpHandle {
            index: (self.arena.len() - 1) as u32,
            generation: 0,
        }
    }

    fn release(&mut self, handle: OpHandle) -> Option<u32> {
        let entry = self.arena.get_mut(handle.index as usize)?;
        if entry.generation != handle.generation {
            return None;
        }
        let slot = entry.slot.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(handle.index);
        Some(slot)
    }
}

pub struct OperationRegistry {
    coordinator_id: u64,
    max_slots: u32,
    tables: UnsafeCell<Tables>,
    linked: AtomicUsize,
}

// Tables are written only under an `EvacuationGuard` of the owning
// coordinator, i.e. while no other thread holds the update lock in any mode.
// Readers always hold it at least shared.
unsafe impl Send for OperationRegistry {}
unsafe impl Sync for OperationRegistry {}

impl OperationRegistry {
    pub fn new(coordinator: &Coordinator, max_slots: u32) -> Self {
        Self {
            coordinator_id: coordinator.id(),
            max_slots,
            tables: UnsafeCell::new(Tables::default()),
            linked: AtomicUsize::new(0),
        }
    }

    pub fn max_slots(&self) -> u32 {
        self.max_slots
    }

    #[allow(clippy::mut_from_ref)]
    fn tables_mut(&self, guard: &EvacuationGuard<'_>) -> &mut Tables {
        debug_assert_eq!(
            guard.coordinator_id(),
            self.coordinator_id,
            "guard from another coordinator"
        );
        unsafe { &mut *self.tables.get() }
    }

    fn tables(&self) -> &Tables {
        unsafe { &*self.tables.get() }
    }

    /// Link `op` at the head of its slot's chain.
    pub fn prepend(
        &self,
        guard: &EvacuationGuard<'_>,
        op: Operation,
    ) -> Result<OpHandle, EngineError> {
        if op.slot >= self.max_slots {
            return Err(EngineError::MalformedFilter(format!(
                "slot {} out of range (max {})",
                op.slot, self.max_slots
            )));
        }

        let tables = self.tables_mut(guard);
        let handle = tables.alloc(op.slot);
        let entry = ChainEntry {
            handle,
            callback: op.callback,
        };
        let chain: Arc<[ChainEntry]> = match tables.chains.get(&op.slot) {
            Some(old) => std::iter::once(entry).chain(old.iter().cloned()).collect(),
            None => Arc::from(vec![entry]),
        };
        tables.chains.insert(op.slot, chain);
        self.linked.fetch_add(1, Ordering::Release);
        Ok(handle)
    }

    /// Unlink the operation identified by `handle`. Returns false when the
    /// handle is stale or unknown.
    pub fn unlink(&self, guard: &EvacuationGuard<'_>, handle: OpHandle) -> bool {
        let tables = self.tables_mut(guard);
        let Some(slot) = tables.release(handle) else {
            return false;
        };

        if let Some(old) = tables.chains.get(&slot) {
            let remaining: Vec<ChainEntry> =
                old.iter().filter(|e| e.handle != handle).cloned().collect();
            if remaining.is_empty() {
                tables.chains.remove(&slot);
            } else {
                tables.chains.insert(slot, Arc::from(remaining));
            }
        }
        self.linked.fetch_sub(1, Ordering::Release);
        true
    }

    /// Run every operation linked at `slot`, newest first.
    #[inline]
    pub fn dispatch(&self, coordinator: &Coordinator, slot: u32) {
        if self.linked.load(Ordering::Acquire) == 0 {
            return;
        }
        debug_assert!(slot < self.max_slots, "slot {} out of range", slot);

        let chain = coordinator.with_shared(|| self.tables().chains.get(&slot).cloned());
        if let Some(chain) = chain {
            for entry in chain.iter() {
                (entry.callback)();
            }
        }
    }

    /// Handles linked at `slot`, in execution order.
    pub fn chain(&self, coordinator: &Coordinator, slot: u32) -> Vec<OpHandle> {
        coordinator.with_shared(|| {
            self.tables()
                .chains
                .get(&slot)
                .map(|c| c.iter().map(|e| e.handle).collect())
                .unwrap_or_default()
        })
    }

    /// Every non-empty chain, keyed by slot.
    pub fn snapshot(&self, coordinator: &Coordinator) -> BTreeMap<u32, Vec<OpHandle>> {
        coordinator.with_shared(|| {
            self.tables()
                .chains
                .iter()
                .map(|(slot, c)| (*slot, c.iter().map(|e| e.handle).collect()))
                .collect()
        })
    }

    /// Number of linked operations across all slots.
    pub fn len(&self) -> usize {
        self.linked.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
