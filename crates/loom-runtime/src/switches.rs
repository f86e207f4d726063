//! Function switches.
//!
//! Instrumented binaries carry two clones of every patchable function and ask
//! [`FunctionSwitches::is_patched`] which one to run. A switch is a reference
//! count of installed filters that patch the function.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::quiescence::EvacuationGuard;

pub struct FunctionSwitches {
    counts: Box<[AtomicU32]>,
}

impl FunctionSwitches {
    pub fn new(max_functions: u32) -> Self {
        Self {
            counts: (0..max_functions).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn len(&self) -> u32 {
        self.counts.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    #[inline]
    pub fn is_patched(&self, function: u32) -> bool {
        self.counts
            .get(function as usize)
            .is_some_and(|c| c.load(Ordering::Acquire) > 0)
    }

    pub fn patch(&self, _guard: &EvacuationGuard<'_>, function: u32) {
        if let Some(count) = self.counts.get(function as usize) {
            count.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Drop one filter's claim on `function`. With `revert` unset the switch
    /// stays patched for the life of the process.
    pub fn unpatch(&self, _guard: &EvacuationGuard<'_>, function: u32, revert: bool) {
        if !revert {
            return;
        }
        if let Some(count) = self.counts.get(function as usize) {
            let _ = count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        }
    }

    /// Number of functions currently switched to the patched clone.
    pub fn patched_count(&self) -> usize {
        self.counts
            .iter()
            .filter(|c| c.load(Ordering::Acquire) > 0)
            .count()
    }
}
