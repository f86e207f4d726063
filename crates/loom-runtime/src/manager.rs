//! Filter manager: turns parsed filters into operations and splices them in
//! and out of the registry under an evacuation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use loom_config::{log_engine_error, log_engine_info, log_engine_warn};

use crate::error::EngineError;
use crate::filter::{Direction, FilterSpec, FilterType, OpSpec};
use crate::registry::{Callback, OpHandle, Operation};
use crate::state::ProcessState;
use crate::sync::{ForkSafeMutex, ForkSafeMutexGuard, RegionLock, Semaphore};

struct InstalledFilter {
    spec: FilterSpec,
    handles: Vec<OpHandle>,
    source: Option<PathBuf>,
}

/// One row of [`FilterManager::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSummary {
    pub id: u32,
    pub kind: FilterType,
    pub ops: usize,
    pub functions: usize,
    pub source: Option<PathBuf>,
}

pub struct FilterManager {
    state: Arc<ProcessState>,
    // Held across the whole evacuate/mutate/resume bracket, so installs and
    // removals never interleave. Reset in a forked child.
    filters: ForkSafeMutex<BTreeMap<u32, InstalledFilter>>,
    revert_switches: bool,
}

impl FilterManager {
    pub fn new(state: Arc<ProcessState>, revert_switches: bool) -> Self {
        Self {
            state,
            filters: ForkSafeMutex::new(BTreeMap::new()),
            revert_switches,
        }
    }

    pub fn state(&self) -> &Arc<ProcessState> {
        &self.state
    }

    /// Must be called with the calling thread's shared hold given up; see
    /// [`Coordinator::without_hold`](crate::Coordinator::without_hold).
    fn filters(&self) -> ForkSafeMutexGuard<'_, BTreeMap<u32, InstalledFilter>> {
        self.filters.lock()
    }

    /// Run `f` on the filter table from any thread, instrumented or not.
    fn with_filters<R>(&self, f: impl FnOnce(&BTreeMap<u32, InstalledFilter>) -> R) -> R {
        self.state
            .coordinator()
            .without_hold(|| f(&self.filters()))
    }

    /// Install `spec` as filter `id`.
    pub fn install(&self, id: u32, spec: FilterSpec) -> Result<(), EngineError> {
        self.state
            .coordinator()
            .without_hold(|| self.install_inner(id, spec, None))
    }

    /// Read, parse and install the filter file at `path`.
    pub fn install_file(&self, id: u32, path: &Path) -> Result<(), EngineError> {
        let spec = FilterSpec::load(path)?;
        self.state
            .coordinator()
            .without_hold(|| self.install_inner(id, spec, Some(path.to_path_buf())))
    }

    fn install_inner(
        &self,
        id: u32,
        spec: FilterSpec,
        source: Option<PathBuf>,
    ) -> Result<(), EngineError> {
        let mut filters = self.filters();
        if filters.contains_key(&id) {
            return Err(EngineError::DuplicateFilterId(id));
        }
        spec.validate(&self.state.limits())?;
        let ops = self.build_operations(&spec)?;

        let registry = self.state.registry();
        let switches = self.state.switches();
        let guard = self
            .state
            .coordinator()
            .evacuate(&spec.unsafe_back_edges, &spec.unsafe_call_sites);

        let mut handles = Vec::with_capacity(ops.len());
        for op in ops {
            match registry.prepend(&guard, op) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in handles {
                        registry.unlink(&guard, handle);
                    }
                    guard.resume();
                    return Err(e);
                }
            }
        }
        for &function in &spec.functions_to_patch {
            switches.patch(&guard, function);
        }
        guard.resume();

        log_engine_info!(
            "Filter installed",
            filter_id = id,
            kind = spec.kind.name(),
            ops = handles.len(),
        );
        filters.insert(
            id,
            InstalledFilter {
                spec,
                handles,
                source,
            },
        );
        Ok(())
    }

    fn build_operations(&self, spec: &FilterSpec) -> Result<Vec<Operation>, EngineError> {
        let ops = match spec.kind {
            FilterType::CriticalRegion => {
                let region = Arc::new(RegionLock::new());
                let r = region.clone();
                bind(&spec.ops, move || r.acquire(), move || region.release())
            }
            FilterType::Order => {
                let sem = Arc::new(Semaphore::new());
                let s = sem.clone();
                bind(&spec.ops, move || s.down(), move || sem.up())
            }
            FilterType::Atomic => {
                let coordinator = self.state.coordinator().clone();
                let c = coordinator.clone();
                bind(
                    &spec.ops,
                    move || c.enter_atomic(),
                    move || coordinator.exit_atomic(),
                )
            }
            FilterType::Barrier => return Err(EngineError::UnsupportedFilterType(spec.kind)),
        };
        Ok(ops)
    }

    /// Remove filter `id`.
    pub fn remove(&self, id: u32) -> Result<(), EngineError> {
        self.state.coordinator().without_hold(|| self.remove_inner(id))
    }

    fn remove_inner(&self, id: u32) -> Result<(), EngineError> {
        let mut filters = self.filters();
        let Some(filter) = filters.get(&id) else {
            return Err(EngineError::UnknownFilterId(id));
        };

        let registry = self.state.registry();
        let switches = self.state.switches();
        let guard = self.state.coordinator().evacuate(
            &filter.spec.unsafe_back_edges,
            &filter.spec.unsafe_call_sites,
        );
        for &handle in &filter.handles {
            if !registry.unlink(&guard, handle) {
                log_engine_error!("Operation missing from registry", filter_id = id);
            }
        }
        for &function in &filter.spec.functions_to_patch {
            switches.unpatch(&guard, function, self.revert_switches);
        }
        guard.resume();

        filters.remove(&id);
        log_engine_info!("Filter removed", filter_id = id);
        Ok(())
    }

    pub fn contains(&self, id: u32) -> bool {
        self.with_filters(|filters| filters.contains_key(&id))
    }

    pub fn list(&self) -> Vec<FilterSummary> {
        self.with_filters(|filters| {
            filters
                .iter()
                .map(|(&id, f)| FilterSummary {
                    id,
                    kind: f.spec.kind,
                    ops: f.handles.len(),
                    functions: f.spec.functions_to_patch.len(),
                    source: f.source.clone(),
                })
                .collect()
        })
    }

    /// Ids of every installed filter, in order.
    pub fn ids(&self) -> Vec<u32> {
        self.with_filters(|filters| filters.keys().copied().collect())
    }

    /// Release a table lock left held by a parent thread that does not exist
    /// in the child. Installed filters carry over.
    ///
    /// # Safety
    /// Call only in the child right after `fork`, before it spawns threads.
    pub unsafe fn reinit_after_fork(&self) {
        if self.filters.is_locked() {
            log_engine_warn!("Filter table was locked at fork, resetting");
        }
        self.filters.reset_after_fork();
    }

    /// Take the table lock and never release it, as a thread that vanished
    /// in a fork would.
    #[cfg(test)]
    pub(crate) fn leak_table_lock(&self) {
        std::mem::forget(self.filters());
    }
}

/// Bind a filter's start and end actions to its operation list.
fn bind<S, E>(ops: &[OpSpec], start: S, end: E) -> Vec<Operation>
where
    S: Fn() + Send + Sync + 'static,
    E: Fn() + Send + Sync + 'static,
{
    let start: Callback = Arc::new(start);
    let end: Callback = Arc::new(end);
    ops.iter()
        .map(|op| Operation {
            slot: op.slot,
            callback: match op.direction {
                Direction::Start => start.clone(),
                Direction::End => end.clone(),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_config::EngineConfig;

    fn manager() -> FilterManager {
        let engine = EngineConfig {
            max_slots: 128,
            max_back_edges: 16,
            max_call_sites: 16,
            max_functions: 16,
            revert_switches_on_remove: true,
        };
        FilterManager::new(Arc::new(ProcessState::new(&engine)), true)
    }

    #[test]
    fn test_install_then_remove() {
        let m = manager();
        m.install(1, "1 2 0 42 1 43 1 3".parse().unwrap()).unwrap();
        assert!(m.contains(1));
        assert!(m.state().is_patched(3));
        assert_eq!(m.state().registry().len(), 2);

        m.remove(1).unwrap();
        assert!(!m.contains(1));
        assert!(!m.state().is_patched(3));
        assert!(m.state().registry().is_empty());
    }

    #[test]
    fn test_duplicate_and_unknown_ids() {
        let m = manager();
        m.install(5, "1 1 0 1".parse().unwrap()).unwrap();
        assert!(matches!(
            m.install(5, "2 1 0 2".parse().unwrap()),
            Err(EngineError::DuplicateFilterId(5))
        ));
        assert!(matches!(m.remove(6), Err(EngineError::UnknownFilterId(6))));
        assert_eq!(m.list().len(), 1);
        assert_eq!(m.list()[0].kind, FilterType::CriticalRegion);
    }

    #[test]
    fn test_barrier_rejected_without_side_effects() {
        let m = manager();
        assert!(matches!(
            m.install(0, "4 1 0 1 1 2".parse().unwrap()),
            Err(EngineError::UnsupportedFilterType(FilterType::Barrier))
        ));
        assert!(m.state().registry().is_empty());
        assert!(!m.state().is_patched(2));
    }

    #[test]
    fn test_out_of_range_slot_is_malformed() {
        let m = manager();
        assert!(matches!(
            m.install(0, "1 1 0 500".parse().unwrap()),
            Err(EngineError::MalformedFilter(_))
        ));
        assert!(!m.contains(0));
    }

    #[test]
    fn test_reinit_after_fork_frees_table() {
        let m = manager();
        m.install(1, "1 1 0 1".parse().unwrap()).unwrap();
        // A daemon mid-install in the parent at fork time
        m.leak_table_lock();

        unsafe { m.reinit_after_fork() };
        assert_eq!(m.ids(), vec![1]);
        m.remove(1).unwrap();
    }

    #[test]
    fn test_ids_in_order() {
        let m = manager();
        m.install(2, "2 2 0 3 1 4".parse().unwrap()).unwrap();
        m.install(1, "1 1 0 1".parse().unwrap()).unwrap();
        assert_eq!(m.ids(), vec![1, 2]);
        m.remove(2).unwrap();
        assert_eq!(m.ids(), vec![1]);
    }

    #[test]
    fn test_order_filter_runs_end_before_start() {
        let m = manager();
        m.install(1, "2 2 0 10 1 11".parse().unwrap()).unwrap();
        let state = m.state().clone();

        let s2 = state.clone();
        let waiter = std::thread::spawn(move || s2.dispatch(10));
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!waiter.is_finished());

        state.dispatch(11);
        waiter.join().unwrap();
    }
}
