use std::sync::Arc;

use loom_config::EngineConfig;

use crate::filter::Limits;
use crate::quiescence::Coordinator;
use crate::registry::OperationRegistry;
use crate::switches::FunctionSwitches;

/// Everything the engine keeps per process: the coordinator (lock, wait
/// flags, counters), the operation registry and the function switches.
pub struct ProcessState {
    coordinator: Arc<Coordinator>,
    registry: OperationRegistry,
    switches: FunctionSwitches,
}

impl ProcessState {
    pub fn new(engine: &EngineConfig) -> Self {
        let coordinator = Arc::new(Coordinator::new(
            engine.max_back_edges,
            engine.max_call_sites,
        ));
        let registry = OperationRegistry::new(&coordinator, engine.max_slots);
        Self {
            coordinator,
            registry,
            switches: FunctionSwitches::new(engine.max_functions),
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn switches(&self) -> &FunctionSwitches {
        &self.switches
    }

    #[inline]
    pub fn dispatch(&self, slot: u32) {
        self.registry.dispatch(&self.coordinator, slot);
    }

    #[inline]
    pub fn is_patched(&self, function: u32) -> bool {
        self.switches.is_patched(function)
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_slots: self.registry.max_slots(),
            max_back_edges: self.coordinator.num_back_edges(),
            max_call_sites: self.coordinator.num_call_sites(),
            max_functions: self.switches.len(),
        }
    }
}
