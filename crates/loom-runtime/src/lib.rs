//! # loom-runtime
//!
//! The in-process live update engine.
//!
//! Instrumented programs call the hooks in [`ffi`] on thread boundaries, loop
//! back edges, around blocking calls and at slots. The engine keeps those
//! hooks nearly free until an update arrives; then the [`quiescence`]
//! coordinator parks every thread at a safe point, the [`manager`] splices
//! the filter's operations into the [`registry`], and the process resumes.
//!
//! Updates arrive through the [`daemon`] thread, which talks to the
//! controller.

pub mod daemon;
pub mod error;
pub mod ffi;
pub mod filter;
pub mod lifecycle;
pub mod manager;
pub mod quiescence;
pub mod registry;
pub mod state;
pub mod switches;
pub mod sync;

pub use daemon::{DaemonConnector, DaemonHandle, TcpConnector};
pub use error::{EngineError, LifecycleError};
pub use filter::{Direction, FilterParseError, FilterSpec, FilterType, Limits, OpSpec};
pub use lifecycle::Runtime;
pub use manager::{FilterManager, FilterSummary};
pub use quiescence::{Coordinator, EvacuationGuard, Hold};
pub use registry::{Callback, OpHandle, Operation, OperationRegistry};
pub use state::ProcessState;
pub use switches::FunctionSwitches;
