//! Filter install/remove against a live process state.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use loom_config::EngineConfig;
use loom_runtime::{
    Direction, EngineError, FilterManager, FilterSpec, FilterType, OpSpec, ProcessState,
};
use proptest::prelude::*;

const SLOTS: u32 = 64;
const FUNCTIONS: u32 = 8;

fn engine(revert: bool) -> EngineConfig {
    EngineConfig {
        max_slots: SLOTS,
        max_back_edges: 16,
        max_call_sites: 16,
        max_functions: FUNCTIONS,
        revert_switches_on_remove: revert,
    }
}

fn manager() -> Arc<FilterManager> {
    Arc::new(FilterManager::new(
        Arc::new(ProcessState::new(&engine(true))),
        true,
    ))
}

/// A counter updated with a plain load and store, so lost updates show up
/// when two threads run the increment at once.
struct RacyCounter(UnsafeCell<u64>);

unsafe impl Sync for RacyCounter {}

impl RacyCounter {
    fn increment(&self) {
        unsafe {
            let v = std::ptr::read_volatile(self.0.get());
            thread::yield_now();
            std::ptr::write_volatile(self.0.get(), v + 1);
        }
    }

    fn get(&self) -> u64 {
        unsafe { std::ptr::read_volatile(self.0.get()) }
    }
}

#[test]
fn critical_region_serializes_increments() {
    const THREADS: u64 = 2;
    const ITERATIONS: u64 = 2_000;

    let m = manager();
    m.install(1, "1 2 0 42 1 43 0 0 0".parse().unwrap()).unwrap();

    let state = m.state().clone();
    let counter = Arc::new(RacyCounter(UnsafeCell::new(0)));
    let barrier = Arc::new(Barrier::new(THREADS as usize));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let state = state.clone();
            let counter = counter.clone();
            let b = barrier.clone();
            thread::spawn(move || {
                let c = state.coordinator();
                c.enter_thread();
                b.wait();
                for _ in 0..ITERATIONS {
                    c.cycle_check(7);
                    state.dispatch(42);
                    counter.increment();
                    state.dispatch(43);
                }
                c.exit_thread(false);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(counter.get(), THREADS * ITERATIONS);
    m.remove(1).unwrap();
    assert!(state.registry().is_empty());
}

#[test]
fn order_filter_runs_end_before_start() {
    let m = manager();
    // Slot 5 must wait for slot 6
    m.install(2, "2 2 0 5 1 6".parse().unwrap()).unwrap();
    let state = m.state().clone();

    let log = Arc::new(std::sync::Mutex::new(Vec::new()));
    let waiter = {
        let state = state.clone();
        let log = log.clone();
        thread::spawn(move || {
            state.coordinator().enter_thread();
            state.dispatch(5);
            log.lock().unwrap().push("second");
            state.coordinator().exit_thread(false);
        })
    };

    thread::sleep(std::time::Duration::from_millis(20));
    state.coordinator().enter_thread();
    log.lock().unwrap().push("first");
    state.dispatch(6);
    state.coordinator().exit_thread(false);

    waiter.join().unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    m.remove(2).unwrap();
}

#[test]
fn atomic_filter_excludes_other_threads() {
    const ITERATIONS: usize = 200;

    let m = manager();
    m.install(3, "3 2 0 10 1 11".parse().unwrap()).unwrap();
    let state = m.state().clone();
    let inside = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(AtomicBool::new(false));

    let bystander = {
        let state = state.clone();
        let inside = inside.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let c = state.coordinator();
            c.enter_thread();
            while !stop.load(Ordering::SeqCst) {
                assert_eq!(inside.load(Ordering::SeqCst), 0);
                c.cycle_check(0);
            }
            c.exit_thread(false);
        })
    };

    let c = state.coordinator();
    c.enter_thread();
    for _ in 0..ITERATIONS {
        state.dispatch(10);
        inside.fetch_add(1, Ordering::SeqCst);
        thread::yield_now();
        inside.fetch_sub(1, Ordering::SeqCst);
        state.dispatch(11);
        c.cycle_check(0);
    }
    c.exit_thread(false);

    stop.store(true, Ordering::SeqCst);
    bystander.join().unwrap();
    m.remove(3).unwrap();
}

#[test]
fn install_while_threads_run() {
    let m = manager();
    let state = m.state().clone();
    let stop = Arc::new(AtomicBool::new(false));

    let workers: Vec<_> = (0..3)
        .map(|i| {
            let state = state.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let c = state.coordinator();
                c.enter_thread();
                while !stop.load(Ordering::Relaxed) {
                    c.cycle_check(i);
                    state.dispatch(42);
                    c.before_blocking(1);
                    thread::yield_now();
                    c.after_blocking(1);
                    state.dispatch(43);
                }
                c.exit_thread(false);
            })
        })
        .collect();

    for id in 0..20 {
        m.install(id, "1 2 0 42 1 43 1 3 0 1 1".parse().unwrap())
            .unwrap();
        assert!(state.is_patched(3));
        m.remove(id).unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    for h in workers {
        h.join().unwrap();
    }
    assert!(state.registry().is_empty());
    assert!(!state.is_patched(3));
}

#[test]
fn instrumented_threads_install_concurrently() {
    let m = manager();
    let start = Arc::new(Barrier::new(2));
    let (done_tx, done_rx) = std::sync::mpsc::channel();

    for id in 0..2u32 {
        let m = m.clone();
        let start = start.clone();
        let done_tx = done_tx.clone();
        thread::spawn(move || {
            let c = m.state().coordinator();
            c.enter_thread();
            start.wait();
            m.install(id, "1 1 0 3".parse().unwrap()).unwrap();
            assert!(m.contains(id));
            m.remove(id).unwrap();
            c.exit_thread(false);
            done_tx.send(id).unwrap();
        });
    }

    for _ in 0..2 {
        done_rx
            .recv_timeout(std::time::Duration::from_secs(10))
            .expect("concurrent installs from instrumented threads deadlocked");
    }
    assert!(m.state().registry().is_empty());
}

#[test]
fn duplicate_id_leaves_registry_unchanged() {
    let m = manager();
    let state = m.state().clone();
    m.install(9, "1 2 0 1 1 2 1 4".parse().unwrap()).unwrap();
    let before = state.registry().snapshot(state.coordinator());

    let err = m.install(9, "2 1 0 30 1 5".parse().unwrap()).unwrap_err();
    assert!(matches!(err, EngineError::DuplicateFilterId(9)));
    assert_eq!(state.registry().snapshot(state.coordinator()), before);
    assert!(!state.is_patched(5));
    assert_eq!(m.list().len(), 1);
}

#[test]
fn out_of_range_filter_is_rejected_before_update() {
    let m = manager();
    let state = m.state().clone();
    let err = m
        .install(1, format!("1 1 0 {}", SLOTS).parse().unwrap())
        .unwrap_err();
    assert!(matches!(err, EngineError::MalformedFilter(_)));
    assert!(state.registry().is_empty());
    assert!(!state.coordinator().is_evacuating());
}

#[test]
fn barrier_filter_is_unsupported() {
    let m = manager();
    let err = m.install(1, "4 1 0 3".parse().unwrap()).unwrap_err();
    assert!(matches!(
        err,
        EngineError::UnsupportedFilterType(FilterType::Barrier)
    ));
    assert!(m.state().registry().is_empty());
}

#[test]
fn switches_stay_patched_without_revert() {
    let state = Arc::new(ProcessState::new(&engine(false)));
    let m = FilterManager::new(state.clone(), false);
    m.install(1, "1 0 1 2".parse().unwrap()).unwrap();
    m.remove(1).unwrap();
    assert!(state.is_patched(2));
}

fn filter_spec() -> impl Strategy<Value = FilterSpec> {
    let kind = prop_oneof![
        Just(FilterType::CriticalRegion),
        Just(FilterType::Order),
        Just(FilterType::Atomic),
    ];
    let op = (any::<bool>(), 0..SLOTS).prop_map(|(start, slot)| OpSpec {
        direction: if start { Direction::Start } else { Direction::End },
        slot,
    });
    (
        kind,
        prop::collection::vec(op, 0..6),
        prop::collection::vec(0..FUNCTIONS, 0..3),
        prop::collection::vec(0u32..16, 0..3),
        prop::collection::vec(0u32..16, 0..3),
    )
        .prop_map(
            |(kind, ops, functions_to_patch, unsafe_back_edges, unsafe_call_sites)| FilterSpec {
                kind,
                ops,
                functions_to_patch,
                unsafe_back_edges,
                unsafe_call_sites,
            },
        )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Installing then removing a filter restores chains and switches.
    #[test]
    fn install_then_remove_restores_state(
        base in prop::collection::vec(filter_spec(), 0..4),
        extra in filter_spec(),
    ) {
        let m = manager();
        let state = m.state().clone();
        for (id, spec) in base.into_iter().enumerate() {
            m.install(id as u32, spec).unwrap();
        }

        let chains = state.registry().snapshot(state.coordinator());
        let patched: Vec<bool> = (0..FUNCTIONS).map(|f| state.is_patched(f)).collect();

        m.install(100, extra.clone()).unwrap();
        prop_assert_eq!(state.registry().len(), chains.values().map(Vec::len).sum::<usize>() + extra.ops.len());
        m.remove(100).unwrap();

        prop_assert_eq!(state.registry().snapshot(state.coordinator()), chains);
        let after: Vec<bool> = (0..FUNCTIONS).map(|f| state.is_patched(f)).collect();
        prop_assert_eq!(after, patched);
    }
}
