//! Quiescence coordination.
//!
//! Every instrumented thread holds the update lock shared while it runs. It
//! lets go only at safe points: a back edge whose wait flag is set, or the
//! span of a blocking external call. The updater sets wait flags, then takes
//! the lock exclusively once no thread is inside an unsafe blocking call. At
//! that point no application thread can observe the engine's tables, and they
//! may be rewritten.
//!
//! Per-thread state (nesting depth, what the thread currently holds) lives in
//! a thread-local keyed by coordinator id, so several coordinators can coexist
//! in one process.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use loom_config::{log_engine_debug, log_engine_error};

use crate::sync::{Backoff, UpdateLock};

static NEXT_COORDINATOR_ID: AtomicU64 = AtomicU64::new(1);

/// What the calling thread holds on the update lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hold {
    /// Not registered with the coordinator.
    None,
    /// Running instrumented code.
    Shared,
    /// Registered, but its shared hold is released for a blocking call.
    Released,
    /// Inside an atomic region, or acting as the updater.
    Exclusive,
}

#[derive(Debug, Clone, Copy)]
struct ThreadState {
    coordinator: u64,
    depth: u32,
    hold: Hold,
    /// Hold to return to when leaving an atomic region.
    atomic_from: Hold,
    blocking_call: Option<u32>,
}

impl ThreadState {
    fn outside(coordinator: u64) -> Self {
        Self {
            coordinator,
            depth: 0,
            hold: Hold::None,
            atomic_from: Hold::None,
            blocking_call: None,
        }
    }

    fn is_outside(&self) -> bool {
        self.depth == 0 && self.hold == Hold::None && self.blocking_call.is_none()
    }
}

thread_local! {
    static THREAD_STATES: RefCell<Vec<ThreadState>> = const { RefCell::new(Vec::new()) };
}

pub struct Coordinator {
    id: u64,
    lock: UpdateLock,
    /// Edges the in-flight evacuation parks at. Only the updater writes them.
    wait: Box<[AtomicBool]>,
    /// Threads waiting to enter an atomic region; while non-zero every edge
    /// parks.
    atomic_requests: AtomicU32,
    counters: Box<[AtomicU32]>,
    /// Set from the start of `evacuate` until the matching resume. Also
    /// serializes updaters.
    evacuating: AtomicBool,
}

impl Coordinator {
    pub fn new(max_back_edges: u32, max_call_sites: u32) -> Self {
        Self {
            id: NEXT_COORDINATOR_ID.fetch_add(1, Ordering::Relaxed),
            lock: UpdateLock::new(),
            wait: (0..max_back_edges).map(|_| AtomicBool::new(false)).collect(),
            atomic_requests: AtomicU32::new(0),
            counters: (0..max_call_sites).map(|_| AtomicU32::new(0)).collect(),
            evacuating: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn num_back_edges(&self) -> u32 {
        self.wait.len() as u32
    }

    pub fn num_call_sites(&self) -> u32 {
        self.counters.len() as u32
    }

    // ------------------------------------------------------------------
    // Thread-local bookkeeping
    // ------------------------------------------------------------------

    fn load_state(&self) -> ThreadState {
        THREAD_STATES
            .try_with(|states| {
                states
                    .borrow()
                    .iter()
                    .find(|s| s.coordinator == self.id)
                    .copied()
            })
            .ok()
            .flatten()
            .unwrap_or_else(|| ThreadState::outside(self.id))
    }

    fn store_state(&self, state: ThreadState) {
        let _ = THREAD_STATES.try_with(|states| {
            let mut states = states.borrow_mut();
            let pos = states.iter().position(|s| s.coordinator == self.id);
            match (pos, state.is_outside()) {
                (Some(i), true) => {
                    states.swap_remove(i);
                }
                (Some(i), false) => states[i] = state,
                (None, false) => states.push(state),
                (None, true) => {}
            }
        });
    }

    /// Nesting depth of `enter_thread` calls on the calling thread.
    pub fn thread_depth(&self) -> u32 {
        self.load_state().depth
    }

    /// What the calling thread currently holds.
    pub fn thread_hold(&self) -> Hold {
        self.load_state().hold
    }

    // ------------------------------------------------------------------
    // Thread hooks
    // ------------------------------------------------------------------

    /// Register the calling thread. Only the outermost call takes the shared
    /// hold.
    pub fn enter_thread(&self) {
        let mut st = self.load_state();
        st.depth += 1;
        if st.hold == Hold::None {
            self.lock.read_lock();
            st.hold = Hold::Shared;
        }
        self.store_state(st);
    }

    /// Unregister the calling thread. The hold is released when the depth
    /// reaches zero, or at once when `forced`.
    pub fn exit_thread(&self, forced: bool) {
        let mut st = self.load_state();
        if st.depth == 0 {
            log_engine_debug!("exit_thread on a thread that never entered", forced = forced);
            return;
        }

        st.depth = if forced { 0 } else { st.depth - 1 };
        if st.depth > 0 {
            self.store_state(st);
            return;
        }

        match st.hold {
            Hold::Shared => self.lock.read_unlock(),
            Hold::Exclusive => self.lock.write_unlock(),
            Hold::Released | Hold::None => {}
        }
        if let Some(call) = st.blocking_call.take() {
            self.decrement(call);
        }
        self.store_state(ThreadState::outside(self.id));
    }

    /// Back-edge hook. Parks the thread while the edge's wait flag is set.
    #[inline]
    pub fn cycle_check(&self, edge: u32) {
        let Some(flag) = self.wait.get(edge as usize) else {
            debug_assert!(false, "back edge {} out of range", edge);
            return;
        };
        if flag.load(Ordering::Acquire) || self.atomic_requested() {
            self.park(flag);
        }
    }

    #[inline]
    fn atomic_requested(&self) -> bool {
        self.atomic_requests.load(Ordering::Acquire) > 0
    }

    #[cold]
    fn park(&self, flag: &AtomicBool) {
        let hold = self.load_state().hold;
        if hold == Hold::Exclusive {
            // Waiting here would wait on ourselves
            return;
        }

        let release = hold == Hold::Shared;
        if release {
            self.lock.read_unlock();
        }
        let mut backoff = Backoff::new();
        while flag.load(Ordering::Acquire) || self.atomic_requested() {
            backoff.snooze();
        }
        if release {
            self.lock.read_lock();
        }
    }

    /// Called right before a blocking external call.
    ///
    /// The increment is ordered before the release so that an updater holding
    /// the lock exclusively sees every thread that is, or is about to be,
    /// inside the call.
    pub fn before_blocking(&self, call: u32) {
        let Some(counter) = self.counters.get(call as usize) else {
            debug_assert!(false, "call site {} out of range", call);
            return;
        };
        let mut st = self.load_state();
        if st.hold == Hold::Exclusive {
            return;
        }

        counter.fetch_add(1, Ordering::SeqCst);
        if st.hold == Hold::Shared {
            self.lock.read_unlock();
            st.hold = Hold::Released;
        }
        st.blocking_call = Some(call);
        self.store_state(st);
    }

    /// Called right after the blocking call returns, whatever its outcome.
    /// Re-acquires before decrementing.
    pub fn after_blocking(&self, call: u32) {
        if call as usize >= self.counters.len() {
            debug_assert!(false, "call site {} out of range", call);
            return;
        }
        let mut st = self.load_state();
        if st.hold == Hold::Exclusive {
            return;
        }

        if st.hold == Hold::Released {
            self.lock.read_lock();
            st.hold = Hold::Shared;
        }
        self.decrement(call);
        st.blocking_call = None;
        self.store_state(st);
    }

    fn decrement(&self, call: u32) {
        let counter = &self.counters[call as usize];
        if counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1))
            .is_err()
        {
            log_engine_error!("Blocking-call counter would go negative", call_site = call);
            debug_assert!(false, "counter underflow at call site {}", call);
        }
    }

    /// Run `f` with at least a shared hold, taking a transient one if the
    /// calling thread holds nothing.
    pub fn with_shared<R>(&self, f: impl FnOnce() -> R) -> R {
        match self.load_state().hold {
            Hold::Shared | Hold::Exclusive => f(),
            Hold::None | Hold::Released => {
                self.lock.read_lock();
                let out = f();
                self.lock.read_unlock();
                out
            }
        }
    }

    /// Run `f` with the calling thread's shared hold given up, as across a
    /// blocking call.
    ///
    /// Anything an instrumented thread waits on that an updater may hold
    /// while it evacuates (the filter table, another update in flight) must
    /// be waited on inside this, or the updater's exclusive acquire waits on
    /// the waiting thread.
    pub fn without_hold<R>(&self, f: impl FnOnce() -> R) -> R {
        let mut st = self.load_state();
        if st.hold != Hold::Shared {
            return f();
        }
        self.lock.read_unlock();
        st.hold = Hold::Released;
        self.store_state(st);

        let out = f();

        let mut st = self.load_state();
        self.lock.read_lock();
        st.hold = Hold::Shared;
        self.store_state(st);
        out
    }

    /// Threads currently inside blocking call site `call`.
    pub fn counter(&self, call: u32) -> u32 {
        self.counters
            .get(call as usize)
            .map_or(0, |c| c.load(Ordering::SeqCst))
    }

    /// Whether a thread reaching back edge `edge` would park.
    pub fn wait_flag(&self, edge: u32) -> bool {
        self.wait
            .get(edge as usize)
            .is_some_and(|f| f.load(Ordering::Acquire) || self.atomic_requested())
    }

    fn clear_wait(&self) {
        for flag in self.wait.iter() {
            flag.store(false, Ordering::Release);
        }
    }

    // ------------------------------------------------------------------
    // Updater side
    // ------------------------------------------------------------------

    /// Bring the process to quiescence.
    ///
    /// Parks threads at every back edge not in `unsafe_edges`, then takes the
    /// lock exclusively once no thread is inside a call site of
    /// `unsafe_calls`. The returned guard holds the lock until it is resumed
    /// or dropped.
    ///
    /// There is no timeout: a call in `unsafe_calls` that never returns stalls
    /// the update forever.
    pub fn evacuate(&self, unsafe_edges: &[u32], unsafe_calls: &[u32]) -> EvacuationGuard<'_> {
        let mut backoff = Backoff::new();
        while self
            .evacuating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }

        // An instrumented thread may act as updater; it gives up its own hold
        // for the duration and gets it back on resume.
        let saved = self.load_state();
        match saved.hold {
            Hold::Shared => self.lock.read_unlock(),
            Hold::Exclusive => {
                log_engine_error!("evacuate called from inside an atomic region");
                debug_assert!(false, "evacuate called from inside an atomic region");
                self.lock.write_unlock();
            }
            Hold::Released | Hold::None => {}
        }

        let mut park = vec![true; self.wait.len()];
        for &edge in unsafe_edges {
            if let Some(p) = park.get_mut(edge as usize) {
                *p = false;
            }
        }
        for (flag, park) in self.wait.iter().zip(park) {
            if park {
                flag.store(true, Ordering::Release);
            }
        }

        backoff.reset();
        let mut attempts = 0u64;
        loop {
            attempts += 1;
            self.lock.write_lock();
            if unsafe_calls.iter().all(|&call| self.counter(call) == 0) {
                break;
            }
            self.lock.write_unlock();
            backoff.snooze();
        }
        log_engine_debug!("Process quiescent", attempts = attempts);

        self.store_state(ThreadState {
            hold: Hold::Exclusive,
            ..saved
        });

        EvacuationGuard {
            coordinator: self,
            saved,
            _not_send: PhantomData,
        }
    }

    /// Clear all wait flags and release the exclusive lock.
    pub fn resume(&self, guard: EvacuationGuard<'_>) {
        debug_assert_eq!(guard.coordinator.id, self.id, "guard from another coordinator");
        drop(guard);
    }

    fn finish_evacuation(&self, saved: ThreadState) {
        self.clear_wait();
        if !self.evacuating.swap(false, Ordering::SeqCst) {
            log_engine_error!("resume without a matching evacuate");
            debug_assert!(false, "resume without a matching evacuate");
        }
        self.lock.write_unlock();

        match saved.hold {
            Hold::Shared => self.lock.read_lock(),
            Hold::Exclusive => self.lock.write_lock(),
            Hold::Released | Hold::None => {}
        }
        self.store_state(saved);
    }

    pub fn is_evacuating(&self) -> bool {
        self.evacuating.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Atomic regions
    // ------------------------------------------------------------------

    /// Run the calling thread alone until [`exit_atomic`](Self::exit_atomic).
    ///
    /// Every other thread is parked at its next back edge or blocking call.
    /// Inside the region the calling thread's blocking-call hooks do nothing.
    pub fn enter_atomic(&self) {
        let mut st = self.load_state();
        if st.hold == Hold::Exclusive {
            log_engine_debug!("Nested atomic region ignored");
            return;
        }

        self.atomic_requests.fetch_add(1, Ordering::SeqCst);
        if st.hold == Hold::Shared {
            self.lock.read_unlock();
        }
        self.lock.write_lock();
        // Parked threads stay parked on the lock itself from here on
        self.atomic_requests.fetch_sub(1, Ordering::SeqCst);

        st.atomic_from = st.hold;
        st.hold = Hold::Exclusive;
        self.store_state(st);
    }

    pub fn exit_atomic(&self) {
        let mut st = self.load_state();
        if st.hold != Hold::Exclusive {
            log_engine_debug!("exit_atomic outside an atomic region");
            return;
        }

        self.lock.write_unlock();
        st.hold = match st.atomic_from {
            Hold::Shared => {
                self.lock.read_lock();
                Hold::Shared
            }
            other => other,
        };
        st.atomic_from = Hold::None;
        self.store_state(st);
    }

    // ------------------------------------------------------------------
    // Fork
    // ------------------------------------------------------------------

    /// Rebuild coordinator state in a forked child.
    ///
    /// The child starts with no evacuation in flight, an unlocked lock and
    /// zeroed counters. The calling thread then re-takes whatever it held in
    /// the parent, including its own count on a blocking call it forked from.
    ///
    /// # Safety
    /// Call only in the child right after `fork`, before it spawns threads.
    pub unsafe fn reinit_after_fork(&self) {
        self.atomic_requests.store(0, Ordering::SeqCst);
        self.clear_wait();
        for counter in self.counters.iter() {
            counter.store(0, Ordering::SeqCst);
        }
        self.evacuating.store(false, Ordering::SeqCst);
        self.lock.reinit();

        let st = self.load_state();
        match st.hold {
            Hold::Shared => self.lock.read_lock(),
            Hold::Exclusive => self.lock.write_lock(),
            Hold::Released | Hold::None => {}
        }
        if let Some(call) = st.blocking_call {
            if let Some(counter) = self.counters.get(call as usize) {
                counter.store(1, Ordering::SeqCst);
            }
        }
    }

    /// The underlying lock. Diagnostic only.
    pub fn update_lock(&self) -> &UpdateLock {
        &self.lock
    }
}

/// Proof that the process is quiescent. Engine tables may be mutated while it
/// lives. Dropping it resumes the process.
#[must_use = "dropping the guard resumes the process immediately"]
pub struct EvacuationGuard<'a> {
    coordinator: &'a Coordinator,
    saved: ThreadState,
    // The exclusive hold must be released on the thread that took it
    _not_send: PhantomData<*const ()>,
}

impl EvacuationGuard<'_> {
    pub fn coordinator_id(&self) -> u64 {
        self.coordinator.id
    }

    pub fn resume(self) {
        drop(self);
    }
}

impl Drop for EvacuationGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.finish_evacuation(self.saved);
    }
}
