//! Scheduler state and the operations that mutate it.
//!
//! Everything here is a pure state machine over the TCB table, the FIFO
//! ready queue, the blocked set, and the sleep countdown map. No signals
//! and no register switching happen in this module: [`Scheduler::reschedule`]
//! returns a [`Decision`] and the preemption driver carries it out. That
//! split keeps the whole scheduling discipline testable without ever
//! arming a timer.

use crate::config::{Config, MAX_THREADS};
use crate::error::{sys_fail, ThreadError};
use crate::tcb::{Context, Tcb, ThreadState, Tid};
use log::{debug, trace};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, VecDeque};

/// Why the running thread is giving up the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SwitchCause {
    /// The interval timer fired.
    Preempt,
    /// The running thread blocked itself.
    Block,
    /// The running thread went to sleep.
    Sleep,
    /// The running thread terminated; its TCB is already in the graveyard.
    Terminate,
}

/// What the preemption driver should do after a reschedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    /// The current thread keeps the processor; no register switch.
    Continue,
    /// Switch to `to`, saving the outgoing context into `from`.
    /// `from` is `None` when the outgoing thread no longer exists
    /// (self-termination): the driver jumps without saving.
    Switch { from: Option<Tid>, to: Tid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockOutcome {
    /// Target was already blocked (no-op) or was parked directly.
    Done,
    /// The caller blocked itself and must yield.
    MustYield,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TerminateOutcome {
    /// A non-running thread was destroyed in place.
    Done,
    /// The running thread terminated itself; its TCB waits in the
    /// graveyard and the caller must schedule a successor.
    WasRunning,
}

/// All live scheduler state. One instance exists per process, owned by the
/// cell in `preempt` and only ever touched with the preemption signal
/// masked.
pub(crate) struct Scheduler {
    config: Config,
    /// Live TCBs by id. Boxed so addresses stay stable across table churn;
    /// saved-context pointers outlive individual map operations.
    threads: BTreeMap<Tid, Box<Tcb>>,
    /// Free ids; a min-heap so the smallest id is reused first.
    free_ids: BinaryHeap<Reverse<u32>>,
    /// FIFO of threads eligible to run. The main thread never appears here.
    ready: VecDeque<Tid>,
    blocked: BTreeSet<Tid>,
    /// Remaining quanta per sleeping thread; ascending-id iteration keeps
    /// same-tick wakeups deterministic.
    sleeping: BTreeMap<Tid, u32>,
    running: Tid,
    total_quantums: u64,
    /// A self-terminated TCB parked here until execution has left its
    /// stack; dropped on the next tick.
    graveyard: Option<Box<Tcb>>,
}

impl Scheduler {
    pub(crate) fn new(config: Config) -> Self {
        let mut free_ids = BinaryHeap::with_capacity(MAX_THREADS);
        for id in 1..MAX_THREADS as u32 {
            free_ids.push(Reverse(id));
        }
        let mut threads = BTreeMap::new();
        threads.insert(Tid::MAIN, Tcb::main_thread());
        Self {
            config,
            threads,
            free_ids,
            // Pre-sized so wakeups and re-enqueues never allocate.
            ready: VecDeque::with_capacity(MAX_THREADS),
            blocked: BTreeSet::new(),
            sleeping: BTreeMap::new(),
            running: Tid::MAIN,
            total_quantums: 1,
            graveyard: None,
        }
    }

    pub(crate) fn quantum_usecs(&self) -> i32 {
        self.config.quantum_usecs()
    }

    pub(crate) fn running(&self) -> Tid {
        self.running
    }

    pub(crate) fn total_quantums(&self) -> u64 {
        self.total_quantums
    }

    pub(crate) fn quantums_of(&self, tid: Tid) -> Result<u64, ThreadError> {
        self.threads
            .get(&tid)
            .map(|t| t.quantums)
            .ok_or(ThreadError::NoSuchThread(tid))
    }

    /// Identity and entry point of the running thread, for the trampoline.
    pub(crate) fn running_thread(&self) -> Option<(Tid, Option<fn()>)> {
        self.threads.get(&self.running).map(|t| (t.id, t.entry))
    }

    pub(crate) fn ctx_ptr(&mut self, tid: Tid) -> Option<*mut Context> {
        self.threads
            .get_mut(&tid)
            .map(|t| &mut t.ctx as *mut Context)
    }

    /// Allocate the smallest free id and enqueue a fresh `Ready` thread.
    pub(crate) fn spawn(&mut self, entry: fn()) -> Result<Tid, ThreadError> {
        let Some(Reverse(raw)) = self.free_ids.pop() else {
            return Err(ThreadError::TableFull);
        };
        let id = Tid::new(raw);
        let tcb =
            Tcb::spawned(id, entry).unwrap_or_else(|_| sys_fail("thread stack allocation failed"));
        self.threads.insert(id, tcb);
        self.ready.push_back(id);
        debug!("spawned thread {id}");
        Ok(id)
    }

    /// Destroy `tid` (never the main thread; the caller handles that case)
    /// and recycle its id. A running thread's TCB is parked in the
    /// graveyard because we are still executing on its stack.
    pub(crate) fn terminate(&mut self, tid: Tid) -> Result<TerminateOutcome, ThreadError> {
        let tcb = self
            .threads
            .remove(&tid)
            .ok_or(ThreadError::NoSuchThread(tid))?;
        self.free_ids.push(Reverse(tid.val()));
        self.sleeping.remove(&tid);
        self.blocked.remove(&tid);
        self.ready.retain(|t| *t != tid);
        debug!("terminated thread {tid}");
        if tid == self.running {
            self.graveyard = Some(tcb);
            Ok(TerminateOutcome::WasRunning)
        } else {
            Ok(TerminateOutcome::Done)
        }
    }

    /// Move `tid` out of scheduling. Blocking the running thread is
    /// finished by `reschedule(Block)`, which records the blocked state
    /// exactly once.
    pub(crate) fn block(&mut self, tid: Tid) -> Result<BlockOutcome, ThreadError> {
        if tid == Tid::MAIN {
            return Err(ThreadError::BlockMain);
        }
        let tcb = self
            .threads
            .get_mut(&tid)
            .ok_or(ThreadError::NoSuchThread(tid))?;
        if tcb.state == ThreadState::Blocked {
            return Ok(BlockOutcome::Done);
        }
        if tid == self.running {
            return Ok(BlockOutcome::MustYield);
        }
        tcb.state = ThreadState::Blocked;
        self.blocked.insert(tid);
        self.ready.retain(|t| *t != tid);
        debug!("blocked thread {tid}");
        Ok(BlockOutcome::Done)
    }

    /// Undo a block. A thread that is still sleeping stays off the ready
    /// queue; the sleep-expiry path will enqueue it.
    pub(crate) fn resume(&mut self, tid: Tid) -> Result<(), ThreadError> {
        let tcb = self
            .threads
            .get_mut(&tid)
            .ok_or(ThreadError::NoSuchThread(tid))?;
        if tcb.state != ThreadState::Blocked {
            return Ok(());
        }
        tcb.state = ThreadState::Ready;
        self.blocked.remove(&tid);
        if !self.sleeping.contains_key(&tid) {
            self.ready.push_back(tid);
        }
        debug!("resumed thread {tid}");
        Ok(())
    }

    /// Record the running thread's sleep countdown. The caller follows up
    /// with `reschedule(Sleep)`, whose first tick already counts: a
    /// countdown of `n` makes the thread eligible again `n + 1` ticks from
    /// now.
    pub(crate) fn begin_sleep(&mut self, num_quantums: i32) -> Result<(), ThreadError> {
        if self.running == Tid::MAIN {
            return Err(ThreadError::SleepMain);
        }
        if num_quantums < 0 {
            return Err(ThreadError::NegativeSleep(num_quantums));
        }
        self.sleeping.insert(self.running, num_quantums as u32);
        debug!("thread {} sleeping for {num_quantums} quanta", self.running);
        Ok(())
    }

    /// One scheduling round: wake expired sleepers, account the tick, park
    /// the outgoing thread according to `cause`, and pick the next thread
    /// to run. Falls back to the main thread when the queue is empty and
    /// the outgoing thread voluntarily relinquished.
    pub(crate) fn reschedule(&mut self, cause: SwitchCause) -> Decision {
        if cause != SwitchCause::Terminate {
            // Safe to reap now: whatever stack the corpse owns is not the
            // one we are executing on.
            self.graveyard = None;
        }
        self.wake_sleepers();
        self.total_quantums += 1;

        match self.ready.pop_front() {
            None => {
                if cause == SwitchCause::Preempt {
                    // Sole runnable thread; it keeps the processor.
                    self.bump(self.running);
                    return Decision::Continue;
                }
                // Voluntary relinquish with nobody ready: the main thread
                // takes over. Main can never be blocked or sleeping, so it
                // is always a valid target.
                let prev = self.running;
                debug_assert!(prev != Tid::MAIN || cause == SwitchCause::Terminate);
                self.park(prev, cause);
                self.make_running(Tid::MAIN);
                trace!("ready queue empty, falling back to main");
                Decision::Switch {
                    from: (cause != SwitchCause::Terminate).then_some(prev),
                    to: Tid::MAIN,
                }
            }
            Some(next) => {
                let prev = self.running;
                self.park(prev, cause);
                self.make_running(next);
                trace!("switching {prev} -> {next}");
                Decision::Switch {
                    from: (cause != SwitchCause::Terminate).then_some(prev),
                    to: next,
                }
            }
        }
    }

    /// Park the outgoing thread according to why it stopped running. A
    /// preempted thread goes back to the queue tail, except the main
    /// thread, which idles outside the queue until the empty-queue
    /// fallback selects it.
    fn park(&mut self, prev: Tid, cause: SwitchCause) {
        match cause {
            SwitchCause::Preempt => {
                if let Some(tcb) = self.threads.get_mut(&prev) {
                    tcb.state = ThreadState::Ready;
                }
                if prev != Tid::MAIN {
                    self.ready.push_back(prev);
                }
            }
            SwitchCause::Block => {
                if let Some(tcb) = self.threads.get_mut(&prev) {
                    tcb.state = ThreadState::Blocked;
                }
                self.blocked.insert(prev);
            }
            SwitchCause::Sleep => {
                // Stays `Ready` but off the queue; the countdown in the
                // sleep map gates its return.
                if let Some(tcb) = self.threads.get_mut(&prev) {
                    tcb.state = ThreadState::Ready;
                }
            }
            SwitchCause::Terminate => {}
        }
    }

    fn make_running(&mut self, tid: Tid) {
        let tcb = self.threads.get_mut(&tid).expect("next thread is live");
        tcb.state = ThreadState::Running;
        tcb.quantums += 1;
        self.running = tid;
    }

    fn bump(&mut self, tid: Tid) {
        if let Some(tcb) = self.threads.get_mut(&tid) {
            tcb.quantums += 1;
        }
    }

    /// Entries already at zero wake up (unless blocked) and leave the map;
    /// everyone else counts down one. Waking at zero rather than after the
    /// decrement gives `sleep(n)` its `n + 1`-tick eligibility bound.
    fn wake_sleepers(&mut self) {
        let expired: Vec<Tid> = self
            .sleeping
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(t, _)| *t)
            .collect();
        for tid in expired {
            self.sleeping.remove(&tid);
            if let Some(tcb) = self.threads.get_mut(&tid) {
                if tcb.state != ThreadState::Blocked {
                    tcb.state = ThreadState::Ready;
                    self.ready.push_back(tid);
                    trace!("thread {tid} woke up");
                }
            }
        }
        for n in self.sleeping.values_mut() {
            *n -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn noop() {}

    fn sched() -> Scheduler {
        Scheduler::new(Config::new(100_000).unwrap())
    }

    /// Drive one preemption tick, applying the decision's state effects
    /// (there are none beyond what `reschedule` already did).
    fn tick(s: &mut Scheduler) -> Decision {
        s.reschedule(SwitchCause::Preempt)
    }

    #[test]
    fn fresh_library_runs_main_in_its_first_quantum() {
        let s = sched();
        assert_eq!(s.running(), Tid::MAIN);
        assert_eq!(s.total_quantums(), 1);
        assert_eq!(s.quantums_of(Tid::MAIN), Ok(1));
    }

    #[test]
    fn spawn_allocates_ascending_ids() {
        let mut s = sched();
        assert_eq!(s.spawn(noop), Ok(Tid::new(1)));
        assert_eq!(s.spawn(noop), Ok(Tid::new(2)));
        assert_eq!(s.spawn(noop), Ok(Tid::new(3)));
    }

    #[test]
    fn terminated_id_is_reused_smallest_first() {
        let mut s = sched();
        for _ in 0..3 {
            s.spawn(noop).unwrap();
        }
        s.terminate(Tid::new(2)).unwrap();
        assert_eq!(s.spawn(noop), Ok(Tid::new(2)));

        s.terminate(Tid::new(3)).unwrap();
        s.terminate(Tid::new(1)).unwrap();
        assert_eq!(s.spawn(noop), Ok(Tid::new(1)));
        assert_eq!(s.spawn(noop), Ok(Tid::new(3)));
    }

    #[test]
    fn table_fills_at_max_threads() {
        let mut s = sched();
        for expected in 1..MAX_THREADS as u32 {
            assert_eq!(s.spawn(noop), Ok(Tid::new(expected)));
        }
        assert_eq!(s.spawn(noop), Err(ThreadError::TableFull));
    }

    #[test]
    fn lone_main_keeps_the_processor_on_preempt() {
        let mut s = sched();
        assert_eq!(tick(&mut s), Decision::Continue);
        assert_eq!(s.quantums_of(Tid::MAIN), Ok(2));
        assert_eq!(s.total_quantums(), 2);
    }

    #[test]
    fn round_robin_is_fifo_and_skips_main() {
        let mut s = sched();
        let t1 = s.spawn(noop).unwrap();
        let t2 = s.spawn(noop).unwrap();

        // Main is preempted: it idles outside the queue, t1 runs.
        assert_eq!(
            tick(&mut s),
            Decision::Switch {
                from: Some(Tid::MAIN),
                to: t1
            }
        );
        assert!(!s.ready.contains(&Tid::MAIN));

        // t1 and t2 alternate; each tick appends the outgoing thread.
        assert_eq!(tick(&mut s), Decision::Switch { from: Some(t1), to: t2 });
        assert_eq!(tick(&mut s), Decision::Switch { from: Some(t2), to: t1 });

        // Fairness: after everyone ran, counts differ by at most one.
        let q1 = s.quantums_of(t1).unwrap();
        let q2 = s.quantums_of(t2).unwrap();
        assert!(q1.abs_diff(q2) <= 1);
        assert_eq!(
            s.total_quantums(),
            s.quantums_of(Tid::MAIN).unwrap() + q1 + q2
        );
    }

    #[test]
    fn block_ready_thread_leaves_queue_resume_appends_at_tail() {
        let mut s = sched();
        let t1 = s.spawn(noop).unwrap();
        let t2 = s.spawn(noop).unwrap();

        assert_eq!(s.block(t1), Ok(BlockOutcome::Done));
        assert!(!s.ready.contains(&t1));
        assert!(s.blocked.contains(&t1));

        s.resume(t1).unwrap();
        assert_eq!(s.ready, [t2, t1]);
    }

    #[test]
    fn block_is_idempotent() {
        let mut s = sched();
        let t1 = s.spawn(noop).unwrap();
        s.block(t1).unwrap();
        assert_eq!(s.block(t1), Ok(BlockOutcome::Done));
        assert_eq!(s.threads[&t1].state, ThreadState::Blocked);
        assert!(s.blocked.contains(&t1));
    }

    #[test]
    fn resume_on_non_blocked_is_a_no_op() {
        let mut s = sched();
        let t1 = s.spawn(noop).unwrap();
        s.resume(t1).unwrap();
        assert_eq!(s.ready, [t1]);
        assert_eq!(s.threads[&t1].state, ThreadState::Ready);
    }

    #[test]
    fn blocking_the_running_thread_yields() {
        let mut s = sched();
        let t1 = s.spawn(noop).unwrap();
        let t2 = s.spawn(noop).unwrap();
        tick(&mut s); // t1 running

        assert_eq!(s.block(t1), Ok(BlockOutcome::MustYield));
        let d = s.reschedule(SwitchCause::Block);
        assert_eq!(d, Decision::Switch { from: Some(t1), to: t2 });
        assert_eq!(s.threads[&t1].state, ThreadState::Blocked);
        assert!(s.blocked.contains(&t1));
    }

    #[test]
    fn blocking_the_last_runnable_thread_falls_back_to_main() {
        let mut s = sched();
        let t1 = s.spawn(noop).unwrap();
        tick(&mut s); // t1 running, main idle

        assert_eq!(s.block(t1), Ok(BlockOutcome::MustYield));
        let d = s.reschedule(SwitchCause::Block);
        assert_eq!(
            d,
            Decision::Switch {
                from: Some(t1),
                to: Tid::MAIN
            }
        );
        assert_eq!(s.threads[&Tid::MAIN].state, ThreadState::Running);
    }

    #[test]
    fn errors_reject_bad_arguments_without_mutating() {
        let mut s = sched();
        assert_eq!(s.block(Tid::MAIN), Err(ThreadError::BlockMain));
        assert_eq!(
            s.block(Tid::new(42)),
            Err(ThreadError::NoSuchThread(Tid::new(42)))
        );
        assert_eq!(
            s.resume(Tid::new(42)),
            Err(ThreadError::NoSuchThread(Tid::new(42)))
        );
        assert_eq!(s.begin_sleep(1), Err(ThreadError::SleepMain));
        assert_eq!(s.quantums_of(Tid::new(7)), Err(ThreadError::NoSuchThread(Tid::new(7))));
        assert_eq!(s.total_quantums(), 1);
    }

    #[test]
    fn sleeper_becomes_eligible_n_plus_one_ticks_later() {
        let mut s = sched();
        let t1 = s.spawn(noop).unwrap();
        tick(&mut s); // t1 running

        s.begin_sleep(2).unwrap();
        // The sleep's own yield is the first of the n + 1 ticks.
        let d = s.reschedule(SwitchCause::Sleep);
        assert_eq!(
            d,
            Decision::Switch {
                from: Some(t1),
                to: Tid::MAIN
            }
        );
        assert_eq!(s.sleeping[&t1], 1);

        assert_eq!(tick(&mut s), Decision::Continue); // countdown 1 -> 0
        assert_eq!(s.sleeping[&t1], 0);
        assert!(!s.ready.contains(&t1));

        // Countdown at zero: t1 wakes on this tick and is selected.
        assert_eq!(
            tick(&mut s),
            Decision::Switch {
                from: Some(Tid::MAIN),
                to: t1
            }
        );
        assert!(!s.sleeping.contains_key(&t1));
    }

    #[test]
    fn sleep_zero_is_a_yield_that_can_reselect_the_sleeper() {
        let mut s = sched();
        let t1 = s.spawn(noop).unwrap();
        tick(&mut s); // t1 running

        s.begin_sleep(0).unwrap();
        let d = s.reschedule(SwitchCause::Sleep);
        // Woken by the same tick and picked right back up.
        assert_eq!(d, Decision::Switch { from: Some(t1), to: t1 });
        assert!(!s.sleeping.contains_key(&t1));
        assert_eq!(s.threads[&t1].state, ThreadState::Running);
    }

    #[test]
    fn negative_sleep_is_rejected() {
        let mut s = sched();
        s.spawn(noop).unwrap();
        tick(&mut s); // t1 running
        assert_eq!(s.begin_sleep(-1), Err(ThreadError::NegativeSleep(-1)));
        assert!(s.sleeping.is_empty());
    }

    #[test]
    fn resume_while_sleeping_waits_for_expiry() {
        let mut s = sched();
        let t1 = s.spawn(noop).unwrap();
        let _t2 = s.spawn(noop).unwrap();
        tick(&mut s); // t1 running

        s.begin_sleep(3).unwrap();
        s.reschedule(SwitchCause::Sleep); // t2 running
        s.block(t1).unwrap();
        s.resume(t1).unwrap();

        // Resumed but still sleeping: stays off the queue until expiry.
        assert_eq!(s.threads[&t1].state, ThreadState::Ready);
        assert!(!s.ready.contains(&t1));
        assert!(s.sleeping.contains_key(&t1));

        while s.sleeping.contains_key(&t1) {
            tick(&mut s);
        }
        assert!(s.ready.contains(&t1) || s.running() == t1);
    }

    #[test]
    fn blocked_sleeper_needs_resume_after_expiry() {
        let mut s = sched();
        let t1 = s.spawn(noop).unwrap();
        let _t2 = s.spawn(noop).unwrap();
        tick(&mut s); // t1 running

        s.begin_sleep(1).unwrap();
        s.reschedule(SwitchCause::Sleep); // t2 running
        s.block(t1).unwrap();

        // Let the countdown run out while blocked: the entry is consumed
        // but t1 must not become ready.
        for _ in 0..4 {
            tick(&mut s);
        }
        assert!(!s.sleeping.contains_key(&t1));
        assert!(!s.ready.contains(&t1));
        assert_eq!(s.threads[&t1].state, ThreadState::Blocked);

        s.resume(t1).unwrap();
        assert!(s.ready.contains(&t1));
    }

    #[test]
    fn self_terminate_with_successor_schedules_it() {
        let mut s = sched();
        let t1 = s.spawn(noop).unwrap();
        let t2 = s.spawn(noop).unwrap();
        tick(&mut s); // t1 running

        assert_eq!(s.terminate(t1), Ok(TerminateOutcome::WasRunning));
        let d = s.reschedule(SwitchCause::Terminate);
        assert_eq!(d, Decision::Switch { from: None, to: t2 });
        assert!(s.graveyard.is_some());
        assert!(!s.threads.contains_key(&t1));

        // The corpse is reaped on the next tick, off its stack.
        tick(&mut s);
        assert!(s.graveyard.is_none());
    }

    #[test]
    fn self_terminate_with_empty_queue_falls_back_to_main() {
        let mut s = sched();
        let t1 = s.spawn(noop).unwrap();
        tick(&mut s); // t1 running

        let main_q = s.quantums_of(Tid::MAIN).unwrap();
        assert_eq!(s.terminate(t1), Ok(TerminateOutcome::WasRunning));
        let d = s.reschedule(SwitchCause::Terminate);
        assert_eq!(
            d,
            Decision::Switch {
                from: None,
                to: Tid::MAIN
            }
        );
        assert_eq!(s.running(), Tid::MAIN);
        assert_eq!(s.quantums_of(Tid::MAIN), Ok(main_q + 1));
    }

    #[test]
    fn terminate_other_cleans_every_collection() {
        let mut s = sched();
        let t1 = s.spawn(noop).unwrap();
        let _t2 = s.spawn(noop).unwrap();
        tick(&mut s); // t1 running
        s.begin_sleep(5).unwrap();
        s.reschedule(SwitchCause::Sleep); // t2 running, t1 sleeping
        s.block(t1).unwrap();

        s.terminate(t1).unwrap();
        assert!(!s.threads.contains_key(&t1));
        assert!(!s.blocked.contains(&t1));
        assert!(!s.sleeping.contains_key(&t1));
        assert!(!s.ready.contains(&t1));
        assert!(s.graveyard.is_none());
    }

    // Property tests: arbitrary operation sequences preserve the scheduler
    // invariants.

    #[derive(Debug, Clone)]
    enum Op {
        Spawn,
        Terminate(u32),
        Block(u32),
        Resume(u32),
        Sleep(i32),
        Tick,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Spawn),
            2 => (0u32..12).prop_map(Op::Terminate),
            2 => (0u32..12).prop_map(Op::Block),
            2 => (0u32..12).prop_map(Op::Resume),
            1 => (0i32..4).prop_map(Op::Sleep),
            4 => Just(Op::Tick),
        ]
    }

    fn check_invariants(s: &Scheduler, dead_quantums: u64) {
        // Exactly one running thread, and it is the one on record.
        let running: Vec<Tid> = s
            .threads
            .values()
            .filter(|t| t.state == ThreadState::Running)
            .map(|t| t.id)
            .collect();
        assert_eq!(running, [s.running]);

        // Ready and blocked are disjoint; main and the running thread
        // never queue; no duplicates.
        let ready_set: BTreeSet<Tid> = s.ready.iter().copied().collect();
        assert_eq!(ready_set.len(), s.ready.len());
        assert!(!ready_set.contains(&Tid::MAIN));
        assert!(!ready_set.contains(&s.running));
        for tid in &ready_set {
            assert!(s.threads.contains_key(tid));
            assert!(!s.blocked.contains(tid));
        }
        for tid in &s.blocked {
            assert_eq!(s.threads[tid].state, ThreadState::Blocked);
            assert!(!ready_set.contains(tid));
        }

        // Sleeping threads stay off the ready queue.
        for tid in s.sleeping.keys() {
            assert!(s.threads.contains_key(tid));
            assert!(!ready_set.contains(tid));
        }

        // Live ids and free ids partition the id space.
        let live: BTreeSet<u32> = s.threads.keys().map(|t| t.val()).collect();
        let free: BTreeSet<u32> = s.free_ids.iter().map(|Reverse(id)| *id).collect();
        assert!(live.is_disjoint(&free));
        let mut all = live.clone();
        all.extend(&free);
        assert_eq!(all, (0..MAX_THREADS as u32).collect::<BTreeSet<u32>>());

        // Quantum accounting: the global counter equals everything handed
        // out, to the living and the dead alike.
        let live_sum: u64 = s.threads.values().map(|t| t.quantums).sum();
        assert_eq!(s.total_quantums, live_sum + dead_quantums);
    }

    proptest! {
        #[test]
        fn invariants_hold_under_arbitrary_op_sequences(
            ops in proptest::collection::vec(op_strategy(), 1..150)
        ) {
            let mut s = sched();
            let mut dead_quantums = 0u64;

            for op in ops {
                match op {
                    Op::Spawn => {
                        // Smallest-free-id allocation.
                        let expected = (0..MAX_THREADS as u32)
                            .map(Tid::new)
                            .find(|t| !s.threads.contains_key(t));
                        match s.spawn(noop) {
                            Ok(id) => prop_assert_eq!(Some(id), expected),
                            Err(ThreadError::TableFull) => {
                                prop_assert_eq!(expected, None)
                            }
                            Err(e) => prop_assert!(false, "unexpected {}", e),
                        }
                    }
                    Op::Terminate(raw) => {
                        let tid = Tid::new(raw);
                        if tid == Tid::MAIN {
                            continue; // would exit the process
                        }
                        let q = s.quantums_of(tid).ok();
                        if let Ok(outcome) = s.terminate(tid) {
                            dead_quantums += q.unwrap_or(0);
                            if outcome == TerminateOutcome::WasRunning {
                                s.reschedule(SwitchCause::Terminate);
                            }
                        }
                    }
                    Op::Block(raw) => {
                        if let Ok(BlockOutcome::MustYield) = s.block(Tid::new(raw)) {
                            s.reschedule(SwitchCause::Block);
                        }
                    }
                    Op::Resume(raw) => {
                        let _ = s.resume(Tid::new(raw));
                    }
                    Op::Sleep(n) => {
                        if s.begin_sleep(n).is_ok() {
                            s.reschedule(SwitchCause::Sleep);
                        }
                    }
                    Op::Tick => {
                        s.reschedule(SwitchCause::Preempt);
                    }
                }
                check_invariants(&s, dead_quantums);
            }
        }
    }
}
