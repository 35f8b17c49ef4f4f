//! The preemption driver: the process-wide scheduler cell, the virtual
//! interval timer, the SIGVTALRM handler, masked critical sections, and
//! the machinery that turns a scheduling [`Decision`] into a register
//! switch.
//!
//! Both halves of scheduling meet here. The timer handler and the
//! voluntary yields (`block` on self, `sleep`, `terminate` on self) call
//! [`yield_current`], which asks the scheduler for a [`Decision`] and then
//! carries it out with `filament-arch`.

use crate::config::Config;
use crate::error::{sys_fail, ThreadError};
use crate::sched::{Decision, Scheduler, SwitchCause};
use crate::tcb::Context;
use core::cell::UnsafeCell;
use nix::sys::signal::{
    sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};

const PREEMPT_SIGNAL: Signal = Signal::SIGVTALRM;

/// Process-wide scheduler slot. The library runs on a single OS thread by
/// construction, and every access happens with the preemption signal
/// masked (or inside its handler, where the kernel masks it), so plain
/// interior mutability is enough.
struct SchedCell(UnsafeCell<Option<Scheduler>>);

unsafe impl Sync for SchedCell {}

static SCHED: SchedCell = SchedCell(UnsafeCell::new(None));

fn cell() -> &'static mut Option<Scheduler> {
    unsafe { &mut *SCHED.0.get() }
}

/// Run `f` on the scheduler. The caller must hold a [`MaskGuard`].
pub(crate) fn with<R>(
    f: impl FnOnce(&mut Scheduler) -> Result<R, ThreadError>,
) -> Result<R, ThreadError> {
    match cell().as_mut() {
        Some(sched) => f(sched),
        None => Err(ThreadError::NotInitialized),
    }
}

/// Bring the library up: scheduler state first, then the signal handler,
/// then the timer, so a tick can never observe missing state.
pub(crate) fn install(config: Config) -> Result<(), ThreadError> {
    let slot = cell();
    if slot.is_some() {
        return Err(ThreadError::AlreadyInitialized);
    }
    *slot = Some(Scheduler::new(config));

    let action = SigAction::new(
        SigHandler::Handler(on_tick),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(PREEMPT_SIGNAL, &action) }
        .unwrap_or_else(|_| sys_fail("installing the preemption signal handler failed"));
    arm_timer(config.quantum_usecs());
    Ok(())
}

/// The preemption signal handler. The kernel blocks SIGVTALRM for the
/// duration, which gives this path the same protection as a [`MaskGuard`].
extern "C" fn on_tick(_signal: libc::c_int) {
    let Some(sched) = cell().as_mut() else {
        return;
    };
    let decision = sched.reschedule(SwitchCause::Preempt);
    perform(decision);
}

/// The voluntary-yield half of the driver: reschedule for `cause` and act
/// on the decision. Returns once this thread is resumed; never returns for
/// a thread that terminated itself.
pub(crate) fn yield_current(cause: SwitchCause) {
    let Some(sched) = cell().as_mut() else {
        return;
    };
    let decision = sched.reschedule(cause);
    perform(decision);
}

/// Carry out a scheduling decision: re-arm the timer for a full quantum
/// and move register state into the chosen thread. `Continue` and
/// self-switches (a thread re-selected in the tick it yielded) move
/// nothing.
fn perform(decision: Decision) {
    let Decision::Switch { from, to } = decision else {
        return;
    };
    let (from_ctx, to_ctx, quantum) = {
        let Some(sched) = cell().as_mut() else {
            return;
        };
        let from_ctx = from.and_then(|tid| sched.ctx_ptr(tid));
        let Some(to_ctx) = sched.ctx_ptr(to) else {
            return;
        };
        (from_ctx, to_ctx.cast_const(), sched.quantum_usecs())
    };
    arm_timer(quantum);
    match from_ctx {
        Some(f) if f.cast_const() == to_ctx => {}
        Some(f) => unsafe { switch_context(f, to_ctx) },
        None => unsafe { jump_context(to_ctx) },
    }
}

/// Switch from the running thread into `to`, capturing the current signal
/// mask alongside the registers. Returns when `from` is eventually
/// resumed, with its mask reinstated: a thread suspended inside a masked
/// critical section resumes still masked.
///
/// # Safety
///
/// Both pointers must refer to contexts of live, boxed TCBs; those
/// addresses are stable for as long as the threads exist.
unsafe fn switch_context(from: *mut Context, to: *const Context) {
    (*from).mask = current_mask();
    filament_arch::switch(&mut (*from).regs, &(*to).regs);
    let mask = (*from).mask;
    install_mask(&mask);
}

/// Resume `to` without saving anything; the current stack is abandoned.
/// Used only after the running TCB has been moved to the graveyard.
///
/// # Safety
///
/// Same requirements on `to` as [`switch_context`].
unsafe fn jump_context(to: *const Context) -> ! {
    // The target reinstates its own mask: a suspended thread does so when
    // its `switch_context` call resumes, a fresh one in the trampoline.
    filament_arch::jump(&(*to).regs)
}

/// First frame of every spawned thread. Runs the entry with preemption
/// unmasked, and terminates the thread if the entry returns without doing
/// so itself.
pub(crate) extern "C" fn trampoline() {
    // We arrive with the preemption signal still masked by whichever
    // critical section performed the switch; read our identity before
    // opening the door.
    let Some((me, entry)) = cell().as_ref().and_then(|s| s.running_thread()) else {
        sys_fail("thread started outside an initialized library");
    };
    unblock_preemption();
    if let Some(entry) = entry {
        entry();
    }
    let _ = crate::terminate(me);
    unreachable!("terminated thread kept running");
}

/// Critical section over scheduler state: blocks the preemption signal on
/// entry, and unblocks on drop only if this guard was the one that blocked
/// it. A context switch may abandon a guard's frame without running its
/// drop; the saved mask in [`Context`] keeps the discipline intact across
/// that.
pub(crate) struct MaskGuard {
    engaged: bool,
}

impl MaskGuard {
    pub(crate) fn enter() -> Self {
        let mut old = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&preempt_set()), Some(&mut old))
            .unwrap_or_else(|_| sys_fail("blocking the preemption signal failed"));
        Self {
            engaged: !old.contains(PREEMPT_SIGNAL),
        }
    }
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        if self.engaged {
            unblock_preemption();
        }
    }
}

fn preempt_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(PREEMPT_SIGNAL);
    set
}

fn unblock_preemption() {
    sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&preempt_set()), None)
        .unwrap_or_else(|_| sys_fail("unblocking the preemption signal failed"));
}

fn current_mask() -> SigSet {
    SigSet::thread_get_mask().unwrap_or_else(|_| sys_fail("reading the signal mask failed"))
}

fn install_mask(mask: &SigSet) {
    mask.thread_set_mask()
        .unwrap_or_else(|_| sys_fail("setting the signal mask failed"))
}

/// (Re-)arm the virtual interval timer with a full quantum for both the
/// first expiry and the repeating interval.
fn arm_timer(quantum_usecs: i32) {
    let usecs = i64::from(quantum_usecs);
    let period = libc::timeval {
        tv_sec: (usecs / 1_000_000) as libc::time_t,
        tv_usec: (usecs % 1_000_000) as libc::suseconds_t,
    };
    let timer = libc::itimerval {
        it_interval: period,
        it_value: period,
    };
    if unsafe { libc::setitimer(libc::ITIMER_VIRTUAL, &timer, std::ptr::null_mut()) } < 0 {
        sys_fail("arming the virtual interval timer failed");
    }
}
