//! Preemptive user-level threads multiplexed on one OS thread.
//!
//! The library schedules up to [`MAX_THREADS`] threads round-robin over
//! the single OS execution context of the calling process. Each thread
//! owns a fixed [`STACK_SIZE`]-byte stack and a saved register context;
//! a virtual-time interval timer (SIGVTALRM) preempts the running thread
//! at the end of each quantum, and blocking, sleeping, and termination
//! yield the processor voluntarily through the same path.
//!
//! [`init`] must be called exactly once, from the thread that becomes
//! thread 0 (the main thread). Spawned threads start at a plain `fn()`
//! entry; a thread whose entry returns is terminated as if it had called
//! [`terminate`] on itself. Terminating the main thread ends the process.
//!
//! All scheduler state is process-global and mutated only with the
//! preemption signal masked. The library is single-OS-thread by
//! construction: calling into it from more than one OS thread is outside
//! its contract, as is re-initializing it.
//!
//! Failing calls print `thread library error: ...` to standard error and
//! return the error; failures of the host facilities the scheduler cannot
//! live without (signal handler, signal mask, timer, stack allocation)
//! print `system error: ...` and end the process with status 1.

mod config;
mod error;
mod preempt;
mod sched;
mod tcb;

pub use config::{MAX_THREADS, STACK_SIZE};
pub use error::ThreadError;
pub use tcb::Tid;

use config::Config;
use preempt::MaskGuard;
use sched::{BlockOutcome, SwitchCause, TerminateOutcome};

/// Initialize the library and start preemption with a quantum of
/// `quantum_usecs` microseconds of virtual (CPU) time.
///
/// The calling context becomes thread 0, already in its first quantum:
/// immediately after `init`, [`total_quantums`] and [`quantums`] for
/// thread 0 both report 1.
pub fn init(quantum_usecs: i32) -> Result<(), ThreadError> {
    report((|| {
        let config = Config::new(quantum_usecs)?;
        let _mask = MaskGuard::enter();
        preempt::install(config)
    })())
}

/// Create a thread that will run `entry`, at the tail of the ready queue.
/// Returns the new thread's id: the smallest id not currently in use.
pub fn spawn(entry: fn()) -> Result<Tid, ThreadError> {
    report((|| {
        let _mask = MaskGuard::enter();
        preempt::with(|s| s.spawn(entry))
    })())
}

/// Destroy `tid`, releasing its stack and recycling its id.
///
/// Terminating the main thread ([`Tid::MAIN`]) ends the process with
/// status 0 and does not return. A thread terminating itself does not
/// return either: the next ready thread (or the main thread, if none) is
/// scheduled in its place.
pub fn terminate(tid: Tid) -> Result<(), ThreadError> {
    report((|| {
        let _mask = MaskGuard::enter();
        if tid == Tid::MAIN {
            // Validates that the library is up; past this point the
            // process is ending and the OS reclaims every stack.
            preempt::with(|_| Ok(()))?;
            std::process::exit(0);
        }
        match preempt::with(|s| s.terminate(tid))? {
            TerminateOutcome::Done => Ok(()),
            TerminateOutcome::WasRunning => {
                preempt::yield_current(SwitchCause::Terminate);
                unreachable!("terminated thread kept running");
            }
        }
    })())
}

/// Move `tid` out of scheduling until [`resume`]d. Blocking an already
/// blocked thread is a no-op; blocking the running thread yields
/// immediately and returns only after a later `resume`. The main thread
/// cannot be blocked.
pub fn block(tid: Tid) -> Result<(), ThreadError> {
    report((|| {
        let _mask = MaskGuard::enter();
        match preempt::with(|s| s.block(tid))? {
            BlockOutcome::Done => Ok(()),
            BlockOutcome::MustYield => {
                preempt::yield_current(SwitchCause::Block);
                // Resumed by a later `resume` call.
                Ok(())
            }
        }
    })())
}

/// Undo a [`block`]. A thread that is not blocked is left untouched; a
/// thread that is still mid-[`sleep`] becomes eligible again only when its
/// countdown expires.
pub fn resume(tid: Tid) -> Result<(), ThreadError> {
    report((|| {
        let _mask = MaskGuard::enter();
        preempt::with(|s| s.resume(tid))
    })())
}

/// Put the calling thread to sleep for `num_quantums` quanta. The calling
/// thread stays ready but leaves the queue; it becomes eligible again
/// `num_quantums + 1` ticks from now (so `sleep(0)` is a plain yield).
/// The main thread cannot sleep.
pub fn sleep(num_quantums: i32) -> Result<(), ThreadError> {
    report((|| {
        let _mask = MaskGuard::enter();
        preempt::with(|s| s.begin_sleep(num_quantums))?;
        preempt::yield_current(SwitchCause::Sleep);
        Ok(())
    })())
}

/// Id of the calling thread.
pub fn tid() -> Result<Tid, ThreadError> {
    report((|| {
        let _mask = MaskGuard::enter();
        preempt::with(|s| Ok(s.running()))
    })())
}

/// Total quanta handed out since [`init`], across all threads that ever
/// ran. Starts at 1 (the main thread's first quantum).
pub fn total_quantums() -> Result<u64, ThreadError> {
    report((|| {
        let _mask = MaskGuard::enter();
        preempt::with(|s| Ok(s.total_quantums()))
    })())
}

/// Number of quanta `tid` has been running, the current one included if it
/// is running now.
pub fn quantums(tid: Tid) -> Result<u64, ThreadError> {
    report((|| {
        let _mask = MaskGuard::enter();
        preempt::with(|s| s.quantums_of(tid))
    })())
}

/// Library errors surface both on stderr and as the returned `Err`.
fn report<T>(result: Result<T, ThreadError>) -> Result<T, ThreadError> {
    if let Err(err) = &result {
        eprintln!("thread library error: {err}");
    }
    result
}
