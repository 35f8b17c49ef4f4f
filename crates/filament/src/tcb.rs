use crate::config::STACK_SIZE;
use core::fmt;
use filament_arch::Regs;
use nix::sys::signal::SigSet;

/// Thread identifier. Id 0 is the main thread; ids of terminated threads
/// are reused, smallest first.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Tid(u32);

impl Tid {
    /// The thread that called [`crate::init`]. It owns no allocated stack
    /// and terminating it ends the process.
    pub const MAIN: Tid = Tid(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn val(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked,
}

/// Saved machine context of a suspended thread: the callee-saved register
/// frame plus the signal mask it was captured under. Restoring the context
/// restores both, so a thread suspended mid-critical-section resumes with
/// the preemption signal still masked.
pub struct Context {
    pub(crate) regs: Regs,
    pub(crate) mask: SigSet,
}

impl Context {
    pub(crate) fn empty() -> Self {
        Self {
            regs: Regs::zeroed(),
            mask: SigSet::empty(),
        }
    }

    /// Initial context of a spawned thread: first resumption enters the
    /// trampoline at the top of `stack` with an empty signal mask (the
    /// trampoline unmasks preemption itself before running the entry).
    fn for_stack(stack: &mut Stack) -> Self {
        Self {
            regs: Regs::with_entry(stack.as_mut_slice(), crate::preempt::trampoline),
            mask: SigSet::empty(),
        }
    }
}

/// Fixed-size stack buffer, exclusively owned by one TCB for its entire
/// lifetime.
pub struct Stack(Box<[u8]>);

impl Stack {
    /// Fallible allocation: out-of-memory is reported as the allocation
    /// failing rather than aborting the process, so the caller can route it
    /// through the system-error path.
    fn alloc() -> Result<Self, StackAllocError> {
        let mut buf: Vec<u8> = Vec::new();
        buf.try_reserve_exact(STACK_SIZE)
            .map_err(|_| StackAllocError)?;
        buf.resize(STACK_SIZE, 0);
        Ok(Self(buf.into_boxed_slice()))
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

#[derive(Debug)]
pub struct StackAllocError;

/// Per-thread record: identity, state, quantum count, owned stack, and the
/// saved context used to resume it.
pub struct Tcb {
    pub id: Tid,
    pub state: ThreadState,
    /// Number of quanta this thread has been running; incremented each time
    /// it becomes `Running`.
    pub quantums: u64,
    pub entry: Option<fn()>,
    pub ctx: Context,
    // Held only for ownership; entered through `ctx`. `None` for the main
    // thread, which runs on the process stack.
    _stack: Option<Stack>,
}

impl Tcb {
    /// The main thread's TCB: already running when the library comes up,
    /// with its first quantum under way. Its context is filled in by the
    /// first switch away from it.
    pub fn main_thread() -> Box<Self> {
        Box::new(Self {
            id: Tid::MAIN,
            state: ThreadState::Running,
            quantums: 1,
            entry: None,
            ctx: Context::empty(),
            _stack: None,
        })
    }

    /// A freshly spawned thread: `Ready`, zero quanta so far, its context
    /// aimed at the trampoline on its own stack.
    pub fn spawned(id: Tid, entry: fn()) -> Result<Box<Self>, StackAllocError> {
        let mut stack = Stack::alloc()?;
        let ctx = Context::for_stack(&mut stack);
        Ok(Box::new(Self {
            id,
            state: ThreadState::Ready,
            quantums: 0,
            entry: Some(entry),
            ctx,
            _stack: Some(stack),
        }))
    }
}
