//! Saved-register frames and the switch/jump primitives filament schedules
//! with.
//!
//! A [`Regs`] holds the callee-saved machine state of a suspended thread:
//! stack pointer, resume address, and the registers the platform ABI
//! requires a callee to preserve. Nothing else needs to be stored, since a
//! switch always happens at a call boundary where caller-saved registers
//! are dead.
//!
//! Two entry points leave the current thread:
//!
//! * [`switch`] stores the current execution point into `from` and loads
//!   `to`. It returns (much) later, when some other thread switches back
//!   into `from`.
//! * [`jump`] loads `to` without saving anything. Used when the outgoing
//!   context is being torn down and must never be resumed.
//!
//! Signal-mask handling is deliberately *not* here; the caller owns it
//! (see `filament::preempt`). This crate is pure register state.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::{switch, jump, Regs};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::{switch, jump, Regs};
    } else {
        compile_error!("filament-arch supports x86_64 and aarch64 only");
    }
}
