use crate::error::ThreadError;

/// Upper bound on simultaneously live threads, the main thread included.
pub const MAX_THREADS: usize = 100;

/// Fixed per-thread stack size in bytes. Stacks never grow.
pub const STACK_SIZE: usize = 4096;

/// Validated library configuration, fixed at [`crate::init`] time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    quantum_usecs: i32,
}

impl Config {
    /// Checks that the quantum is a positive number of microseconds.
    pub fn new(quantum_usecs: i32) -> Result<Self, ThreadError> {
        if quantum_usecs <= 0 {
            return Err(ThreadError::QuantumNotPositive(quantum_usecs));
        }
        Ok(Self { quantum_usecs })
    }

    pub fn quantum_usecs(&self) -> i32 {
        self.quantum_usecs
    }
}
