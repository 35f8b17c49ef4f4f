use crate::tcb::Tid;
use thiserror::Error;

/// Library errors: invalid arguments or state. The failing call reports the
/// error to standard error and mutates nothing.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ThreadError {
    #[error("quantum must be positive, got {0}")]
    QuantumNotPositive(i32),

    #[error("thread library is already initialized")]
    AlreadyInitialized,

    #[error("thread library is not initialized")]
    NotInitialized,

    #[error("thread table is full")]
    TableFull,

    #[error("no thread with id {0}")]
    NoSuchThread(Tid),

    #[error("the main thread cannot be blocked")]
    BlockMain,

    #[error("the main thread cannot sleep")]
    SleepMain,

    #[error("sleep length must be non-negative, got {0}")]
    NegativeSleep(i32),
}

/// System errors are unrecoverable: without a working signal, timer, or
/// allocation path the preemption machinery cannot be trusted. Report and
/// exit with status 1.
pub(crate) fn sys_fail(msg: &str) -> ! {
    eprintln!("system error: {msg}");
    std::process::exit(1);
}
