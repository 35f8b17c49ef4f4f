use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Quantum length in microseconds of virtual (CPU) time
    #[arg(long, default_value_t = 50_000)]
    quantum_usecs: i32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run CPU-bound workers round-robin and print their quantum counts
    Spin {
        /// Number of worker threads
        #[arg(long, default_value_t = 3)]
        workers: usize,

        /// Quanta each worker burns before finishing
        #[arg(long, default_value_t = 5)]
        quanta: u64,
    },
    /// Workers nap for their own id's worth of quanta and report the gap
    Sleepers,
    /// Ping-pong between main and one worker via block/resume
    Handoff {
        /// Number of round trips
        #[arg(long, default_value_t = 5)]
        rounds: u64,
    },
}

/// Room for the demo workers' results, indexed by thread id. Workers only
/// touch atomics: their 4096-byte stacks are no place for formatting.
const SLOTS: usize = 16;
static FINAL: [AtomicU64; SLOTS] = [const { AtomicU64::new(0) }; SLOTS];
static QUANTA_TARGET: AtomicU64 = AtomicU64::new(0);
static FINISHED: AtomicU64 = AtomicU64::new(0);
static HANDOFFS: AtomicU64 = AtomicU64::new(0);

/// Burn user-mode CPU until `done` holds; the quantum is virtual time, so
/// idling would stop the clock.
fn burn_until(done: impl Fn() -> bool) {
    let mut sink = 0u64;
    while !done() {
        for i in 0..10_000u64 {
            sink = sink.wrapping_add(i);
        }
        std::hint::black_box(sink);
    }
}

fn spin_worker() {
    let me = filament::tid().expect("worker is running");
    let target = QUANTA_TARGET.load(Relaxed);
    burn_until(|| filament::quantums(me).expect("worker is live") >= target);
    FINAL[me.val() as usize].store(filament::quantums(me).expect("worker is live"), Relaxed);
    FINISHED.fetch_add(1, Relaxed);
    // Returning terminates the worker.
}

fn nap_worker() {
    let me = filament::tid().expect("worker is running");
    let before = filament::total_quantums().expect("library is up");
    filament::sleep(me.val() as i32).expect("worker may sleep");
    let after = filament::total_quantums().expect("library is up");
    FINAL[me.val() as usize].store(after - before, Relaxed);
    FINISHED.fetch_add(1, Relaxed);
}

fn handoff_worker() {
    let me = filament::tid().expect("worker is running");
    loop {
        HANDOFFS.fetch_add(1, Relaxed);
        if filament::block(me).is_err() {
            return;
        }
    }
}

fn cmd_spin(workers: usize, quanta: u64) -> Result<()> {
    if workers == 0 || workers >= SLOTS {
        bail!("workers must be between 1 and {}", SLOTS - 1);
    }
    QUANTA_TARGET.store(quanta, Relaxed);

    let mut tids = Vec::with_capacity(workers);
    for _ in 0..workers {
        tids.push(filament::spawn(spin_worker)?);
    }
    info!("spawned {workers} spinners");

    // The workers never yield; they advance on timer preemption alone,
    // and main gets the processor back once all of them are gone.
    burn_until(|| FINISHED.load(Relaxed) == workers as u64);

    for tid in &tids {
        println!(
            "thread {tid}: {} quanta",
            FINAL[tid.val() as usize].load(Relaxed)
        );
    }
    println!("total: {} quanta", filament::total_quantums()?);
    Ok(())
}

fn cmd_sleepers() -> Result<()> {
    let t1 = filament::spawn(nap_worker)?;
    let t2 = filament::spawn(nap_worker)?;

    burn_until(|| FINISHED.load(Relaxed) == 2);

    for tid in [t1, t2] {
        println!(
            "thread {tid}: slept {} quanta, back after {}",
            tid.val(),
            FINAL[tid.val() as usize].load(Relaxed)
        );
    }
    Ok(())
}

fn cmd_handoff(rounds: u64) -> Result<()> {
    let worker = filament::spawn(handoff_worker)?;

    for round in 1..=rounds {
        burn_until(|| HANDOFFS.load(Relaxed) >= round);
        filament::resume(worker)?;
    }
    burn_until(|| HANDOFFS.load(Relaxed) > rounds);
    filament::terminate(worker)?;

    println!("completed {} handoffs", HANDOFFS.load(Relaxed));
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    filament::init(cli.quantum_usecs)?;
    info!("library up with a {}us quantum", cli.quantum_usecs);

    match cli.command {
        Commands::Spin { workers, quanta } => cmd_spin(workers, quanta)?,
        Commands::Sleepers => cmd_sleepers()?,
        Commands::Handoff { rounds } => cmd_handoff(rounds)?,
    }
    Ok(())
}
