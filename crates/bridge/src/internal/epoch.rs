//! Epoch clock behind per-call budgets.
//!
//! Each scope that has a call budget owns one [`DeadlineClock`]. The clock
//! advances its engine's epoch on a fixed tick; a store whose deadline has
//! passed traps at the next epoch check inside guest code.

use std::{
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Sender, bounded, select, tick};
use wasmtime::Engine;

pub const EPOCH_TICK: Duration = Duration::from_millis(10);

/// Advances one engine's epoch every [`EPOCH_TICK`] until stopped.
pub struct DeadlineClock {
    halt: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DeadlineClock {
    pub fn start(engine: Engine, thread_name: String) -> std::io::Result<Self> {
        let (halt, halted) = bounded::<()>(0);
        let thread = thread::Builder::new().name(thread_name).spawn(move || {
            let ticks = tick(EPOCH_TICK);
            loop {
                select! {
                    recv(halted) -> _ => break,
                    recv(ticks) -> _ => engine.increment_epoch(),
                }
            }
        })?;

        Ok(Self {
            halt: Some(halt),
            thread: Some(thread),
        })
    }

    /// Stop ticking and wait for the clock thread. Idempotent.
    pub fn stop(&mut self) {
        // Disconnecting the halt channel wakes the clock thread.
        self.halt = None;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    pub const fn is_running(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for DeadlineClock {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Number of ticks that covers `budget`, never less than one.
pub fn ticks_for(budget: Duration) -> u64 {
    let ticks = budget.as_millis().div_ceil(EPOCH_TICK.as_millis());
    u64::try_from(ticks).unwrap_or(u64::MAX).max(1)
}
