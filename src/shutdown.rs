//! Run-wide cancellation and the drain/terminate state machine.
//!
//! There is exactly one [`ShutdownSignal`] per run. Every stage holds a
//! reference to it (never a copy of its value) and re-reads it each time it
//! wakes from a receive, a send or a pause.

use crate::monitor::ChannelProbe;
use crate::stats::PipelineStats;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    /// The reader is still producing pages
    Running = 0,
    /// The reader is done; workers empty their channels
    Draining = 1,
    /// No new work may start
    Terminated = 2,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Phase::Running,
            1 => Phase::Draining,
            _ => Phase::Terminated,
        }
    }
}

#[derive(Debug, Default)]
pub struct ShutdownSignal {
    phase: AtomicU8,
    forced: AtomicBool,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Moves Running to Draining; later phases are left alone.
    pub fn begin_draining(&self) {
        let _ = self.phase.compare_exchange(
            Phase::Running as u8,
            Phase::Draining as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn terminate(&self, forced: bool) {
        if forced {
            self.forced.store(true, Ordering::SeqCst);
        }
        self.phase.store(Phase::Terminated as u8, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.phase() == Phase::Terminated
    }

    pub fn was_forced(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }

    /// Sleeps for `total` in `slice` steps; returns false if termination cut it short.
    pub fn pause(&self, total: Duration, slice: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.is_terminated() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(slice.min(deadline - now));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub forced: bool,
    pub drain_time: Duration,
}

/// Watches the run and decides when it is over.
pub struct ShutdownCoordinator<'a> {
    signal: &'a ShutdownSignal,
    stats: &'a PipelineStats,
    probe: &'a ChannelProbe,
    drain_timeout: Duration,
    poll_interval: Duration,
}

impl<'a> ShutdownCoordinator<'a> {
    pub fn new(
        signal: &'a ShutdownSignal,
        stats: &'a PipelineStats,
        probe: &'a ChannelProbe,
        drain_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            signal,
            stats,
            probe,
            drain_timeout,
            poll_interval,
        }
    }

    fn drained(&self) -> bool {
        self.stats.is_idle() && self.probe.snapshot().is_empty()
    }

    /// Blocks until the run reaches Terminated and reports how it got there.
    pub fn run(&self) -> DrainReport {
        while self.signal.phase() == Phase::Running {
            thread::sleep(self.poll_interval);
        }

        let started = Instant::now();
        info!("Source exhausted, draining in-flight work");

        let forced = loop {
            if self.signal.is_terminated() {
                break self.signal.was_forced();
            }
            if self.drained() {
                break false;
            }
            if started.elapsed() >= self.drain_timeout {
                let depths = self.probe.snapshot();
                warn!(
                    timeout_secs = self.drain_timeout.as_secs_f64(),
                    articles = depths.articles,
                    images = depths.images,
                    pending_images = self.stats.pending_images.get(),
                    "Drain timed out, forcing termination"
                );
                break true;
            }
            thread::sleep(self.poll_interval);
        };

        self.signal.terminate(forced);
        let drain_time = started.elapsed();
        info!(forced, drain_secs = drain_time.as_secs_f64(), "Pipeline terminated");
        DrainReport { forced, drain_time }
    }
}
