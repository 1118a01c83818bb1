//! Elapsed-time counters driven by the match tick loop.
//!
//! All match timeouts (lobby grace, auto start, stage loading, auto return,
//! per-player disqualification) share this one abstraction. Timers are
//! advanced once per tick with the tick delta, so the state machine can be
//! simulated in tests without touching the wall clock.

/// A stopwatch-like counter. Stopped with zero elapsed time by default.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    running: bool,
    elapsed: f32,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or resume) counting without clearing elapsed time.
    pub fn start(&mut self) {
        self.running = true;
    }

    /// Stop counting and clear elapsed time.
    pub fn reset(&mut self) {
        self.running = false;
        self.elapsed = 0.0;
    }

    /// Clear elapsed time and start counting.
    pub fn restart(&mut self) {
        self.elapsed = 0.0;
        self.running = true;
    }

    /// Advance the timer by one tick delta. No-op while stopped.
    pub fn advance(&mut self, dt: f32) {
        if self.running {
            self.elapsed += dt;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn elapsed_secs(&self) -> f32 {
        self.elapsed
    }

    /// True when the timer is running and has reached the threshold.
    pub fn expired(&self, threshold: f32) -> bool {
        self.running && self.elapsed >= threshold
    }
}
