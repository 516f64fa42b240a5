//! Frame timing.
//!
//! Snapshots arrive at whatever cadence the network allows (10–60 Hz);
//! rendering runs at display refresh. [`FrameClock`] supplies the
//! elapsed seconds between frames so every reconciler converges per
//! rendered frame, independent of tick rate.

use tokio::time::Instant;

/// Supplies `dt` once per render frame.
#[derive(Debug)]
pub struct FrameClock {
    last: Instant,
}

impl FrameClock {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Seconds elapsed since the previous call (or construction).
    pub fn tick(&mut self) -> f32 {
        let now = Instant::now();
        let dt = (now - self.last).as_secs_f32();
        self.last = now;
        dt
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}
