use std::sync::Mutex;
use std::time::Instant;

/// External playback clock, the single source of truth for "now".
///
/// Any `Fn() -> f64` closure is a clock, which is how audio timelines are
/// usually plugged in.
pub trait PlaybackClock: Send + Sync {
    /// Current media time in seconds.
    fn now(&self) -> f64;
}

impl<F> PlaybackClock for F
where
    F: Fn() -> f64 + Send + Sync,
{
    fn now(&self) -> f64 {
        self()
    }
}

/// Wall-clock driven media time with seek and rate support.
pub struct WallClock {
    state: Mutex<WallState>,
}

struct WallState {
    origin: Instant,
    base: f64,
    rate: f64,
}

impl WallClock {
    pub fn new() -> Self {
        Self::starting_at(0.0)
    }

    pub fn starting_at(position: f64) -> Self {
        Self {
            state: Mutex::new(WallState {
                origin: Instant::now(),
                base: position,
                rate: 1.0,
            }),
        }
    }

    pub fn seek(&self, position: f64) {
        let mut state = self.lock();
        state.origin = Instant::now();
        state.base = position;
    }

    pub fn set_rate(&self, rate: f64) {
        let mut state = self.lock();
        let now = state.position();
        state.origin = Instant::now();
        state.base = now;
        state.rate = rate;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WallState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl WallState {
    fn position(&self) -> f64 {
        self.base + self.origin.elapsed().as_secs_f64() * self.rate
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackClock for WallClock {
    fn now(&self) -> f64 {
        self.lock().position()
    }
}
