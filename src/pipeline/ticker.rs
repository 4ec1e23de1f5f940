use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::error::{PipelineError, Result};

/// Steady external pulse that paces the scheduling loop.
///
/// Returns `false` once the source has ended.
#[async_trait]
pub trait TickSource: Send {
    async fn tick(&mut self) -> bool;
}

/// Fixed-rate ticks from a tokio interval, standing in for vsync.
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    /// Tick `rate_hz` times per second. Any positive, finite rate is accepted.
    pub fn new(rate_hz: f64) -> Result<Self> {
        if !(rate_hz > 0.0 && rate_hz.is_finite()) {
            return Err(PipelineError::invalid_config(format!(
                "tick rate must be positive, got {rate_hz}"
            )));
        }
        let mut interval = interval(Duration::from_secs_f64(1.0 / rate_hz));
        // A stalled loop should not burst to catch up.
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Ok(Self { interval })
    }
}

#[async_trait]
impl TickSource for IntervalTicker {
    async fn tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

/// Ticks on demand; used by tests and by hosts with their own frame callback.
pub struct ManualTicker {
    rx: mpsc::UnboundedReceiver<()>,
}

#[derive(Clone)]
pub struct ManualTrigger {
    tx: mpsc::UnboundedSender<()>,
}

impl ManualTicker {
    pub fn new() -> (Self, ManualTrigger) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, ManualTrigger { tx })
    }
}

impl ManualTrigger {
    /// Request one tick. Returns false if the ticker was dropped.
    pub fn fire(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

#[async_trait]
impl TickSource for ManualTicker {
    async fn tick(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_ticker_ends_with_trigger() {
        let (mut ticker, trigger) = ManualTicker::new();
        assert!(trigger.fire());
        assert!(ticker.tick().await);
        drop(trigger);
        assert!(!ticker.tick().await);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_ticker_paces() {
        let mut ticker = IntervalTicker::new(10.0).unwrap();
        let start = tokio::time::Instant::now();
        for _ in 0..3 {
            assert!(ticker.tick().await);
        }
        // First tick is immediate.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_rates_are_not_clamped() {
        let mut ticker = IntervalTicker::new(0.5).unwrap();
        let start = tokio::time::Instant::now();
        ticker.tick().await;
        ticker.tick().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[test]
    fn rejects_non_positive_rates() {
        for rate in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                IntervalTicker::new(rate),
                Err(PipelineError::InvalidConfig(_))
            ));
        }
    }
}
