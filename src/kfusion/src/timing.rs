//! Per-stage timing instrumentation.
//!
//! Collection is active only with the `profiling` feature. Without it the
//! timer and collector are zero-sized and every call compiles to a no-op.

use serde::{Deserialize, Serialize};
#[cfg(feature = "profiling")]
use std::time::Instant;

/// Timing breakdown of one frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameTiming {
    pub total_ms: f64,
    /// Ingestion, bilateral filter, and pyramid construction.
    pub filter_ms: f64,
    /// Per-pixel association and linearization (per-pixel mode only).
    pub track_ms: f64,
    /// Reduction, including fused linearization.
    pub reduce_ms: f64,
    pub solve_ms: f64,
    pub integrate_ms: f64,
    pub raycast_ms: f64,
}

#[cfg(feature = "profiling")]
pub struct Timer {
    start: Instant,
    name: &'static str,
}

#[cfg(feature = "profiling")]
impl Timer {
    #[inline]
    pub fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    /// Milliseconds since [`Timer::new`], also traced under the timer's
    /// phase name.
    #[inline]
    pub fn elapsed_ms(&self) -> f64 {
        let ms = self.start.elapsed().as_secs_f64() * 1000.0;
        tracing::trace!(phase = self.name, ms, "phase timer");
        ms
    }
}

/// No-op timer when profiling is disabled.
#[cfg(not(feature = "profiling"))]
pub struct Timer;

#[cfg(not(feature = "profiling"))]
impl Timer {
    #[inline(always)]
    pub fn new(_name: &'static str) -> Self {
        Self
    }

    #[inline(always)]
    pub fn elapsed_ms(&self) -> f64 {
        0.0
    }
}

#[cfg(feature = "profiling")]
#[derive(Debug, Default)]
pub struct TimingCollector {
    frame_start: Option<Instant>,
    timing: FrameTiming,
}

#[cfg(feature = "profiling")]
impl TimingCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_frame(&mut self) {
        self.frame_start = Some(Instant::now());
        self.timing = FrameTiming::default();
    }

    pub fn record_phase(&mut self, phase: &str, duration_ms: f64) {
        let slot = match phase {
            "filter" => &mut self.timing.filter_ms,
            "track" => &mut self.timing.track_ms,
            "reduce" => &mut self.timing.reduce_ms,
            "solve" => &mut self.timing.solve_ms,
            "integrate" => &mut self.timing.integrate_ms,
            "raycast" => &mut self.timing.raycast_ms,
            _ => return,
        };
        *slot += duration_ms;
    }

    /// Timing accumulated since [`TimingCollector::start_frame`].
    pub fn current(&self) -> FrameTiming {
        let mut timing = self.timing.clone();
        timing.total_ms = self
            .frame_start
            .map(|s| s.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        timing
    }
}

/// No-op collector when profiling is disabled.
#[cfg(not(feature = "profiling"))]
#[derive(Debug, Default)]
pub struct TimingCollector;

#[cfg(not(feature = "profiling"))]
impl TimingCollector {
    #[inline(always)]
    pub fn new() -> Self {
        Self
    }

    #[inline(always)]
    pub fn start_frame(&mut self) {}

    #[inline(always)]
    pub fn record_phase(&mut self, _phase: &str, _duration_ms: f64) {}

    #[inline(always)]
    pub fn current(&self) -> FrameTiming {
        FrameTiming::default()
    }
}

/// Time a block and record it under `phase`.
///
/// ```ignore
/// let system = time_phase!(self.timing, "reduce", { reduce(&records, layout) });
/// ```
#[macro_export]
macro_rules! time_phase {
    ($collector:expr, $phase:expr, $block:expr) => {{
        #[cfg(feature = "profiling")]
        let _timer = $crate::timing::Timer::new($phase);

        let result = $block;

        #[cfg(feature = "profiling")]
        $collector.record_phase($phase, _timer.elapsed_ms());

        result
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_collector() {
        let mut collector = TimingCollector::new();

        collector.start_frame();
        collector.record_phase("filter", 1.0);
        collector.record_phase("reduce", 2.0);
        collector.record_phase("reduce", 0.5);
        collector.record_phase("raycast", 3.0);
        collector.record_phase("unknown", 9.0);

        let timing = collector.current();

        #[cfg(feature = "profiling")]
        {
            assert_eq!(timing.filter_ms, 1.0);
            assert_eq!(timing.reduce_ms, 2.5);
            assert_eq!(timing.raycast_ms, 3.0);
            assert_eq!(timing.solve_ms, 0.0);
        }

        #[cfg(not(feature = "profiling"))]
        {
            assert_eq!(timing, FrameTiming::default());
        }
    }
}
