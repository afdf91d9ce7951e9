use super::DynamicThrottleParams;
use std::time::Duration;

/// Window controller for the dynamic throttler. Tracks an EWMA of token
/// hold latency and grows the window while it is saturated and healthy.
#[derive(Debug, Clone)]
pub(super) struct AdaptiveWindow {
    size: u32,
    ewma_latency_us: u64,
}

impl AdaptiveWindow {
    pub(super) fn from_params(params: &DynamicThrottleParams) -> Self {
        Self {
            size: params.min_window_size.max(1),
            ewma_latency_us: params.target_latency_us.max(1),
        }
    }

    pub(super) fn size(&self) -> u32 {
        self.size
    }

    pub(super) fn ewma_latency_us(&self) -> u64 {
        self.ewma_latency_us
    }

    pub(super) fn clamp_to(&mut self, params: &DynamicThrottleParams) {
        let floor = params.min_window_size.max(1);
        self.size = self.size.clamp(floor, params.max_window_size.max(floor));
    }

    pub(super) fn observe(
        &mut self,
        params: &DynamicThrottleParams,
        held: Duration,
        saturated: bool,
    ) {
        let sample = (held.as_micros() as u64).max(1);
        self.ewma_latency_us = (self.ewma_latency_us.saturating_mul(7) + sample) / 8;

        let floor = params.min_window_size.max(1);
        let ceiling = params.max_window_size.max(floor);
        let target = params.target_latency_us.max(1);

        if self.ewma_latency_us > target.saturating_mul(2) {
            let backed_off = (self.size as f64 * params.window_size_backoff).floor() as u32;
            self.size = backed_off.clamp(floor, ceiling);
            return;
        }

        if saturated && self.ewma_latency_us <= target {
            self.size = self
                .size
                .saturating_add(params.window_size_increment)
                .min(ceiling);
        }
    }
}
