use std::ops::Sub;
use std::time::Duration;

/// Count/sum/min/max over a stream of integer samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleStats {
    count: u64,
    sum: u64,
    min: Option<u64>,
    max: Option<u64>,
}

impl SampleStats {
    pub fn add(&mut self, sample: u64) {
        self.count += 1;
        self.sum = self.sum.wrapping_add(sample);
        self.min = Some(self.min.map_or(sample, |m| m.min(sample)));
        self.max = Some(self.max.map_or(sample, |m| m.max(sample)));
    }

    pub fn merge(&mut self, rhs: &SampleStats) {
        self.count += rhs.count;
        self.sum = self.sum.wrapping_add(rhs.sum);
        self.min = match (self.min, rhs.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = match (self.max, rhs.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    pub fn reset_min_max(&mut self) {
        self.min = None;
        self.max = None;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }

    pub fn min(&self) -> Option<u64> {
        self.min
    }

    pub fn max(&self) -> Option<u64> {
        self.max
    }

    pub fn average(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(self.sum as f64 / self.count as f64)
    }
}

impl Sub for &SampleStats {
    type Output = SampleStats;

    /// Counters subtract; min/max are not invertible and are kept from `self`.
    fn sub(self, rhs: &SampleStats) -> SampleStats {
        SampleStats {
            count: self.count.wrapping_sub(rhs.count),
            sum: self.sum.wrapping_sub(rhs.sum),
            min: self.min,
            max: self.max,
        }
    }
}

/// Size and latency of operations holding a bucket lock.
///
/// `size` is sampled with the number of active operations (including the
/// new one) each time an operation starts; `latency` is sampled in
/// microseconds when an operation releases its lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActiveOperationsStats {
    size: SampleStats,
    latency: SampleStats,
    active_size: u32,
}

impl ActiveOperationsStats {
    pub fn operation_started(&mut self) {
        self.active_size += 1;
        self.size.add(self.active_size as u64);
    }

    pub fn operation_done(&mut self, latency: Duration) {
        debug_assert!(self.active_size > 0, "operation_done without a started op");
        self.active_size = self.active_size.saturating_sub(1);
        self.latency.add(latency.as_micros() as u64);
    }

    pub fn merge(&mut self, rhs: &ActiveOperationsStats) {
        self.size.merge(&rhs.size);
        self.latency.merge(&rhs.latency);
        self.active_size += rhs.active_size;
    }

    pub fn reset_min_max(&mut self) {
        self.size.reset_min_max();
        self.latency.reset_min_max();
    }

    pub fn size(&self) -> &SampleStats {
        &self.size
    }

    pub fn latency(&self) -> &SampleStats {
        &self.latency
    }

    /// Operations currently holding a lock.
    pub fn active_size(&self) -> u32 {
        self.active_size
    }
}

impl Sub for &ActiveOperationsStats {
    type Output = ActiveOperationsStats;

    /// Delta since an earlier snapshot. `active_size` is a gauge and is
    /// taken from `self`.
    fn sub(self, rhs: &ActiveOperationsStats) -> ActiveOperationsStats {
        ActiveOperationsStats {
            size: &self.size - &rhs.size,
            latency: &self.latency - &rhs.latency,
            active_size: self.active_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ActiveOperationsStats, SampleStats};
    use proptest::prelude::*;
    use std::time::Duration;

    fn arb_stats() -> impl Strategy<Value = ActiveOperationsStats> {
        prop::collection::vec((any::<bool>(), 0u64..1_000_000), 0..64).prop_map(|ops| {
            let mut stats = ActiveOperationsStats::default();
            for (start, micros) in ops {
                if start || stats.active_size() == 0 {
                    stats.operation_started();
                } else {
                    stats.operation_done(Duration::from_micros(micros));
                }
            }
            stats
        })
    }

    fn counters(s: &SampleStats) -> (u64, u64) {
        (s.count(), s.sum())
    }

    proptest! {
        #[test]
        fn merge_then_subtract_restores_counters(a in arb_stats(), b in arb_stats()) {
            let mut merged = a;
            merged.merge(&b);
            let delta = &merged - &a;
            prop_assert_eq!(counters(delta.size()), counters(b.size()));
            prop_assert_eq!(counters(delta.latency()), counters(b.latency()));
        }
    }

    #[test]
    fn started_and_done_track_active_size() {
        let mut stats = ActiveOperationsStats::default();
        stats.operation_started();
        stats.operation_started();
        assert_eq!(stats.active_size(), 2);
        assert_eq!(stats.size().max(), Some(2));
        assert_eq!(stats.size().sum(), 3);
        stats.operation_done(Duration::from_micros(150));
        stats.operation_done(Duration::from_micros(50));
        assert_eq!(stats.active_size(), 0);
        assert_eq!(stats.latency().count(), 2);
        assert_eq!(stats.latency().min(), Some(50));
        assert_eq!(stats.latency().max(), Some(150));
        assert_eq!(stats.latency().average(), Some(100.0));
    }

    #[test]
    fn reset_min_max_keeps_counters() {
        let mut stats = ActiveOperationsStats::default();
        stats.operation_started();
        stats.operation_done(Duration::from_micros(10));
        stats.reset_min_max();
        assert_eq!(stats.latency().min(), None);
        assert_eq!(stats.latency().count(), 1);
        assert_eq!(stats.latency().sum(), 10);
    }

    #[test]
    fn merge_combines_extremes() {
        let mut a = SampleStats::default();
        a.add(5);
        let mut b = SampleStats::default();
        b.add(1);
        b.add(9);
        a.merge(&b);
        assert_eq!((a.min(), a.max(), a.count()), (Some(1), Some(9), 3));
    }
}
