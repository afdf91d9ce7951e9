mod adaptive;

use crate::error::FileStorError;
use adaptive::AdaptiveWindow;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicThrottleParams {
    pub min_window_size: u32,
    pub max_window_size: u32,
    pub window_size_increment: u32,
    /// Multiplier applied to the window when latency runs away.
    pub window_size_backoff: f64,
    pub target_latency_us: u64,
}

impl Default for DynamicThrottleParams {
    fn default() -> Self {
        Self {
            min_window_size: 20,
            max_window_size: 1_000,
            window_size_increment: 20,
            window_size_backoff: 0.95,
            target_latency_us: 5_000,
        }
    }
}

impl DynamicThrottleParams {
    pub fn validate(&self) -> Result<(), FileStorError> {
        if self.min_window_size == 0 {
            return Err(FileStorError::InvalidConfig {
                message: "dynamic_throttling.min_window_size must be at least 1".into(),
            });
        }
        if self.min_window_size > self.max_window_size {
            return Err(FileStorError::InvalidConfig {
                message: format!(
                    "dynamic_throttling window inverted: min {} > max {}",
                    self.min_window_size, self.max_window_size
                ),
            });
        }
        if !(self.window_size_backoff > 0.0 && self.window_size_backoff <= 1.0) {
            return Err(FileStorError::InvalidConfig {
                message: "dynamic_throttling.window_size_backoff must be in (0, 1]".into(),
            });
        }
        Ok(())
    }
}

/// Admission-control source consulted before dispatching throttled
/// operation classes. Implementations are internally synchronized.
pub trait SharedThrottler: Send + Sync {
    /// Never blocks; the returned token may be invalid.
    fn try_acquire_one_now(&self) -> ThrottleToken;

    /// Waits until a token is available or `deadline` passes.
    fn blocking_acquire_one(&self, deadline: Instant) -> ThrottleToken;

    fn current_window_size(&self) -> u32;

    fn waiting_threads(&self) -> u32;

    fn current_active_token_count(&self) -> u32;

    fn reconfigure_dynamic_throttling(&self, _params: &DynamicThrottleParams) {}

    /// Wakes every blocked acquirer; this and later blocking acquires that
    /// find the window full return an invalid token at once.
    fn shutdown(&self) {}
}

trait TokenRelease: Send + Sync {
    fn release_one(&self, held: Duration);
}

/// Admission capability. Dropping a valid token returns it to its throttler.
pub struct ThrottleToken {
    owner: Option<Arc<dyn TokenRelease>>,
    acquired_at: Instant,
}

impl ThrottleToken {
    pub fn invalid() -> Self {
        Self {
            owner: None,
            acquired_at: Instant::now(),
        }
    }

    fn issued(owner: Arc<dyn TokenRelease>) -> Self {
        Self {
            owner: Some(owner),
            acquired_at: Instant::now(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.owner.is_some()
    }
}

impl std::fmt::Debug for ThrottleToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleToken")
            .field("valid", &self.is_valid())
            .field("held_for", &self.acquired_at.elapsed())
            .finish()
    }
}

impl Drop for ThrottleToken {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.release_one(self.acquired_at.elapsed());
        }
    }
}

#[derive(Debug, Default)]
struct UnlimitedCore {
    active: AtomicU32,
}

impl TokenRelease for UnlimitedCore {
    fn release_one(&self, _held: Duration) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Hands out a token to every caller; only counts them.
#[derive(Debug, Default)]
pub struct UnlimitedThrottler {
    core: Arc<UnlimitedCore>,
}

impl UnlimitedThrottler {
    pub fn new() -> Self {
        Self::default()
    }

    fn issue(&self) -> ThrottleToken {
        self.core.active.fetch_add(1, Ordering::Relaxed);
        ThrottleToken::issued(Arc::clone(&self.core) as Arc<dyn TokenRelease>)
    }
}

impl SharedThrottler for UnlimitedThrottler {
    fn try_acquire_one_now(&self) -> ThrottleToken {
        self.issue()
    }

    fn blocking_acquire_one(&self, _deadline: Instant) -> ThrottleToken {
        self.issue()
    }

    fn current_window_size(&self) -> u32 {
        u32::MAX
    }

    fn waiting_threads(&self) -> u32 {
        0
    }

    fn current_active_token_count(&self) -> u32 {
        self.core.active.load(Ordering::Relaxed)
    }
}

struct WindowState {
    params: DynamicThrottleParams,
    window: AdaptiveWindow,
    active: u32,
    waiting: u32,
    shut_down: bool,
}

impl WindowState {
    fn try_take(&mut self) -> bool {
        if self.active < self.window.size() {
            self.active += 1;
            true
        } else {
            false
        }
    }
}

struct DynamicCore {
    state: Mutex<WindowState>,
    cond: Condvar,
}

impl TokenRelease for DynamicCore {
    fn release_one(&self, held: Duration) {
        let mut state = self.state.lock();
        let saturated = state.active >= state.window.size();
        debug_assert!(state.active > 0, "throttle token released twice");
        state.active = state.active.saturating_sub(1);
        let params = state.params;
        state.window.observe(&params, held, saturated);
        let has_waiters = state.waiting > 0;
        drop(state);
        if has_waiters {
            // the window may have grown by more than one slot
            self.cond.notify_all();
        }
    }
}

/// Window-limited throttler whose window adapts to observed token latency.
pub struct DynamicThrottler {
    core: Arc<DynamicCore>,
}

impl DynamicThrottler {
    pub fn new(params: DynamicThrottleParams) -> Self {
        Self {
            core: Arc::new(DynamicCore {
                state: Mutex::new(WindowState {
                    params,
                    window: AdaptiveWindow::from_params(&params),
                    active: 0,
                    waiting: 0,
                    shut_down: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    fn issue(&self) -> ThrottleToken {
        ThrottleToken::issued(Arc::clone(&self.core) as Arc<dyn TokenRelease>)
    }
}

impl SharedThrottler for DynamicThrottler {
    fn try_acquire_one_now(&self) -> ThrottleToken {
        if self.core.state.lock().try_take() {
            self.issue()
        } else {
            ThrottleToken::invalid()
        }
    }

    fn blocking_acquire_one(&self, deadline: Instant) -> ThrottleToken {
        let mut state = self.core.state.lock();
        if state.try_take() {
            drop(state);
            return self.issue();
        }
        if state.shut_down {
            return ThrottleToken::invalid();
        }
        state.waiting += 1;
        loop {
            let timed_out = self.core.cond.wait_until(&mut state, deadline).timed_out();
            if state.try_take() {
                state.waiting -= 1;
                drop(state);
                return self.issue();
            }
            if timed_out || state.shut_down {
                state.waiting -= 1;
                return ThrottleToken::invalid();
            }
        }
    }

    fn current_window_size(&self) -> u32 {
        self.core.state.lock().window.size()
    }

    fn waiting_threads(&self) -> u32 {
        self.core.state.lock().waiting
    }

    fn current_active_token_count(&self) -> u32 {
        self.core.state.lock().active
    }

    fn reconfigure_dynamic_throttling(&self, params: &DynamicThrottleParams) {
        let mut state = self.core.state.lock();
        state.params = *params;
        state.window.clamp_to(params);
        drop(state);
        self.core.cond.notify_all();
    }

    fn shutdown(&self) {
        self.core.state.lock().shut_down = true;
        self.core.cond.notify_all();
    }
}

/// Holds both throttler flavours and selects the active one with a single
/// atomic flag, so the policy can be toggled under live traffic.
pub struct ThrottlerSwitch {
    dynamic: Arc<dyn SharedThrottler>,
    unlimited: Arc<dyn SharedThrottler>,
    use_dynamic: AtomicBool,
}

impl ThrottlerSwitch {
    pub fn new(params: DynamicThrottleParams, use_dynamic: bool) -> Self {
        Self {
            dynamic: Arc::new(DynamicThrottler::new(params)),
            unlimited: Arc::new(UnlimitedThrottler::new()),
            use_dynamic: AtomicBool::new(use_dynamic),
        }
    }

    pub fn active(&self) -> &Arc<dyn SharedThrottler> {
        if self.use_dynamic.load(Ordering::Acquire) {
            &self.dynamic
        } else {
            &self.unlimited
        }
    }

    pub fn uses_dynamic(&self) -> bool {
        self.use_dynamic.load(Ordering::Acquire)
    }

    pub fn set_use_dynamic(&self, enabled: bool) {
        let previous = self.use_dynamic.swap(enabled, Ordering::AcqRel);
        if previous != enabled {
            info!(dynamic = enabled, "switched operation throttler");
        }
    }

    pub fn dynamic(&self) -> &Arc<dyn SharedThrottler> {
        &self.dynamic
    }

    pub fn unlimited(&self) -> &Arc<dyn SharedThrottler> {
        &self.unlimited
    }

    pub fn reconfigure(&self, params: &DynamicThrottleParams) {
        self.dynamic.reconfigure_dynamic_throttling(params);
    }

    pub fn shutdown(&self) {
        self.dynamic.shutdown();
        self.unlimited.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::{DynamicThrottleParams, DynamicThrottler, SharedThrottler, ThrottlerSwitch};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn fixed_window(size: u32) -> DynamicThrottleParams {
        DynamicThrottleParams {
            min_window_size: size,
            max_window_size: size,
            window_size_increment: 0,
            window_size_backoff: 1.0,
            target_latency_us: 1_000,
        }
    }

    #[test]
    fn try_acquire_respects_window() {
        let throttler = DynamicThrottler::new(fixed_window(2));
        let a = throttler.try_acquire_one_now();
        let b = throttler.try_acquire_one_now();
        let c = throttler.try_acquire_one_now();
        assert!(a.is_valid() && b.is_valid());
        assert!(!c.is_valid());
        assert_eq!(throttler.current_active_token_count(), 2);
        drop(a);
        assert_eq!(throttler.current_active_token_count(), 1);
        assert!(throttler.try_acquire_one_now().is_valid());
    }

    #[test]
    fn blocking_acquire_times_out_at_deadline() {
        let throttler = DynamicThrottler::new(fixed_window(1));
        let _held = throttler.try_acquire_one_now();
        let start = Instant::now();
        let token = throttler.blocking_acquire_one(start + Duration::from_millis(30));
        assert!(!token.is_valid());
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(throttler.waiting_threads(), 0);
    }

    #[test]
    fn blocking_acquire_wakes_on_release() {
        let throttler = Arc::new(DynamicThrottler::new(fixed_window(1)));
        let held = throttler.try_acquire_one_now();
        let waiter = {
            let throttler = Arc::clone(&throttler);
            std::thread::spawn(move || {
                throttler
                    .blocking_acquire_one(Instant::now() + Duration::from_secs(10))
                    .is_valid()
            })
        };
        while throttler.waiting_threads() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        drop(held);
        assert!(waiter.join().expect("waiter thread"));
    }

    #[test]
    fn shutdown_releases_blocked_acquirers() {
        let throttler = Arc::new(DynamicThrottler::new(fixed_window(1)));
        let _held = throttler.try_acquire_one_now();
        let waiter = {
            let throttler = Arc::clone(&throttler);
            std::thread::spawn(move || {
                let started = Instant::now();
                let token = throttler.blocking_acquire_one(started + Duration::from_secs(10));
                (token.is_valid(), started.elapsed())
            })
        };
        while throttler.waiting_threads() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        throttler.shutdown();
        let (valid, waited) = waiter.join().expect("waiter thread");
        assert!(!valid);
        assert!(waited < Duration::from_secs(5));
        assert_eq!(throttler.waiting_threads(), 0);

        let started = Instant::now();
        let late = throttler.blocking_acquire_one(started + Duration::from_secs(10));
        assert!(!late.is_valid());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn reconfigure_widens_window() {
        let throttler = DynamicThrottler::new(fixed_window(1));
        let _a = throttler.try_acquire_one_now();
        assert!(!throttler.try_acquire_one_now().is_valid());
        throttler.reconfigure_dynamic_throttling(&fixed_window(3));
        assert_eq!(throttler.current_window_size(), 3);
        assert!(throttler.try_acquire_one_now().is_valid());
    }

    #[test]
    fn switch_selects_active_throttler() {
        let switch = ThrottlerSwitch::new(fixed_window(1), false);
        let tokens: Vec<_> = (0..8).map(|_| switch.active().try_acquire_one_now()).collect();
        assert!(tokens.iter().all(|t| t.is_valid()));
        assert_eq!(switch.unlimited().current_active_token_count(), 8);
        switch.set_use_dynamic(true);
        assert!(switch.uses_dynamic());
        let first = switch.active().try_acquire_one_now();
        assert!(first.is_valid());
        assert!(!switch.active().try_acquire_one_now().is_valid());
        drop(tokens);
        assert_eq!(switch.unlimited().current_active_token_count(), 0);
    }

    #[test]
    fn params_validation() {
        assert!(DynamicThrottleParams::default().validate().is_ok());
        let bad = DynamicThrottleParams {
            window_size_backoff: 1.5,
            ..DynamicThrottleParams::default()
        };
        assert!(bad.validate().is_err());
    }
}
