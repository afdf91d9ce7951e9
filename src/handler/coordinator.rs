use super::stripe::{Stripe, StripeState};
use parking_lot::MutexGuard;
use std::sync::Arc;

struct HeldStripe<'a> {
    stripe: &'a Stripe,
    guard: Option<MutexGuard<'a, StripeState>>,
}

/// Mutexes of several stripes held at once. This is the only place more
/// than one stripe mutex is taken; they are always locked in ascending
/// stripe index order.
pub(super) struct StripeGuardSet<'a> {
    held: Vec<HeldStripe<'a>>,
}

impl<'a> StripeGuardSet<'a> {
    /// Locks every stripe in `indices` (duplicates allowed) in ascending order.
    pub(super) fn acquire(stripes: &'a [Arc<Stripe>], indices: &[usize]) -> Self {
        let mut ordered = indices.to_vec();
        ordered.sort_unstable();
        ordered.dedup();
        debug_assert!(
            ordered.windows(2).all(|w| w[0] < w[1]),
            "stripe lock order violated: {ordered:?}"
        );

        let held = ordered
            .into_iter()
            .map(|index| {
                let stripe = stripes[index].as_ref();
                HeldStripe {
                    stripe,
                    guard: Some(stripe.state.lock()),
                }
            })
            .collect();
        Self { held }
    }

    pub(super) fn state_mut(&mut self, index: usize) -> &mut StripeState {
        let held = self
            .held
            .iter_mut()
            .find(|h| h.stripe.index() == index)
            .unwrap_or_else(|| panic!("stripe {index} is not part of this guard set"));
        match held.guard.as_mut() {
            Some(guard) => &mut **guard,
            None => panic!("stripe {index} guard already released"),
        }
    }

    pub(super) fn indices(&self) -> Vec<usize> {
        self.held.iter().map(|h| h.stripe.index()).collect()
    }
}

impl Drop for StripeGuardSet<'_> {
    fn drop(&mut self) {
        for held in &mut self.held {
            if let Some(guard) = held.guard.take() {
                held.stripe.set_cached_queue_size(&guard);
            }
        }
        for held in &self.held {
            held.stripe.notify_all();
        }
    }
}
