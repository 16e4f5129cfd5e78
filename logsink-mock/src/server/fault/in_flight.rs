use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

/// Process-wide count of requests currently being handled.
///
/// Only used for diagnostics, never for admission control.
#[derive(Debug, Clone, Default)]
pub struct InFlightRequests(Arc<AtomicUsize>);

impl InFlightRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request as in flight until the returned guard is dropped.
    pub fn enter(&self) -> InFlightGuard {
        let position = self.0.fetch_add(1, Ordering::AcqRel) + 1;
        InFlightGuard {
            counter: self.0.clone(),
            position,
        }
    }

    pub fn current(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// Slot held by a single in-flight request.
///
/// Dropping it (on return, early exit or cancellation) releases the slot.
#[derive(Debug)]
#[must_use = "the request is only counted while the guard is alive"]
pub struct InFlightGuard {
    counter: Arc<AtomicUsize>,
    position: usize,
}

impl InFlightGuard {
    /// Number of requests in flight (this one included) when it entered.
    #[inline(always)]
    pub fn position(&self) -> usize {
        self.position
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
