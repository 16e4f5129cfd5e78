use std::{fmt, time::Duration};

use parking_lot::Mutex;
use rand::{RngExt as _, SeedableRng as _, rngs::StdRng};

/// Source of the uniform draws used to decide which fault (if any) to inject.
pub trait ChanceSource: fmt::Debug + Send + Sync + 'static {
    /// Uniform draw in `[0, 1)`.
    fn draw(&self) -> f64;

    /// Uniform duration in `[0, max)`, in whole milliseconds.
    fn lag(&self, max: Duration) -> Duration {
        let max_millis = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        if max_millis == 0 {
            return Duration::ZERO;
        }
        let millis = (self.draw().clamp(0., 1.) * max_millis as f64) as u64;
        Duration::from_millis(millis.min(max_millis - 1))
    }
}

/// Thread-local generator, seeded from the OS once per worker thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngSource;

impl ChanceSource for ThreadRngSource {
    #[inline(always)]
    fn draw(&self) -> f64 {
        rand::random()
    }
}

/// Generator seeded once with a user-provided seed.
///
/// Draws are reproducible in order; with concurrent requests the
/// interleaving of those draws across requests is not.
pub struct SeededSource {
    seed: u64,
    rng: Mutex<StdRng>,
}

impl SeededSource {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl fmt::Debug for SeededSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeededSource")
            .field("seed", &self.seed)
            .finish()
    }
}

impl ChanceSource for SeededSource {
    fn draw(&self) -> f64 {
        self.rng.lock().random()
    }
}

#[cfg(test)]
pub(crate) use self::scripted::ScriptedSource;

#[cfg(test)]
mod scripted {
    use std::collections::VecDeque;

    use super::*;

    /// Replays predetermined draws, panicking once exhausted.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedSource {
        draws: Mutex<VecDeque<f64>>,
        consumed: Mutex<usize>,
    }

    impl ScriptedSource {
        pub(crate) fn new(draws: impl IntoIterator<Item = f64>) -> Self {
            Self {
                draws: Mutex::new(draws.into_iter().collect()),
                consumed: Mutex::new(0),
            }
        }

        pub(crate) fn consumed(&self) -> usize {
            *self.consumed.lock()
        }
    }

    impl ChanceSource for ScriptedSource {
        fn draw(&self) -> f64 {
            *self.consumed.lock() += 1;
            self.draws
                .lock()
                .pop_front()
                .expect("scripted chance source exhausted")
        }
    }
}
