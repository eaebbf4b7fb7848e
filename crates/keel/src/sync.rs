use std::sync::{Condvar, Mutex, PoisonError};

/// Counting semaphore.
///
/// `wait` blocks while the count is zero, then takes one permit. `post` adds one permit and
/// wakes a single waiter.
#[derive(Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Create a semaphore holding `permits` initial permits.
    pub fn new(permits: usize) -> Self {
        Self {
            count: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Block until a permit is available, then take it.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);

        // Loop, condvars are allowed to wake spuriously
        while *count == 0 {
            count = self
                .available
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }

        *count -= 1;
    }

    /// Take a permit if one is available, without blocking.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);

        if *count == 0 {
            return false;
        }

        *count -= 1;
        true
    }

    /// Release one permit, waking a waiter if there is one.
    pub fn post(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count += 1;
        drop(count);

        self.available.notify_one();
    }

    /// Current number of available permits.
    pub fn permits(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
