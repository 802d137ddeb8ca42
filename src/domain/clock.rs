use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Millisecond clock used by the engine and the optimizers.
///
/// All timestamps in traces and cache entries come from this trait so that
/// tests can inject a deterministic clock instead of wall-clock time.
pub trait Clock: std::fmt::Debug + Send + Sync {
    fn now_ms(&self) -> i64;
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall-clock backed implementation.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_millis() as i64
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_ms: Arc<Mutex<i64>>,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        ManualClock { now_ms: Arc::new(Mutex::new(start_ms)) }
    }

    pub fn shared(start_ms: i64) -> (SharedClock, ManualClock) {
        let clock = ManualClock::new(start_ms);
        (Arc::new(clock.clone()), clock)
    }

    pub fn advance(&self, delta_ms: i64) {
        let mut now = self.now_ms.lock().expect("clock mutex poisoned");
        *now += delta_ms;
    }

    pub fn set(&self, now_ms: i64) {
        let mut now = self.now_ms.lock().expect("clock mutex poisoned");
        *now = now_ms;
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        *self.now_ms.lock().expect("clock mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance(250);
        assert_eq!(clock.now_ms(), 1_250);
        clock.set(5_000);
        assert_eq!(clock.now_ms(), 5_000);
    }
}
