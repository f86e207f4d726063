use std::time::Duration;

const SPIN_LIMIT: u32 = 10;
const YIELD_LIMIT: u32 = 100;
const MAX_SLEEP: Duration = Duration::from_millis(1);

/// Adaptive backoff for the engine's polling loops: spin, then yield, then
/// sleep with an exponentially growing interval capped at [`MAX_SLEEP`].
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snooze(&mut self) {
        if self.step < SPIN_LIMIT {
            std::hint::spin_loop();
        } else if self.step < YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            std::thread::sleep(self.sleep_interval());
        }
        self.step = self.step.saturating_add(1);
    }

    fn sleep_interval(&self) -> Duration {
        let exp = self.step.saturating_sub(YIELD_LIMIT).min(10);
        Duration::from_micros(1u64 << exp).min(MAX_SLEEP)
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }
}
