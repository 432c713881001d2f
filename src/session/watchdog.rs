use std::time::Duration;

/// Period of the elapsed-time watchdog
pub const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogTick {
    Running(Duration),
    Expired,
}

/// Counts one-second ticks against the allowed call length
#[derive(Debug, Clone)]
pub struct Watchdog {
    max_duration: Duration,
    elapsed: Duration,
}

impl Watchdog {
    pub fn new(max_duration: Duration) -> Self {
        Self {
            max_duration,
            elapsed: Duration::ZERO,
        }
    }

    pub fn on_tick(&mut self) -> WatchdogTick {
        self.elapsed += TICK;
        if self.elapsed >= self.max_duration {
            WatchdogTick::Expired
        } else {
            WatchdogTick::Running(self.elapsed)
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}
