use crate::domain::settings::Config;
use std::time::Duration;

/// How often the daemon samples desk height and idle time.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Accumulates continuous time spent at sitting height.
///
/// The counter resets as soon as the desk is raised to standing height or the
/// operator has been idle for longer than the configured break.
#[derive(Debug, Clone)]
pub struct SittingTracker {
    stand_threshold_cm: f64,
    break_time: Duration,
    sitting: Duration,
}

impl SittingTracker {
    pub fn new(config: &Config) -> Self {
        Self {
            stand_threshold_cm: config.stand_threshold,
            break_time: config.sitting_break(),
            sitting: Duration::ZERO,
        }
    }

    /// Fold one sample into the counter. `height_cm` is `None` while no desk
    /// session exists, in which case the counter is held as is.
    pub fn record(&mut self, height_cm: Option<f64>, idle: Duration, elapsed: Duration) {
        let Some(height_cm) = height_cm else {
            return;
        };

        if height_cm >= self.stand_threshold_cm || idle > self.break_time {
            self.sitting = Duration::ZERO;
        } else {
            self.sitting += elapsed;
        }
    }

    pub fn sitting_time(&self) -> Duration {
        self.sitting
    }
}
