//! User idle time, used to reset the sitting counter after a break away from
//! the machine.

use std::time::Duration;

pub trait IdleSource: Send + Sync + 'static {
    /// Time since the last keyboard or mouse input.
    fn idle_time(&self) -> Duration;
}

/// Reports the user as always active. The sitting counter then only resets
/// when the desk is raised.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIdleTracking;

impl IdleSource for NoIdleTracking {
    fn idle_time(&self) -> Duration {
        Duration::ZERO
    }
}
