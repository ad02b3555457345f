//! Stall watchdog for the AI session.
//!
//! Tracks the time since the AI last produced output. When enabled and the
//! quiet period elapses, one alert is raised; the episode re-arms only
//! after fresh activity. Disabling clears any armed alert silently.

use std::time::{Duration, Instant};

/// Edge-triggered quiet-period detector.
#[derive(Debug)]
pub struct Watchdog {
    enabled: bool,
    quiet: Duration,
    last_activity: Instant,
    alerted: bool,
}

impl Watchdog {
    pub fn new(quiet: Duration, enabled: bool) -> Self {
        Self {
            enabled,
            quiet,
            last_activity: Instant::now(),
            alerted: false,
        }
    }

    /// Record AI output. Re-arms the alert for the next quiet episode.
    pub fn activity(&mut self) {
        self.last_activity = Instant::now();
        self.alerted = false;
    }

    /// Enable or disable the watchdog. Disabling suppresses any armed
    /// alert without reporting it.
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled && !self.enabled {
            // Stale quiet time from before the toggle must not fire.
            self.last_activity = Instant::now();
            self.alerted = false;
        }
        self.enabled = enabled;
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Check for a stall. Returns the idle duration in seconds exactly
    /// once per quiet episode.
    pub fn poll(&mut self) -> Option<u64> {
        if !self.enabled || self.alerted {
            return None;
        }
        let idle = self.last_activity.elapsed();
        if idle >= self.quiet {
            self.alerted = true;
            Some(idle.as_secs())
        } else {
            None
        }
    }
}
