use std::time::Duration;
use std::time::Instant;

use error_stack::Report;

use super::PluginError;

/// Restart allowance of the device plugin accept loop.
///
/// Consecutive crashes less than `window` apart accumulate; a crash after a
/// quiet `window` starts counting from one again.
#[derive(Debug, Clone)]
pub struct CrashBudget {
    max_restarts: u32,
    window: Duration,
    restarts: u32,
    last_crash: Option<Instant>,
}

impl CrashBudget {
    pub const DEFAULT_MAX_RESTARTS: u32 = 5;
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60 * 60);

    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts,
            window,
            restarts: 0,
            last_crash: None,
        }
    }

    /// Record a crash observed at `now`.
    ///
    /// Returns the restart count within the current window, or
    /// [`PluginError::CrashBudgetExhausted`] once it exceeds the allowance.
    pub fn record_crash(&mut self, now: Instant) -> Result<u32, Report<PluginError>> {
        self.restarts = match self.last_crash {
            Some(last) if now.saturating_duration_since(last) <= self.window => self.restarts + 1,
            _ => 1,
        };
        self.last_crash = Some(now);

        if self.restarts > self.max_restarts {
            return Err(Report::new(PluginError::CrashBudgetExhausted {
                restarts: self.restarts,
                window: self.window,
            }));
        }
        Ok(self.restarts)
    }
}

impl Default for CrashBudget {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_RESTARTS, Self::DEFAULT_WINDOW)
    }
}
