//! Run-scoped context shared by orchestrator components

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Context created once per orchestrator invocation.
///
/// Everything that needs the run's start time or its timestamp stamp gets it
/// from here instead of from ambient global state, so two runs in the same
/// process can never share a stamp.
#[derive(Debug, Clone)]
pub struct RunContext {
    started: Instant,
    started_at: DateTime<Utc>,
    stamp: String,
}

impl RunContext {
    /// Start a new run now
    pub fn new() -> Self {
        let started_at = Utc::now();
        Self {
            started: Instant::now(),
            stamp: started_at.format("%Y%m%d-%H%M%S").to_string(),
            started_at,
        }
    }

    /// Wall-clock time the run started
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Filesystem-safe timestamp identifying this run
    pub fn stamp(&self) -> &str {
        &self.stamp
    }

    /// Time elapsed since the run started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Elapsed time as `MM:SS` for status lines
    pub fn elapsed_label(&self) -> String {
        format_elapsed(self.elapsed())
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a duration as `MM:SS`
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(0)), "00:00");
        assert_eq!(format_elapsed(Duration::from_secs(59)), "00:59");
        assert_eq!(format_elapsed(Duration::from_secs(61)), "01:01");
        assert_eq!(format_elapsed(Duration::from_secs(3600)), "60:00");
    }

    #[test]
    fn test_stamp_shape() {
        let context = RunContext::new();
        assert_eq!(context.stamp().len(), "20260101-000000".len());
    }
}
