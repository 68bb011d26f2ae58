//! Crash-recovery decision, kept free of I/O so it can be tested directly.

use std::time::Duration;

use crate::config::SupervisorSettings;

/// What to do after the engine exits on its own while Running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashDecision {
    /// Relaunch after `delay`.
    Restart {
        /// One-based attempt number; becomes the new retry count.
        attempt: u32,
        /// Wait before the relaunch.
        delay: Duration,
    },
    /// Budget exhausted or nothing to relaunch with.
    GiveUp,
}

/// Linear backoff: attempt `n` waits `retry_base_delay * n`.
///
/// `retry_count` is the number of restarts already spent since the engine
/// last reached Running. Without remembered start options there is nothing to
/// relaunch, so the answer is always `GiveUp`.
pub fn crash_policy(retry_count: u32, settings: &SupervisorSettings, has_start_options: bool) -> CrashDecision {
    if !has_start_options || retry_count >= settings.max_retries {
        return CrashDecision::GiveUp;
    }
    let attempt = retry_count + 1;
    CrashDecision::Restart {
        attempt,
        delay: settings.retry_base_delay * attempt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(2000),
            ..Default::default()
        }
    }

    #[test]
    fn backoff_grows_linearly() {
        let s = settings();
        assert_eq!(
            crash_policy(0, &s, true),
            CrashDecision::Restart { attempt: 1, delay: Duration::from_millis(2000) }
        );
        assert_eq!(
            crash_policy(2, &s, true),
            CrashDecision::Restart { attempt: 3, delay: Duration::from_millis(6000) }
        );
    }

    #[test]
    fn gives_up_after_budget() {
        assert_eq!(crash_policy(3, &settings(), true), CrashDecision::GiveUp);
    }

    #[test]
    fn gives_up_without_start_options() {
        assert_eq!(crash_policy(0, &settings(), false), CrashDecision::GiveUp);
    }

    #[test]
    fn zero_budget_never_restarts() {
        let s = SupervisorSettings {
            max_retries: 0,
            ..settings()
        };
        assert_eq!(crash_policy(0, &s, true), CrashDecision::GiveUp);
    }
}
