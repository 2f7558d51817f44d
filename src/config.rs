//! Scheduler configuration.

use std::time::Duration;

/// Delay applied by the timer fallback to every deferred job.
pub const DEFAULT_TIMER_DELAY: Duration = Duration::from_millis(1);

/// Name given to the timer fallback's worker thread.
pub const DEFAULT_TIMER_THREAD: &str = "settlable-timer";

/// Environment variable overriding [`SchedulerConfig::timer_delay`], in milliseconds.
pub const ENV_TIMER_DELAY_MS: &str = "SETTLABLE_TIMER_DELAY_MS";

/// Environment variable overriding [`SchedulerConfig::thread_name`].
pub const ENV_TIMER_THREAD: &str = "SETTLABLE_TIMER_THREAD";

/// Settings for the [`TimerScheduler`](crate::scheduler::TimerScheduler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// How long after being deferred a job becomes due.
    pub timer_delay: Duration,
    /// Name of the worker thread.
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timer_delay: DEFAULT_TIMER_DELAY,
            thread_name: DEFAULT_TIMER_THREAD.to_owned(),
        }
    }
}

impl SchedulerConfig {
    /// Defaults overridden by `SETTLABLE_TIMER_DELAY_MS` and
    /// `SETTLABLE_TIMER_THREAD` when they are set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_TIMER_DELAY_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => config.timer_delay = Duration::from_millis(ms),
                Err(err) => tracing::warn!(
                    var = ENV_TIMER_DELAY_MS,
                    value = %raw,
                    %err,
                    "ignoring unparsable timer delay"
                ),
            }
        }
        if let Some(name) = lookup(ENV_TIMER_THREAD).filter(|name| !name.is_empty()) {
            config.thread_name = name;
        }
        tracing::debug!(
            timer_delay = ?config.timer_delay,
            thread_name = %config.thread_name,
            "scheduler config resolved"
        );
        config
    }

    /// Same configuration with a different delay.
    pub fn with_timer_delay(mut self, delay: Duration) -> Self {
        self.timer_delay = delay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.timer_delay, Duration::from_millis(1));
        assert_eq!(config.thread_name, "settlable-timer");
    }

    #[test]
    fn test_env_overrides() {
        let config = SchedulerConfig::from_lookup(lookup(&[
            (ENV_TIMER_DELAY_MS, "25"),
            (ENV_TIMER_THREAD, "reactions"),
        ]));
        assert_eq!(config.timer_delay, Duration::from_millis(25));
        assert_eq!(config.thread_name, "reactions");
    }

    #[test]
    fn test_bad_delay_keeps_default() {
        let config = SchedulerConfig::from_lookup(lookup(&[(ENV_TIMER_DELAY_MS, "soon")]));
        assert_eq!(config, SchedulerConfig::default());
    }
}
