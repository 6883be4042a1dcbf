// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Retry configuration for external-utility invocations (spec §4.5.2).

use std::time::Duration;

const RETRY_DELAY_ENV_VAR: &str = "SIGNBROKER_RETRY_DELAY_MS";
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Governs retries of the external manifest-update utility only. Every
/// other failure in this crate is non-retryable (spec §4.5.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    pub delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RETRY_DELAY,
            max_retries: 1,
        }
    }
}

impl RetryConfig {
    /// Reads `SIGNBROKER_RETRY_DELAY_MS` for the retry delay, falling back
    /// to the ~1s default when unset or unparseable. `max_retries` is
    /// fixed at 1 (spec §4.5.2: "retried once").
    pub fn from_env() -> Self {
        let delay = std::env::var(RETRY_DELAY_ENV_VAR)
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RETRY_DELAY);

        Self {
            delay,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_delay_is_one_second_with_one_retry() {
        let config = RetryConfig::default();
        assert_eq!(config.delay, Duration::from_secs(1));
        assert_eq!(config.max_retries, 1);
    }

    #[test]
    fn env_override_parses_milliseconds() {
        std::env::set_var(RETRY_DELAY_ENV_VAR, "25");
        let config = RetryConfig::from_env();
        std::env::remove_var(RETRY_DELAY_ENV_VAR);
        assert_eq!(config.delay, Duration::from_millis(25));
        assert_eq!(config.max_retries, 1);
    }

    #[test]
    fn unparseable_env_falls_back_to_default() {
        std::env::set_var(RETRY_DELAY_ENV_VAR, "not-a-number");
        let config = RetryConfig::from_env();
        std::env::remove_var(RETRY_DELAY_ENV_VAR);
        assert_eq!(config.delay, Duration::from_secs(1));
    }
}
