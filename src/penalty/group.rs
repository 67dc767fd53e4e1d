//! Per-group backoff configuration.

use std::time::Duration;

use tokio::time::Instant;

/// Default session lifetime since last activity.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
/// Default first backoff delay.
pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_secs(1);
/// Default geometric growth factor.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
/// Default backoff ceiling.
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(60);
/// Longest duration the engine schedules: one century.
pub const MAX_DURATION: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// `now + duration`, saturating instead of panicking on overflow.
///
/// Durations are capped at [`MAX_DURATION`]; if even that does not fit in
/// the platform's `Instant`, the offset is halved until it does.
pub(crate) fn deadline_after(now: Instant, duration: Duration) -> Instant {
    let mut offset = duration.min(MAX_DURATION);
    loop {
        if let Some(deadline) = now.checked_add(offset) {
            return deadline;
        }
        offset /= 2;
    }
}

/// Resolved configuration for a group.
///
/// Sessions copy their group's configuration when they are created, so
/// replacing a group's configuration only affects sessions created afterwards.
///
/// Values are not validated here. A zero interval or a multiplier below one
/// is the caller's responsibility.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupConfig {
    /// Session lifetime since last activity
    pub ttl: Duration,
    /// First backoff delay
    pub initial_interval: Duration,
    /// Growth factor applied per backoff stage
    pub multiplier: f64,
    /// Backoff ceiling
    pub max_interval: Duration,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            multiplier: DEFAULT_MULTIPLIER,
            max_interval: DEFAULT_MAX_INTERVAL,
        }
    }
}

impl GroupConfig {
    /// Delay imposed by the backoff at `stage`.
    ///
    /// Stage 0 is `initial_interval`, stage k is
    /// `initial_interval * multiplier^k`, clamped at `max_interval`.
    pub fn delay_for_stage(&self, stage: u32) -> Duration {
        let exponent = i32::try_from(stage).unwrap_or(i32::MAX);
        let secs = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);

        // Overflow, NaN and negative products all saturate at the ceiling.
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }
}

/// Partial overrides for a group's configuration.
///
/// Unset fields fall back to the documented defaults (`ttl=1h`,
/// `initial=1s`, `multiplier=2`, `max=60s`), never to a previously
/// installed configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GroupOptions {
    /// Session lifetime since last activity
    pub ttl: Option<Duration>,
    /// First backoff delay
    pub initial_interval: Option<Duration>,
    /// Growth factor applied per backoff stage
    pub multiplier: Option<f64>,
    /// Backoff ceiling
    pub max_interval: Option<Duration>,
}

impl GroupOptions {
    /// Create options with every field unset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session lifetime since last activity.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Set the first backoff delay.
    pub fn initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = Some(interval);
        self
    }

    /// Set the growth factor applied per backoff stage.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Set the backoff ceiling.
    pub fn max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = Some(interval);
        self
    }

    /// Resolve the overrides on top of the defaults.
    ///
    /// Durations longer than [`MAX_DURATION`] are capped.
    pub fn build(&self) -> GroupConfig {
        let defaults = GroupConfig::default();
        GroupConfig {
            ttl: self.ttl.unwrap_or(defaults.ttl).min(MAX_DURATION),
            initial_interval: self
                .initial_interval
                .unwrap_or(defaults.initial_interval)
                .min(MAX_DURATION),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
            max_interval: self.max_interval.unwrap_or(defaults.max_interval).min(MAX_DURATION),
        }
    }
}

impl From<GroupOptions> for GroupConfig {
    fn from(options: GroupOptions) -> Self {
        options.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login_config() -> GroupConfig {
        GroupOptions::new()
            .initial_interval(Duration::from_secs(5))
            .multiplier(2.0)
            .max_interval(Duration::from_secs(60))
            .build()
    }

    #[test]
    fn test_defaults() {
        let config = GroupConfig::default();
        assert_eq!(config.ttl, Duration::from_secs(3600));
        assert_eq!(config.initial_interval, Duration::from_secs(1));
        assert_eq!(config.multiplier, 2.0);
        assert_eq!(config.max_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_options_override_only_supplied_fields() {
        let config = GroupOptions::new().ttl(Duration::from_secs(600)).build();

        assert_eq!(config.ttl, Duration::from_secs(600));
        assert_eq!(config.initial_interval, DEFAULT_INITIAL_INTERVAL);
        assert_eq!(config.multiplier, DEFAULT_MULTIPLIER);
        assert_eq!(config.max_interval, DEFAULT_MAX_INTERVAL);
    }

    #[test]
    fn test_delay_sequence_reaches_ceiling() {
        let config = login_config();
        let delays: Vec<u64> = (0..7).map(|s| config.delay_for_stage(s).as_secs()).collect();

        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60, 60]);
    }

    #[test]
    fn test_delay_saturates_for_huge_stage() {
        let config = login_config();

        assert_eq!(config.delay_for_stage(10_000), Duration::from_secs(60));
        assert_eq!(config.delay_for_stage(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_build_caps_durations() {
        let config = GroupOptions::new()
            .ttl(Duration::MAX)
            .initial_interval(Duration::MAX)
            .max_interval(Duration::MAX)
            .build();

        assert_eq!(config.ttl, MAX_DURATION);
        assert_eq!(config.initial_interval, MAX_DURATION);
        assert_eq!(config.delay_for_stage(u32::MAX), MAX_DURATION);
    }

    #[test]
    fn test_deadline_after_saturates() {
        let now = Instant::now();

        assert_eq!(deadline_after(now, Duration::from_secs(5)), now + Duration::from_secs(5));
        assert_eq!(deadline_after(now, Duration::MAX), now + MAX_DURATION);
    }

    #[test]
    fn test_fractional_multiplier() {
        let config = GroupOptions::new()
            .initial_interval(Duration::from_secs(2))
            .multiplier(1.5)
            .build();

        assert_eq!(config.delay_for_stage(1), Duration::from_secs(3));
        assert_eq!(config.delay_for_stage(2), Duration::from_millis(4500));
    }
}
