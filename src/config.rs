//! Configuration, paths and pacing

use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;

/// Inclusive range a randomized delay is drawn from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl DelayRange {
    pub const fn from_secs(min: u64, max: u64) -> Self {
        Self {
            min: Duration::from_secs(min),
            max: Duration::from_secs(max),
        }
    }

    /// Always returns exactly `delay`
    pub const fn fixed(delay: Duration) -> Self {
        Self {
            min: delay,
            max: delay,
        }
    }

    /// Draw uniformly from the range, millisecond resolution
    pub fn pick(&self) -> Duration {
        let lo = self.min.as_millis() as u64;
        let hi = self.max.as_millis() as u64;
        if hi <= lo {
            return self.min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }
}

/// All configurable paths and constants
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub ledger_db: PathBuf,
    pub catalog_file: PathBuf,
    /// Bound on the provider handshake during initialize
    pub handshake_timeout: Duration,
    /// Gap between two ticks of one conversation job
    pub tick_interval: DelayRange,
    /// Human-pacing delay before every scheduled send and auto-reply
    pub send_delay: DelayRange,
    /// Minutes debited per successful send (one second)
    pub tick_cost_minutes: f64,
    /// Balance granted when an account is first seen
    pub starter_balance_minutes: f64,
    pub low_balance_minutes: f64,
    pub max_targets: usize,
    /// Start conversations automatically when a device becomes ready
    pub auto_start: bool,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let data_dir = home.join(".fleet-warmer");

        Self {
            ledger_db: data_dir.join("ledger.db"),
            catalog_file: data_dir.join("chatsimulation.json"),
            data_dir,
            handshake_timeout: Duration::from_secs(60),
            tick_interval: DelayRange::from_secs(30, 90),
            send_delay: DelayRange::from_secs(10, 30),
            tick_cost_minutes: TICK_COST_MINUTES,
            starter_balance_minutes: 0.5,
            low_balance_minutes: 5.0,
            max_targets: 3,
            auto_start: true,
        }
    }
}

impl Config {
    /// Create config for testing with custom paths and fixed pacing
    pub fn for_test(temp_dir: &std::path::Path) -> Self {
        Self {
            data_dir: temp_dir.to_path_buf(),
            ledger_db: temp_dir.join("ledger.db"),
            catalog_file: temp_dir.join("chatsimulation.json"),
            handshake_timeout: Duration::from_secs(5),
            tick_interval: DelayRange::fixed(Duration::from_secs(60)),
            send_delay: DelayRange::fixed(Duration::from_secs(10)),
            tick_cost_minutes: TICK_COST_MINUTES,
            starter_balance_minutes: 0.5,
            low_balance_minutes: 5.0,
            max_targets: 3,
            auto_start: false,
        }
    }

    /// Reject ranges and amounts the scheduler cannot honor
    pub fn validate(&self) -> crate::Result<()> {
        for (name, range) in [("tick_interval", self.tick_interval), ("send_delay", self.send_delay)] {
            if range.min > range.max {
                return Err(crate::Error::Config(format!(
                    "{} min {:?} exceeds max {:?}",
                    name, range.min, range.max
                )));
            }
        }
        if self.tick_interval.max.is_zero() {
            return Err(crate::Error::Config("tick_interval must be non-zero".to_string()));
        }
        if !(self.tick_cost_minutes.is_finite() && self.tick_cost_minutes >= 0.0) {
            return Err(crate::Error::Config(format!(
                "tick_cost_minutes must be non-negative, got {}",
                self.tick_cost_minutes
            )));
        }
        if self.max_targets == 0 {
            return Err(crate::Error::Config("max_targets must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// One second of conversation, in minutes
pub const TICK_COST_MINUTES: f64 = 1.0 / 60.0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.ledger_db.to_string_lossy().contains("ledger.db"));
        assert_eq!(config.handshake_timeout, Duration::from_secs(60));
        assert_eq!(config.tick_interval, DelayRange::from_secs(30, 90));
        assert_eq!(config.send_delay, DelayRange::from_secs(10, 30));
        assert_eq!(config.max_targets, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_test_config() {
        let temp = std::env::temp_dir();
        let config = Config::for_test(&temp);
        assert_eq!(config.data_dir, temp);
        assert!(!config.auto_start);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pick_stays_in_range() {
        let range = DelayRange::from_secs(10, 30);
        for _ in 0..200 {
            let d = range.pick();
            assert!(d >= range.min && d <= range.max, "{:?} out of range", d);
        }
    }

    #[test]
    fn test_pick_fixed() {
        let range = DelayRange::fixed(Duration::from_millis(250));
        assert_eq!(range.pick(), Duration::from_millis(250));
    }

    #[test]
    fn test_validate_inverted_range() {
        let mut config = Config::for_test(&std::env::temp_dir());
        config.send_delay = DelayRange::from_secs(30, 10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tick_cost_is_one_second() {
        assert!((TICK_COST_MINUTES * 60.0 - 1.0).abs() < 1e-12);
    }
}
