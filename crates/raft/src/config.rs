//! Raft timing configuration.

use rand::Rng;
use std::time::Duration;
use thiserror::Error;

/// Errors from validating a [`RaftConfig`].
#[derive(Debug, Error)]
pub enum RaftConfigError {
    #[error("election timeout range is inverted: min {min:?} > max {max:?}")]
    InvertedRange { min: Duration, max: Duration },

    #[error("election timeout max {max:?} must be at least twice min {min:?}")]
    RangeTooNarrow { min: Duration, max: Duration },

    #[error("heartbeat interval {heartbeat:?} must be strictly less than election timeout min {min:?}")]
    HeartbeatTooSlow { heartbeat: Duration, min: Duration },
}

/// Timing knobs for the Raft engine.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Leader heartbeat period. Must be strictly less than
    /// `election_timeout_min`.
    pub heartbeat_interval: Duration,

    /// Lower bound of the randomized election timeout.
    pub election_timeout_min: Duration,

    /// Upper bound of the randomized election timeout. Must be at least
    /// `2 * election_timeout_min` so that split votes stay unlikely.
    pub election_timeout_max: Duration,

    /// Per-attempt deadline for a peer RPC.
    pub rpc_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(250),
            election_timeout_max: Duration::from_millis(500),
            rpc_timeout: Duration::from_secs(1),
        }
    }
}

impl RaftConfig {
    /// Validate the hard timing constraints.
    ///
    /// Emits a warning (but does not fail) when `election_timeout_min` is
    /// below five heartbeat periods, where message jitter can trigger
    /// spurious elections.
    pub fn validate(&self) -> Result<(), RaftConfigError> {
        if self.election_timeout_min > self.election_timeout_max {
            return Err(RaftConfigError::InvertedRange {
                min: self.election_timeout_min,
                max: self.election_timeout_max,
            });
        }
        if self.election_timeout_max < self.election_timeout_min * 2 {
            return Err(RaftConfigError::RangeTooNarrow {
                min: self.election_timeout_min,
                max: self.election_timeout_max,
            });
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat_interval,
                min: self.election_timeout_min,
            });
        }
        if self.election_timeout_min < self.heartbeat_interval * 5 {
            tracing::warn!(
                heartbeat = ?self.heartbeat_interval,
                election_min = ?self.election_timeout_min,
                "election timeout is under five heartbeat periods; \
                 expect spurious elections under message jitter"
            );
        }
        Ok(())
    }

    /// Draw a fresh election timeout, uniform over
    /// `[election_timeout_min, election_timeout_max]` inclusive.
    pub fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        RaftConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_narrow_range() {
        let config = RaftConfig {
            election_timeout_min: Duration::from_millis(200),
            election_timeout_max: Duration::from_millis(300),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RaftConfigError::RangeTooNarrow { .. })
        ));
    }

    #[test]
    fn rejects_slow_heartbeat() {
        let config = RaftConfig {
            heartbeat_interval: Duration::from_millis(300),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RaftConfigError::HeartbeatTooSlow { .. })
        ));
    }

    #[test]
    fn timeout_samples_stay_in_range_and_cover_endpoints() {
        let config = RaftConfig {
            election_timeout_min: Duration::from_millis(100),
            election_timeout_max: Duration::from_millis(101),
            ..Default::default()
        };
        let (mut saw_min, mut saw_max) = (false, false);
        for _ in 0..500 {
            let t = config.random_election_timeout();
            assert!(t >= config.election_timeout_min);
            assert!(t <= config.election_timeout_max);
            saw_min |= t == config.election_timeout_min;
            saw_max |= t == config.election_timeout_max;
        }
        assert!(saw_min && saw_max);
    }
}
