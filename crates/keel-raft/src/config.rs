//! Raft configuration (timeouts and tuning).

use std::time::Duration;

use crate::error::{RaftError, Result};

/// Default election timeout (follower → candidate).
pub const DEFAULT_ELECTION_TIMEOUT: Duration = Duration::from_millis(150);

/// Default heartbeat period (leader → followers).
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(50);

/// Raft configuration.
///
/// The election timeout is the base of a randomized draw: every reset
/// uses a fresh value in `[election_timeout, 2 * election_timeout)`,
/// which is what keeps elections from splitting indefinitely.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Base election timeout. A follower that hears nothing from a
    /// leader (and grants no vote) within the randomized draw starts
    /// an election.
    pub election_timeout: Duration,

    /// Heartbeat period. The leader sends AppendEntries (possibly
    /// empty) to every peer at this interval. Must be shorter than
    /// the election timeout or followers will keep starting spurious
    /// elections.
    pub heartbeat_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout: DEFAULT_ELECTION_TIMEOUT,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}

impl RaftConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout.is_zero() {
            return Err(RaftError::Config {
                reason: "election_timeout must be > 0".to_string(),
            });
        }
        if self.heartbeat_timeout.is_zero() {
            return Err(RaftError::Config {
                reason: "heartbeat_timeout must be > 0".to_string(),
            });
        }
        if self.heartbeat_timeout >= self.election_timeout {
            return Err(RaftError::Config {
                reason: format!(
                    "heartbeat_timeout ({:?}) must be < election_timeout ({:?})",
                    self.heartbeat_timeout, self.election_timeout
                ),
            });
        }
        Ok(())
    }
}

/// Draw a fresh randomized election timeout in `[base, 2 * base)`.
pub fn random_election_timeout(base: Duration) -> Duration {
    use rand::Rng;
    let min_ms = base.as_millis() as u64;
    if min_ms == 0 {
        return base;
    }
    let random_ms = rand::thread_rng().gen_range(min_ms..min_ms * 2);
    Duration::from_millis(random_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_valid() {
        assert!(RaftConfig::default().validate().is_ok());
    }

    #[test]
    fn heartbeat_longer_than_election_rejected() {
        let config = RaftConfig {
            election_timeout: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_millis(100),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_timeouts_rejected() {
        let config = RaftConfig {
            election_timeout: Duration::ZERO,
            heartbeat_timeout: Duration::from_millis(10),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn randomized_draw_in_range() {
        let base = Duration::from_millis(150);
        for _ in 0..100 {
            let t = random_election_timeout(base);
            assert!(t >= base);
            assert!(t < base * 2);
        }
    }
}
