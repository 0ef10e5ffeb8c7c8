//! # config
//!
//! why: keep raft timing and safety switches in one serializable place
//! relations: owned by node.rs, read by the raft-node timer, election and replication loops
//! what: RaftConfig with defaults and validation

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Raft timing and protocol configuration. All durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout
    pub election_timeout_min: u64,
    /// Upper bound of the randomized election timeout
    pub election_timeout_max: u64,
    /// Interval between leader replication cycles
    pub heartbeat_interval: u64,
    /// Bound on every outbound rpc. A full replication round takes up to
    /// rpc_timeout + heartbeat_interval, which must fit under election_timeout_min.
    pub rpc_timeout: u64,
    /// Cap on entries shipped in a single AppendEntries call
    pub max_entries_per_append: usize,
    /// Refuse votes to candidates whose log is behind the voter's log
    pub check_vote_log_recency: bool,
    /// Only advance commit_index onto entries from the leader's current term
    pub commit_requires_current_term: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            rpc_timeout: 75,
            max_entries_per_append: 128,
            check_vote_log_recency: false,
            commit_requires_current_term: false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("election timeout range is empty: {min}..{max}")]
    EmptyElectionRange { min: u64, max: u64 },
    #[error("heartbeat interval ({heartbeat}ms) must be below the election timeout floor ({floor}ms)")]
    HeartbeatTooSlow { heartbeat: u64, floor: u64 },
    #[error("rpc timeout ({rpc_timeout}ms) plus heartbeat interval ({heartbeat}ms) must be below the election timeout floor ({floor}ms)")]
    RpcTooSlow { rpc_timeout: u64, heartbeat: u64, floor: u64 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl RaftConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn rpc_deadline(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }

    pub fn election_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.election_timeout_min),
            Duration::from_millis(self.election_timeout_max),
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval == 0 {
            return Err(ConfigError::Zero("heartbeat_interval"));
        }
        if self.rpc_timeout == 0 {
            return Err(ConfigError::Zero("rpc_timeout"));
        }
        if self.max_entries_per_append == 0 {
            return Err(ConfigError::Zero("max_entries_per_append"));
        }
        if self.election_timeout_min == 0 || self.election_timeout_min > self.election_timeout_max {
            return Err(ConfigError::EmptyElectionRange {
                min: self.election_timeout_min,
                max: self.election_timeout_max,
            });
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat_interval,
                floor: self.election_timeout_min,
            });
        }
        // one hung peer holds a round open for rpc_timeout; the next beat must still land in time
        if self.rpc_timeout + self.heartbeat_interval >= self.election_timeout_min {
            return Err(ConfigError::RpcTooSlow {
                rpc_timeout: self.rpc_timeout,
                heartbeat: self.heartbeat_interval,
                floor: self.election_timeout_min,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(RaftConfig::default().validate(), Ok(()));
    }

    #[test]
    fn heartbeat_must_undercut_election_floor() {
        let config = RaftConfig {
            heartbeat_interval: 200,
            ..RaftConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::HeartbeatTooSlow { heartbeat: 200, floor: 150 })
        );
    }

    #[test]
    fn rpc_and_heartbeat_must_fit_inside_election_floor() {
        let config = RaftConfig {
            rpc_timeout: 100,
            ..RaftConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::RpcTooSlow { rpc_timeout: 100, heartbeat: 50, floor: 150 })
        );

        let config = RaftConfig {
            rpc_timeout: 99,
            ..RaftConfig::default()
        };
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn inverted_election_range_rejected() {
        let config = RaftConfig {
            election_timeout_min: 400,
            election_timeout_max: 300,
            ..RaftConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::EmptyElectionRange { .. })));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: RaftConfig = serde_json::from_str(r#"{"heartbeat_interval": 20}"#).unwrap();
        assert_eq!(config.heartbeat_interval, 20);
        assert_eq!(config.election_timeout_min, 150);
        assert!(!config.check_vote_log_recency);
    }
}
