//! Node configuration
//!
//! [`NodeConfigFile`] is the serialized form (TOML, durations in milliseconds) and converts into the
//! runtime [`NodeConfig`]. The consensus thresholds are kept apart in [`ConsensusThresholds`] so a
//! node can swap them under its reconfiguration lock.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::constants::{
    DEFAULT_CHECK_ITEM_TIME, DEFAULT_CONSENSUS_RECEIVED_CHECK_TIME, DEFAULT_DECLINED_ITEM_EXPIRATION,
    DEFAULT_MAX_CACHE_AGE, DEFAULT_MAX_CONSENSUS_RECEIVED_CHECK_TIME, DEFAULT_MAX_ELECTIONS_TIME,
    DEFAULT_MAX_ITEM_CREATION_AGE, DEFAULT_MAX_RESYNC_TIME, DEFAULT_POLL_TIME, DEFAULT_RESYNC_TIME,
    DEFAULT_REVOKED_ITEM_EXTRA_EXPIRATION,
};

/// Errors in the node configuration. These are fatal at startup.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// A threshold is zero or larger than the voting population
    #[snafu(display("{name} = {value} is out of range 1..={max}"))]
    InvalidThreshold {
        /// Which threshold
        name: &'static str,
        /// The configured value
        value: usize,
        /// The largest acceptable value
        max: usize,
    },
    /// A duration that must be positive is zero
    #[snafu(display("{name} must be positive"))]
    ZeroDuration {
        /// Which duration
        name: &'static str,
    },
    /// The configuration file could not be read
    #[snafu(display("failed to read config file: {source}"))]
    ReadFile {
        /// Originating io error
        source: std::io::Error,
    },
    /// The configuration file is not valid TOML for a [`NodeConfigFile`]
    #[snafu(display("failed to parse config file: {source}"))]
    Parse {
        /// Originating toml error
        source: toml::de::Error,
    },
}

/// Vote counts needed to adopt an outcome
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusThresholds {
    /// Positive votes from distinct nodes needed to approve
    pub positive_consensus: usize,
    /// Negative votes from distinct nodes needed to decline
    pub negative_consensus: usize,
    /// Peers reporting the same terminal state needed to adopt it during resync
    pub resync_break_consensus: usize,
}

impl ConsensusThresholds {
    /// Thresholds for a network of `nodes_count` voting nodes.
    ///
    /// Approval needs two thirds of the network, declining needs just enough that approval
    /// becomes impossible. The resync threshold is twice the negative one, capped at the
    /// positive one.
    #[must_use]
    pub fn for_network_size(nodes_count: usize) -> Self {
        let positive_consensus = (nodes_count * 2).div_ceil(3).max(1);
        let negative_consensus = (nodes_count + 1).saturating_sub(positive_consensus).max(1);
        let resync_break_consensus = (negative_consensus * 2).min(positive_consensus);
        Self {
            positive_consensus,
            negative_consensus,
            resync_break_consensus,
        }
    }

    /// Check the thresholds against the number of voting nodes
    ///
    /// # Errors
    /// [`ConfigError::InvalidThreshold`] if a threshold is zero or cannot ever be reached
    pub fn validate(&self, nodes_count: usize) -> Result<(), ConfigError> {
        let checks = [
            ("positive_consensus", self.positive_consensus, nodes_count),
            ("negative_consensus", self.negative_consensus, nodes_count),
            // the resyncing node cannot vouch for itself
            (
                "resync_break_consensus",
                self.resync_break_consensus,
                nodes_count.saturating_sub(1).max(1),
            ),
        ];
        for (name, value, max) in checks {
            if value == 0 || value > max {
                return Err(ConfigError::InvalidThreshold { name, value, max });
            }
        }
        Ok(())
    }
}

/// Holds configuration for a `quorum` node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeConfig {
    /// Initial consensus thresholds
    pub thresholds: ConsensusThresholds,
    /// Longest an election may collect votes before concluding without consensus
    pub max_elections_time: Duration,
    /// Interval at which vote requests are re-sent to peers that have not answered
    pub poll_time: Duration,
    /// Interval at which a decided election re-announces its result to lagging peers
    pub consensus_received_check_time: Duration,
    /// Longest a decided election keeps re-announcing its result
    pub max_consensus_received_check_time: Duration,
    /// Interval at which state queries are re-sent during resync
    pub resync_time: Duration,
    /// Longest a resync may gather peer states
    pub max_resync_time: Duration,
    /// Interval at which `wait_item` re-reads the ledger
    pub check_item_time: Duration,
    /// How long items are kept in the node's item cache
    pub max_cache_age: Duration,
    /// Oldest an item may be when it is registered
    pub max_item_creation_age: Duration,
    /// How long a revoked record is kept
    pub revoked_item_expiration: Duration,
    /// How long a declined record is kept
    pub declined_item_expiration: Duration,
    /// Sub-items of a complex item that must be known (or resolved by resync) before the
    /// unknown rest is resynced and the parent considered resolvable
    pub known_sub_contracts_to_resync: usize,
}

impl NodeConfig {
    /// Default timing with the given thresholds
    #[must_use]
    pub fn with_thresholds(thresholds: ConsensusThresholds) -> Self {
        Self {
            thresholds,
            max_elections_time: DEFAULT_MAX_ELECTIONS_TIME,
            poll_time: DEFAULT_POLL_TIME,
            consensus_received_check_time: DEFAULT_CONSENSUS_RECEIVED_CHECK_TIME,
            max_consensus_received_check_time: DEFAULT_MAX_CONSENSUS_RECEIVED_CHECK_TIME,
            resync_time: DEFAULT_RESYNC_TIME,
            max_resync_time: DEFAULT_MAX_RESYNC_TIME,
            check_item_time: DEFAULT_CHECK_ITEM_TIME,
            max_cache_age: DEFAULT_MAX_CACHE_AGE,
            max_item_creation_age: DEFAULT_MAX_ITEM_CREATION_AGE,
            revoked_item_expiration: DEFAULT_MAX_ITEM_CREATION_AGE
                + DEFAULT_REVOKED_ITEM_EXTRA_EXPIRATION,
            declined_item_expiration: DEFAULT_DECLINED_ITEM_EXPIRATION,
            known_sub_contracts_to_resync: 1,
        }
    }

    /// Default configuration for a network of `nodes_count` voting nodes
    #[must_use]
    pub fn for_network_size(nodes_count: usize) -> Self {
        Self::with_thresholds(ConsensusThresholds::for_network_size(nodes_count))
    }

    /// Check the whole configuration for a network of `nodes_count` voting nodes
    ///
    /// # Errors
    /// Returns the first problem found
    pub fn validate(&self, nodes_count: usize) -> Result<(), ConfigError> {
        self.thresholds.validate(nodes_count)?;
        let durations = [
            ("max_elections_time", self.max_elections_time),
            ("poll_time", self.poll_time),
            (
                "consensus_received_check_time",
                self.consensus_received_check_time,
            ),
            ("resync_time", self.resync_time),
            ("max_resync_time", self.max_resync_time),
            ("check_item_time", self.check_item_time),
        ];
        for (name, duration) in durations {
            if duration.is_zero() {
                return Err(ConfigError::ZeroDuration { name });
            }
        }
        Ok(())
    }
}

/// Contains configuration values for a `quorum` node, as stored on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfigFile {
    /// Positive votes needed to approve
    pub positive_consensus: usize,
    /// Negative votes needed to decline
    pub negative_consensus: usize,
    /// Peer agreement needed to adopt a resynced state
    pub resync_break_consensus: usize,
    /// Election timeout, in milliseconds
    pub max_elections_time: u64,
    /// Vote re-request interval, in milliseconds
    pub poll_time: u64,
    /// Result re-announce interval, in milliseconds
    pub consensus_received_check_time: u64,
    /// Result re-announce window, in milliseconds
    pub max_consensus_received_check_time: u64,
    /// State query re-send interval, in milliseconds
    pub resync_time: u64,
    /// Resync timeout, in milliseconds
    pub max_resync_time: u64,
    /// Ledger re-read interval for waiters, in milliseconds
    pub check_item_time: u64,
    /// Item cache lifetime, in milliseconds
    pub max_cache_age: u64,
    /// Maximum age of a registered item, in milliseconds
    pub max_item_creation_age: u64,
    /// Retention of revoked records, in milliseconds
    pub revoked_item_expiration: u64,
    /// Retention of declined records, in milliseconds
    pub declined_item_expiration: u64,
    /// Known sub-items required before resyncing the rest
    pub known_sub_contracts_to_resync: usize,
}

impl NodeConfigFile {
    /// Read a configuration file
    ///
    /// # Errors
    /// If the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).context(ReadFileSnafu)?;
        Self::from_toml(&contents)
    }

    /// Parse a configuration from TOML
    ///
    /// # Errors
    /// If the text is not a valid configuration
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).context(ParseSnafu)
    }
}

impl Default for NodeConfigFile {
    fn default() -> Self {
        NodeConfig::for_network_size(10).into()
    }
}

/// Milliseconds of a duration, saturating
fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl From<NodeConfigFile> for NodeConfig {
    fn from(val: NodeConfigFile) -> Self {
        NodeConfig {
            thresholds: ConsensusThresholds {
                positive_consensus: val.positive_consensus,
                negative_consensus: val.negative_consensus,
                resync_break_consensus: val.resync_break_consensus,
            },
            max_elections_time: Duration::from_millis(val.max_elections_time),
            poll_time: Duration::from_millis(val.poll_time),
            consensus_received_check_time: Duration::from_millis(
                val.consensus_received_check_time,
            ),
            max_consensus_received_check_time: Duration::from_millis(
                val.max_consensus_received_check_time,
            ),
            resync_time: Duration::from_millis(val.resync_time),
            max_resync_time: Duration::from_millis(val.max_resync_time),
            check_item_time: Duration::from_millis(val.check_item_time),
            max_cache_age: Duration::from_millis(val.max_cache_age),
            max_item_creation_age: Duration::from_millis(val.max_item_creation_age),
            revoked_item_expiration: Duration::from_millis(val.revoked_item_expiration),
            declined_item_expiration: Duration::from_millis(val.declined_item_expiration),
            known_sub_contracts_to_resync: val.known_sub_contracts_to_resync,
        }
    }
}

impl From<NodeConfig> for NodeConfigFile {
    fn from(val: NodeConfig) -> Self {
        NodeConfigFile {
            positive_consensus: val.thresholds.positive_consensus,
            negative_consensus: val.thresholds.negative_consensus,
            resync_break_consensus: val.thresholds.resync_break_consensus,
            max_elections_time: as_millis(val.max_elections_time),
            poll_time: as_millis(val.poll_time),
            consensus_received_check_time: as_millis(val.consensus_received_check_time),
            max_consensus_received_check_time: as_millis(val.max_consensus_received_check_time),
            resync_time: as_millis(val.resync_time),
            max_resync_time: as_millis(val.max_resync_time),
            check_item_time: as_millis(val.check_item_time),
            max_cache_age: as_millis(val.max_cache_age),
            max_item_creation_age: as_millis(val.max_item_creation_age),
            revoked_item_expiration: as_millis(val.revoked_item_expiration),
            declined_item_expiration: as_millis(val.declined_item_expiration),
            known_sub_contracts_to_resync: val.known_sub_contracts_to_resync,
        }
    }
}
