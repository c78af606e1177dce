//! # Escrow Configuration & Constants
//!
//! The fixed protocol windows live here as constants. The handful of knobs an
//! operator may tune are grouped in [`EscrowConfig`], which is deserialized
//! from the node's TOML file and validated before the engine starts.
//!
//! The minimum refund timeout is a floor, not a default: a deployment can
//! require longer timeouts but can never accept anything shorter than
//! [`MIN_TIMEOUT`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Protocol Windows
// ---------------------------------------------------------------------------

/// Shortest refund timeout any escrow may be created with.
pub const MIN_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Longest refund timeout any escrow may be created with. Keeps
/// `created_at + timeout` comfortably inside the representable date range.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Fixed window, measured from creation, before a disputed escrow can be
/// resolved by either party.
pub const DISPUTE_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default cap on the free-form description, in bytes.
pub const MAX_DESCRIPTION_LENGTH: usize = 1024;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Rejected configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `min_timeout_secs` is below the protocol floor.
    #[error("min_timeout_secs {configured} is below the protocol floor of {floor}")]
    TimeoutBelowFloor {
        /// The configured value.
        configured: u64,
        /// The protocol minimum.
        floor: u64,
    },

    /// `max_timeout_secs` is above the protocol ceiling.
    #[error("max_timeout_secs {configured} exceeds the protocol ceiling of {ceiling}")]
    TimeoutAboveCeiling {
        /// The configured value.
        configured: u64,
        /// The protocol maximum.
        ceiling: u64,
    },

    /// `max_timeout_secs` is smaller than `min_timeout_secs`.
    #[error("max_timeout_secs {max} is smaller than min_timeout_secs {min}")]
    InvertedTimeoutRange {
        /// Configured minimum.
        min: u64,
        /// Configured maximum.
        max: u64,
    },

    /// `max_description_len` is zero.
    #[error("max_description_len must be greater than zero")]
    EmptyDescriptionLimit,
}

// ---------------------------------------------------------------------------
// EscrowConfig
// ---------------------------------------------------------------------------

/// Operator-tunable limits applied at escrow creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscrowConfig {
    /// Minimum accepted refund timeout, in seconds.
    pub min_timeout_secs: u64,
    /// Maximum accepted refund timeout, in seconds.
    pub max_timeout_secs: u64,
    /// Maximum description length, in bytes.
    pub max_description_len: usize,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            min_timeout_secs: MIN_TIMEOUT.as_secs(),
            max_timeout_secs: MAX_TIMEOUT.as_secs(),
            max_description_len: MAX_DESCRIPTION_LENGTH,
        }
    }
}

impl EscrowConfig {
    /// Checks the configuration against the protocol floor and internal
    /// consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_timeout_secs < MIN_TIMEOUT.as_secs() {
            return Err(ConfigError::TimeoutBelowFloor {
                configured: self.min_timeout_secs,
                floor: MIN_TIMEOUT.as_secs(),
            });
        }

        if self.max_timeout_secs > MAX_TIMEOUT.as_secs() {
            return Err(ConfigError::TimeoutAboveCeiling {
                configured: self.max_timeout_secs,
                ceiling: MAX_TIMEOUT.as_secs(),
            });
        }

        if self.max_timeout_secs < self.min_timeout_secs {
            return Err(ConfigError::InvertedTimeoutRange {
                min: self.min_timeout_secs,
                max: self.max_timeout_secs,
            });
        }

        if self.max_description_len == 0 {
            return Err(ConfigError::EmptyDescriptionLimit);
        }

        Ok(())
    }

    /// Shortest accepted timeout. Never below [`MIN_TIMEOUT`], even for a
    /// configuration that skipped [`validate`](Self::validate).
    pub fn min_timeout(&self) -> Duration {
        Duration::from_secs(self.min_timeout_secs).max(MIN_TIMEOUT)
    }

    /// Longest accepted timeout. Never above [`MAX_TIMEOUT`].
    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout_secs).min(MAX_TIMEOUT)
    }
}
