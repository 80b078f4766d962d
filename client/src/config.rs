//! Configuration management for the client.

use std::env;
use std::time::Duration;

const DEFAULT_GC_INTERVAL_SECS: u64 = 300;
const DEFAULT_GC_GRACE_PERIOD_SECS: u64 = 24 * 60 * 60;

/// How long tombstoned objects and map entries are kept before garbage
/// collection may remove them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GracePeriod {
    /// Never replaced by the value the server advertises
    Fixed(Duration),
    /// Replaced whenever the server advertises a new value
    Dynamic(Duration),
}

impl GracePeriod {
    pub fn duration(&self) -> Duration {
        match self {
            GracePeriod::Fixed(d) | GracePeriod::Dynamic(d) => *d,
        }
    }

    /// Apply a server-advertised grace period. Returns whether it changed.
    pub fn update(&mut self, advertised: Duration) -> bool {
        match self {
            GracePeriod::Fixed(_) => false,
            GracePeriod::Dynamic(current) => {
                let changed = *current != advertised;
                *current = advertised;
                changed
            }
        }
    }
}

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Prefix of local message ids; unique per session
    pub client_id: String,
    /// How often garbage collection runs
    pub gc_interval: Duration,
    /// Tombstone retention
    pub gc_grace_period: GracePeriod,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            gc_interval: Duration::from_secs(DEFAULT_GC_INTERVAL_SECS),
            gc_grace_period: GracePeriod::Dynamic(Duration::from_secs(
                DEFAULT_GC_GRACE_PERIOD_SECS,
            )),
        }
    }
}

impl Config {
    /// Load `.env` if present, then read the environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let client_id =
            env::var("CONVERGE_CLIENT_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
        if client_id.is_empty() {
            return Err(ConfigError::EmptyClientId);
        }

        let gc_interval: u64 = env::var("CONVERGE_GC_INTERVAL_SECS")
            .unwrap_or_else(|_| DEFAULT_GC_INTERVAL_SECS.to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidGcInterval)?;
        if gc_interval == 0 {
            return Err(ConfigError::InvalidGcInterval);
        }

        let grace: u64 = env::var("CONVERGE_GC_GRACE_PERIOD_SECS")
            .unwrap_or_else(|_| DEFAULT_GC_GRACE_PERIOD_SECS.to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidGcGracePeriod)?;

        let fixed: bool = env::var("CONVERGE_GC_GRACE_FIXED")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidGcGraceFixed)?;

        let grace = Duration::from_secs(grace);
        Ok(Self {
            client_id,
            gc_interval: Duration::from_secs(gc_interval),
            gc_grace_period: if fixed {
                GracePeriod::Fixed(grace)
            } else {
                GracePeriod::Dynamic(grace)
            },
        })
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("CONVERGE_CLIENT_ID must not be empty")]
    EmptyClientId,

    #[error("Invalid CONVERGE_GC_INTERVAL_SECS value")]
    InvalidGcInterval,

    #[error("Invalid CONVERGE_GC_GRACE_PERIOD_SECS value")]
    InvalidGcGracePeriod,

    #[error("Invalid CONVERGE_GC_GRACE_FIXED value")]
    InvalidGcGraceFixed,
}
