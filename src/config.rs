//! Engine configuration.
//!
//! One struct carries every recognized option, with defaults that suit a
//! 60 Hz LAN game. Construct with struct-update syntax so added fields do
//! not break callers:
//!
//! ```
//! use trailstate::EngineConfig;
//!
//! let config = EngineConfig {
//!     max_players: 4,
//!     trailing_delays: vec![0, 12, 48],
//!     ..EngineConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use web_time::Duration;

use crate::error::EngineError;

/// All recognized engine options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Join requests beyond this population are refused.
    ///
    /// Default: 8
    pub max_players: u32,

    /// Target simulation ticks per second for the timing driver.
    ///
    /// Default: 60
    pub frame_rate_hz: u32,

    /// Frame offsets of the maintained states; must start at 0 and increase
    /// strictly. Deeper trailing states tolerate later corrections at the
    /// cost of memory and rollback re-execution.
    ///
    /// Default: `[0, 30]` (half a second of slack at 60 Hz)
    pub trailing_delays: Vec<i64>,

    /// Frames between desync-check digest broadcasts.
    ///
    /// Default: 256
    pub hash_cadence: i64,

    /// Protocol ping frequency.
    ///
    /// Default: 1 s
    pub ping_interval: Duration,

    /// Total deadline for an acked message; on expiry the remote is dropped.
    ///
    /// Default: 10 s
    pub total_timeout: Duration,

    /// How long a joining client waits for the host before reverting to
    /// unconnected.
    ///
    /// Default: 10 s
    pub join_timeout: Duration,

    /// Window size for ping/throughput statistics.
    ///
    /// Default: 20
    pub sampler_size: usize,

    /// Maximum logic ticks run per clock poll when behind (display updates
    /// may be skipped during a burst, logic frames are never dropped).
    ///
    /// Default: 5
    pub max_catchup: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_players: 8,
            frame_rate_hz: 60,
            trailing_delays: vec![0, 30],
            hash_cadence: 256,
            ping_interval: Duration::from_millis(1000),
            total_timeout: Duration::from_millis(10_000),
            join_timeout: Duration::from_millis(10_000),
            sampler_size: 20,
            max_catchup: 5,
        }
    }
}

impl EngineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for LAN play: shallow trailing delay, tight timeouts.
    #[must_use]
    pub fn lan() -> Self {
        Self {
            trailing_delays: vec![0, 10],
            ping_interval: Duration::from_millis(500),
            total_timeout: Duration::from_millis(5_000),
            join_timeout: Duration::from_millis(5_000),
            ..Self::default()
        }
    }

    /// Preset for direct-IP internet play: deeper trailing delay to absorb
    /// late corrections.
    #[must_use]
    pub fn internet() -> Self {
        Self {
            trailing_delays: vec![0, 20, 50],
            ..Self::default()
        }
    }

    /// Checks internal consistency of the option set.
    pub fn validate(&self) -> Result<(), EngineError> {
        let delays_ok = self.trailing_delays.first() == Some(&0)
            && self.trailing_delays.windows(2).all(|pair| pair[0] < pair[1]);
        if !delays_ok
            || self.max_players == 0
            || self.frame_rate_hz == 0
            || self.hash_cadence <= 0
            || self.sampler_size == 0
        {
            return Err(EngineError::InvalidSessionState);
        }
        Ok(())
    }
}

// #########
// # TESTS #
// #########
