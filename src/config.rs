//! Tunable knobs for the reactor, gathered in one place instead of scattered
//! as magic numbers through the poller, connector and connection modules.

use std::time::Duration;

/// Name of the environment variable that overrides the requested io_uring
/// submission/completion queue depth.
pub const IORING_ENTRIES_VAR: &str = "RINGLOOP_IORING_ENTRIES";

/// Parameters for [`crate::poller::Poller`].
#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    /// Requested ring depth, before probing down on `-ENOMEM`.
    pub entries_default: u32,
    /// Smallest ring depth the poller will retry with before giving up.
    pub entries_min: u32,
    /// Max completions drained per `poll()` call.
    pub batch_limit: u32,
    /// Soft wall-clock budget (microseconds) for draining a completion
    /// batch once the first completion has arrived.
    pub time_budget_us: u64,
    /// Number of buffers in the provided-buffer group used for multishot
    /// receive.
    pub provided_buffer_count: u16,
    /// Size in bytes of each provided buffer.
    pub provided_buffer_len: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        let mut config = PollerConfig {
            entries_default: 32768,
            entries_min: 1024,
            batch_limit: 1024,
            time_budget_us: 1000,
            provided_buffer_count: 64,
            provided_buffer_len: 64 * 1024,
        };
        if let Some(requested) = Self::entries_from_env() {
            config.entries_default = config.clamp_entries(requested);
        }
        config
    }
}

impl PollerConfig {
    /// Reads [`IORING_ENTRIES_VAR`] from the environment. Invalid or zero
    /// values are treated as "unset"; [`Default::default`] clamps whatever
    /// this returns into `[entries_min, entries_default]` ceiling/floor
    /// before it's used anywhere.
    fn entries_from_env() -> Option<u32> {
        std::env::var(IORING_ENTRIES_VAR)
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|&n| n != 0)
    }

    /// Clamps a requested entry count into this config's supported range.
    pub fn clamp_entries(&self, requested: u32) -> u32 {
        requested.clamp(self.entries_min, self.entries_default.max(self.entries_min))
    }
}

/// Parameters for [`crate::connector::Connector`] backoff.
#[derive(Debug, Clone, Copy)]
pub struct ConnectorConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        ConnectorConfig {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Default high-water mark applied to a [`crate::connection::Connection`]'s
/// output buffer when the embedder does not set one explicitly. The spec
/// does not mandate a default; 64 MiB is chosen so existing integrations
/// that never call `set_high_water_mark` never see `on_high_water` fire.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Minimum reserved prefix of an [`crate::buffer::IoBuffer`], large enough
/// to prepend an 8-byte length header in place.
pub const IO_BUFFER_RESERVED_PREFIX: usize = 8;

/// Initial growth size used when an [`crate::buffer::IoBuffer`] is created.
pub const IO_BUFFER_INITIAL_LEN: usize = 1024;

/// Size of the on-stack scratch buffer used by scatter reads to absorb
/// bursts larger than the buffer's current writable window.
pub const SCATTER_READ_SCRATCH_LEN: usize = 64 * 1024;

/// Backlog passed to `listen(2)` by the acceptor.
pub const LISTEN_BACKLOG: i32 = 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_entries_respects_floor_and_ceiling() {
        let config = PollerConfig {
            entries_min: 1024,
            entries_default: 32768,
            ..PollerConfig::default()
        };
        assert_eq!(config.clamp_entries(1), 1024);
        assert_eq!(config.clamp_entries(1_000_000), 32768);
        assert_eq!(config.clamp_entries(4096), 4096);
    }

    #[test]
    fn default_config_clamps_env_override() {
        // entries_from_env() is consulted by Default::default(); the
        // unset/invalid path (no env var present here) must still produce
        // a ring depth inside [entries_min, entries_default ceiling].
        let config = PollerConfig::default();
        assert_eq!(config.clamp_entries(config.entries_default), config.entries_default);
    }
}
