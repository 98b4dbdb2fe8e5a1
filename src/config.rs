//! In-memory configuration surface.
//!
//! Loading these values from a file or environment is explicitly out of
//! scope (see the crate root docs) — this module only defines the shapes and
//! their documented defaults, plus a fluent builder for tests and call sites
//! that want to override a handful of fields, in the same shape the rate
//! limiter and idempotency plugins use for their own `Config`/`Builder` pairs.

use std::path::PathBuf;
use std::time::Duration;

/// Default retry back-off table, in order of attempt index.
pub fn default_retry_intervals() -> Vec<Duration> {
    [20, 200, 1_000, 5_000, 10_000, 30_000, 60_000, 120_000]
        .into_iter()
        .map(Duration::from_millis)
        .collect()
}

/// Per-attempt bandwidth requirements the copy engine holds a replica to.
#[derive(Clone, Debug)]
pub struct BandwidthConfiguration {
    /// Minimum sustained throughput before `CopyBandwidthTimeout` fires.
    pub minimum_speed_mb_per_sec: f64,
    /// Deadline for the first byte to arrive.
    pub time_to_first_byte: Duration,
    /// Absolute wall-clock deadline for the whole copy, regardless of bandwidth.
    pub absolute_timeout: Duration,
}

impl BandwidthConfiguration {
    fn for_attempt(attempt: usize) -> Self {
        // Aggressive on early attempts, relaxed as the engine falls back to
        // being willing to wait out a slow-but-alive peer.
        let profiles = [
            (6.0, 2_000, 10_000),
            (4.0, 3_000, 20_000),
            (2.0, 5_000, 45_000),
            (1.0, 8_000, 90_000),
        ];
        let (mbps, ttfb_ms, abs_ms) = profiles[attempt.min(profiles.len() - 1)];
        Self {
            minimum_speed_mb_per_sec: mbps,
            time_to_first_byte: Duration::from_millis(ttfb_ms),
            absolute_timeout: Duration::from_millis(abs_ms),
        }
    }

    /// The fallback profile used once the global retry count passes half of
    /// `MaxRetryCount`, or for any attempt index not otherwise configured.
    pub fn default_profile() -> Self {
        Self {
            minimum_speed_mb_per_sec: 1.0,
            time_to_first_byte: Duration::from_millis(10_000),
            absolute_timeout: Duration::from_millis(120_000),
        }
    }
}

/// Selects a [`BandwidthConfiguration`] for a given attempt, honoring the
/// documented fall-through to the default profile past the retry midpoint.
pub struct BandwidthSelector {
    configurations: Vec<BandwidthConfiguration>,
}

impl BandwidthSelector {
    pub fn new(configurations: Vec<BandwidthConfiguration>) -> Self {
        Self { configurations }
    }

    pub fn default_table() -> Self {
        Self::new((0..4).map(BandwidthConfiguration::for_attempt).collect())
    }

    /// `attempt` is the per-pass attempt index; `total_retries` and
    /// `max_retry_count` implement the "attempt index forced to -1 past the
    /// halfway point" rule.
    pub fn select(&self, attempt: usize, total_retries: u32, max_retry_count: u32) -> BandwidthConfiguration {
        if total_retries as f64 > max_retry_count as f64 / 2.0 {
            return BandwidthConfiguration::default_profile();
        }
        self.configurations
            .get(attempt)
            .cloned()
            .unwrap_or_else(BandwidthConfiguration::default_profile)
    }
}

/// Engine-wide tunables; defaults mirror the design's documented values.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub copy_attempts_with_restricted_replicas: usize,
    pub restricted_copy_replica_count: usize,
    /// `-1` (the BuildXL-lineage default) means "always eligible" — any
    /// non-negative observed size clears the parallel-hashing boundary.
    pub parallel_hashing_file_size_boundary: i64,
    /// `-1` (the default) means trusted hashing is used for every copy.
    pub trusted_hash_file_size_boundary: i64,
    pub max_retry_count: u32,
    pub retry_intervals: Vec<Duration>,
    pub put_cache_ttl: Duration,
    pub workspace: PathBuf,
}

impl EngineConfig {
    pub fn use_trusted_hash(&self, size: Option<u64>) -> bool {
        match size {
            Some(size) => size as i64 >= self.trusted_hash_file_size_boundary,
            None => true,
        }
    }

    pub fn use_parallel_hashing(&self, bytes_so_far: u64) -> bool {
        bytes_so_far as i64 >= self.parallel_hashing_file_size_boundary
    }

    pub fn max_replica_count(&self, attempt: usize, total_candidates: usize) -> usize {
        if attempt < self.copy_attempts_with_restricted_replicas {
            self.restricted_copy_replica_count.min(total_candidates)
        } else {
            total_candidates
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            copy_attempts_with_restricted_replicas: 0,
            restricted_copy_replica_count: 3,
            parallel_hashing_file_size_boundary: -1,
            trusted_hash_file_size_boundary: -1,
            max_retry_count: 32,
            retry_intervals: default_retry_intervals(),
            put_cache_ttl: Duration::from_secs(5 * 60),
            workspace: std::env::temp_dir(),
        }
    }
}

/// Builder for [`EngineConfig`].
pub struct EngineConfigBuilder(EngineConfig);

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self(EngineConfig::default())
    }

    pub fn workspace(mut self, path: impl Into<PathBuf>) -> Self {
        self.0.workspace = path.into();
        self
    }

    pub fn max_retry_count(mut self, n: u32) -> Self {
        self.0.max_retry_count = n;
        self
    }

    pub fn retry_intervals(mut self, intervals: Vec<Duration>) -> Self {
        self.0.retry_intervals = intervals;
        self
    }

    pub fn restricted_copy_replica_count(mut self, n: usize) -> Self {
        self.0.restricted_copy_replica_count = n;
        self
    }

    pub fn copy_attempts_with_restricted_replicas(mut self, n: usize) -> Self {
        self.0.copy_attempts_with_restricted_replicas = n;
        self
    }

    pub fn put_cache_ttl(mut self, ttl: Duration) -> Self {
        self.0.put_cache_ttl = ttl;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.0
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Admission-control tunables for the copy scheduler.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub max_concurrent_pulls: usize,
    pub max_concurrent_pushes: usize,
    pub admission_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_pulls: 16,
            max_concurrent_pushes: 8,
            admission_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bandwidth_falls_through_to_default_past_retry_midpoint() {
        let selector = BandwidthSelector::default_table();
        let normal = selector.select(0, 1, 32);
        let default = BandwidthConfiguration::default_profile();
        assert_ne!(normal.minimum_speed_mb_per_sec, default.minimum_speed_mb_per_sec);

        let forced_default = selector.select(0, 17, 32);
        assert_eq!(
            forced_default.minimum_speed_mb_per_sec,
            default.minimum_speed_mb_per_sec
        );
    }

    #[test]
    fn restricted_replica_count_applies_to_early_attempts_only() {
        let cfg = EngineConfigBuilder::new()
            .copy_attempts_with_restricted_replicas(2)
            .restricted_copy_replica_count(3)
            .build();
        assert_eq!(cfg.max_replica_count(0, 10), 3);
        assert_eq!(cfg.max_replica_count(1, 10), 3);
        assert_eq!(cfg.max_replica_count(2, 10), 10);
    }

    #[test]
    fn trusted_hash_boundary_default_is_always_eligible() {
        let cfg = EngineConfig::default();
        assert!(cfg.use_trusted_hash(Some(0)));
        assert!(cfg.use_trusted_hash(Some(u64::MAX)));
    }
}
