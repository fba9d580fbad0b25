use serde::Deserialize;

use crate::{EngineError, Result, description::DEFAULT_STREAM};

/// When aggregate snapshots are written alongside the events of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SnapshotPolicy {
    pub enabled: bool,
    /// A snapshot is taken whenever a commit crosses a multiple of `every` versions.
    pub every: u64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            every: 1,
        }
    }
}

impl SnapshotPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Returns true if moving an aggregate from version `from` to version `to` should store a
    /// snapshot.
    pub fn should_snapshot(&self, from: u64, to: u64) -> bool {
        if !self.enabled || to <= from {
            return false;
        }
        let every = self.every.max(1);
        to / every > from / every
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    /// Attempts made on a single event before the projection gives up for the current pass.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Maximum number of events read from a stream per projection and pass.
    pub batch_size: usize,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 50,
            batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_stream: String,
    pub max_concurrency_retries: u32,
    pub snapshots: SnapshotPolicy,
    /// Report handlers that yield no events as domain rejections.
    pub reject_empty_yield: bool,
    pub projection: ProjectionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_stream: DEFAULT_STREAM.to_string(),
            max_concurrency_retries: 3,
            snapshots: SnapshotPolicy::default(),
            reject_empty_yield: false,
            projection: ProjectionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parses a JSON document; missing keys keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|source| EngineError::MalformedPayload {
            name: "engine config".to_string(),
            source,
        })
    }

    pub fn with_snapshots(mut self, snapshots: SnapshotPolicy) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn with_max_concurrency_retries(mut self, retries: u32) -> Self {
        self.max_concurrency_retries = retries;
        self
    }
}
