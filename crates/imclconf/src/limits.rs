//! Bounds, thresholds and telemetry settings for the control plane.

use serde::{Deserialize, Serialize};

/// Queue, buffer and drain bounds applied to every container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Capacity of each recurring-buffer and external-port queue.
    /// Default: 16
    #[serde(default = "LimitsConfig::default_queue_depth")]
    pub queue_depth: usize,

    /// Capacity of the shared intra-container queue.
    /// Default: 64
    #[serde(default = "LimitsConfig::default_intra_queue_depth")]
    pub intra_queue_depth: usize,

    /// Intents a port accepts when its metadata does not say otherwise.
    /// Default: 8
    #[serde(default = "LimitsConfig::default_intents_per_port")]
    pub intents_per_port: usize,

    /// Stale-size recurring buffers discarded before giving up.
    /// Default: 1000
    #[serde(default = "LimitsConfig::default_recurring_retry_limit")]
    pub recurring_retry_limit: u32,

    /// Messages handled per queue per poll cycle.
    /// Default: 50
    #[serde(default = "LimitsConfig::default_drain_limit")]
    pub drain_limit: u32,

    /// Bytes the general buffer manager may have outstanding.
    /// Default: 1 MiB
    #[serde(default = "LimitsConfig::default_general_pool_bytes")]
    pub general_pool_bytes: usize,

    /// Fixed nodes in the low-power-safe pool.
    /// Default: 32
    #[serde(default = "LimitsConfig::default_island_pool_nodes")]
    pub island_pool_nodes: usize,

    /// Largest payload a low-power-safe node can hold.
    /// Default: 512
    #[serde(default = "LimitsConfig::default_island_node_bytes")]
    pub island_node_bytes: usize,
}

impl LimitsConfig {
    fn default_queue_depth() -> usize {
        16
    }

    fn default_intra_queue_depth() -> usize {
        64
    }

    fn default_intents_per_port() -> usize {
        8
    }

    fn default_recurring_retry_limit() -> u32 {
        1000
    }

    fn default_drain_limit() -> u32 {
        50
    }

    fn default_general_pool_bytes() -> usize {
        1024 * 1024
    }

    fn default_island_pool_nodes() -> usize {
        32
    }

    fn default_island_node_bytes() -> usize {
        512
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            queue_depth: Self::default_queue_depth(),
            intra_queue_depth: Self::default_intra_queue_depth(),
            intents_per_port: Self::default_intents_per_port(),
            recurring_retry_limit: Self::default_recurring_retry_limit(),
            drain_limit: Self::default_drain_limit(),
            general_pool_bytes: Self::default_general_pool_bytes(),
            island_pool_nodes: Self::default_island_pool_nodes(),
            island_node_bytes: Self::default_island_node_bytes(),
        }
    }
}

/// When and how graph commands leave the container thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffloadConfig {
    /// Containers with a stack at or below this size offload.
    /// Default: 16 KiB
    #[serde(default = "OffloadConfig::default_stack_threshold_bytes")]
    pub stack_threshold_bytes: usize,

    /// Containers with a frame period below this offload.
    /// Default: 1000 us
    #[serde(default = "OffloadConfig::default_frame_threshold_us")]
    pub frame_threshold_us: u64,

    /// Worker threads per pool.
    /// Default: 1
    #[serde(default = "OffloadConfig::default_worker_threads")]
    pub worker_threads: usize,

    /// Stack size given to worker threads.
    /// Default: 256 KiB
    #[serde(default = "OffloadConfig::default_worker_stack_bytes")]
    pub worker_stack_bytes: usize,

    /// Jobs a pool queues before rejecting pushes.
    /// Default: 4
    #[serde(default = "OffloadConfig::default_job_queue_depth")]
    pub job_queue_depth: usize,
}

impl OffloadConfig {
    fn default_stack_threshold_bytes() -> usize {
        16 * 1024
    }

    fn default_frame_threshold_us() -> u64 {
        1000
    }

    fn default_worker_threads() -> usize {
        1
    }

    fn default_worker_stack_bytes() -> usize {
        256 * 1024
    }

    fn default_job_queue_depth() -> usize {
        4
    }
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            stack_threshold_bytes: Self::default_stack_threshold_bytes(),
            frame_threshold_us: Self::default_frame_threshold_us(),
            worker_threads: Self::default_worker_threads(),
            worker_stack_bytes: Self::default_worker_stack_bytes(),
            job_queue_depth: Self::default_job_queue_depth(),
        }
    }
}

/// Log verbosity handed to whatever subscriber the host installs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Default: "info"
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}
