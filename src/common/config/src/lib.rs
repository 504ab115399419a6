//! Configuration management for Weft.
//!
//! Provides the caller-facing query options (degree of parallelism, execution
//! mode, merge buffering) and the tuning constants used by the partitioned
//! execution engine.

use std::sync::OnceLock;

use common_error::{QueryError, QueryResult};
use serde::{Deserialize, Serialize};

/// Largest degree of parallelism a query may request.
pub const MAX_SUPPORTED_DOP: usize = 512;

/// Hot loops poll the cancellation token when `counter & mask == 0`.
pub const DEFAULT_CANCELLATION_CHECK_INTERVAL: usize = 64;

/// Default chunk size for striped sources, chunked iterators and channels.
pub const DEFAULT_CHUNK_SIZE: usize = 128;

/// Per-producer element count at which the ordered pipelined merge blocks a producer.
pub const DEFAULT_PRODUCER_BUFFER_LIMIT: usize = 8192;

/// Number of chunks an asynchronous channel can hold before the producer blocks.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 512;

/// Query-level options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct QueryOptions {
    /// Number of partitions/worker tasks. `None` means the machine default.
    pub degree_of_parallelism: Option<usize>,
    /// Whether the engine may fall back to a single partition.
    pub execution_mode: ExecutionMode,
    /// How much output the merge may buffer before the consumer sees it.
    pub merge_options: MergeOptions,
    /// Tuning constants.
    pub tuning: TuningConfig,
}

impl QueryOptions {
    /// Set the degree of parallelism.
    #[must_use]
    pub fn with_degree_of_parallelism(mut self, dop: usize) -> Self {
        self.degree_of_parallelism = Some(dop);
        self
    }

    /// Set the execution mode.
    #[must_use]
    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    /// Set the merge options.
    #[must_use]
    pub fn with_merge_options(mut self, options: MergeOptions) -> Self {
        self.merge_options = options;
        self
    }

    /// Replace the tuning constants.
    #[must_use]
    pub fn with_tuning(mut self, tuning: TuningConfig) -> Self {
        self.tuning = tuning;
        self
    }

    /// The degree of parallelism to run with.
    pub fn effective_degree_of_parallelism(&self) -> usize {
        self.degree_of_parallelism
            .unwrap_or_else(default_degree_of_parallelism)
    }

    /// Check every option for a usable value.
    pub fn validate(&self) -> QueryResult<()> {
        if let Some(dop) = self.degree_of_parallelism {
            if dop == 0 || dop > MAX_SUPPORTED_DOP {
                return Err(QueryError::invalid_parameter(format!(
                    "degree of parallelism must be in 1..={MAX_SUPPORTED_DOP}, got {dop}"
                )));
            }
        }
        self.tuning.validate()
    }
}

/// Execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ExecutionMode {
    /// The engine may run a query on one partition when its shape limits parallelism.
    #[default]
    Default,
    /// Always run with the requested degree of parallelism.
    ForceParallelism,
}

/// Output buffering policy for the final merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MergeOptions {
    /// Hand each element to the consumer as soon as possible.
    NotBuffered,
    /// Buffer in chunks (pipelined).
    #[default]
    AutoBuffered,
    /// Produce the whole output before the consumer sees any of it.
    FullyBuffered,
}

/// Tuning constants of the partitioned execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    /// Element count between cancellation polls. Must be a power of two.
    pub cancellation_check_interval: usize,
    /// Chunk size for striping, chunked iteration and channels.
    pub chunk_size: usize,
    /// Queued elements per producer before the ordered pipelined merge blocks it.
    pub producer_buffer_limit: usize,
    /// Chunks an asynchronous channel holds before its producer blocks.
    pub channel_capacity: usize,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            cancellation_check_interval: DEFAULT_CANCELLATION_CHECK_INTERVAL,
            chunk_size: DEFAULT_CHUNK_SIZE,
            producer_buffer_limit: DEFAULT_PRODUCER_BUFFER_LIMIT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl TuningConfig {
    /// The process-wide default tuning, immutable after first use.
    pub fn global() -> &'static Self {
        static DEFAULT: OnceLock<TuningConfig> = OnceLock::new();
        DEFAULT.get_or_init(Self::default)
    }

    /// Mask applied to loop counters; the token is polled when `counter & mask == 0`.
    pub const fn cancellation_check_mask(&self) -> usize {
        self.cancellation_check_interval - 1
    }

    /// Set the chunk size.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the producer buffer limit.
    #[must_use]
    pub fn with_producer_buffer_limit(mut self, limit: usize) -> Self {
        self.producer_buffer_limit = limit;
        self
    }

    /// Set the channel capacity in chunks.
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set the cancellation check interval.
    #[must_use]
    pub fn with_cancellation_check_interval(mut self, interval: usize) -> Self {
        self.cancellation_check_interval = interval;
        self
    }

    /// Check the constants for usable values.
    pub fn validate(&self) -> QueryResult<()> {
        if !self.cancellation_check_interval.is_power_of_two() {
            return Err(QueryError::invalid_parameter(format!(
                "cancellation check interval must be a power of two, got {}",
                self.cancellation_check_interval
            )));
        }
        if self.chunk_size == 0 {
            return Err(QueryError::invalid_parameter("chunk size must be positive"));
        }
        if self.producer_buffer_limit == 0 {
            return Err(QueryError::invalid_parameter(
                "producer buffer limit must be positive",
            ));
        }
        if self.channel_capacity == 0 {
            return Err(QueryError::invalid_parameter(
                "channel capacity must be positive",
            ));
        }
        Ok(())
    }
}

/// Machine default degree of parallelism: core count capped at [`MAX_SUPPORTED_DOP`].
pub fn default_degree_of_parallelism() -> usize {
    static DOP: OnceLock<usize> = OnceLock::new();
    *DOP.get_or_init(|| {
        std::thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .min(MAX_SUPPORTED_DOP)
    })
}
