use serde::{Deserialize, Serialize};
use std::error::Error;
use std::path::Path;
use std::time::Duration;

/// On-disk form of the engine configuration. Memory sizes are given in KB, everything is optional
/// and falls back to the defaults of [`StreamEngineConfig`].
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct StreamEngineConfigJson {
    pub page_size_kb: Option<usize>,
    pub decompress_block_size_kb: Option<usize>,
    pub decompress_job_ring_size: Option<usize>,
    pub decompression_thread_count: Option<usize>,
    pub completion_thread_count: Option<usize>,
    pub temp_memory_budget_kb: Option<usize>,
    pub temp_pool_size_kb: Option<usize>,
    pub request_grouping_time_period_ms: Option<u64>,
    pub max_bytes_per_second: Option<u64>,
    pub use_optical_drive_thread: Option<bool>,
    pub headless: Option<bool>,
    pub max_batch_size: Option<usize>,
    pub max_finalize_per_frame: Option<usize>,
    pub out_of_budget_retry_ms: Option<u64>,
    pub wait_poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct StreamEngineConfig {
    // Size of the chunks a file is read in. Preemption and cancellation are checked between pages.
    pub page_size: usize,

    // Compressed pages are cut into blocks of this size before being handed to the decompressor
    pub decompress_block_size: usize,

    // Maximum number of decompression blocks in flight across every request
    pub decompress_job_ring_size: usize,

    pub decompression_thread_count: usize,

    // One completion queue per thread. The first N-1 task types get a dedicated queue.
    pub completion_thread_count: usize,

    // Live temporary memory above which non-urgent allocations stop falling back to the heap
    pub temp_memory_budget: usize,

    // Bounded pool tried before the heap. Zero disables it.
    pub temp_pool_size: usize,

    // Requests created within the same period are grouped together before seek order applies
    pub request_grouping_time_period: Duration,

    // Optional cap on physical read bandwidth, per IO thread
    pub max_bytes_per_second: Option<u64>,

    // Spawn a dedicated thread for optical media
    pub use_optical_drive_thread: bool,

    // A headless engine (dedicated server) refuses all streaming
    pub headless: bool,

    // Requests accepted per start_batch_read call
    pub max_batch_size: usize,

    // Sync callbacks delivered per update. Zero means no limit.
    pub max_finalize_per_frame: usize,

    // How long an IO thread waits for temporary memory to be freed before retrying anyway
    pub out_of_budget_retry: Duration,

    pub wait_poll_interval: Duration,
}

impl Default for StreamEngineConfig {
    fn default() -> Self {
        StreamEngineConfig {
            page_size: 1024 * 1024,
            decompress_block_size: 32 * 1024,
            decompress_job_ring_size: 256,
            decompression_thread_count: 2,
            completion_thread_count: 2,
            temp_memory_budget: 10 * 1024 * 1024,
            temp_pool_size: 4 * 1024 * 1024,
            request_grouping_time_period: Duration::from_millis(2000),
            max_bytes_per_second: None,
            use_optical_drive_thread: false,
            headless: false,
            max_batch_size: 32,
            max_finalize_per_frame: 0,
            out_of_budget_retry: Duration::from_millis(50),
            wait_poll_interval: Duration::from_millis(5),
        }
    }
}

impl StreamEngineConfig {
    pub fn from_json(json: StreamEngineConfigJson) -> Result<Self, Box<dyn Error>> {
        let defaults = StreamEngineConfig::default();
        let config = StreamEngineConfig {
            page_size: json
                .page_size_kb
                .map(|kb| kb * 1024)
                .unwrap_or(defaults.page_size),
            decompress_block_size: json
                .decompress_block_size_kb
                .map(|kb| kb * 1024)
                .unwrap_or(defaults.decompress_block_size),
            decompress_job_ring_size: json
                .decompress_job_ring_size
                .unwrap_or(defaults.decompress_job_ring_size),
            decompression_thread_count: json
                .decompression_thread_count
                .unwrap_or(defaults.decompression_thread_count),
            completion_thread_count: json
                .completion_thread_count
                .unwrap_or(defaults.completion_thread_count),
            temp_memory_budget: json
                .temp_memory_budget_kb
                .map(|kb| kb * 1024)
                .unwrap_or(defaults.temp_memory_budget),
            temp_pool_size: json
                .temp_pool_size_kb
                .map(|kb| kb * 1024)
                .unwrap_or(defaults.temp_pool_size),
            request_grouping_time_period: json
                .request_grouping_time_period_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_grouping_time_period),
            max_bytes_per_second: json.max_bytes_per_second.or(defaults.max_bytes_per_second),
            use_optical_drive_thread: json
                .use_optical_drive_thread
                .unwrap_or(defaults.use_optical_drive_thread),
            headless: json.headless.unwrap_or(defaults.headless),
            max_batch_size: json.max_batch_size.unwrap_or(defaults.max_batch_size),
            max_finalize_per_frame: json
                .max_finalize_per_frame
                .unwrap_or(defaults.max_finalize_per_frame),
            out_of_budget_retry: json
                .out_of_budget_retry_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.out_of_budget_retry),
            wait_poll_interval: json
                .wait_poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.wait_poll_interval),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self, Box<dyn Error>> {
        let config_file: StreamEngineConfigJson = serde_json::from_str(json)?;
        Self::from_json(config_file)
    }

    pub fn read_from_path(path: &Path) -> Result<Self, Box<dyn Error>> {
        let file_contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&file_contents)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.page_size == 0 {
            return Err("page_size must be non-zero".to_string());
        }

        if self.decompress_block_size == 0 || self.decompress_block_size > self.page_size {
            return Err(format!(
                "decompress_block_size must be between 1 and the page size ({})",
                self.page_size
            ));
        }

        if self.decompress_job_ring_size == 0 {
            return Err("decompress_job_ring_size must be non-zero".to_string());
        }

        if self.decompression_thread_count == 0 || self.completion_thread_count == 0 {
            return Err("decompression and completion thread counts must be non-zero".to_string());
        }

        if self.max_batch_size == 0 {
            return Err("max_batch_size must be non-zero".to_string());
        }

        if self.max_bytes_per_second == Some(0) {
            return Err("max_bytes_per_second must be non-zero when set".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_defaults() {
        let config = StreamEngineConfig::from_json_str("{}").unwrap();
        let defaults = StreamEngineConfig::default();
        assert_eq!(config.page_size, defaults.page_size);
        assert_eq!(config.decompress_job_ring_size, 256);
        assert_eq!(config.max_batch_size, 32);
    }

    #[test]
    fn memory_sizes_are_in_kb() {
        let config = StreamEngineConfig::from_json_str(
            r#"{ "temp_memory_budget_kb": 2048, "page_size_kb": 64, "decompress_block_size_kb": 16 }"#,
        )
        .unwrap();
        assert_eq!(config.temp_memory_budget, 2 * 1024 * 1024);
        assert_eq!(config.page_size, 64 * 1024);
        assert_eq!(config.decompress_block_size, 16 * 1024);
    }

    #[test]
    fn block_larger_than_page_is_rejected() {
        let result = StreamEngineConfig::from_json_str(
            r#"{ "page_size_kb": 16, "decompress_block_size_kb": 32 }"#,
        );
        assert!(result.is_err());
    }
}
