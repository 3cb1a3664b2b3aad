use serde::Serialize;
use sluice_base::StreamTaskType;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct TaskTypeCounters {
    requests: AtomicU64,
    bytes_read: AtomicU64,
}

/// Counters updated by every stage of the engine. Cheap to bump from any thread.
#[derive(Default)]
pub(crate) struct StreamingStatistics {
    requests_started: AtomicU64,
    requests_completed: AtomicU64,
    requests_failed: AtomicU64,
    bytes_read: AtomicU64,
    bytes_decompressed: AtomicU64,
    preemptions: AtomicU64,
    reschedules: AtomicU64,
    out_of_budget_events: AtomicU64,
    verification_failures: AtomicU64,
    per_type: [TaskTypeCounters; StreamTaskType::COUNT],
}

impl StreamingStatistics {
    pub fn request_started(
        &self,
        task_type: StreamTaskType,
    ) {
        self.requests_started.fetch_add(1, Ordering::Relaxed);
        self.per_type[task_type.index()]
            .requests
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_finished(
        &self,
        failed: bool,
    ) {
        if failed {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add_bytes_read(
        &self,
        task_type: StreamTaskType,
        bytes: u64,
    ) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        self.per_type[task_type.index()]
            .bytes_read
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_decompressed(
        &self,
        bytes: u64,
    ) {
        self.bytes_decompressed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn preempted(&self) {
        self.preemptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rescheduled(&self) {
        self.reschedules.fetch_add(1, Ordering::Relaxed);
    }

    pub fn out_of_budget(&self) {
        self.out_of_budget_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn verification_failed(&self) {
        self.verification_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(
        &self,
        in_flight: usize,
        pending_finalize: usize,
        temp_memory: TempMemoryStatistics,
    ) -> StreamingStatisticsSnapshot {
        let per_type = StreamTaskType::ALL
            .iter()
            .map(|task_type| {
                let counters = &self.per_type[task_type.index()];
                TaskTypeStatistics {
                    task_type: *task_type,
                    requests: counters.requests.load(Ordering::Relaxed),
                    bytes_read: counters.bytes_read.load(Ordering::Relaxed),
                }
            })
            .collect();

        StreamingStatisticsSnapshot {
            requests_started: self.requests_started.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_decompressed: self.bytes_decompressed.load(Ordering::Relaxed),
            preemptions: self.preemptions.load(Ordering::Relaxed),
            reschedules: self.reschedules.load(Ordering::Relaxed),
            out_of_budget_events: self.out_of_budget_events.load(Ordering::Relaxed),
            verification_failures: self.verification_failures.load(Ordering::Relaxed),
            in_flight,
            pending_finalize,
            temp_memory,
            per_type,
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, Default)]
pub struct TempMemoryStatistics {
    pub current: usize,
    pub interval_peak: usize,
    pub max: usize,
    pub budget: usize,
    pub out_of_budget: bool,
}

#[derive(Serialize, Debug, Clone)]
pub struct TaskTypeStatistics {
    pub task_type: StreamTaskType,
    pub requests: u64,
    pub bytes_read: u64,
}

/// Point-in-time copy of the engine counters, taken by `StreamEngine::statistics`
#[derive(Serialize, Debug, Clone)]
pub struct StreamingStatisticsSnapshot {
    pub requests_started: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub bytes_read: u64,
    pub bytes_decompressed: u64,
    // Reads that yielded their IO thread to an urgent request
    pub preemptions: u64,
    // Requests handed to another IO thread after their medium was reclassified
    pub reschedules: u64,
    pub out_of_budget_events: u64,
    pub verification_failures: u64,
    pub in_flight: usize,
    pub pending_finalize: usize,
    pub temp_memory: TempMemoryStatistics,
    pub per_type: Vec<TaskTypeStatistics>,
}
