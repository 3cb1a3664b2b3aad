use crate::archive::FileSource;
use crate::codec::{Codec, DeflateCodec};
use crate::completion::{CompletionDispatcher, CompletionSender, FinishedQueue};
use crate::config::StreamEngineConfig;
use crate::context::StreamContext;
use crate::decompress::{DecompressSender, DecompressionPipeline};
use crate::file_request::{FileRequest, FileRequestDesc, RequestStatePool};
use crate::io_worker::{IoWorker, IoWorkerShared};
use crate::listener::{ListenerSlot, StreamEngineListener};
use crate::read_stream::{ReadStream, StreamCallback, StreamReadParams};
use crate::statistics::{StreamingStatistics, StreamingStatisticsSnapshot, TempMemoryStatistics};
use crate::temp_memory::TempMemoryBudget;
use sluice_base::hashing::HashMap;
use sluice_base::{MediaType, StreamError, StreamPriority, StreamTaskType, ALL_TASK_TYPES_MASK};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// One entry of `StreamEngine::start_batch_read`
pub struct StreamReadBatchParams {
    pub task_type: StreamTaskType,
    pub path: String,
    pub callback: Option<Arc<dyn StreamCallback>>,
    pub params: Option<StreamReadParams>,
}

struct EngineThreads {
    io_workers: Vec<IoWorker>,
    decompression: DecompressionPipeline,
    completion: CompletionDispatcher,
}

impl EngineThreads {
    // Stops producers before consumers so every request still reaches completion
    fn finish(self) {
        for io_worker in self.io_workers {
            io_worker.finish();
        }
        self.decompression.finish();
        self.completion.finish();
    }
}

pub(crate) struct EngineShared {
    ctx: StreamContext,
    request_pool: Arc<RequestStatePool>,
    finished: Arc<FinishedQueue>,
    listener: ListenerSlot,
    // Hdd first, it takes whatever no other worker is registered for
    io_workers: Vec<Arc<IoWorkerShared>>,
    threads: Mutex<Option<EngineThreads>>,
    // Every stream whose main thread phase hasn't run yet
    streams: Mutex<HashMap<u64, ReadStream>>,
    paused_streams: Mutex<Vec<ReadStream>>,
    pause_mask: AtomicU32,
    read_group_depth: AtomicU32,
    shut_down: AtomicBool,
    finalizing: AtomicBool,
    next_stream_id: AtomicU64,
    epoch: Instant,
    main_thread: ThreadId,
    last_interval_peak: AtomicUsize,
    last_out_of_budget: AtomicBool,
}

impl EngineShared {
    pub fn config(&self) -> &StreamEngineConfig {
        &self.ctx.config
    }

    pub fn is_main_thread(&self) -> bool {
        std::thread::current().id() == self.main_thread
    }

    fn worker_for(
        &self,
        media_type: MediaType,
    ) -> &Arc<IoWorkerShared> {
        self.io_workers
            .iter()
            .find(|worker| worker.media_type() == media_type)
            .unwrap_or(&self.io_workers[0])
    }

    /// Runs the main thread phase of finished streams of the given types, in completion order.
    /// Streams of other types, and any past the per-frame cap, stay queued in front.
    pub fn main_thread_finalize(
        &self,
        type_mask: u32,
    ) {
        // A callback that waits on another stream ends up here again
        if self.finalizing.swap(true, Ordering::AcqRel) {
            return;
        }

        profiling::scope!("StreamEngine::main_thread_finalize");
        let max_per_frame = self.ctx.config.max_finalize_per_frame;
        let mut finished = self.finished.take_all();
        let mut deferred = VecDeque::default();
        let mut finalized = 0;
        while let Some(stream) = finished.pop_front() {
            let over_cap = max_per_frame != 0 && finalized >= max_per_frame;
            if over_cap || !stream.task_type().is_in_mask(type_mask) {
                deferred.push_back(stream);
                continue;
            }

            if stream.error() == Some(StreamError::VerificationFailed) {
                log::warn!(
                    "Stream {} ({}) failed verification, the data on the medium is corrupt",
                    stream.path(),
                    stream.task_type()
                );
            }

            stream.execute_sync_callback();
            self.streams.lock().unwrap().remove(&stream.id());
            finalized += 1;
        }

        self.finished.requeue_front(deferred);
        self.finalizing.store(false, Ordering::Release);
    }

    /// Forgets a stream that was aborted by its owner
    pub fn abort_job(
        &self,
        stream: &ReadStream,
    ) {
        self.streams.lock().unwrap().remove(&stream.id());
        self.finished.remove(stream.id());
        self.paused_streams
            .lock()
            .unwrap()
            .retain(|paused| paused.id() != stream.id());
    }

    pub fn update_job_priority(&self) {
        for worker in &self.io_workers {
            worker.need_sorting();
        }
    }

    fn start_stream(
        &self,
        stream: &ReadStream,
        start_immediately: bool,
    ) {
        let params = stream.params();
        let source = &self.ctx.source;
        let desc = FileRequestDesc {
            path: stream.path().to_string(),
            task_type: stream.task_type(),
            priority: stream.priority(),
            offset: params.offset,
            size: params.size,
            flags: params.flags,
            external_buffer: params.buffer.clone(),
            load_time: params.load_time,
            disk_offset: source.file_offset_on_media(stream.path()),
            created_ms: self.epoch.elapsed().as_millis() as u64,
        };

        let request = FileRequest::new(stream.id(), desc, Some(stream.clone()), &self.request_pool);
        stream.set_request(request.clone());
        self.ctx.stats.request_started(stream.task_type());

        if let Some(listener) = &*self.listener.read().unwrap() {
            listener.on_stream_enqueue(stream);
        }

        let media_type = request.classify_media(source.as_ref());
        log::trace!(
            "Queueing {} ({}, {:?}) on the {} IO thread",
            stream.path(),
            stream.task_type(),
            stream.priority(),
            media_type.name()
        );
        self.worker_for(media_type)
            .add_request(request, start_immediately);
    }

    fn temp_memory_statistics(&self) -> TempMemoryStatistics {
        let temp_memory = &self.ctx.temp_memory;
        TempMemoryStatistics {
            current: temp_memory.allocated(),
            interval_peak: self.last_interval_peak.load(Ordering::Acquire),
            max: temp_memory.max_allocated(),
            budget: temp_memory.budget(),
            out_of_budget: self.last_out_of_budget.load(Ordering::Acquire),
        }
    }
}

/// Entry point for asynchronous reads. Requests are queued on one IO thread per storage medium,
/// decompressed on a thread pool and reported through [`StreamCallback`]s: once from a completion
/// thread and once from the thread calling [`StreamEngine::update`].
///
/// The engine must be created, updated and shut down from the same thread.
pub struct StreamEngine {
    shared: Arc<EngineShared>,
}

impl StreamEngine {
    pub fn new(
        config: StreamEngineConfig,
        source: Arc<dyn FileSource>,
    ) -> Result<Self, String> {
        Self::with_codec(config, source, Arc::new(DeflateCodec::default()))
    }

    pub fn with_codec(
        config: StreamEngineConfig,
        source: Arc<dyn FileSource>,
        codec: Arc<dyn Codec>,
    ) -> Result<Self, String> {
        config.validate()?;
        log::info!(
            "Starting stream engine: {} byte pages, {} byte decompression blocks, {} byte temporary memory budget",
            config.page_size,
            config.decompress_block_size,
            config.temp_memory_budget
        );

        let (completion, completion_receivers) =
            CompletionSender::new(config.completion_thread_count);
        let (decompress, job_rx) = DecompressSender::new(config.decompress_job_ring_size);
        let ctx = StreamContext {
            temp_memory: TempMemoryBudget::new(config.temp_memory_budget, config.temp_pool_size),
            config: Arc::new(config),
            source,
            codec,
            stats: Arc::new(StreamingStatistics::default()),
            completion,
            decompress,
        };

        let mut io_workers = vec![IoWorkerShared::new(MediaType::Hdd)];
        if ctx.config.use_optical_drive_thread {
            io_workers.push(IoWorkerShared::new(MediaType::Disc));
        }
        io_workers.push(IoWorkerShared::new(MediaType::Memory));
        for worker in &io_workers {
            for fallback in &io_workers {
                if !Arc::ptr_eq(worker, fallback) {
                    worker.register_fallback(fallback);
                }
            }
        }

        let finished = Arc::new(FinishedQueue::default());
        let request_pool = Arc::new(RequestStatePool::default());
        let listener: ListenerSlot = Arc::new(RwLock::new(None));

        let completion = CompletionDispatcher::new(
            completion_receivers,
            finished.clone(),
            request_pool.clone(),
            listener.clone(),
        )
        .map_err(|e| format!("Could not start completion threads: {}", e))?;

        let decompression =
            match DecompressionPipeline::new(job_rx, &ctx, ctx.config.decompression_thread_count)
            {
                Ok(decompression) => decompression,
                Err(e) => {
                    completion.finish();
                    return Err(format!("Could not start decompression threads: {}", e));
                }
            };

        let mut io_threads = Vec::with_capacity(io_workers.len());
        for worker in &io_workers {
            match IoWorker::new(worker.clone(), ctx.clone()) {
                Ok(io_thread) => io_threads.push(io_thread),
                Err(e) => {
                    EngineThreads {
                        io_workers: io_threads,
                        decompression,
                        completion,
                    }
                    .finish();
                    return Err(format!(
                        "Could not start the {} IO thread: {}",
                        worker.media_type().name(),
                        e
                    ));
                }
            }
        }

        let shared = Arc::new(EngineShared {
            ctx,
            request_pool,
            finished,
            listener,
            io_workers,
            threads: Mutex::new(Some(EngineThreads {
                io_workers: io_threads,
                decompression,
                completion,
            })),
            streams: Mutex::new(HashMap::default()),
            paused_streams: Mutex::new(Vec::default()),
            pause_mask: AtomicU32::new(0),
            read_group_depth: AtomicU32::new(0),
            shut_down: AtomicBool::new(false),
            finalizing: AtomicBool::new(false),
            next_stream_id: AtomicU64::new(1),
            epoch: Instant::now(),
            main_thread: std::thread::current().id(),
            last_interval_peak: AtomicUsize::new(0),
            last_out_of_budget: AtomicBool::new(false),
        });

        Ok(StreamEngine { shared })
    }

    pub fn config(&self) -> &StreamEngineConfig {
        self.shared.config()
    }

    /// The temporary memory the engine reads through. Callers may allocate from it too, their
    /// allocations count against the same budget.
    pub fn temp_memory(&self) -> &TempMemoryBudget {
        &self.shared.ctx.temp_memory
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }

    pub fn set_listener(
        &self,
        listener: Option<Arc<dyn StreamEngineListener>>,
    ) {
        *self.shared.listener.write().unwrap() = listener;
    }

    /// Starts an asynchronous read of `path`. Without `params` the read is urgent, reads the whole
    /// file and fires both callback phases.
    ///
    /// Returns `None` if the engine is shut down or running headless.
    ///
    /// Panics if `path` is empty.
    #[profiling::function]
    pub fn start_read(
        &self,
        task_type: StreamTaskType,
        path: &str,
        callback: Option<Arc<dyn StreamCallback>>,
        params: Option<StreamReadParams>,
    ) -> Option<ReadStream> {
        assert!(!path.is_empty(), "start_read called with an empty path");

        if self.shared.config().headless {
            log::warn!("Ignoring read of {} in headless mode", path);
            return None;
        }

        if self.is_shut_down() {
            log::warn!("Ignoring read of {}, the stream engine is shut down", path);
            return None;
        }

        let params = params.unwrap_or_else(|| StreamReadParams {
            priority: StreamPriority::Urgent,
            ..Default::default()
        });

        let id = self.shared.next_stream_id.fetch_add(1, Ordering::AcqRel);
        let stream = ReadStream::new(
            id,
            task_type,
            path.to_string(),
            callback,
            params,
            Arc::downgrade(&self.shared),
        );
        self.shared
            .streams
            .lock()
            .unwrap()
            .insert(id, stream.clone());

        if task_type.is_in_mask(self.pause_mask()) {
            log::debug!("Streaming of {} is paused, parking {}", task_type, path);
            self.shared
                .paused_streams
                .lock()
                .unwrap()
                .push(stream.clone());
            return Some(stream);
        }

        let start_immediately = self.shared.read_group_depth.load(Ordering::Acquire) == 0;
        self.shared.start_stream(&stream, start_immediately);
        Some(stream)
    }

    /// Starts up to `max_batch_size` reads as one read group. The pre-request callback runs once,
    /// before any of them is queued.
    pub fn start_batch_read(
        &self,
        mut requests: Vec<StreamReadBatchParams>,
        pre_request_callback: Option<&mut dyn FnMut()>,
    ) -> Vec<ReadStream> {
        let max_batch_size = self.shared.config().max_batch_size;
        if requests.len() > max_batch_size {
            log::warn!(
                "start_batch_read called with {} requests, only the first {} are started",
                requests.len(),
                max_batch_size
            );
            requests.truncate(max_batch_size);
        }

        if let Some(pre_request_callback) = pre_request_callback {
            pre_request_callback();
        }

        self.begin_read_group();
        let streams = requests
            .into_iter()
            .filter_map(|request| {
                self.start_read(
                    request.task_type,
                    &request.path,
                    request.callback,
                    request.params,
                )
            })
            .collect();
        self.end_read_group();

        streams
    }

    /// Reads started until the matching `end_read_group` are only scheduled when the group ends,
    /// so they are sorted together. Groups nest.
    pub fn begin_read_group(&self) {
        self.shared.read_group_depth.fetch_add(1, Ordering::AcqRel);
    }

    pub fn end_read_group(&self) {
        let previous = self.shared.read_group_depth.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |depth| depth.checked_sub(1),
        );

        match previous {
            Ok(1) => {
                for worker in &self.shared.io_workers {
                    worker.signal_start_work(false);
                }
            }
            Ok(_) => {}
            Err(_) => log::warn!("end_read_group called without a matching begin_read_group"),
        }
    }

    /// Pauses or resumes streaming of the task types in `type_mask`. Reads started for a paused
    /// type are held back and queued once the type is resumed.
    pub fn pause_streaming(
        &self,
        pause: bool,
        type_mask: u32,
    ) {
        if pause {
            self.shared.pause_mask.fetch_or(type_mask, Ordering::AcqRel);
            return;
        }

        let pause_mask = self
            .shared
            .pause_mask
            .fetch_and(!type_mask, Ordering::AcqRel)
            & !type_mask;

        let resumed: Vec<_> = {
            let mut paused_streams = self.shared.paused_streams.lock().unwrap();
            let (resumed, still_paused): (Vec<ReadStream>, Vec<ReadStream>) = paused_streams
                .drain(..)
                .partition(|stream| !stream.task_type().is_in_mask(pause_mask));
            *paused_streams = still_paused;
            resumed
        };

        if !resumed.is_empty() {
            log::debug!("Resuming {} paused streams", resumed.len());
        }

        let start_immediately = self.shared.read_group_depth.load(Ordering::Acquire) == 0;
        for stream in resumed {
            if !stream.is_finished() {
                self.shared.start_stream(&stream, start_immediately);
            }
        }
    }

    pub fn pause_mask(&self) -> u32 {
        self.shared.pause_mask.load(Ordering::Acquire)
    }

    /// Stops starting new physical reads. Queued requests are kept.
    pub fn pause_io(
        &self,
        pause: bool,
    ) {
        log::debug!("{} IO", if pause { "Pausing" } else { "Resuming" });
        for worker in &self.shared.io_workers {
            worker.pause(pause);
        }
    }

    /// Runs the main thread phase of every finished stream. Call once per frame.
    pub fn update(&self) {
        self.update_types(ALL_TASK_TYPES_MASK);
    }

    /// Like `update`, but only finalizes streams of the task types in `type_mask`
    pub fn update_types(
        &self,
        type_mask: u32,
    ) {
        profiling::scope!("StreamEngine::update");
        self.shared.main_thread_finalize(type_mask);

        let temp_memory = &self.shared.ctx.temp_memory;
        self.shared
            .last_interval_peak
            .store(temp_memory.take_interval_peak(), Ordering::Release);
        self.shared
            .last_out_of_budget
            .store(temp_memory.take_out_of_budget(), Ordering::Release);
    }

    /// Blocks until every started stream finished, updating while waiting. With `abort_all` set,
    /// queued reads are aborted first and parked streams are dropped.
    pub fn update_and_wait(
        &self,
        abort_all: bool,
    ) {
        profiling::scope!("StreamEngine::update_and_wait");
        if abort_all {
            for worker in &self.shared.io_workers {
                worker.abort_all(StreamError::UserAbort);
            }

            let parked = std::mem::take(&mut *self.shared.paused_streams.lock().unwrap());
            for stream in parked {
                stream.finish_aborted(StreamError::UserAbort);
            }
        }

        if self
            .shared
            .io_workers
            .iter()
            .any(|worker| worker.is_paused())
        {
            log::warn!("update_and_wait called while IO is paused");
        }

        loop {
            // Staged requests of an open read group would otherwise never be picked up
            for worker in &self.shared.io_workers {
                worker.signal_start_work(true);
            }
            self.update();

            let outstanding = self.shared.streams.lock().unwrap().len();
            let parked = self.shared.paused_streams.lock().unwrap().len();
            if outstanding <= parked {
                break;
            }

            std::thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn statistics(&self) -> StreamingStatisticsSnapshot {
        let outstanding = self.shared.streams.lock().unwrap().len();
        let pending_finalize = self.shared.finished.len();
        self.shared.ctx.stats.snapshot(
            outstanding.saturating_sub(pending_finalize),
            pending_finalize,
            self.shared.temp_memory_statistics(),
        )
    }

    /// Aborts everything still queued, waits for in-flight work, and delivers the remaining
    /// callbacks with `AbortedOnShutdown`. Called on drop.
    pub fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        log::info!("Shutting down stream engine");
        for worker in &self.shared.io_workers {
            worker.pause(false);
            worker.abort_all(StreamError::AbortedOnShutdown);
        }

        if let Some(threads) = self.shared.threads.lock().unwrap().take() {
            threads.finish();
        }

        while !self.shared.finished.is_empty() {
            self.shared.main_thread_finalize(ALL_TASK_TYPES_MASK);
            if self.shared.finalizing.load(Ordering::Acquire) {
                // Shut down from inside a callback, the outer finalize delivers the rest
                break;
            }
        }

        let parked = std::mem::take(&mut *self.shared.paused_streams.lock().unwrap());
        for stream in parked {
            stream.finish_aborted(StreamError::AbortedOnShutdown);
        }

        self.shared.request_pool.flush();
        log::info!("Stream engine shut down");
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
