use crate::engine::EngineShared;
use crate::file_request::FileRequest;
use crate::temp_memory::TempBlock;
use sluice_base::{StreamError, StreamPriority, StreamTaskType, ALL_TASK_TYPES_MASK};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// Caller owned memory a stream can read into instead of allocating its own buffer
pub type SharedBuffer = Arc<Mutex<Vec<u8>>>;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadFlags {
    // Skip the main thread phase, the async phase becomes the last one
    pub no_sync_callback: bool,
    // The file is known to be loose on disk, don't ask the file source where it lives
    pub file_on_disk: bool,
    // Allocate temporary memory as if the request were urgent
    pub ignore_tmp_out_of_memory: bool,
    // The external buffer must never be read back (e.g. write-combined memory)
    pub write_only_external_buffer: bool,
}

#[derive(Clone, Debug, Default)]
pub struct StreamReadParams {
    pub user_data: u64,
    pub priority: StreamPriority,
    // Desired latency. Requests are grouped by when they are wanted, not only when they arrive.
    pub load_time: Duration,
    // Completing later than this is logged as a late stream. Zero disables the check.
    pub max_load_time: Duration,
    pub buffer: Option<SharedBuffer>,
    pub offset: u64,
    // Zero reads from the offset to the end of the file
    pub size: u64,
    pub flags: ReadFlags,
}

/// Completion notifications for a stream. Each phase fires at most once, also when the stream is
/// aborted or fails.
pub trait StreamCallback: Send + Sync {
    /// Called from a completion thread as soon as the data is ready
    fn stream_async_on_complete(
        &self,
        _stream: &ReadStream,
        _error: Option<StreamError>,
    ) {
    }

    /// Called on the main thread during `StreamEngine::update`, always after the async phase
    fn stream_on_complete(
        &self,
        _stream: &ReadStream,
        _error: Option<StreamError>,
    ) {
    }
}

pub(crate) enum ResultBuffer {
    Internal {
        block: TempBlock,
        offset: usize,
        len: usize,
    },
    External {
        buffer: SharedBuffer,
        len: usize,
    },
}

/// What a finished request hands over to its stream
pub(crate) struct RequestResult {
    pub error: Option<StreamError>,
    pub bytes_read: u64,
    pub buffer: Option<ResultBuffer>,
}

impl RequestResult {
    pub fn failed(error: StreamError) -> Self {
        RequestResult {
            error: Some(error),
            bytes_read: 0,
            buffer: None,
        }
    }
}

struct ReadStreamInner {
    id: u64,
    task_type: StreamTaskType,
    path: String,
    params: StreamReadParams,
    callback: Option<Arc<dyn StreamCallback>>,
    engine: Weak<EngineShared>,
    request: Mutex<Option<Arc<FileRequest>>>,
    priority: AtomicU8,
    error: AtomicU32,
    bytes_read: AtomicU64,
    finished: AtomicBool,
    async_executed: AtomicBool,
    sync_executed: AtomicBool,
    buffer: Mutex<Option<ResultBuffer>>,
    start_time: Instant,
}

/// Handle to an in-flight or completed read. Cloning is cheap, every clone refers to the same
/// stream.
#[derive(Clone)]
pub struct ReadStream {
    inner: Arc<ReadStreamInner>,
}

impl std::fmt::Debug for ReadStream {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ReadStream")
            .field("id", &self.inner.id)
            .field("task_type", &self.inner.task_type)
            .field("path", &self.inner.path)
            .field("finished", &self.is_finished())
            .field("error", &self.error())
            .finish()
    }
}

impl ReadStream {
    pub(crate) fn new(
        id: u64,
        task_type: StreamTaskType,
        path: String,
        callback: Option<Arc<dyn StreamCallback>>,
        params: StreamReadParams,
        engine: Weak<EngineShared>,
    ) -> Self {
        let priority = params.priority;
        ReadStream {
            inner: Arc::new(ReadStreamInner {
                id,
                task_type,
                path,
                params,
                callback,
                engine,
                request: Mutex::new(None),
                priority: AtomicU8::new(priority.rank() as u8),
                error: AtomicU32::new(0),
                bytes_read: AtomicU64::new(0),
                finished: AtomicBool::new(false),
                async_executed: AtomicBool::new(false),
                sync_executed: AtomicBool::new(false),
                buffer: Mutex::new(None),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn task_type(&self) -> StreamTaskType {
        self.inner.task_type
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn params(&self) -> &StreamReadParams {
        &self.inner.params
    }

    pub fn user_data(&self) -> u64 {
        self.inner.params.user_data
    }

    pub fn priority(&self) -> StreamPriority {
        StreamPriority::from_rank(self.inner.priority.load(Ordering::Acquire) as u64)
            .unwrap_or_default()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    pub fn is_error(&self) -> bool {
        self.error().is_some()
    }

    pub fn error(&self) -> Option<StreamError> {
        StreamError::from_code(self.inner.error.load(Ordering::Acquire))
    }

    pub fn error_name(&self) -> &'static str {
        self.error().map(|error| error.name()).unwrap_or("Ok")
    }

    /// Bytes delivered so far. With `wait` set, blocks until the stream finished.
    pub fn bytes_read(
        &self,
        wait: bool,
    ) -> u64 {
        if wait {
            self.wait(None);
        }
        self.inner.bytes_read.load(Ordering::Acquire)
    }

    /// Runs `f` over the delivered bytes. Returns `None` if there is no buffer, either because the
    /// read hasn't completed, it failed, or its temporary memory was released.
    pub fn with_buffer<R, F: FnOnce(&[u8]) -> R>(
        &self,
        f: F,
    ) -> Option<R> {
        let buffer = self.inner.buffer.lock().unwrap();
        match &*buffer {
            Some(ResultBuffer::Internal { block, offset, len }) => {
                Some(f(&block[*offset..*offset + *len]))
            }
            Some(ResultBuffer::External { buffer, len }) => {
                let data = buffer.lock().unwrap();
                let len = (*len).min(data.len());
                Some(f(&data[..len]))
            }
            None => None,
        }
    }

    /// Copy of the delivered bytes
    pub fn buffer(&self) -> Option<Vec<u8>> {
        self.with_buffer(|data| data.to_vec())
    }

    /// Releases the internally allocated buffer early. External buffers are left untouched.
    pub fn free_temporary_memory(&self) {
        let mut buffer = self.inner.buffer.lock().unwrap();
        if let Some(ResultBuffer::Internal { .. }) = &*buffer {
            *buffer = None;
        }
    }

    /// Cancels the read, blocking until no more writes into the stream's buffers can happen. Both
    /// callback phases still run (on this thread if they haven't yet) and report `UserAbort`
    /// unless the stream had already finished. Must be called from the main thread.
    pub fn abort(&self) {
        if let Some(request) = self.request() {
            request.cancel();
        }
        self.finish_aborted(StreamError::UserAbort);
    }

    /// Like `abort`, but returns false instead of blocking if a buffer is currently being written
    pub fn try_abort(&self) -> bool {
        if let Some(request) = self.request() {
            if !request.try_cancel() {
                return false;
            }
        }
        self.finish_aborted(StreamError::UserAbort);
        true
    }

    /// Waits until the stream finished. Returns false if `max_wait` elapsed first. When called on
    /// the main thread, pending main thread callbacks are delivered while waiting.
    pub fn wait(
        &self,
        max_wait: Option<Duration>,
    ) -> bool {
        profiling::scope!("ReadStream::wait");
        let start = Instant::now();
        loop {
            if self.is_finished() {
                return true;
            }

            let poll_interval = match self.inner.engine.upgrade() {
                Some(engine) => {
                    if engine.is_main_thread() {
                        engine.main_thread_finalize(ALL_TASK_TYPES_MASK);
                        if self.is_finished() {
                            return true;
                        }
                    }
                    engine.config().wait_poll_interval
                }
                None => return self.is_finished(),
            };

            if let Some(max_wait) = max_wait {
                if start.elapsed() >= max_wait {
                    return false;
                }
            }

            std::thread::sleep(poll_interval);
        }
    }

    /// Changes the priority of a read that hasn't completed yet
    pub fn set_priority(
        &self,
        priority: StreamPriority,
    ) {
        self.inner
            .priority
            .store(priority.rank() as u8, Ordering::Release);
        if let Some(request) = self.request() {
            request.set_priority(priority);
            if let Some(engine) = self.inner.engine.upgrade() {
                engine.update_job_priority();
            }
        }
    }

    //
    // Engine side
    //
    pub(crate) fn request(&self) -> Option<Arc<FileRequest>> {
        self.inner.request.lock().unwrap().clone()
    }

    pub(crate) fn set_request(
        &self,
        request: Arc<FileRequest>,
    ) {
        *self.inner.request.lock().unwrap() = Some(request);
    }

    pub(crate) fn is_sync_executed(&self) -> bool {
        self.inner.sync_executed.load(Ordering::Acquire)
    }

    fn set_error(
        &self,
        error: StreamError,
    ) -> bool {
        self.inner
            .error
            .compare_exchange(0, error.code(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Takes over the result of the finished request and runs the async phase. Called on a
    /// completion thread.
    pub(crate) fn on_request_complete(
        &self,
        result: RequestResult,
    ) {
        self.inner
            .bytes_read
            .store(result.bytes_read, Ordering::Release);
        if let Some(error) = result.error {
            self.set_error(error);
        }
        *self.inner.buffer.lock().unwrap() = result.buffer;
        *self.inner.request.lock().unwrap() = None;

        // Aborted while the request was finishing, nobody will look at the data
        if self.is_sync_executed() {
            self.free_temporary_memory();
            return;
        }

        self.execute_async_callback();

        if self.inner.params.flags.no_sync_callback {
            self.inner.finished.store(true, Ordering::Release);
            self.check_load_time();
            self.free_temporary_memory();
        }
    }

    pub(crate) fn execute_async_callback(&self) {
        if self.inner.async_executed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(callback) = &self.inner.callback {
            profiling::scope!("StreamCallback::stream_async_on_complete");
            callback.stream_async_on_complete(self, self.error());
        }
    }

    /// Runs the main thread phase (and the async phase first, if it hasn't run yet). Internal
    /// buffers are released once it returns.
    pub(crate) fn execute_sync_callback(&self) {
        self.execute_async_callback();
        if self.inner.sync_executed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.finished.store(true, Ordering::Release);
        if !self.inner.params.flags.no_sync_callback {
            self.check_load_time();
            if let Some(callback) = &self.inner.callback {
                profiling::scope!("StreamCallback::stream_on_complete");
                callback.stream_on_complete(self, self.error());
            }
        }

        self.free_temporary_memory();
    }

    pub(crate) fn finish_aborted(
        &self,
        error: StreamError,
    ) {
        if !self.is_sync_executed() {
            self.set_error(error);
        }

        self.execute_sync_callback();

        if let Some(engine) = self.inner.engine.upgrade() {
            engine.abort_job(self);
        }
    }

    fn check_load_time(&self) {
        let max_load_time = self.inner.params.max_load_time;
        if max_load_time.is_zero() {
            return;
        }

        let elapsed = self.inner.start_time.elapsed();
        if elapsed > max_load_time {
            log::warn!(
                "Stream {} ({}) took {:?}, longer than its maximum load time of {:?}",
                self.inner.path,
                self.inner.task_type,
                elapsed,
                max_load_time
            );
        }
    }
}
