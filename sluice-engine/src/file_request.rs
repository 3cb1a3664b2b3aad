use crate::archive::{read_exact_at, EntryMetadata, FileSource, OpenedFile};
use crate::codec::{Codec, InflateStatus, InflateStream};
use crate::context::StreamContext;
use crate::decompress::DecompressBlock;
use crate::read_stream::{ReadFlags, ReadStream, RequestResult, ResultBuffer, SharedBuffer};
use crate::temp_memory::{TempBlock, TempMemoryBudget};
use sluice_base::{MediaType, StreamError, StreamPriority, StreamResult, StreamTaskType};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

// Sort key layout, most significant first:
// priority (4 bits) | time group (20 bits) | sweep (10 bits) | disk offset in KB (30 bits)
pub(crate) const SORT_KEY_PRIORITY_SHIFT: u32 = 60;
pub(crate) const SORT_KEY_TIME_GROUP_SHIFT: u32 = 40;
pub(crate) const SORT_KEY_SWEEP_SHIFT: u32 = 30;
const SORT_KEY_TIME_GROUP_MASK: u64 = (1 << 20) - 1;
const SORT_KEY_SWEEP_MASK: u64 = (1 << 10) - 1;
const SORT_KEY_OFFSET_MASK: u64 = (1 << 30) - 1;
const SORT_KEY_GROUP_SWEEP_MASK: u64 = (SORT_KEY_TIME_GROUP_MASK << 10) | SORT_KEY_SWEEP_MASK;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum RequestState {
    NotReady,
    InQueue,
    Reading,
    Decompressing,
    Validating,
    Done,
    Failed,
}

impl RequestState {
    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(value: u8) -> RequestState {
        match value {
            1 => RequestState::InQueue,
            2 => RequestState::Reading,
            3 => RequestState::Decompressing,
            4 => RequestState::Validating,
            5 => RequestState::Done,
            6 => RequestState::Failed,
            _ => RequestState::NotReady,
        }
    }
}

/// Result of one pass of the page reader
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    Finished,
    Preempted,
    Failed(StreamError),
}

/// Everything the caller decided about a read before it was queued
pub(crate) struct FileRequestDesc {
    pub path: String,
    pub task_type: StreamTaskType,
    pub priority: StreamPriority,
    pub offset: u64,
    pub size: u64,
    pub flags: ReadFlags,
    pub external_buffer: Option<SharedBuffer>,
    pub load_time: Duration,
    pub disk_offset: u64,
    pub created_ms: u64,
}

#[cfg(test)]
impl FileRequestDesc {
    pub fn new(
        path: &str,
        task_type: StreamTaskType,
    ) -> Self {
        FileRequestDesc {
            path: path.to_string(),
            task_type,
            priority: StreamPriority::Normal,
            offset: 0,
            size: 0,
            flags: ReadFlags::default(),
            external_buffer: None,
            load_time: Duration::ZERO,
            disk_offset: 0,
            created_ms: 0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ScratchConsumer {
    Read,
    Decompress,
}

/// Buffer holding the compressed bytes of a request. The IO thread writes pages into it and the
/// decompressor reads blocks out of it; whichever consumer releases it last frees the memory.
/// Every page has its own lock, so filling one page never waits on blocks inflating from another.
pub(crate) struct ScratchBuffer {
    pages: Vec<RwLock<Option<Vec<u8>>>>,
    page_size: usize,
    charge: Mutex<Option<TempBlock>>,
    users: AtomicU32,
    read_released: AtomicBool,
    decompress_released: AtomicBool,
}

impl ScratchBuffer {
    pub fn new(
        mut block: TempBlock,
        page_size: usize,
    ) -> Arc<Self> {
        let page_size = page_size.max(1);
        let pages = block
            .take_pages(page_size)
            .into_iter()
            .map(|page| RwLock::new(Some(page)))
            .collect();

        Arc::new(ScratchBuffer {
            pages,
            page_size,
            charge: Mutex::new(Some(block)),
            users: AtomicU32::new(2),
            read_released: AtomicBool::new(false),
            decompress_released: AtomicBool::new(false),
        })
    }

    // Ranges never cross a page boundary
    fn locate(
        &self,
        begin: usize,
        end: usize,
    ) -> (usize, std::ops::Range<usize>) {
        let page_index = begin / self.page_size;
        let offset = begin - page_index * self.page_size;
        (page_index, offset..offset + end.saturating_sub(begin))
    }

    /// Runs `f` on `begin..end`. Returns None once freed or if the range doesn't fit in one page.
    pub fn write<R, F: FnOnce(&mut [u8]) -> R>(
        &self,
        begin: usize,
        end: usize,
        f: F,
    ) -> Option<R> {
        let (page_index, range) = self.locate(begin, end);
        let mut page = self.pages.get(page_index)?.write().unwrap();
        page.as_mut().and_then(|data| data.get_mut(range)).map(f)
    }

    pub fn read<R, F: FnOnce(&[u8]) -> R>(
        &self,
        begin: usize,
        end: usize,
        f: F,
    ) -> Option<R> {
        let (page_index, range) = self.locate(begin, end);
        let page = self.pages.get(page_index)?.read().unwrap();
        page.as_ref().and_then(|data| data.get(range)).map(f)
    }

    /// Each consumer releases once, repeated calls are ignored. Returns true if this call freed
    /// the memory.
    pub fn release(
        &self,
        consumer: ScratchConsumer,
    ) -> bool {
        let released = match consumer {
            ScratchConsumer::Read => &self.read_released,
            ScratchConsumer::Decompress => &self.decompress_released,
        };

        if released.swap(true, Ordering::AcqRel) {
            return false;
        }

        if self.users.fetch_sub(1, Ordering::AcqRel) == 1 {
            for page in &self.pages {
                *page.write().unwrap() = None;
            }
            *self.charge.lock().unwrap() = None;
            true
        } else {
            false
        }
    }

    pub fn is_freed(&self) -> bool {
        self.charge.lock().unwrap().is_none()
    }
}

pub(crate) enum OutputBuffer {
    Internal(TempBlock),
    External(SharedBuffer),
}

/// Per-request bookkeeping of the IO side. Boxed instances are recycled through
/// [`RequestStatePool`].
#[derive(Default)]
pub(crate) struct ReadState {
    metadata: EntryMetadata,
    configured: bool,
    compressed: bool,
    stream_in_place: bool,
    blocked: bool,
    page_size: usize,
    page_read_start: u64,
    page_read_current: u64,
    page_read_end: u64,
    // Requested range within the uncompressed data
    result_offset: u64,
    result_size: u64,
    validate_crc: bool,
    read_hasher: Option<crc32fast::Hasher>,
    output_allocated: bool,
    scratch: Option<Arc<ScratchBuffer>>,
    last_block_pushed: bool,
}

impl ReadState {
    pub fn reset(&mut self) {
        *self = ReadState::default();
    }
}

struct DecompressStream {
    stream: Box<dyn InflateStream>,
    // Budget charge for the codec state, only taken for multi-page entries
    _reservation: Option<TempBlock>,
}

#[derive(Default)]
pub(crate) struct DecompressState {
    queue: VecDeque<DecompressBlock>,
    job_active: bool,
    stream: Option<DecompressStream>,
    scratch: Option<Arc<ScratchBuffer>>,
    bytes_decompressed: u64,
    expected_size: u64,
    expected_crc: Option<u32>,
    hasher: Option<crc32fast::Hasher>,
    stream_ended: bool,
}

impl DecompressState {
    // Inflates one block of input into `output` at the running offset
    fn inflate_into(
        &mut self,
        mut input: &[u8],
        output: &mut [u8],
        write_only_output: bool,
    ) -> Result<u64, String> {
        let mut produced = 0;
        // Lets the codec consume trailing end-of-stream bits once the output is full
        let mut spill = [0u8; 1];
        while !input.is_empty() && !self.stream_ended {
            let offset = self.bytes_decompressed as usize;
            let output_full = offset >= output.len();
            let destination: &mut [u8] = if output_full {
                &mut spill
            } else {
                &mut output[offset..]
            };

            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| "codec state was released".to_string())?;
            let progress = stream
                .stream
                .inflate(input, destination, write_only_output)
                .map_err(|e| e.to_string())?;

            if output_full && progress.bytes_out > 0 {
                return Err("decompressed data overflows the output buffer".to_string());
            }

            if let Some(hasher) = self.hasher.as_mut() {
                hasher.update(&destination[..progress.bytes_out]);
            }
            self.bytes_decompressed += progress.bytes_out as u64;
            produced += progress.bytes_out as u64;
            input = &input[progress.bytes_in..];

            if progress.status == InflateStatus::StreamEnd {
                self.stream_ended = true;
            } else if progress.bytes_in == 0 && progress.bytes_out == 0 {
                return Err("decompressor stalled".to_string());
            }
        }

        Ok(produced)
    }
}

/// Free list of request bookkeeping, reused before allocating new instances and flushed when the
/// engine shuts down
#[derive(Default)]
pub(crate) struct RequestStatePool {
    free: Mutex<Vec<Box<ReadState>>>,
}

impl RequestStatePool {
    pub fn allocate(&self) -> Box<ReadState> {
        self.free.lock().unwrap().pop().unwrap_or_default()
    }

    pub fn release(
        &self,
        mut state: Box<ReadState>,
    ) {
        state.reset();
        self.free.lock().unwrap().push(state);
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    pub fn flush(&self) {
        self.free.lock().unwrap().clear();
    }
}

/// One read of one file range. Shared between the IO thread servicing it, the decompression
/// pipeline and the completion dispatcher; the caller sees it through its [`ReadStream`].
pub(crate) struct FileRequest {
    id: u64,
    desc: FileRequestDesc,
    stream: Option<ReadStream>,
    state: AtomicU8,
    error: AtomicU32,
    priority: AtomicU8,
    media_type: AtomicU8,
    sort_key: AtomicU64,
    sort_key_computed: AtomicBool,
    out_of_budget: AtomicBool,
    // Read stage, plus the decompress stage once the entry turns out to be compressed
    outstanding_stages: AtomicU32,
    // Held while writing into an external buffer so that cancellation can wait for writers
    read_lock: Mutex<()>,
    decompress_lock: Mutex<()>,
    read_state: Mutex<Option<Box<ReadState>>>,
    output: Mutex<Option<OutputBuffer>>,
    decompress: Mutex<DecompressState>,
    result: Mutex<Option<RequestResult>>,
}

impl FileRequest {
    pub fn new(
        id: u64,
        desc: FileRequestDesc,
        stream: Option<ReadStream>,
        pool: &RequestStatePool,
    ) -> Arc<Self> {
        let priority = desc.priority;
        Arc::new(FileRequest {
            id,
            desc,
            stream,
            state: AtomicU8::new(RequestState::NotReady.to_u8()),
            error: AtomicU32::new(0),
            priority: AtomicU8::new(priority.rank() as u8),
            media_type: AtomicU8::new(0),
            sort_key: AtomicU64::new(0),
            sort_key_computed: AtomicBool::new(false),
            out_of_budget: AtomicBool::new(false),
            outstanding_stages: AtomicU32::new(1),
            read_lock: Mutex::new(()),
            decompress_lock: Mutex::new(()),
            read_state: Mutex::new(Some(pool.allocate())),
            output: Mutex::new(None),
            decompress: Mutex::new(DecompressState::default()),
            result: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.desc.path
    }

    pub fn task_type(&self) -> StreamTaskType {
        self.desc.task_type
    }

    pub fn stream(&self) -> Option<&ReadStream> {
        self.stream.as_ref()
    }

    pub fn state(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(
        &self,
        state: RequestState,
    ) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    pub fn priority(&self) -> StreamPriority {
        StreamPriority::from_rank(self.priority.load(Ordering::Acquire) as u64)
            .unwrap_or_default()
    }

    pub fn set_priority(
        &self,
        priority: StreamPriority,
    ) {
        self.priority
            .store(priority.rank() as u8, Ordering::Release);
        self.invalidate_sort_key();
    }

    /// Allowed to allocate temporary memory past the budget
    pub fn ignores_budget(&self) -> bool {
        self.priority().is_urgent() || self.desc.flags.ignore_tmp_out_of_memory
    }

    pub fn is_out_of_budget(&self) -> bool {
        self.out_of_budget.load(Ordering::Acquire)
    }

    pub fn set_out_of_budget(
        &self,
        out_of_budget: bool,
    ) {
        self.out_of_budget.store(out_of_budget, Ordering::Release);
    }

    //
    // Errors
    //
    pub fn error(&self) -> Option<StreamError> {
        StreamError::from_code(self.error.load(Ordering::Acquire))
    }

    pub fn is_failed(&self) -> bool {
        self.error.load(Ordering::Acquire) != 0
    }

    pub fn is_cancelled(&self) -> bool {
        self.error() == Some(StreamError::UserAbort)
    }

    /// Records the error unless one was recorded before. Returns true if this call set it.
    pub fn fail(
        &self,
        error: StreamError,
    ) -> bool {
        let first = self
            .error
            .compare_exchange(0, error.code(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            log::debug!("Request {} ({}) failed: {}", self.id, self.desc.path, error);
            self.set_state(RequestState::Failed);
        }
        first
    }

    /// Fails the request with `UserAbort`. Blocks until nobody is writing into the external buffer.
    pub fn cancel(&self) {
        if self.desc.external_buffer.is_some() {
            let _read_guard = self.read_lock.lock().unwrap();
            let _decompress_guard = self.decompress_lock.lock().unwrap();
            self.fail(StreamError::UserAbort);
        } else {
            self.fail(StreamError::UserAbort);
        }
    }

    /// Non-blocking `cancel`. Returns false if the external buffer is being written right now.
    pub fn try_cancel(&self) -> bool {
        if self.desc.external_buffer.is_some() {
            let _read_guard = match self.read_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => return false,
            };
            let _decompress_guard = match self.decompress_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => return false,
            };
            self.fail(StreamError::UserAbort);
        } else {
            self.fail(StreamError::UserAbort);
        }
        true
    }

    //
    // Scheduling
    //
    pub fn media_type(&self) -> Option<MediaType> {
        MediaType::from_u8(self.media_type.load(Ordering::Acquire))
    }

    /// Classifies the medium once and caches it
    pub fn classify_media(
        &self,
        source: &dyn FileSource,
    ) -> MediaType {
        if let Some(media_type) = self.media_type() {
            return media_type;
        }

        let media_type = if self.desc.flags.file_on_disk {
            MediaType::Hdd
        } else {
            match source.media_type(&self.desc.path) {
                MediaType::Unknown => MediaType::Hdd,
                media_type => media_type,
            }
        };

        self.media_type
            .store(media_type.to_u8(), Ordering::Release);
        media_type
    }

    pub fn set_media_type(
        &self,
        media_type: MediaType,
    ) {
        self.media_type
            .store(media_type.to_u8(), Ordering::Release);
        self.invalidate_sort_key();
    }

    pub fn sort_key(&self) -> u64 {
        self.sort_key.load(Ordering::Acquire)
    }

    pub fn invalidate_sort_key(&self) {
        self.sort_key_computed.store(false, Ordering::Release);
    }

    /// Computes the key the IO thread orders its queue by, smallest first. The key is kept until
    /// invalidated.
    ///
    /// `current_key_in_progress` is the key of the request the IO thread is servicing. A request of
    /// the same priority that would sort before it is moved into the next sweep so the disk head
    /// keeps moving forward instead of being pulled back by every new arrival.
    pub fn compute_sort_key(
        &self,
        current_key_in_progress: u64,
        grouping_period: Duration,
    ) -> u64 {
        if self.sort_key_computed.load(Ordering::Acquire) {
            return self.sort_key();
        }

        let priority_bits = self.priority().rank() << SORT_KEY_PRIORITY_SHIFT;
        let key = if self.media_type() == Some(MediaType::Memory) {
            priority_bits
        } else {
            let period_ms = (grouping_period.as_millis() as u64).max(1);
            let wanted_at_ms = self.desc.created_ms + self.desc.load_time.as_millis() as u64;
            let time_group = (wanted_at_ms / period_ms) & SORT_KEY_TIME_GROUP_MASK;
            let offset_kb = (self.desc.disk_offset >> 10) & SORT_KEY_OFFSET_MASK;
            let mut key =
                priority_bits | (time_group << SORT_KEY_TIME_GROUP_SHIFT) | offset_kb;

            let same_priority = (key >> SORT_KEY_PRIORITY_SHIFT)
                == (current_key_in_progress >> SORT_KEY_PRIORITY_SHIFT);
            if same_priority && key < current_key_in_progress {
                // Time group and sweep are adjacent, a full sweep counter carries into the group
                let group_and_sweep =
                    (current_key_in_progress >> SORT_KEY_SWEEP_SHIFT) & SORT_KEY_GROUP_SWEEP_MASK;
                let next = group_and_sweep + 1;
                key = if next > SORT_KEY_GROUP_SWEEP_MASK {
                    current_key_in_progress
                } else {
                    priority_bits | (next << SORT_KEY_SWEEP_SHIFT) | offset_kb
                };
            }

            key
        };

        self.sort_key.store(key, Ordering::Release);
        self.sort_key_computed.store(true, Ordering::Release);
        key
    }

    /// Lowers the request to `Preempted` so it resumes right after the urgent work it yielded to
    pub fn preempt(&self) {
        self.set_priority(StreamPriority::Preempted);
        self.set_state(RequestState::InQueue);
    }

    //
    // Reading
    //
    fn with_read_state<R, F: FnOnce(&mut ReadState) -> R>(
        &self,
        f: F,
    ) -> Option<R> {
        let mut read_state = self.read_state.lock().unwrap();
        read_state.as_mut().map(|state| f(state))
    }

    /// Resolves page bounds and buffer strategy from the entry metadata. Only the first call has
    /// an effect.
    pub fn configure_read(
        &self,
        metadata: EntryMetadata,
        page_size: usize,
    ) -> StreamResult<()> {
        let external_len = self
            .desc
            .external_buffer
            .as_ref()
            .map(|buffer| buffer.lock().unwrap().len() as u64);

        let result = self.with_read_state(|state| {
            if state.configured {
                return Ok(false);
            }

            let full_size = metadata.uncompressed_size;
            if self.desc.offset > full_size {
                return Err(StreamError::OffsetOutOfRange);
            }

            let result_size = if self.desc.size == 0 {
                full_size - self.desc.offset
            } else {
                self.desc.size
            };

            if self.desc.offset + result_size > full_size {
                return Err(StreamError::SizeOutOfRange);
            }

            if let Some(external_len) = external_len {
                if external_len < result_size {
                    return Err(StreamError::SizeOutOfRange);
                }
            }

            state.metadata = metadata;
            state.result_offset = self.desc.offset;
            state.result_size = result_size;
            state.compressed = metadata.is_compressed;
            state.validate_crc =
                metadata.crc32.is_some() && self.desc.offset == 0 && result_size == full_size;

            if state.compressed {
                // Inflating has to start at the beginning of the stream
                state.page_read_start = 0;
                state.page_read_end = metadata.compressed_size;
                state.blocked = metadata.compressed_size > page_size as u64;
                state.stream_in_place = match external_len {
                    Some(external_len) => {
                        !self.desc.flags.write_only_external_buffer
                            && self.desc.offset == 0
                            && external_len >= full_size
                    }
                    None => false,
                };
            } else {
                state.page_read_start = self.desc.offset;
                state.page_read_end = self.desc.offset + result_size;
                if state.validate_crc {
                    state.read_hasher = Some(crc32fast::Hasher::new());
                }
            }
            state.page_read_current = state.page_read_start;
            state.page_size = page_size;
            state.configured = true;
            Ok(state.compressed)
        });

        match result {
            Some(Ok(true)) => {
                self.outstanding_stages.fetch_add(1, Ordering::AcqRel);
                let mut decompress = self.decompress.lock().unwrap();
                decompress.expected_size = metadata.uncompressed_size;
                if self.desc.offset == 0 && metadata.crc32.is_some() {
                    decompress.expected_crc = metadata.crc32;
                    decompress.hasher = Some(crc32fast::Hasher::new());
                }
                Ok(())
            }
            Some(Ok(false)) => Ok(()),
            Some(Err(error)) => Err(error),
            None => Err(StreamError::CannotStartReading),
        }
    }

    /// Allocates every buffer the read needs, all or nothing. Only the first successful call has an
    /// effect.
    pub fn allocate_output(
        &self,
        temp_memory: &TempMemoryBudget,
        codec: &dyn Codec,
    ) -> StreamResult<()> {
        profiling::scope!("FileRequest::allocate_output");
        let urgent = self.ignores_budget();
        let alloc = |size: u64| {
            temp_memory
                .temp_alloc(size as usize, urgent, true, 1)
                .ok_or(StreamError::OutOfMemory)
        };

        let mut read_state = self.read_state.lock().unwrap();
        let state = read_state
            .as_mut()
            .ok_or(StreamError::CannotStartReading)?;
        if state.output_allocated {
            return Ok(());
        }

        let (scratch, output, stream) = if state.compressed {
            let scratch = alloc(state.metadata.compressed_size)?;
            let output = if state.stream_in_place {
                match &self.desc.external_buffer {
                    Some(buffer) => OutputBuffer::External(buffer.clone()),
                    None => OutputBuffer::Internal(alloc(state.metadata.uncompressed_size)?),
                }
            } else {
                OutputBuffer::Internal(alloc(state.metadata.uncompressed_size)?)
            };
            let stream = if state.blocked {
                Some(DecompressStream {
                    stream: codec.create_stream(),
                    _reservation: Some(alloc(codec.state_size() as u64)?),
                })
            } else {
                None
            };
            (Some(ScratchBuffer::new(scratch, state.page_size)), output, stream)
        } else {
            let output = match &self.desc.external_buffer {
                Some(buffer) => OutputBuffer::External(buffer.clone()),
                None => OutputBuffer::Internal(alloc(state.result_size)?),
            };
            (None, output, None)
        };

        if let Some(scratch) = &scratch {
            let mut decompress = self.decompress.lock().unwrap();
            decompress.scratch = Some(scratch.clone());
            decompress.stream = stream;
        }
        state.scratch = scratch;
        *self.output.lock().unwrap() = Some(output);
        state.output_allocated = true;
        Ok(())
    }

    /// Reads the remaining pages. Before every page the read stops if the request failed, or
    /// yields if `should_yield` reports urgent work. The page cursor survives so a later call
    /// resumes where this one stopped.
    pub fn read_file_in_pages(
        self: &Arc<Self>,
        file: &mut dyn OpenedFile,
        ctx: &StreamContext,
        should_yield: &dyn Fn() -> bool,
    ) -> ReadOutcome {
        profiling::scope!("FileRequest::read_file_in_pages");
        let page_size = ctx.config.page_size as u64;
        let throttle_start = Instant::now();
        let mut throttled_bytes = 0u64;

        let mut read_state = self.read_state.lock().unwrap();
        let state = match read_state.as_mut() {
            Some(state) => state,
            None => return ReadOutcome::Failed(StreamError::CannotStartReading),
        };

        loop {
            if state.page_read_current >= state.page_read_end {
                return ReadOutcome::Finished;
            }

            if let Some(error) = self.error() {
                return ReadOutcome::Failed(error);
            }

            if !self.priority().is_urgent() && should_yield() {
                log::trace!(
                    "Request {} yields at offset {} of {}",
                    self.desc.path,
                    state.page_read_current,
                    state.page_read_end
                );
                return ReadOutcome::Preempted;
            }

            let len = page_size.min(state.page_read_end - state.page_read_current) as usize;
            let page_result = if state.compressed {
                self.read_compressed_page(state, file, len, ctx)
            } else {
                self.read_raw_page(state, file, len)
            };

            if let Err(error) = page_result {
                return ReadOutcome::Failed(error);
            }

            ctx.stats.add_bytes_read(self.desc.task_type, len as u64);

            if let Some(max_bytes_per_second) = ctx.config.max_bytes_per_second {
                throttled_bytes += len as u64;
                let expected =
                    Duration::from_secs_f64(throttled_bytes as f64 / max_bytes_per_second as f64);
                let elapsed = throttle_start.elapsed();
                if expected > elapsed {
                    std::thread::sleep(expected - elapsed);
                }
            }
        }
    }

    fn read_raw_page(
        &self,
        state: &mut ReadState,
        file: &mut dyn OpenedFile,
        len: usize,
    ) -> StreamResult<()> {
        let _read_guard = self.read_lock.lock().unwrap();
        if let Some(error) = self.error() {
            return Err(error);
        }

        let file_offset = state.page_read_current;
        let output_offset = (state.page_read_current - state.page_read_start) as usize;
        let mut read_page = |destination: &mut [u8]| -> StreamResult<()> {
            let destination = destination
                .get_mut(output_offset..output_offset + len)
                .ok_or(StreamError::SizeOutOfRange)?;
            read_exact_at(file, file_offset, destination).map_err(|e| {
                log::warn!("Read of {} failed: {}", self.desc.path, e);
                StreamError::CannotStartReading
            })?;
            if let Some(hasher) = state.read_hasher.as_mut() {
                hasher.update(destination);
            }
            Ok(())
        };

        let mut output = self.output.lock().unwrap();
        match output.as_mut() {
            Some(OutputBuffer::Internal(block)) => read_page(&mut block[..])?,
            Some(OutputBuffer::External(buffer)) => {
                let mut data = buffer.lock().unwrap();
                read_page(&mut data[..])?
            }
            None => return Err(StreamError::CannotStartReading),
        }

        state.page_read_current += len as u64;
        Ok(())
    }

    fn read_compressed_page(
        self: &Arc<Self>,
        state: &mut ReadState,
        file: &mut dyn OpenedFile,
        len: usize,
        ctx: &StreamContext,
    ) -> StreamResult<()> {
        let scratch = state
            .scratch
            .clone()
            .ok_or(StreamError::CannotStartReading)?;
        let page_begin = (state.page_read_current - state.page_read_start) as usize;
        let page_end = page_begin + len;
        let file_offset = state.page_read_current;

        scratch
            .write(page_begin, page_end, |data| read_exact_at(file, file_offset, data))
            .ok_or(StreamError::CannotStartReading)?
            .map_err(|e| {
                log::warn!("Read of {} failed: {}", self.desc.path, e);
                StreamError::CannotStartReading
            })?;

        state.page_read_current += len as u64;

        // A single page entry is decompressed in one go, larger ones block by block
        let block_size = if state.blocked {
            ctx.config.decompress_block_size
        } else {
            len
        };
        let stream_end = (state.page_read_end - state.page_read_start) as usize;
        let mut block_begin = page_begin;
        while block_begin < page_end {
            let block_end = (block_begin + block_size).min(page_end);
            let last = block_end == stream_end;
            let permit = ctx.decompress.acquire_permit();
            ctx.decompress.push(
                self,
                DecompressBlock {
                    scratch: Some(scratch.clone()),
                    begin: block_begin,
                    end: block_end,
                    last,
                    permit: Some(permit),
                },
            );
            if last {
                state.last_block_pushed = true;
            }
            block_begin = block_end;
        }

        Ok(())
    }

    /// Ends the read stage, successful or not. Raw reads are validated here; compressed reads that
    /// never pushed their last block push an empty one so the decompress stage ends too.
    pub fn finish_read(
        self: &Arc<Self>,
        ctx: &StreamContext,
    ) {
        let needs_terminator = self
            .with_read_state(|state| {
                if !self.is_failed() && !state.compressed && state.validate_crc {
                    self.set_state(RequestState::Validating);
                    let actual = state.read_hasher.take().map(|hasher| hasher.finalize());
                    if actual != state.metadata.crc32 {
                        log::warn!(
                            "{} failed verification, expected crc {:?} got {:?}",
                            self.desc.path,
                            state.metadata.crc32,
                            actual
                        );
                        ctx.stats.verification_failed();
                        self.fail(StreamError::VerificationFailed);
                    }
                }

                if let Some(scratch) = &state.scratch {
                    scratch.release(ScratchConsumer::Read);
                }

                let needs_terminator = state.compressed && !state.last_block_pushed;
                state.last_block_pushed = true;
                needs_terminator
            })
            .unwrap_or(false);

        if needs_terminator {
            ctx.decompress.push(self, DecompressBlock::terminator());
        }

        self.stage_done(ctx);
    }

    fn stage_done(
        self: &Arc<Self>,
        ctx: &StreamContext,
    ) {
        if self.outstanding_stages.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.complete(ctx);
        }
    }

    //
    // Decompression
    //
    /// Queues a block. Returns true if no job is running for this request, in which case the
    /// caller must start one.
    pub fn enqueue_decompress_block(
        &self,
        block: DecompressBlock,
    ) -> bool {
        let mut decompress = self.decompress.lock().unwrap();
        decompress.queue.push_back(block);
        if decompress.job_active {
            false
        } else {
            decompress.job_active = true;
            true
        }
    }

    /// Processes queued blocks in order until the queue is empty. Only one chain runs per request
    /// at a time; finishing a block starts the next one.
    pub fn run_decompress_chain(
        self: &Arc<Self>,
        ctx: &StreamContext,
    ) {
        profiling::scope!("FileRequest::run_decompress_chain");
        loop {
            let block = {
                let mut decompress = self.decompress.lock().unwrap();
                match decompress.queue.pop_front() {
                    Some(block) => block,
                    None => {
                        decompress.job_active = false;
                        return;
                    }
                }
            };

            let last = block.last;
            self.decompress_block(&block, ctx);

            // Frees the ring slot
            drop(block);

            if last {
                self.finish_decompression(ctx);
                self.stage_done(ctx);
            }
        }
    }

    fn decompress_block(
        &self,
        block: &DecompressBlock,
        ctx: &StreamContext,
    ) {
        let scratch = match &block.scratch {
            Some(scratch) => scratch,
            None => return,
        };

        let _decompress_guard = self.decompress_lock.lock().unwrap();
        if self.is_failed() {
            return;
        }

        self.set_state(RequestState::Decompressing);
        let write_only = self.desc.flags.write_only_external_buffer;

        let mut decompress = self.decompress.lock().unwrap();
        let decompress = &mut *decompress;
        if decompress.stream.is_none() {
            decompress.stream = Some(DecompressStream {
                stream: ctx.codec.create_stream(),
                _reservation: None,
            });
        }

        let mut output = self.output.lock().unwrap();
        let result = scratch
            .read(block.begin, block.end, |input| {
                match output.as_mut() {
                    Some(OutputBuffer::Internal(out)) => {
                        decompress.inflate_into(input, &mut out[..], write_only)
                    }
                    Some(OutputBuffer::External(buffer)) => {
                        let mut data = buffer.lock().unwrap();
                        let expected = (decompress.expected_size as usize).min(data.len());
                        decompress.inflate_into(input, &mut data[..expected], write_only)
                    }
                    None => Err("no output buffer".to_string()),
                }
            })
            .unwrap_or_else(|| Err("compressed data was released".to_string()));

        match result {
            Ok(produced) => ctx.stats.add_bytes_decompressed(produced),
            Err(e) => {
                log::warn!("Decompressing {} failed: {}", self.desc.path, e);
                self.fail(StreamError::DecompressionFailed);
            }
        }
    }

    fn finish_decompression(
        &self,
        ctx: &StreamContext,
    ) {
        let _decompress_guard = self.decompress_lock.lock().unwrap();
        let mut decompress = self.decompress.lock().unwrap();

        if !self.is_failed() {
            let complete = (decompress.stream_ended || decompress.expected_size == 0)
                && decompress.bytes_decompressed == decompress.expected_size;
            if !complete {
                log::warn!(
                    "{} decompressed to {} bytes, expected {}",
                    self.desc.path,
                    decompress.bytes_decompressed,
                    decompress.expected_size
                );
                self.fail(StreamError::DecompressionFailed);
            } else if let Some(expected_crc) = decompress.expected_crc {
                self.set_state(RequestState::Validating);
                let actual = decompress.hasher.take().map(|hasher| hasher.finalize());
                if actual != Some(expected_crc) {
                    log::warn!(
                        "{} failed verification, expected crc {:08x} got {:?}",
                        self.desc.path,
                        expected_crc,
                        actual
                    );
                    ctx.stats.verification_failed();
                    self.fail(StreamError::VerificationFailed);
                }
            }
        }

        decompress.stream = None;
        if let Some(scratch) = decompress.scratch.take() {
            scratch.release(ScratchConsumer::Decompress);
        }
    }

    //
    // Completion
    //
    fn complete(
        self: &Arc<Self>,
        ctx: &StreamContext,
    ) {
        profiling::scope!("FileRequest::complete");
        let (compressed, result_offset, result_size, bytes_done) = self
            .with_read_state(|state| {
                if let Some(scratch) = state.scratch.take() {
                    scratch.release(ScratchConsumer::Read);
                    scratch.release(ScratchConsumer::Decompress);
                }
                (
                    state.compressed,
                    state.result_offset,
                    state.result_size,
                    state.page_read_current - state.page_read_start,
                )
            })
            .unwrap_or((false, 0, 0, 0));

        {
            let mut decompress = self.decompress.lock().unwrap();
            decompress.stream = None;
            decompress.queue.clear();
            if let Some(scratch) = decompress.scratch.take() {
                scratch.release(ScratchConsumer::Decompress);
            }
        }

        let output = self.output.lock().unwrap().take();
        let result = match self.error() {
            None => {
                let buffer = match output {
                    Some(OutputBuffer::Internal(block)) => {
                        let block_offset = if compressed { result_offset as usize } else { 0 };
                        match (&self.desc.external_buffer, compressed) {
                            (Some(external), true) => {
                                let _decompress_guard = self.decompress_lock.lock().unwrap();
                                if !self.is_failed() {
                                    let mut data = external.lock().unwrap();
                                    data[..result_size as usize].copy_from_slice(
                                        &block[block_offset..block_offset + result_size as usize],
                                    );
                                }
                                Some(ResultBuffer::External {
                                    buffer: external.clone(),
                                    len: result_size as usize,
                                })
                            }
                            _ => Some(ResultBuffer::Internal {
                                block,
                                offset: block_offset,
                                len: result_size as usize,
                            }),
                        }
                    }
                    Some(OutputBuffer::External(buffer)) => Some(ResultBuffer::External {
                        buffer,
                        len: result_size as usize,
                    }),
                    None => None,
                };

                RequestResult {
                    error: self.error(),
                    bytes_read: result_size,
                    buffer,
                }
            }
            Some(error) => {
                // Raw reads into a caller buffer are valid up to the last completed page,
                // anything internal or decompressed is discarded
                let bytes_read = if compressed { 0 } else { bytes_done };
                let buffer = match output {
                    Some(OutputBuffer::External(buffer)) if !compressed => {
                        Some(ResultBuffer::External {
                            buffer,
                            len: bytes_read as usize,
                        })
                    }
                    _ => None,
                };

                RequestResult {
                    error: Some(error),
                    bytes_read,
                    buffer,
                }
            }
        };

        let failed = result.error.is_some();
        self.set_state(if failed {
            RequestState::Failed
        } else {
            RequestState::Done
        });
        ctx.stats.request_finished(failed);
        log::trace!(
            "Request {} ({}) complete, {} bytes, error {:?}",
            self.id,
            self.desc.path,
            result.bytes_read,
            result.error
        );

        *self.result.lock().unwrap() = Some(result);
        ctx.completion.report(self.clone());
    }

    pub fn take_result(&self) -> RequestResult {
        self.result
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| {
                RequestResult::failed(self.error().unwrap_or(StreamError::CannotStartReading))
            })
    }

    /// Returns the request bookkeeping to the pool. The request must not be used for IO after this.
    pub fn finalize(
        &self,
        pool: &RequestStatePool,
    ) {
        if let Some(state) = self.read_state.lock().unwrap().take() {
            pool.release(state);
        }
    }

    #[cfg(test)]
    pub fn page_cursor(&self) -> (u64, u64, u64) {
        self.with_read_state(|state| {
            (
                state.page_read_start,
                state.page_read_current,
                state.page_read_end,
            )
        })
        .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn scratch(&self) -> Option<Arc<ScratchBuffer>> {
        self.with_read_state(|state| state.scratch.clone())
            .flatten()
    }
}
